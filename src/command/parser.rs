use super::{CommandDescriptor, CommandKind, END_OF_DEVICES};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relay {
    On,
    Off,
}

impl Relay {
    pub fn is_on(&self) -> bool {
        matches!(self, Relay::On)
    }
}

impl From<bool> for Relay {
    fn from(on: bool) -> Self {
        if on {
            Relay::On
        } else {
            Relay::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedReply {
    Devices(Vec<String>),
    State {
        module: String,
        connector: String,
        state: Relay,
    },
    Ir {
        module: String,
        connector: String,
        receive_counter: String,
    },
    Version(String),
    /// Serial data was written, nothing to decode.
    Sent,
}

/// Decoded reply. `fallback` marks a reply that did not match its grammar
/// and was replaced by the fallback value of the command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub reply: ParsedReply,
    pub fallback: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Reply '{reply}' to {kind} does not match '{grammar}'")]
pub struct ProtocolError {
    pub kind: CommandKind,
    pub reply: String,
    pub grammar: &'static str,
}

pub trait Parser: Sync {
    fn load(&self, cmd: &CommandDescriptor, text: &str) -> Result<ParsedReply, ProtocolError>;
    fn fallback(&self, cmd: &CommandDescriptor) -> ParsedReply;
}

struct Grammar {
    source: &'static str,
    regex: OnceLock<Regex>,
}

impl Grammar {
    const fn new(source: &'static str) -> Self {
        Self {
            source,
            regex: OnceLock::new(),
        }
    }

    fn regex(&self) -> &Regex {
        self.regex
            .get_or_init(|| Regex::new(self.source).expect("valid reply grammar"))
    }

    fn check(&self, kind: CommandKind, text: &str) -> Result<(), ProtocolError> {
        if self.regex().is_match(text) {
            Ok(())
        } else {
            Err(ProtocolError {
                kind,
                reply: text.to_string(),
                grammar: self.source,
            })
        }
    }
}

/// `getstate` and `setstate` replies. Fields sit at fixed offsets after the prefix,
/// the grammars only admit ASCII so every offset is a char boundary.
pub struct StateParser {
    kind: CommandKind,
    grammar: Grammar,
}

impl Parser for StateParser {
    fn load(&self, _cmd: &CommandDescriptor, text: &str) -> Result<ParsedReply, ProtocolError> {
        self.grammar.check(self.kind, text)?;
        // Newer firmware echoes `setstate` as `state`.
        let start = if text.starts_with("setstate") { 9 } else { 6 };
        Ok(ParsedReply::State {
            module: text[start..start + 1].to_string(),
            connector: text[start + 2..start + 3].to_string(),
            state: Relay::from(&text[start + 4..start + 5] == "1"),
        })
    }

    fn fallback(&self, cmd: &CommandDescriptor) -> ParsedReply {
        ParsedReply::State {
            module: cmd.module().to_string(),
            connector: cmd.connector().to_string(),
            state: Relay::Off,
        }
    }
}

pub struct IrParser {
    grammar: Grammar,
}

impl Parser for IrParser {
    fn load(&self, _cmd: &CommandDescriptor, text: &str) -> Result<ParsedReply, ProtocolError> {
        self.grammar.check(CommandKind::SendIr, text)?;
        Ok(ParsedReply::Ir {
            module: text[11..12].to_string(),
            connector: text[13..14].to_string(),
            receive_counter: text[15..].to_string(),
        })
    }

    fn fallback(&self, cmd: &CommandDescriptor) -> ParsedReply {
        ParsedReply::Ir {
            module: cmd.module().to_string(),
            connector: cmd.connector().to_string(),
            receive_counter: String::new(),
        }
    }
}

/// Version string is returned verbatim.
pub struct VersionParser;

impl Parser for VersionParser {
    fn load(&self, _cmd: &CommandDescriptor, text: &str) -> Result<ParsedReply, ProtocolError> {
        if text.is_empty() {
            return Err(ProtocolError {
                kind: CommandKind::GetVersion,
                reply: String::new(),
                grammar: ".+",
            });
        }
        Ok(ParsedReply::Version(text.to_string()))
    }

    fn fallback(&self, _cmd: &CommandDescriptor) -> ParsedReply {
        ParsedReply::Version(String::new())
    }
}

/// Lines of a `getdevices` reply, without the terminating line.
pub struct DevicesParser;

impl Parser for DevicesParser {
    fn load(&self, _cmd: &CommandDescriptor, text: &str) -> Result<ParsedReply, ProtocolError> {
        let lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let mut devices = Vec::new();
        for line in lines {
            if line == END_OF_DEVICES {
                return Ok(ParsedReply::Devices(devices));
            }
            devices.push(line.to_string());
        }
        Err(ProtocolError {
            kind: CommandKind::GetDevices,
            reply: text.to_string(),
            grammar: "(device,...\\n)*endlistdevices",
        })
    }

    fn fallback(&self, _cmd: &CommandDescriptor) -> ParsedReply {
        ParsedReply::Devices(Vec::new())
    }
}

pub struct SerialParser;

impl Parser for SerialParser {
    fn load(&self, _cmd: &CommandDescriptor, _text: &str) -> Result<ParsedReply, ProtocolError> {
        Ok(ParsedReply::Sent)
    }

    fn fallback(&self, _cmd: &CommandDescriptor) -> ParsedReply {
        ParsedReply::Sent
    }
}

static GET_STATE: StateParser = StateParser {
    kind: CommandKind::GetState,
    grammar: Grammar::new(r"^state,[0-9]:[0-9],[01]$"),
};
static SET_STATE: StateParser = StateParser {
    kind: CommandKind::SetState,
    grammar: Grammar::new(r"^(set)?state,[0-9]:[0-9],[01]$"),
};
static SEND_IR: IrParser = IrParser {
    grammar: Grammar::new(r"^completeir,[0-9]:[0-9],[0-9]+$"),
};

pub fn parser_for(kind: CommandKind) -> &'static dyn Parser {
    match kind {
        CommandKind::GetDevices => &DevicesParser,
        CommandKind::GetState => &GET_STATE,
        CommandKind::GetVersion => &VersionParser,
        CommandKind::SendIr => &SEND_IR,
        CommandKind::SetState => &SET_STATE,
        CommandKind::SendSerial => &SerialParser,
    }
}

/// Decode `text` as the reply to `cmd`. Never fails: a reply that does not
/// match the grammar of the command kind is logged and replaced by the
/// fallback value.
pub fn parse(cmd: &CommandDescriptor, text: &str) -> Parsed {
    let parser = parser_for(cmd.kind());
    match parser.load(cmd, text.trim()) {
        Ok(reply) => Parsed {
            reply,
            fallback: false,
        },
        Err(err) => {
            log::warn!("{}", err);
            Parsed {
                reply: parser.fallback(cmd),
                fallback: true,
            }
        }
    }
}
