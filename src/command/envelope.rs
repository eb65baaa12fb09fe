use super::CommandDescriptor;
use regex::Regex;
use std::sync::OnceLock;
use tokio::sync::oneshot;

/// Error codes of responses produced by the link itself rather than by the device.
pub mod code {
    pub const IO: i32 = -1;
    pub const TIMEOUT: i32 = -2;
    pub const NOT_CONNECTED: i32 = -3;
    pub const STOPPED: i32 = -4;
    pub const QUEUE_FULL: i32 = -5;
}

pub type ReplySink = oneshot::Sender<ResponseEnvelope>;
pub type ReplySource = oneshot::Receiver<ResponseEnvelope>;

/// A command together with the private sink its reply goes to.
#[derive(Debug)]
pub struct RequestEnvelope {
    descriptor: CommandDescriptor,
    sink: ReplySink,
}

impl RequestEnvelope {
    pub fn new(descriptor: CommandDescriptor) -> (Self, ReplySource) {
        let (sink, source) = oneshot::channel();
        (Self { descriptor, sink }, source)
    }

    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    /// Deliver the reply. A caller that gave up waiting has dropped its
    /// source, in that case the response is discarded.
    pub fn respond(self, response: ResponseEnvelope) {
        if self.sink.send(response).is_err() {
            log::trace!("Reply to '{}' dropped, caller is gone", self.descriptor.wire_text());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    raw_reply: Option<String>,
    error_code: Option<i32>,
    error_message: Option<String>,
}

impl ResponseEnvelope {
    /// Wrap a reply read from the device, recognizing device error replies.
    pub fn from_reply(line: String) -> Self {
        match device_error(&line) {
            Some((code, message)) => Self {
                raw_reply: Some(line),
                error_code: Some(code),
                error_message: Some(message),
            },
            None => Self {
                raw_reply: Some(line),
                error_code: None,
                error_message: None,
            },
        }
    }

    /// Transport failure, no reply available.
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            raw_reply: None,
            error_code: Some(code),
            error_message: Some(message.into()),
        }
    }

    pub fn raw_reply(&self) -> Option<&str> {
        self.raw_reply.as_deref()
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error_code
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_failure(&self) -> bool {
        self.raw_reply.is_none()
    }

    pub fn is_device_error(&self) -> bool {
        self.raw_reply.is_some() && self.error_code.is_some()
    }
}

fn error_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:ERR[_ ](?:[0-9]+:[0-9]+,)?([0-9]+)|unknowncommand,? *([0-9]+))$").expect("valid regex")
    })
}

fn device_error(line: &str) -> Option<(i32, String)> {
    let caps = error_regex().captures(line.trim())?;
    if let Some(m) = caps.get(1) {
        let code = m.as_str().parse().ok()?;
        Some((code, itach_error_text(code).to_string()))
    } else {
        let code = caps.get(2)?.as_str().parse().ok()?;
        Some((code, format!("Unknown command ({})", code)))
    }
}

fn itach_error_text(code: i32) -> &'static str {
    match code {
        1 => "Invalid command. Command not found",
        2 => "Invalid module address",
        3 => "Invalid connector address",
        4 => "Invalid ID value",
        5 => "Invalid frequency value",
        6 => "Invalid repeat value",
        7 => "Invalid offset value",
        8 => "Invalid pulse count",
        9 => "Invalid pulse data",
        10 => "Uneven amount of on/off statements",
        11 => "No carriage return found",
        12 => "Repeat count exceeded",
        13 => "IR command sent to input connector",
        14 => "Blaster command sent to non-blaster connector",
        15 => "No carriage return before buffer full",
        16 => "No carriage return",
        17 => "Bad command syntax",
        18 => "Sensor command sent to non-input connector",
        19 => "Repeated IR transmission failure",
        20 => "Above designated IR on/off pair limit",
        21 => "Symbol odd boundary",
        22 => "Undefined symbol",
        23 => "Unknown option",
        24 => "Invalid baud rate setting",
        25 => "Invalid flow control setting",
        26 => "Invalid parity setting",
        27 => "Settings are locked",
        _ => "Unknown device error",
    }
}
