mod envelope;
pub mod parser;

pub use envelope::*;
pub use parser::{parse, Parsed, ParsedReply, ProtocolError, Relay};

use std::fmt;
use thiserror::Error;

/// Line terminator of every command written to the device.
pub const LINE_TERM: u8 = b'\r';

/// Last line of a `getdevices` reply.
pub const END_OF_DEVICES: &str = "endlistdevices";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    GetDevices,
    GetState,
    GetVersion,
    SendIr,
    SetState,
    /// Raw bytes for a serial port. Not a device command: it travels on a
    /// serial [`ChannelClass`], is written without a terminator and has no
    /// reply. Every other kind is a command-port request.
    SendSerial,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::GetDevices => "getdevices",
            CommandKind::GetState => "getstate",
            CommandKind::GetVersion => "getversion",
            CommandKind::SendIr => "sendir",
            CommandKind::SetState => "setstate",
            CommandKind::SendSerial => "sendserial",
        }
    }

    /// Line that closes a multi-line reply, if the reply spans several lines.
    pub fn reply_terminator(&self) -> Option<&'static str> {
        match self {
            CommandKind::GetDevices => Some(END_OF_DEVICES),
            _ => None,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Traffic class on the shared device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    Command,
    Serial1,
    Serial2,
}

impl ChannelClass {
    pub fn is_serial(&self) -> bool {
        !matches!(self, ChannelClass::Command)
    }
}

impl fmt::Display for ChannelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelClass::Command => "command",
            ChannelClass::Serial1 => "serial-1",
            ChannelClass::Serial2 => "serial-2",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Module '{0}' is not a number in 0..=9")]
    Module(String),
    #[error("Connector '{0}' is not a number in 1..=9")]
    Connector(String),
}

/// Validated module/connector pair.
///
/// Both parts are single decimal digits because every reply grammar of the
/// device encodes them as one character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    module: u8,
    connector: u8,
}

impl Address {
    pub fn new(module: u8, connector: u8) -> Result<Self, AddressError> {
        if module > 9 {
            return Err(AddressError::Module(module.to_string()));
        }
        if !(1..=9).contains(&connector) {
            return Err(AddressError::Connector(connector.to_string()));
        }
        Ok(Self { module, connector })
    }

    pub fn parse(module: &str, connector: &str) -> Result<Self, AddressError> {
        let m = module
            .trim()
            .parse::<u8>()
            .map_err(|_| AddressError::Module(module.to_string()))?;
        let c = connector
            .trim()
            .parse::<u8>()
            .map_err(|_| AddressError::Connector(connector.to_string()))?;
        Self::new(m, c)
    }

    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn connector(&self) -> u8 {
        self.connector
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.connector)
    }
}

/// Fully rendered command, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    kind: CommandKind,
    class: ChannelClass,
    wire_text: String,
    module: String,
    connector: String,
}

impl CommandDescriptor {
    fn new(kind: CommandKind, class: ChannelClass, wire_text: String, module: &str, connector: &str) -> Self {
        Self {
            kind,
            class,
            wire_text,
            module: module.to_string(),
            connector: connector.to_string(),
        }
    }

    fn addressed(kind: CommandKind, addr: &Address, wire_text: String) -> Self {
        Self::new(
            kind,
            ChannelClass::Command,
            wire_text,
            &addr.module.to_string(),
            &addr.connector.to_string(),
        )
    }

    pub fn get_devices() -> Self {
        Self::new(CommandKind::GetDevices, ChannelClass::Command, "getdevices".into(), "", "")
    }

    pub fn get_version() -> Self {
        Self::new(CommandKind::GetVersion, ChannelClass::Command, "getversion".into(), "", "")
    }

    pub fn get_state(addr: &Address) -> Self {
        Self::addressed(CommandKind::GetState, addr, format!("getstate,{}", addr))
    }

    pub fn set_state(addr: &Address, on: bool) -> Self {
        Self::addressed(
            CommandKind::SetState,
            addr,
            format!("setstate,{},{}", addr, if on { 1 } else { 0 }),
        )
    }

    pub fn send_ir(addr: &Address, seq: u32, code: &str) -> Self {
        Self::addressed(CommandKind::SendIr, addr, format!("sendir,{},{},{}", addr, seq, code))
    }

    /// `payload` is URL-encoded; it is decoded to raw bytes when written.
    pub fn send_serial(addr: &Address, class: ChannelClass, payload: &str) -> Self {
        debug_assert!(class.is_serial());
        Self::new(
            CommandKind::SendSerial,
            class,
            payload.to_string(),
            &addr.module.to_string(),
            &addr.connector.to_string(),
        )
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn class(&self) -> ChannelClass {
        self.class
    }

    pub fn wire_text(&self) -> &str {
        &self.wire_text
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }
}
