pub mod command;
pub mod config;
pub mod link;
pub mod status;
pub mod thing;
pub mod utils;

#[cfg(feature = "emul")]
pub mod emulator;

pub use command::{Address, ChannelClass, CommandDescriptor, CommandKind, RequestEnvelope, ResponseEnvelope};
pub use config::Config;
pub use link::{Connector, Link, TcpConnector};
pub use status::{StatusDetail, StatusHandle, ThingStatus};
pub use thing::{Command, Thing};
