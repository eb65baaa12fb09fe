use crate::command::{Address, ChannelClass};
use serde::Deserialize;
use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot read config: {0}")]
    Io(#[from] io::Error),
    #[error("Cannot parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Model {
    #[serde(rename = "itach-ir")]
    ItachIr,
    #[serde(rename = "itach-cc")]
    ItachCc,
    #[serde(rename = "itach-sl")]
    ItachSl,
    #[serde(rename = "itach-flex")]
    ItachFlex,
    #[serde(rename = "gc-100-06")]
    Gc100_06,
    #[serde(rename = "gc-100-12")]
    Gc100_12,
    #[serde(rename = "zmote")]
    Zmote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveCable {
    #[default]
    Ir,
    Serial,
    Relay,
}

impl Model {
    /// Serial ports the device exposes as pass-through sockets.
    pub fn serial_ports(&self, cable: ActiveCable) -> Vec<ChannelClass> {
        match self {
            Model::ItachSl | Model::Gc100_06 => vec![ChannelClass::Serial1],
            Model::ItachFlex if cable == ActiveCable::Serial => vec![ChannelClass::Serial1],
            Model::Gc100_12 => vec![ChannelClass::Serial1, ChannelClass::Serial2],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    pub command_port: u16,
    pub serial1_port: u16,
    pub serial2_port: u16,
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub monitor_interval_ms: u64,
    /// Zero means unbounded.
    pub queue_depth: usize,
    /// Filled from the device model.
    #[serde(skip)]
    pub serial_ports: Vec<ChannelClass>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            command_port: 4998,
            serial1_port: 4999,
            serial2_port: 5000,
            connect_timeout_ms: 1500,
            reply_timeout_ms: 2000,
            command_timeout_ms: 5000,
            reconnect_backoff_ms: 5000,
            monitor_interval_ms: 60000,
            queue_depth: 0,
            serial_ports: Vec::new(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    pub two_way: bool,
    /// URL-encoded delimiter of inbound messages.
    pub end_of_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    Cc,
    Ir,
    Sl,
    SlDirect,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub module: String,
    pub connector: String,
}

impl ChannelConfig {
    pub fn address(&self) -> Result<Address, Error> {
        Address::parse(&self.module, &self.connector)
            .map_err(|e| Error::Invalid(format!("channel '{}': {}", self.id, e)))
    }

    /// Serial port a serial channel writes to.
    pub fn serial_class(&self) -> Option<ChannelClass> {
        match self.kind {
            ChannelType::Sl | ChannelType::SlDirect => match self.module.trim() {
                "1" => Some(ChannelClass::Serial1),
                "2" => Some(ChannelClass::Serial2),
                _ => None,
            },
            _ => None,
        }
    }
}

fn default_poll_interval() -> u64 {
    30000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub id: String,
    pub host: String,
    pub model: Model,
    #[serde(default)]
    pub active_cable: ActiveCable,
    #[serde(default)]
    pub map_file: Option<PathBuf>,
    /// Contact closure refresh period, zero disables polling.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub serial1: SerialConfig,
    #[serde(default)]
    pub serial2: SerialConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut config: Config = toml::from_str(text)?;
        config.link.serial_ports = config.model.serial_ports(config.active_cable);
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }

    pub fn serial(&self, class: ChannelClass) -> Option<&SerialConfig> {
        match class {
            ChannelClass::Serial1 => Some(&self.serial1),
            ChannelClass::Serial2 => Some(&self.serial2),
            ChannelClass::Command => None,
        }
    }

    pub fn supports(&self, class: ChannelClass) -> bool {
        self.link.serial_ports.contains(&class)
    }

    fn validate(&self) -> Result<(), Error> {
        let invalid = |msg: String| Err(Error::Invalid(msg));
        if self.id.trim().is_empty() {
            return invalid("thing id is empty".into());
        }
        if self.host.trim().is_empty() {
            return invalid("IP address not set".into());
        }
        let link = &self.link;
        if link.reply_timeout_ms == 0 || link.monitor_interval_ms == 0 {
            return invalid("reply timeout and monitor interval must be positive".into());
        }
        if link.command_timeout_ms <= link.reply_timeout_ms {
            return invalid("command timeout must exceed reply timeout".into());
        }

        let mut ids = HashSet::new();
        for ch in &self.channels {
            if !ids.insert(ch.id.as_str()) {
                return invalid(format!("duplicate channel '{}'", ch.id));
            }
            ch.address()?;
            if matches!(ch.kind, ChannelType::Sl | ChannelType::SlDirect) {
                match ch.serial_class() {
                    Some(class) if self.supports(class) => (),
                    _ => {
                        return invalid(format!(
                            "channel '{}': device has no serial port on module {}",
                            ch.id, ch.module
                        ))
                    }
                }
            }
        }

        for class in [ChannelClass::Serial1, ChannelClass::Serial2] {
            if let Some(serial) = self.serial(class) {
                if serial.two_way && self.supports(class) && serial.end_of_message.is_empty() {
                    return invalid(format!("end of message delimiter is not defined for {}", class));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
id = "gc100"
host = "192.168.1.50"
model = "gc-100-12"
map_file = "codes.map"
poll_interval_ms = 1000

[link]
reply_timeout_ms = 500
command_timeout_ms = 1000
queue_depth = 10

[serial2]
two_way = true
end_of_message = "%0D"

[[channels]]
id = "relay"
type = "cc"
module = "3"
connector = "1"

[[channels]]
id = "tv"
type = "ir"
module = "4"
connector = "2"

[[channels]]
id = "amp"
type = "sl-direct"
module = "2"
connector = "1"
"#;

    #[test]
    fn full() {
        let config = Config::parse(FULL).unwrap();
        assert_eq!(config.model, Model::Gc100_12);
        assert_eq!(config.link.command_port, 4998);
        assert_eq!(config.link.queue_depth, 10);
        assert_eq!(config.link.command_timeout(), Duration::from_secs(1));
        assert_eq!(
            config.link.serial_ports,
            vec![ChannelClass::Serial1, ChannelClass::Serial2]
        );
        assert_eq!(config.channels.len(), 3);
        assert_eq!(config.channels[2].serial_class(), Some(ChannelClass::Serial2));
        assert_eq!(config.poll_interval(), Some(Duration::from_secs(1)));
        assert!(config.serial2.two_way);
    }

    #[test]
    fn minimal() {
        let config = Config::parse("id = \"a\"\nhost = \"h\"\nmodel = \"itach-ir\"\n").unwrap();
        assert!(config.channels.is_empty());
        assert!(config.link.serial_ports.is_empty());
        assert_eq!(config.link.reconnect_backoff_ms, 5000);
    }

    #[test]
    fn flex_serial_cable() {
        let config =
            Config::parse("id = \"a\"\nhost = \"h\"\nmodel = \"itach-flex\"\nactive_cable = \"serial\"\n")
                .unwrap();
        assert_eq!(config.link.serial_ports, vec![ChannelClass::Serial1]);
    }

    #[test]
    fn rejected() {
        let base = "id = \"a\"\nhost = \"h\"\nmodel = \"itach-ir\"\n";
        let bad_address = format!(
            "{}[[channels]]\nid = \"x\"\ntype = \"cc\"\nmodule = \"a\"\nconnector = \"1\"\n",
            base
        );
        assert!(matches!(Config::parse(&bad_address), Err(Error::Invalid(..))));

        let no_serial = format!(
            "{}[[channels]]\nid = \"x\"\ntype = \"sl\"\nmodule = \"1\"\nconnector = \"1\"\n",
            base
        );
        assert!(matches!(Config::parse(&no_serial), Err(Error::Invalid(..))));

        let dup = format!(
            "{0}[[channels]]\nid = \"x\"\ntype = \"ir\"\nmodule = \"1\"\nconnector = \"1\"\n\
             [[channels]]\nid = \"x\"\ntype = \"ir\"\nmodule = \"1\"\nconnector = \"2\"\n",
            base
        );
        assert!(matches!(Config::parse(&dup), Err(Error::Invalid(..))));

        let no_eom = "id = \"a\"\nhost = \"h\"\nmodel = \"itach-sl\"\n[serial1]\ntwo_way = true\n";
        assert!(matches!(Config::parse(no_eom), Err(Error::Invalid(..))));

        assert!(matches!(Config::parse("id = \"a\"\n"), Err(Error::Toml(..))));
    }
}
