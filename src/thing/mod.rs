//! Channel handlers of one GlobalCache device.

mod channel;
pub mod ir;
mod task;

pub use channel::ChannelState;
pub use ir::{CodeError, CodeMap};

use crate::{
    command::{parse, Address, ChannelClass, CommandDescriptor, Parsed, ParsedReply, Relay},
    config::{self, ChannelConfig, ChannelType, Config},
    link::{self, Connector, Link, SerialFeed},
    status::{StatusDetail, StatusHandle},
    utils::url_encode,
};
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Communication error: {0}")]
    Communication(#[from] link::Error),
    #[error("Device error {code}: {message}")]
    Device { code: i32, message: String },
    #[error("Thing is not online")]
    Offline,
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("Command {command} is not supported by {kind:?} channel")]
    Unsupported { command: Command, kind: ChannelType },
    #[error("Code lookup failed: {0}")]
    Code(#[from] CodeError),
}

impl From<config::Error> for Error {
    fn from(err: config::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    On,
    Off,
    Refresh,
    Text(String),
}

impl FromStr for Command {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            t if t.eq_ignore_ascii_case("ON") => Command::On,
            t if t.eq_ignore_ascii_case("OFF") => Command::Off,
            t if t.eq_ignore_ascii_case("REFRESH") => Command::Refresh,
            t => Command::Text(t.to_string()),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::On => f.write_str("ON"),
            Command::Off => f.write_str("OFF"),
            Command::Refresh => f.write_str("REFRESH"),
            Command::Text(t) => f.write_str(t),
        }
    }
}

struct Channel {
    config: ChannelConfig,
    addr: Address,
    relay: ChannelState<Relay>,
}

/// A started device: connection worker, channels and their last known state.
pub struct Thing {
    id: String,
    link: Link,
    channels: HashMap<String, Channel>,
    codes: Option<CodeMap>,
    command_timeout: Duration,
    ir_counter: AtomicU32,
    received: HashMap<ChannelClass, ChannelState<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Thing {
    /// Validate channels, load the code map and spawn the connection worker.
    /// Must run inside a tokio runtime.
    pub fn start<C: Connector>(config: &Config, connector: C) -> Result<Arc<Self>, Error> {
        log::debug!("Initializing thing {}", config.id);
        let status = StatusHandle::new(&config.id);

        let codes = match &config.map_file {
            Some(path) => match CodeMap::load(path) {
                Ok(map) => {
                    log::debug!("Loaded {} codes from {}", map.len(), path.display());
                    Some(map)
                }
                Err(err) => {
                    let msg = format!("Cannot read map file {}: {}", path.display(), err);
                    status.mark_offline_with_error(StatusDetail::ConfigurationError, &msg);
                    return Err(Error::Configuration(msg));
                }
            },
            None => None,
        };

        let mut channels = HashMap::new();
        for ch in &config.channels {
            let addr = ch.address()?;
            channels.insert(
                ch.id.clone(),
                Channel {
                    config: ch.clone(),
                    addr,
                    relay: ChannelState::new(),
                },
            );
        }

        let mut feeds = Vec::new();
        let mut received = HashMap::new();
        let mut tasks = Vec::new();
        for class in config.link.serial_ports.iter().copied() {
            let serial = match config.serial(class) {
                Some(serial) if serial.two_way => serial,
                _ => continue,
            };
            log::debug!("Enable two-way is true for thing {} {}", config.id, class);
            let (tx, rx) = broadcast::channel(32);
            feeds.push(SerialFeed {
                class,
                end_of_message: crate::utils::url_decode(&serial.end_of_message),
                messages: tx,
            });
            received.insert(class, ChannelState::new());
            tasks.push((class, rx));
        }

        let (link, worker) = Link::start(connector, &config.link, feeds, status);
        let thing = Arc::new(Self {
            id: config.id.clone(),
            link,
            channels,
            codes,
            command_timeout: config.link.command_timeout(),
            ir_counter: AtomicU32::new(1),
            received,
            tasks: Mutex::new(Vec::new()),
            worker: Mutex::new(Some(worker)),
        });

        let mut handles = tasks
            .into_iter()
            .map(|(class, rx)| task::spawn_feedback(&thing, class, rx))
            .collect::<Vec<_>>();
        if let Some(period) = config.poll_interval() {
            handles.push(task::spawn_refresh(&thing, period));
        }
        thing.push_tasks(handles);
        Ok(thing)
    }

    fn push_tasks(&self, handles: Vec<JoinHandle<()>>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> &StatusHandle {
        self.link.status()
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Last known state of a contact closure channel.
    pub fn relay(&self, channel: &str) -> Option<&ChannelState<Relay>> {
        self.channels.get(channel).map(|ch| &ch.relay)
    }

    /// Messages received on a serial port, URL-encoded.
    pub fn received(&self, class: ChannelClass) -> Option<&ChannelState<String>> {
        self.received.get(&class)
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// Queue one command and decode its reply.
    pub async fn execute(&self, descriptor: CommandDescriptor) -> Result<Parsed, Error> {
        let kind = descriptor.kind();
        let response = match self.link.request(descriptor.clone(), self.command_timeout).await {
            Ok(response) => response,
            // The worker brings the Thing back online on its next good exchange.
            Err(link::Error::Timeout) => {
                log::error!("No reply to {} from thing {} in time", kind, self.id);
                self.status()
                    .mark_offline_with_error(StatusDetail::CommunicationError, "Command timed out");
                return Err(link::Error::Timeout.into());
            }
            Err(err) => return Err(err.into()),
        };

        match (response.raw_reply(), response.error_code()) {
            (Some(_), Some(code)) => {
                let message = response.error_message().unwrap_or_default().to_string();
                log::warn!("Device {} rejected {}: {} (code {})", self.id, kind, message, code);
                Err(Error::Device { code, message })
            }
            (Some(reply), None) => {
                log::debug!("Command {} to thing {} succeeded: '{}'", kind, self.id, reply);
                Ok(parse(&descriptor, reply))
            }
            (None, code) => {
                let message = response.error_message().unwrap_or_default().to_string();
                log::debug!("Command {} to thing {} failed: {}", kind, self.id, message);
                Err(link::Error::Failed {
                    code: code.unwrap_or(crate::command::code::IO),
                    message,
                }
                .into())
            }
        }
    }

    pub async fn handle_command(&self, channel: &str, command: Command) -> Result<(), Error> {
        if !self.status().is_online() {
            log::debug!(
                "Can't handle command {} because handler for thing {} is not ONLINE",
                command,
                self.id
            );
            return Err(Error::Offline);
        }
        let ch = self
            .channels
            .get(channel)
            .ok_or_else(|| Error::UnknownChannel(channel.to_string()))?;

        if command == Command::Refresh {
            return self.refresh(ch).await;
        }

        log::debug!("Handling {:?} command {} on channel {} of thing {}", ch.config.kind, command, channel, self.id);
        match ch.config.kind {
            ChannelType::Cc => {
                let on = match command {
                    Command::On => true,
                    Command::Off => false,
                    command => {
                        return Err(Error::Unsupported {
                            command,
                            kind: ch.config.kind,
                        })
                    }
                };
                let parsed = self.execute(CommandDescriptor::set_state(&ch.addr, on)).await?;
                self.update_relay(ch, parsed);
            }
            ChannelType::Ir => {
                let code = self.lookup(&command.to_string())?;
                let seq = self.ir_counter.fetch_add(1, Ordering::Relaxed);
                let parsed = self.execute(CommandDescriptor::send_ir(&ch.addr, seq, &code)).await?;
                if let ParsedReply::Ir { receive_counter, .. } = parsed.reply {
                    log::trace!("IR {} completed, counter {}", seq, receive_counter);
                }
            }
            ChannelType::Sl => {
                let code = self.lookup(&command.to_string())?;
                self.send_serial(ch, &code).await?;
            }
            ChannelType::SlDirect => {
                self.send_serial(ch, &command.to_string()).await?;
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<String, Error> {
        let codes = self.codes.as_ref().ok_or(CodeError::NoMap)?;
        let code = codes.lookup(name)?;
        log::debug!("Transformed {} for thing {} with map file", name, self.id);
        Ok(code)
    }

    async fn send_serial(&self, ch: &Channel, payload: &str) -> Result<(), Error> {
        let class = ch
            .config
            .serial_class()
            .ok_or_else(|| Error::Configuration(format!("channel '{}' has no serial port", ch.config.id)))?;
        self.execute(CommandDescriptor::send_serial(&ch.addr, class, payload))
            .await
            .map(|_| ())
    }

    /// Only contact closures can be queried, other channels ignore REFRESH.
    async fn refresh(&self, ch: &Channel) -> Result<(), Error> {
        if ch.config.kind != ChannelType::Cc {
            return Ok(());
        }
        log::debug!("Handle REFRESH command on channel {} for thing {}", ch.config.id, self.id);
        let parsed = self.execute(CommandDescriptor::get_state(&ch.addr)).await?;
        self.update_relay(ch, parsed);
        Ok(())
    }

    pub(crate) async fn refresh_all(&self) {
        for ch in self.channels.values() {
            if let Err(err) = self.refresh(ch).await {
                log::debug!("Refresh of {} on thing {} failed: {}", ch.config.id, self.id, err);
            }
        }
    }

    fn update_relay(&self, ch: &Channel, parsed: Parsed) {
        match parsed {
            Parsed {
                reply: ParsedReply::State { state, .. },
                fallback: false,
            } => {
                if ch.relay.set(state) {
                    log::info!("Channel {} of thing {} is {:?}", ch.config.id, self.id, state);
                }
            }
            _ => log::debug!("Channel {} of thing {} keeps its state", ch.config.id, self.id),
        }
    }

    fn update_received(&self, class: ChannelClass, msg: &[u8]) {
        if let Some(state) = self.received.get(&class) {
            let encoded = url_encode(msg);
            log::debug!("Updating feedback channel for port {}: '{}'", class, encoded);
            state.set(encoded);
        }
    }

    /// Stop background tasks and the connection worker.
    pub async fn stop(&self) {
        log::debug!("Disposing thing {}", self.id);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.link.stop();
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                log::error!("Connection worker of {} panicked: {}", self.id, err);
            }
        }
    }
}

impl Drop for Thing {
    fn drop(&mut self) {
        self.link.stop();
    }
}

pub(crate) fn on_feedback(thing: &Thing, class: ChannelClass, msg: Result<Vec<u8>, RecvError>) -> bool {
    match msg {
        Ok(msg) => {
            thing.update_received(class, &msg);
            true
        }
        Err(RecvError::Lagged(n)) => {
            log::warn!("Thing {} dropped {} serial message(s) on {}", thing.id, n, class);
            true
        }
        Err(RecvError::Closed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands() {
        assert_eq!("on".parse::<Command>().unwrap(), Command::On);
        assert_eq!(" OFF ".parse::<Command>().unwrap(), Command::Off);
        assert_eq!("Refresh".parse::<Command>().unwrap(), Command::Refresh);
        assert_eq!(
            "PWR+ON%0D".parse::<Command>().unwrap(),
            Command::Text("PWR+ON%0D".into())
        );
        assert_eq!(Command::Text("VOL+".into()).to_string(), "VOL+");
    }
}
