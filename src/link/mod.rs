//! Shared device connection: dispatch queue, connection worker and serial pass-through.

mod conn;
mod passthrough;
mod queue;
mod worker;

pub use conn::*;
pub use passthrough::SerialFeed;
pub use queue::*;
pub use worker::{Worker, WorkerState};

use crate::{
    command::{code, CommandDescriptor, RequestEnvelope, ResponseEnvelope},
    config::LinkConfig,
    status::StatusHandle,
};
use std::{io, string::FromUtf8Error, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::timeout};

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),
    #[error("Parse: {0}")]
    Decode(#[from] FromUtf8Error),
    #[error("Timeout")]
    Timeout,
    #[error("Connection closed by device")]
    Disconnected,
    #[error("No connection to device")]
    NotConnected,
    #[error("Device has no {0} port")]
    NoSuchPort(crate::command::ChannelClass),
    #[error("Dispatch queue is full")]
    QueueFull,
    #[error("Connection worker is stopped")]
    Stopped,
    #[error("{message} (code {code})")]
    Failed { code: i32, message: String },
}

impl Error {
    /// The connection can't be trusted after this error: replies may be out of step.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(..) | Error::Timeout | Error::Disconnected)
    }

    pub fn code(&self) -> i32 {
        match self {
            Error::Timeout => code::TIMEOUT,
            Error::NotConnected | Error::NoSuchPort(..) => code::NOT_CONNECTED,
            Error::Stopped => code::STOPPED,
            Error::QueueFull => code::QUEUE_FULL,
            Error::Failed { code, .. } => *code,
            _ => code::IO,
        }
    }

    pub fn into_response(self) -> ResponseEnvelope {
        ResponseEnvelope::failure(self.code(), self.to_string())
    }
}

/// Caller side of a running connection worker.
#[derive(Clone)]
pub struct Link {
    queue: QueueSender,
    shutdown: Arc<watch::Sender<bool>>,
    status: StatusHandle,
}

impl Link {
    /// Spawn the connection worker for one device.
    pub fn start<C: Connector>(
        connector: C,
        config: &LinkConfig,
        feeds: Vec<SerialFeed>,
        status: StatusHandle,
    ) -> (Self, JoinHandle<()>) {
        let (queue, rx) = dispatch_queue(config.queue_depth);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(connector, rx, status.clone(), shutdown_rx, config, feeds);
        let handle = tokio::spawn(worker.run());
        (
            Self {
                queue,
                shutdown: Arc::new(shutdown),
                status,
            },
            handle,
        )
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    pub fn enqueue(&self, envelope: RequestEnvelope) -> Result<(), Error> {
        self.queue.enqueue(envelope)
    }

    /// Queue `descriptor` and wait at most `limit` for its response.
    pub async fn request(
        &self,
        descriptor: CommandDescriptor,
        limit: Duration,
    ) -> Result<ResponseEnvelope, Error> {
        let (envelope, reply) = RequestEnvelope::new(descriptor);
        self.enqueue(envelope)?;
        match timeout(limit, reply).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Stopped),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Ask the worker to close the connection and exit.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}
