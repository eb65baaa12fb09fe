use super::{Connection, Connector, Error, QueueReceiver, SerialFeed};
use crate::{
    command::{code, ChannelClass, CommandDescriptor, RequestEnvelope, ResponseEnvelope},
    config::LinkConfig,
    status::{StatusDetail, StatusHandle},
};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    sync::watch,
    task::JoinHandle,
    time::{interval_at, sleep_until, Instant, MissedTickBehavior},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Ready,
    CommandInFlight,
}

enum Exit {
    Shutdown,
    Failed(Error),
}

/// Owns the device sockets and services the dispatch queue one request at a time.
pub struct Worker<C: Connector> {
    connector: C,
    queue: QueueReceiver,
    status: StatusHandle,
    shutdown: watch::Receiver<bool>,
    feeds: Vec<SerialFeed>,
    serial: Vec<ChannelClass>,
    reply_timeout: Duration,
    reconnect_backoff: Duration,
    monitor_interval: Duration,
    state: WorkerState,
}

impl<C: Connector> Worker<C> {
    pub fn new(
        connector: C,
        queue: QueueReceiver,
        status: StatusHandle,
        shutdown: watch::Receiver<bool>,
        config: &LinkConfig,
        feeds: Vec<SerialFeed>,
    ) -> Self {
        Self {
            connector,
            queue,
            status,
            shutdown,
            feeds,
            serial: config.serial_ports.clone(),
            reply_timeout: config.reply_timeout(),
            reconnect_backoff: config.reconnect_backoff(),
            monitor_interval: config.monitor_interval(),
            state: WorkerState::Disconnected,
        }
    }

    fn id(&self) -> &str {
        self.status.id()
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            log::trace!("Worker for {}: {:?} -> {:?}", self.status.id(), self.state, state);
            self.state = state;
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn run(mut self) {
        log::debug!("Command processor STARTING for thing {}", self.id());
        while !self.stopping() {
            self.set_state(WorkerState::Connecting);
            match Connection::open(&mut self.connector, &self.serial, self.reply_timeout).await {
                Ok((mut conn, readers)) => {
                    self.status.mark_online();
                    let tasks = self.start_readers(readers);
                    let exit = self.serve(&mut conn).await;
                    for task in tasks {
                        task.abort();
                    }
                    conn.close().await;
                    match exit {
                        Exit::Shutdown => break,
                        Exit::Failed(err) => {
                            log::error!("Comm error for thing {}: {}", self.id(), err);
                            self.status
                                .mark_offline_with_error(StatusDetail::CommunicationError, &err.to_string());
                        }
                    }
                }
                Err(err) => {
                    log::debug!("Failed to connect to thing {}: {}", self.id(), err);
                    self.status
                        .mark_offline_with_error(StatusDetail::CommunicationError, &err.to_string());
                }
            }
            self.set_state(WorkerState::Disconnected);
            self.fail_pending(code::NOT_CONNECTED, "No connection to device");
            if !self.backoff().await {
                break;
            }
        }

        self.queue.close();
        self.fail_pending(code::STOPPED, "Connection worker is stopped");
        self.status.mark_offline();
        log::debug!("Command processor TERMINATING for thing {}", self.id());
    }

    fn start_readers<R>(&self, readers: Vec<(ChannelClass, R)>) -> Vec<JoinHandle<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        readers
            .into_iter()
            .filter_map(|(class, reader)| {
                self.feeds
                    .iter()
                    .find(|f| f.class == class)
                    .map(|feed| feed.spawn(self.id(), reader))
            })
            .collect()
    }

    /// The device answered, so a Thing taken offline by a caller that gave
    /// up waiting is online again.
    fn link_alive(&self) {
        if self.status.mark_online() {
            log::info!("Thing {} is responding again", self.id());
        }
    }

    /// Release every waiting caller with a failure response.
    fn fail_pending(&mut self, code: i32, message: &str) {
        let mut count = 0;
        while let Some(env) = self.queue.try_take() {
            env.respond(ResponseEnvelope::failure(code, message));
            count += 1;
        }
        if count > 0 {
            log::debug!("Failed {} pending request(s) for thing {}: {}", count, self.id(), message);
        }
    }

    /// Wait before reconnecting, failing requests that arrive meanwhile.
    /// Returns `false` if the worker should exit.
    async fn backoff(&mut self) -> bool {
        let deadline = Instant::now() + self.reconnect_backoff;
        loop {
            select! {
                biased;
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
                env = self.queue.take_next() => match env {
                    Some(env) => env.respond(Error::NotConnected.into_response()),
                    None => return false,
                },
                () = sleep_until(deadline) => return true,
            }
        }
    }

    async fn serve<S>(&mut self, conn: &mut Connection<S>) -> Exit
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut monitor = interval_at(Instant::now() + self.monitor_interval, self.monitor_interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            self.set_state(WorkerState::Ready);
            select! {
                biased;
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        return Exit::Shutdown;
                    }
                }
                env = self.queue.take_next() => match env {
                    Some(env) => {
                        if let Some(err) = self.dispatch(conn, env).await {
                            return Exit::Failed(err);
                        }
                    }
                    None => return Exit::Shutdown,
                },
                _ = monitor.tick() => {
                    log::trace!("Performing connection check for thing {}", self.id());
                    match conn.request(&CommandDescriptor::get_version()).await {
                        Ok(_) => self.link_alive(),
                        Err(err) => {
                            log::debug!("Connection check failed for thing {}", self.id());
                            return Exit::Failed(err);
                        }
                    }
                }
            }
        }
    }

    /// Run one exchange. Returns the error if the connection must be dropped.
    async fn dispatch<S>(&mut self, conn: &mut Connection<S>, env: RequestEnvelope) -> Option<Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.set_state(WorkerState::CommandInFlight);
        let text = env.descriptor().wire_text().to_string();
        let start = Instant::now();
        let res = conn.request(env.descriptor()).await;
        log::debug!(
            "Transaction '{}' for thing {} took {} ms",
            env.descriptor().kind(),
            self.id(),
            start.elapsed().as_millis()
        );
        match res {
            Ok(reply) => {
                env.respond(ResponseEnvelope::from_reply(reply));
                self.link_alive();
                None
            }
            Err(err) => {
                env.respond(ResponseEnvelope::failure(err.code(), err.to_string()));
                if err.is_fatal() {
                    Some(err)
                } else {
                    log::warn!("Request '{}' for thing {} failed: {}", text, self.id(), err);
                    None
                }
            }
        }
    }
}
