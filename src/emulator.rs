//! In-process GlobalCache device for tests and `--emulate` runs.

use crate::{
    command::{Address, ChannelClass, LINE_TERM},
    link::Connector,
    utils::prelude::*,
};
use async_trait::async_trait;
use pin_project::pin_project;
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{
        duplex, split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader, DuplexStream, ReadBuf,
    },
    select,
    sync::mpsc,
    time::sleep,
};

const PIPE_LEN: usize = 1024;

struct State {
    version: String,
    devices: Vec<String>,
    relays: HashMap<Address, bool>,
    latency: Duration,
    silent: bool,
    refuse: bool,
    stalled: bool,
    connections: usize,
    commands: Vec<String>,
    lines: Vec<Arc<AtomicBool>>,
    serial_in: HashMap<ChannelClass, Vec<u8>>,
    serial_out: HashMap<ChannelClass, mpsc::UnboundedSender<Vec<u8>>>,
}

/// Shared handle to the emulated device. Clones see the same device.
#[derive(Clone)]
pub struct Emulator {
    state: Arc<Mutex<State>>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new("710-1005-05")
    }
}

impl Emulator {
    pub fn new(version: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                version: version.to_string(),
                devices: vec!["device,0,0 ETHERNET".to_string()],
                relays: HashMap::new(),
                latency: Duration::ZERO,
                silent: false,
                refuse: false,
                stalled: false,
                connections: 0,
                commands: Vec::new(),
                lines: Vec::new(),
                serial_in: HashMap::new(),
                serial_out: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a relay module line to `getdevices` and its connectors.
    pub fn with_relays(self, module: u8, count: u8) -> Self {
        {
            let mut state = self.state();
            state.devices.push(format!("device,{},{} RELAY", module, count));
            for c in 1..=count {
                if let Ok(addr) = Address::new(module, c) {
                    state.relays.insert(addr, false);
                }
            }
        }
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.state().latency = latency;
        self
    }

    pub fn connector(&self) -> EmulatorConnector {
        EmulatorConnector { emu: self.clone() }
    }

    pub fn relay(&self, addr: &Address) -> Option<bool> {
        self.state().relays.get(addr).copied()
    }

    pub fn set_relay(&self, addr: &Address, on: bool) {
        self.state().relays.insert(*addr, on);
    }

    /// Stop answering commands, replies time out.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Stop reading serial ports, writes to them back up.
    pub fn set_serial_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Refuse new connections.
    pub fn set_refuse(&self, refuse: bool) {
        self.state().refuse = refuse;
    }

    /// Drop every open socket. Further I/O on them fails.
    pub fn hang_up(&self) {
        for line in self.state().lines.drain(..) {
            line.store(true, Ordering::SeqCst);
        }
    }

    /// Number of command port connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state().connections
    }

    /// Command lines received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Bytes written to a serial port so far.
    pub fn serial_received(&self, class: ChannelClass) -> Vec<u8> {
        self.state().serial_in.get(&class).cloned().unwrap_or_default()
    }

    /// Emit bytes from the device side of a serial port. Returns `false` if
    /// the port is not connected.
    pub fn serial_send(&self, class: ChannelClass, data: &[u8]) -> bool {
        match self.state().serial_out.get(&class) {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    fn reply(&self, line: &str) -> Option<Vec<String>> {
        let mut state = self.state();
        state.commands.push(line.to_string());
        if state.silent {
            return None;
        }
        let (name, args) = match line.split_once(',') {
            Some((name, args)) => (name, args.split(',').collect::<Vec<_>>()),
            None => (line, Vec::new()),
        };
        let reply = match (name, args.as_slice()) {
            ("getversion", []) => vec![state.version.clone()],
            ("getdevices", []) => {
                let mut lines = state.devices.clone();
                lines.push("endlistdevices".to_string());
                lines
            }
            ("getstate", [addr]) => match parse_addr(addr) {
                Ok(a) => match state.relays.get(&a) {
                    Some(on) => vec![format!("state,{},{}", a, *on as u8)],
                    None => vec![format!("ERR_{},003", a)],
                },
                Err(code) => vec![format!("ERR_{},{:03}", addr, code)],
            },
            ("setstate", [addr, value]) => match (parse_addr(addr), value.as_bytes().parse_bytes::<u8>()) {
                (Ok(a), Ok(v @ (0 | 1))) => match state.relays.get_mut(&a) {
                    Some(on) => {
                        *on = v == 1;
                        vec![format!("state,{},{}", a, v)]
                    }
                    None => vec![format!("ERR_{},003", a)],
                },
                (Err(code), _) => vec![format!("ERR_{},{:03}", addr, code)],
                (Ok(a), _) => vec![format!("ERR_{},017", a)],
            },
            ("sendir", [addr, id, ..]) if args.len() >= 6 => match parse_addr(addr) {
                Ok(a) => vec![format!("completeir,{},{}", a, id)],
                Err(code) => vec![format!("ERR_{},{:03}", addr, code)],
            },
            _ => vec!["ERR_0:0,001".to_string()],
        };
        Some(reply)
    }

    fn latency(&self) -> Duration {
        self.state().latency
    }

    fn open_line(&self, class: ChannelClass) -> io::Result<(DevicePort, DuplexStream)> {
        let mut state = self.state();
        if state.refuse {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused"));
        }
        if class == ChannelClass::Command {
            state.connections += 1;
        }
        let hung = Arc::new(AtomicBool::new(false));
        state.lines.push(hung.clone());
        let (near, far) = duplex(PIPE_LEN);
        Ok((DevicePort { stream: near, hung }, far))
    }

    async fn serve_commands(self, stream: DuplexStream) {
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(LINE_TERM, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => (),
            }
            if buf.last() == Some(&LINE_TERM) {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf).trim().to_string();
            if line.is_empty() {
                continue;
            }
            let latency = self.latency();
            if !latency.is_zero() {
                sleep(latency).await;
            }
            let reply = match self.reply(&line) {
                Some(reply) => reply,
                None => continue,
            };
            for l in reply {
                let mut bytes = l.to_bytes();
                bytes.push(LINE_TERM);
                if writer.write_all(&bytes).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn serve_serial(
        self,
        class: ChannelClass,
        stream: DuplexStream,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (mut reader, mut writer) = split(stream);
        let mut buf = [0u8; 64];
        loop {
            let stalled = self.state().stalled;
            select! {
                res = reader.read(&mut buf), if !stalled => match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        self.state().serial_in.entry(class).or_default().extend_from_slice(&buf[..n]);
                    }
                },
                data = rx.recv() => match data {
                    Some(data) => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }
}

fn parse_addr(text: &str) -> Result<Address, u8> {
    let (m, c) = text.split_once(':').ok_or(2u8)?;
    let module = m.as_bytes().parse_bytes::<u8>().map_err(|_| 2u8)?;
    let connector = c.as_bytes().parse_bytes::<u8>().map_err(|_| 3u8)?;
    Address::new(module, connector).map_err(|_| 3u8)
}

/// Opens sockets to an [`Emulator`].
pub struct EmulatorConnector {
    emu: Emulator,
}

#[async_trait]
impl Connector for EmulatorConnector {
    type Stream = DevicePort;

    async fn connect(&mut self, class: ChannelClass) -> io::Result<DevicePort> {
        let (port, far) = self.emu.open_line(class)?;
        let emu = self.emu.clone();
        match class {
            ChannelClass::Command => tokio::spawn(emu.serve_commands(far)),
            class => {
                let (tx, rx) = mpsc::unbounded_channel();
                emu.state().serial_out.insert(class, tx);
                tokio::spawn(emu.serve_serial(class, far, rx))
            }
        };
        log::debug!("Emulator accepted {} connection", class);
        Ok(port)
    }
}

/// Bridge side of an emulated socket.
#[pin_project]
pub struct DevicePort {
    #[pin]
    stream: DuplexStream,
    hung: Arc<AtomicBool>,
}

impl DevicePort {
    fn broken() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "Device hung up")
    }
}

impl AsyncRead for DevicePort {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.hung.load(Ordering::SeqCst) {
            // End of stream.
            return Poll::Ready(Ok(()));
        }
        this.stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for DevicePort {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        if this.hung.load(Ordering::SeqCst) {
            return Poll::Ready(Err(Self::broken()));
        }
        this.stream.poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if this.hung.load(Ordering::SeqCst) {
            return Poll::Ready(Err(Self::broken()));
        }
        this.stream.poll_flush(cx)
    }
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}
