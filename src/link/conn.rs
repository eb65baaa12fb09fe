use super::Error;
use crate::{
    command::{ChannelClass, CommandDescriptor, LINE_TERM},
    utils::url_decode,
};
use async_trait::async_trait;
use std::{io, time::Duration};
use tokio::{
    io::{
        split, AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
        ReadHalf, WriteHalf,
    },
    net::TcpStream,
    time::timeout,
};

/// Opens the sockets of a device. One stream per traffic class.
#[async_trait]
pub trait Connector: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&mut self, class: ChannelClass) -> io::Result<Self::Stream>;
}

pub struct TcpConnector {
    host: String,
    command_port: u16,
    serial1_port: u16,
    serial2_port: u16,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(host: &str, config: &crate::config::LinkConfig) -> Self {
        Self {
            host: host.to_string(),
            command_port: config.command_port,
            serial1_port: config.serial1_port,
            serial2_port: config.serial2_port,
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&mut self, class: ChannelClass) -> io::Result<TcpStream> {
        let port = match class {
            ChannelClass::Command => self.command_port,
            ChannelClass::Serial1 => self.serial1_port,
            ChannelClass::Serial2 => self.serial2_port,
        };
        log::debug!("Connecting to {} port at {}:{}", class, self.host, port);
        let stream = timeout(self.connect_timeout, TcpStream::connect((self.host.as_str(), port)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "Connect timed out"))??;
        stream.set_nodelay(true)?;
        log::info!("Got a connection to {} port at {}:{}", class, self.host, port);
        Ok(stream)
    }
}

/// Read a line terminated by CR, LF or CRLF. Empty lines are skipped.
pub async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, Error> {
    let mut buf = Vec::new();
    loop {
        let b = match reader.read_u8().await {
            Ok(b) => b,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::Disconnected)
            }
            Err(err) => return Err(err.into()),
        };
        match b {
            b'\r' | b'\n' => {
                if !buf.is_empty() {
                    return Ok(String::from_utf8(buf)?);
                }
            }
            b => buf.push(b),
        }
    }
}

/// Open sockets of one device. Only the connection worker holds it.
pub struct Connection<S: AsyncRead + AsyncWrite> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    serial1: Option<WriteHalf<S>>,
    serial2: Option<WriteHalf<S>>,
    reply_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Connection<S> {
    /// Connect the command port and every serial port in `serial`. If any of
    /// them fails the ones already open are closed. Returns the read sides of
    /// the serial ports.
    pub async fn open<C: Connector<Stream = S>>(
        connector: &mut C,
        serial: &[ChannelClass],
        reply_timeout: Duration,
    ) -> Result<(Self, Vec<(ChannelClass, ReadHalf<S>)>), Error> {
        let (r, w) = split(connector.connect(ChannelClass::Command).await?);
        let mut conn = Self {
            reader: BufReader::new(r),
            writer: w,
            serial1: None,
            serial2: None,
            reply_timeout,
        };
        let mut readers = Vec::new();
        for &class in serial {
            let (r, w) = split(connector.connect(class).await?);
            match class {
                ChannelClass::Serial1 => conn.serial1 = Some(w),
                ChannelClass::Serial2 => conn.serial2 = Some(w),
                ChannelClass::Command => continue,
            }
            readers.push((class, r));
        }
        Ok((conn, readers))
    }

    /// Write one command and wait for its reply. Serial data is written to
    /// its own port and gets an empty reply. A write the peer does not take
    /// within the reply timeout fails with `Timeout`.
    pub async fn request(&mut self, cmd: &CommandDescriptor) -> Result<String, Error> {
        match cmd.class() {
            ChannelClass::Command => self.exchange(cmd).await,
            class => {
                let bytes = url_decode(cmd.wire_text());
                let writer = match class {
                    ChannelClass::Serial1 => self.serial1.as_mut(),
                    _ => self.serial2.as_mut(),
                }
                .ok_or(Error::NoSuchPort(class))?;
                timeout(self.reply_timeout, async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                })
                .await
                .map_err(|_| {
                    log::warn!("{} port did not accept {} byte(s)", class, bytes.len());
                    Error::Timeout
                })??;
                log::trace!("{} -> {:?}", class, crate::utils::hex_string(&bytes));
                Ok(String::new())
            }
        }
    }

    async fn exchange(&mut self, cmd: &CommandDescriptor) -> Result<String, Error> {
        let text = cmd.wire_text();
        let writer = &mut self.writer;
        timeout(self.reply_timeout, async {
            writer.write_all(text.as_bytes()).await?;
            writer.write_u8(LINE_TERM).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| {
            log::warn!("Device did not accept '{}'", text);
            Error::Timeout
        })??;
        log::trace!("-> '{}'", text);

        let reader = &mut self.reader;
        let resp = timeout(self.reply_timeout, async {
            match cmd.kind().reply_terminator() {
                None => read_line(reader).await,
                Some(end) => {
                    let mut lines = Vec::new();
                    loop {
                        let line = read_line(reader).await?;
                        let done = line.trim() == end;
                        lines.push(line);
                        if done {
                            break Ok(lines.join("\n"));
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| {
            log::warn!("No response to '{}'", text);
            Error::Timeout
        })??;
        log::trace!("<- '{}'", resp);
        Ok(resp)
    }

    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
        for w in [self.serial1.as_mut(), self.serial2.as_mut()].into_iter().flatten() {
            let _ = w.shutdown().await;
        }
    }
}
