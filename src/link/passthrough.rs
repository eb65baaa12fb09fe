use crate::{command::ChannelClass, utils::hex_string};
use tokio::{
    io::{AsyncRead, AsyncReadExt, BufReader},
    sync::broadcast,
    task::JoinHandle,
};

/// Inbound side of a serial port with two-way communication enabled.
#[derive(Clone)]
pub struct SerialFeed {
    pub class: ChannelClass,
    pub end_of_message: Vec<u8>,
    pub messages: broadcast::Sender<Vec<u8>>,
}

/// Longest message kept while waiting for the delimiter.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Read from `reader` until the buffer ends with `end_of_message` or holds
/// `MAX_MESSAGE_LEN` bytes. `Ok(None)` on end of stream.
async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    end_of_message: &[u8],
) -> std::io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        buf.push(byte[0]);
        if buf.ends_with(end_of_message) {
            return Ok(Some(buf));
        }
        if buf.len() >= MAX_MESSAGE_LEN {
            log::warn!(
                "No end of message after {} bytes, flushing: {}",
                buf.len(),
                hex_string(&buf[..16])
            );
            return Ok(Some(buf));
        }
    }
}

impl SerialFeed {
    /// Forward messages from the read side of the serial socket until it
    /// closes or the task is aborted.
    pub fn spawn<R: AsyncRead + Unpin + Send + 'static>(&self, id: &str, reader: R) -> JoinHandle<()> {
        let feed = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            log::info!("Serial reader RUNNING for {} on {}", id, feed.class);
            let mut reader = BufReader::new(reader);
            loop {
                match read_message(&mut reader, &feed.end_of_message).await {
                    Ok(Some(msg)) => {
                        log::debug!("Rcv data from {} at {}: {}", id, feed.class, hex_string(&msg));
                        let _ = feed.messages.send(msg);
                    }
                    Ok(None) => {
                        log::debug!("Received end-of-stream from {} on {}", id, feed.class);
                        break;
                    }
                    Err(err) => {
                        log::debug!("Serial reader for {} on {} failed: {}", id, feed.class, err);
                        break;
                    }
                }
            }
            log::debug!("Serial reader STOPPING for {} on {}", id, feed.class);
        })
    }
}
