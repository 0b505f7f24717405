//! Line-oriented transport to the actuator unit.
//!
//! [`Link`] is the seam between the protocol client and whatever byte pipe
//! reaches the microcontroller: a serial device node, a TCP bridge, or an
//! in-memory duplex stream to the simulated unit.  [`StreamLink`] adapts any
//! `AsyncRead + AsyncWrite` to it.

use async_trait::async_trait;
use agribot_types::AgriError;
use futures_util::FutureExt;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tracing::{debug, trace};

#[async_trait]
pub trait Link: Send {
    /// Write `line` followed by `\n`.
    async fn send_line(&mut self, line: &str) -> Result<(), AgriError>;

    /// Read the next non-empty line, without its terminator.
    ///
    /// # Errors
    ///
    /// [`AgriError::LinkClosed`] once the peer has hung up.
    async fn recv_line(&mut self) -> Result<String, AgriError>;

    /// Discard whatever input is already buffered, without waiting for more.
    async fn clear_input(&mut self);
}

/// A [`Link`] over any async byte stream.
pub struct StreamLink<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: String,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        let (read, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer,
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl<S> Link for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    async fn send_line(&mut self, line: &str) -> Result<(), AgriError> {
        trace!(peer = %self.peer, %line, "tx");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_line(&mut self) -> Result<String, AgriError> {
        let mut buf = String::new();
        loop {
            buf.clear();
            if self.reader.read_line(&mut buf).await? == 0 {
                return Err(AgriError::LinkClosed(format!("{} hung up", self.peer)));
            }
            let line = buf.trim();
            if !line.is_empty() {
                trace!(peer = %self.peer, %line, "rx");
                return Ok(line.to_string());
            }
        }
    }

    async fn clear_input(&mut self) {
        let mut dropped = 0usize;
        loop {
            let available = match self.reader.fill_buf().now_or_never() {
                Some(Ok(buf)) => buf.len(),
                _ => 0,
            };
            if available == 0 {
                break;
            }
            self.reader.consume(available);
            dropped += available;
        }
        if dropped > 0 {
            debug!(peer = %self.peer, bytes = dropped, "discarded stale input");
        }
    }
}

/// Open the link named by `endpoint`.
///
/// - `tcp://host:port` – a serial-to-TCP bridge.
/// - anything else – a device node such as `/dev/ttyUSB0`, opened for
///   read/write.  Line settings (baud rate, framing) are expected to be
///   configured on the device beforehand.
pub async fn connect(endpoint: &str) -> Result<Box<dyn Link>, AgriError> {
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| AgriError::Io(format!("connect {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        debug!(%addr, "tcp link connected");
        return Ok(Box::new(StreamLink::new(stream, endpoint)));
    }
    let device = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(endpoint)
        .await
        .map_err(|e| AgriError::Io(format!("open {endpoint}: {e}")))?;
    debug!(path = endpoint, "device link opened");
    Ok(Box::new(StreamLink::new(device, endpoint)))
}

#[async_trait]
impl Link for Box<dyn Link> {
    async fn send_line(&mut self, line: &str) -> Result<(), AgriError> {
        (**self).send_line(line).await
    }

    async fn recv_line(&mut self) -> Result<String, AgriError> {
        (**self).recv_line().await
    }

    async fn clear_input(&mut self) {
        (**self).clear_input().await
    }
}
