//! One TCP connection with framed, timeout-bounded reads and writes.

use crate::error::NetworkError;
use crate::network::wire::{self, Frame};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// How long one read waits before reporting "nothing yet"
pub const READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Bound on a whole frame write
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);
/// Largest single receive
pub const READ_CHUNK: usize = 2048;

pub struct Connection {
    remote: String,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    buffer: BytesMut,
    remote_closed: bool,
    /// Dialed by us rather than accepted
    outbound: bool,
    preamble_sent: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .field("remote_closed", &self.remote_closed)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Connection {
    /// Wrap an accepted socket, keyed by its peer address.
    pub fn accepted(stream: TcpStream) -> std::io::Result<Self> {
        let remote = stream.peer_addr()?.to_string();
        Ok(Self::from_stream(remote, stream, false))
    }

    /// Wrap a dialed socket, keyed by the address we dialed.
    pub fn dialed(remote: String, stream: TcpStream) -> Self {
        Self::from_stream(remote, stream, true)
    }

    fn from_stream(remote: String, stream: TcpStream, outbound: bool) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            remote,
            reader: Some(reader),
            writer: Some(writer),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            remote_closed: false,
            outbound,
            preamble_sent: false,
        }
    }

    pub fn remote_address(&self) -> &str {
        &self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// The peer sent EOF.
    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Next complete frame, or `None` if none arrived within
    /// [`READ_TIMEOUT`] or the peer closed its side.
    pub async fn read(&mut self) -> Result<Option<Frame>, NetworkError> {
        if let Some(frame) = wire::decode_frame(&mut self.buffer)? {
            return Ok(Some(frame));
        }

        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| NetworkError::AlreadyClosed(self.remote.clone()))?;
        if self.remote_closed {
            return Ok(None);
        }

        let mut chunk = [0u8; READ_CHUNK];
        match tokio::time::timeout(READ_TIMEOUT, reader.read(&mut chunk)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                debug!("Peer {} closed its side", self.remote);
                self.remote_closed = true;
                Ok(None)
            }
            Ok(Ok(n)) => {
                self.buffer.extend_from_slice(&chunk[..n]);
                wire::decode_frame(&mut self.buffer)
            }
            Ok(Err(e)) => Err(NetworkError::Io(e)),
        }
    }

    /// Send one frame, retrying partial writes to completion within
    /// [`SEND_TIMEOUT`]. Returns the full frame length.
    pub async fn write(&mut self, frame: &Frame) -> Result<usize, NetworkError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| NetworkError::AlreadyClosed(self.remote.clone()))?;

        let written = tokio::time::timeout(SEND_TIMEOUT, wire::write_frame(writer, frame))
            .await
            .map_err(|_| NetworkError::Timeout("sending frame"))??;

        if frame.is_preamble() {
            self.preamble_sent = true;
        }
        Ok(written)
    }

    /// Send the DATA preamble if this is a dialed connection that has not
    /// sent one yet.
    pub async fn ensure_preamble(&mut self) -> Result<(), NetworkError> {
        if self.outbound && !self.preamble_sent {
            self.write(&Frame::preamble()).await?;
        }
        Ok(())
    }

    /// Shut down the write half and drop both halves. Closing twice is an
    /// error, not a panic.
    pub async fn close(&mut self) -> Result<(), NetworkError> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| NetworkError::AlreadyClosed(self.remote.clone()))?;
        self.reader = None;
        self.buffer.clear();

        let result = tokio::time::timeout(SEND_TIMEOUT, writer.shutdown()).await;
        drop(writer);
        debug!("Released connection {}", self.remote);
        match result {
            Ok(Ok(())) => Ok(()),
            // Peer already gone; the socket is released either way
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Ok(Err(e)) => Err(NetworkError::Io(e)),
            Err(_) => Err(NetworkError::Timeout("closing connection")),
        }
    }
}
