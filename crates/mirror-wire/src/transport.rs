//! Duplex transports carrying framed envelopes.
//!
//! A [`Transport`] is an unbounded outbound queue plus a [`FrameSource`] for
//! inbound frames. Two flavours exist: TCP with 4-byte length-prefixed JSON
//! frames, and an in-process channel pair. The session treats both alike.

use crate::message::{decode_length, frame, MAX_MESSAGE_SIZE};
use crate::WireError;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// Source of inbound frames (one JSON body each).
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// The next frame, `None` once the remote side has closed.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, WireError>>;
}

/// One physical duplex connection to a peer.
pub struct Transport {
    pub(crate) peer_id: Option<String>,
    pub(crate) outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) inbound: Box<dyn FrameSource>,
}

impl Transport {
    /// Wrap an outbound queue and an inbound frame source.
    pub fn new(outbound: mpsc::UnboundedSender<Vec<u8>>, inbound: Box<dyn FrameSource>) -> Self {
        Self {
            peer_id: None,
            outbound,
            inbound,
        }
    }

    /// Wrap a connected TCP stream. Spawns the writer task, so this must be
    /// called inside a tokio runtime.
    pub fn tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::tcp_halves(reader, writer)
    }

    /// Wrap the two halves of a TCP stream (e.g. after a handshake was read
    /// from them directly).
    pub fn tcp_halves(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(writer, rx));
        Self::new(tx, Box::new(TcpFrames { reader }))
    }

    /// Two in-process transports wired to each other.
    pub fn memory_pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self::new(a_tx, Box::new(ChannelFrames { rx: b_rx })),
            Self::new(b_tx, Box::new(ChannelFrames { rx: a_rx })),
        )
    }

    /// Give the transport a stable peer id instead of a generated one.
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    /// The stable peer id, if one was assigned.
    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }
}

/// Drain the outbound queue into the socket. Dropping the queue's sender
/// ends the loop and shuts down the write direction.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(body) = rx.recv().await {
        let bytes = frame(&body);
        if let Err(e) = writer.write_all(&bytes).await {
            debug!("write failed, dropping outbound queue: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            debug!("flush failed, dropping outbound queue: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Length-prefixed frames read from a TCP stream.
struct TcpFrames {
    reader: OwnedReadHalf,
}

#[async_trait]
impl FrameSource for TcpFrames {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, WireError>> {
        match read_frame(&mut self.reader).await {
            Ok(body) => Some(Ok(body)),
            Err(WireError::ConnectionClosed) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Frames handed over an in-process channel.
struct ChannelFrames {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameSource for ChannelFrames {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>, WireError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Read one framed body (4-byte length + JSON) from a TCP stream.
pub async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, WireError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
