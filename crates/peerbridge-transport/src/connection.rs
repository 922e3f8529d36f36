//! Line-framed connections over any async byte stream.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::{ConnectionId, TransportError};

/// Longest line a peer may send. Anything longer is rejected rather than
/// buffered without bound.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Buffer size for in-memory connection pairs.
const MEMORY_PIPE_BYTES: usize = 64 * 1024;

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One bidirectional stream, framed as newline-terminated lines.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    reader: LineReader,
    writer: LineWriter,
}

impl Connection {
    /// Wraps an arbitrary reader/writer pair. `peer` is a human-readable
    /// label for logs (normally `host:port`).
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = ConnectionId::new(
            NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        );
        Self {
            id,
            peer: peer.into(),
            reader: LineReader::new(Box::new(reader), MAX_FRAME_BYTES),
            writer: LineWriter {
                inner: FramedWrite::new(Box::new(writer), LinesCodec::new()),
            },
        }
    }

    /// Wraps a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream
            .peer_addr()
            .map_err(TransportError::ConnectFailed)?
            .to_string();
        // Envelopes are small and latency-sensitive.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (read, write) = stream.into_split();
        Ok(Self::new(peer, read, write))
    }

    /// Two connections wired to each other through an in-memory pipe.
    ///
    /// Whatever one side sends, the other receives. Used for in-process
    /// peers and for tests that need deterministic (socket-free) I/O.
    pub fn in_memory_pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(MEMORY_PIPE_BYTES);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            Self::new("memory:a", a_read, a_write),
            Self::new("memory:b", b_read, b_write),
        )
    }

    /// Lowers the frame limit for this connection's reader.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        *self.reader.inner.decoder_mut() = LinesCodec::new_with_max_length(max_frame);
        self.reader.max_frame = max_frame;
        self
    }

    /// Returns the unique identifier for this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the peer label (`host:port` for TCP).
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Splits into independently owned receive and send halves.
    pub fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// Receive half of a [`Connection`].
pub struct LineReader {
    inner: FramedRead<BoxedReader, LinesCodec>,
    max_frame: usize,
}

impl LineReader {
    fn new(reader: BoxedReader, max_frame: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame)),
            max_frame,
        }
    }

    /// Receives the next non-blank line, without its terminator.
    ///
    /// Returns `Ok(None)` when the stream is cleanly closed. A trailing
    /// unterminated line before EOF is returned as a final frame.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let line = match self.inner.next().await {
                None => return Ok(None),
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(TransportError::FrameTooLarge {
                        limit: self.max_frame,
                    });
                }
                Some(Err(LinesCodecError::Io(e))) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(TransportError::MalformedFrame(e.to_string()));
                }
                Some(Err(LinesCodecError::Io(e))) => return Err(TransportError::ReceiveFailed(e)),
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(line.into_bytes()));
        }
    }

    /// Turns the reader into a lazy stream of frames.
    ///
    /// The stream ends after a clean close or after yielding the first
    /// error.
    pub fn into_stream(
        self,
    ) -> impl Stream<Item = Result<Vec<u8>, TransportError>> + Send {
        futures_util::stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.recv().await {
                Ok(Some(frame)) => Some((Ok(frame), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

/// Send half of a [`Connection`].
pub struct LineWriter {
    inner: FramedWrite<BoxedWriter, LinesCodec>,
}

impl LineWriter {
    /// Writes one UTF-8 frame followed by a newline, then flushes.
    ///
    /// The frame must not itself contain a newline.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let line = std::str::from_utf8(frame)
            .map_err(|e| TransportError::SendFailed(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.inner.send(line).await.map_err(write_error)
    }

    /// Flushes and shuts down the write direction. The peer sees
    /// end-of-stream.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        SinkExt::<&str>::close(&mut self.inner)
            .await
            .map_err(write_error)
    }
}

fn write_error(e: LinesCodecError) -> TransportError {
    match e {
        LinesCodecError::Io(e) => TransportError::SendFailed(e),
        // The encoder has no length limit.
        other => TransportError::SendFailed(io::Error::other(other)),
    }
}
