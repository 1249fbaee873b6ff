//! Transport abstraction.
//!
//! A session talks to its peer through a [`Connection`]: a boxed
//! [`MessageReader`], a boxed [`MessageWriter`] and the immutable
//! [`ConnectionInfo`]. The plain transport is implemented here on top of any
//! tokio byte stream; the encrypted transport lives in [`crate::noise`] and
//! implements the same two traits, so sessions never branch on transport kind.

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result, RpcError};
use crate::noise::NoiseInfo;
use crate::protocol::{self, Message};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Metadata about an established transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    /// Handshake result, present only on encrypted transports.
    pub noise: Option<NoiseInfo>,
}

impl ConnectionInfo {
    /// Addresses of an established TCP stream.
    pub fn tcp(stream: &TcpStream) -> Result<Self> {
        Ok(Self {
            peer_addr: Some(stream.peer_addr()?),
            local_addr: Some(stream.local_addr()?),
            noise: None,
        })
    }

    /// Whether the transport runs over a Noise session.
    pub fn is_encrypted(&self) -> bool {
        self.noise.is_some()
    }
}

/// Read half of a transport.
#[async_trait]
pub trait MessageReader: Send {
    /// Read the next message.
    ///
    /// Returns `None` on clean EOF (peer closed the stream between records).
    async fn read_message(&mut self) -> Result<Option<Message>>;
}

/// Write half of a transport. Each call writes exactly one whole record.
#[async_trait]
pub trait MessageWriter: Send {
    /// Encode `message` and write it as one record, flushing afterwards.
    async fn write_message(&mut self, message: &Message) -> Result<()>;

    /// Shut down the write direction. Calling this more than once is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Reads newline-terminated records from a buffered byte stream.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_line_length: usize,
}

impl<R> LineReader<R> {
    /// Reject records longer than `max_line_length` bytes.
    pub fn new(inner: R, max_line_length: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_line_length,
        }
    }
}

// Bytes of an interrupted read stay in `buf`, so a cancelled `read_message`
// resumes where it left off on the next call.
#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> MessageReader for LineReader<R> {
    async fn read_message(&mut self) -> Result<Option<Message>> {
        // Room for the record plus "\r\n".
        let limit = self.max_line_length + 2;
        let remaining = limit.saturating_sub(self.buf.len()) as u64;
        let n = (&mut self.inner)
            .take(remaining)
            .read_until(ProtocolConfig::RECORD_TERMINATOR, &mut self.buf)
            .await?;

        if n == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.last() != Some(&ProtocolConfig::RECORD_TERMINATOR) {
            let len = self.buf.len();
            self.buf.clear();
            if len >= limit {
                return Err(ProtocolError::LineTooLong {
                    len,
                    max: self.max_line_length,
                }
                .into());
            }
            return Err(ProtocolError::TruncatedRecord.into());
        }

        let message = protocol::decode(&self.buf);
        self.buf.clear();
        Ok(Some(message?))
    }
}

/// Writes one record per message to a byte stream.
pub struct LineWriter<W> {
    inner: W,
    closed: bool,
}

impl<W> LineWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageWriter for LineWriter<W> {
    async fn write_message(&mut self, message: &Message) -> Result<()> {
        let record = protocol::encode(message)?;
        self.inner.write_all(&record).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown().await?;
        Ok(())
    }
}

enum Outbound {
    Record(Message, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Queue in front of a [`MessageWriter`] owned by its own task.
///
/// A record accepted by the queue is written whole even if the sender stops
/// waiting for it, so dropping a caller mid-write never tears a record or
/// skips a Noise nonce. Records go out in the order they were queued.
#[derive(Clone)]
pub(crate) struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    /// Spawn the writer task. Must be called from within a tokio runtime.
    pub(crate) fn spawn(writer: Box<dyn MessageWriter>) -> Self {
        let (tx, rx) = mpsc::channel(ProtocolConfig::OUTBOX_CAPACITY);
        tokio::spawn(drive_writer(writer, rx));
        Self { tx }
    }

    /// Queue `message` and wait until it has been written.
    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Record(message, ack_tx))
            .await
            .map_err(|_| RpcError::Disconnected)?;
        ack_rx.await.unwrap_or(Err(RpcError::Disconnected))
    }

    /// Close the write direction after everything queued so far.
    pub(crate) async fn close(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Close(ack_tx))
            .await
            .map_err(|_| RpcError::Disconnected)?;
        ack_rx.await.unwrap_or(Err(RpcError::Disconnected))
    }
}

async fn drive_writer(mut writer: Box<dyn MessageWriter>, mut rx: mpsc::Receiver<Outbound>) {
    // After a failed write the stream may hold a partial record; nothing
    // else goes out behind it.
    let mut usable = true;
    while let Some(request) = rx.recv().await {
        match request {
            Outbound::Record(message, ack) => {
                let outcome = if usable {
                    writer.write_message(&message).await
                } else {
                    Err(RpcError::Disconnected)
                };
                if let Err(e) = &outcome {
                    debug!("Write failed: {}", e);
                    usable = false;
                }
                let _ = ack.send(outcome);
            }
            Outbound::Close(ack) => {
                usable = false;
                let _ = ack.send(writer.close().await);
            }
        }
    }

    if let Err(e) = writer.close().await {
        debug!("Error closing transport: {}", e);
    }
}

/// An open duplex transport ready to be bound to a session.
pub struct Connection {
    reader: Box<dyn MessageReader>,
    writer: Box<dyn MessageWriter>,
    info: ConnectionInfo,
}

impl Connection {
    /// Assemble a connection from custom reader and writer halves.
    pub fn new(
        reader: impl MessageReader + 'static,
        writer: impl MessageWriter + 'static,
        info: ConnectionInfo,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            info,
        }
    }

    /// Plain transport over any byte stream.
    pub fn plain<S>(stream: S, info: ConnectionInfo, max_line_length: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::new(
            LineReader::new(BufReader::new(read_half), max_line_length),
            LineWriter::new(write_half),
            info,
        )
    }

    /// Plain transport with default limits and no address metadata.
    ///
    /// Mostly useful with `tokio::io::duplex` for in-process sessions.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::plain(stream, ConnectionInfo::default(), ProtocolConfig::MAX_LINE_LENGTH)
    }

    /// Plain transport over an established TCP stream.
    pub fn tcp(stream: TcpStream, max_line_length: usize) -> Result<Self> {
        let info = ConnectionInfo::tcp(&stream)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self::new(
            LineReader::new(BufReader::new(read_half), max_line_length),
            LineWriter::new(write_half),
            info,
        ))
    }

    /// Metadata captured when the transport was established.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Read the next record; `None` on clean EOF.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        self.reader.read_message().await
    }

    /// Write one record.
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        self.writer.write_message(message).await
    }

    /// Shut down the write direction.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.close().await
    }

    /// Split into the halves a session drives.
    pub fn into_parts(self) -> (Box<dyn MessageReader>, Box<dyn MessageWriter>, ConnectionInfo) {
        (self.reader, self.writer, self.info)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::protocol::Payload;
    use std::io::Cursor;

    fn reader(bytes: &[u8], max: usize) -> LineReader<Cursor<Vec<u8>>> {
        LineReader::new(Cursor::new(bytes.to_vec()), max)
    }

    #[tokio::test]
    async fn test_line_read_write_roundtrip() {
        let mut buf = Vec::new();
        let mut writer = LineWriter::new(&mut buf);
        let call = Message::call(1, "Calc", "add(int,int)", Payload::new(&(2, 3)).unwrap());
        writer.write_message(&call).await.unwrap();
        writer.write_message(&Message::Disconnect).await.unwrap();

        let mut reader = reader(&buf, ProtocolConfig::MAX_LINE_LENGTH);
        assert_eq!(reader.read_message().await.unwrap(), Some(call));
        assert_eq!(reader.read_message().await.unwrap(), Some(Message::Disconnect));
        assert_eq!(reader.read_message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_empty_stream_returns_none() {
        let mut reader = reader(b"", 64);
        assert!(reader.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_truncated_record_returns_error() {
        let mut reader = reader(b"{\"type\":\"disconn", 64);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::TruncatedRecord)
        ));
    }

    #[tokio::test]
    async fn test_read_oversized_record_returns_error() {
        let mut long = vec![b'x'; 200];
        long.push(b'\n');
        let mut reader = reader(&long, 64);
        let err = reader.read_message().await.unwrap_err();
        assert!(matches!(
            err,
            RpcError::Protocol(ProtocolError::LineTooLong { max: 64, .. })
        ));
    }

    #[tokio::test]
    async fn test_duplex_connection_pair() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Connection::from_stream(a);
        let mut right = Connection::from_stream(b);

        left.write_message(&Message::Disconnect).await.unwrap();
        assert_eq!(right.read_message().await.unwrap(), Some(Message::Disconnect));

        left.close().await.unwrap();
        left.close().await.unwrap();
        assert_eq!(right.read_message().await.unwrap(), None);
        assert!(!right.info().is_encrypted());
    }
}
