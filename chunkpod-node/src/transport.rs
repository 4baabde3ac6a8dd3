//! Framed TCP transport shared by client and server roles: read/write whole frames and
//! typed messages over a stream, and connect to peers with a bounded timeout.

use std::io;
use std::time::Duration;

use chunkpod_core::wire::FrameEncodeError;
use chunkpod_core::{
    decode_frame, Command, Frame, FrameDecodeError, Message, MessageDecodeError, Node,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const READ_BUF_SIZE: usize = 4096;

/// Buffers a byte stream and yields complete frames.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Next frame, or `None` on a clean end of stream between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        loop {
            match decode_frame(&self.buf) {
                Ok((frame, used)) => {
                    self.buf.drain(..used);
                    return Ok(Some(frame));
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => return Err(TransportError::Frame(e)),
            }
            let mut chunk = [0u8; READ_BUF_SIZE];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next frame decoded as a message; end of stream is an error here.
    pub async fn read_message(&mut self) -> Result<Message, TransportError> {
        let frame = self.read_frame().await?.ok_or(TransportError::Closed)?;
        Ok(Message::decode(&frame)?)
    }

    /// Read messages until TERMINATE; returns everything before it.
    pub async fn read_until_terminate(&mut self) -> Result<Vec<Message>, TransportError> {
        let mut out = Vec::new();
        loop {
            match self.read_message().await? {
                Message::Terminate => return Ok(out),
                Message::Error => return Err(TransportError::ErrorReply),
                msg => out.push(msg),
            }
        }
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), TransportError> {
    let bytes = msg.encode()?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Client side of one request/response exchange.
pub struct Connection {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    /// Connect within `timeout`; a timeout or refusal means the peer is unreachable.
    pub async fn connect(peer: Node, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(peer.socket_addr()))
            .await
            .map_err(|_| TransportError::Timeout)??;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FrameReader::new(r),
            writer: w,
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        write_message(&mut self.writer, msg).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Message, TransportError> {
        self.reader.read_message().await
    }

    pub async fn recv_until_terminate(&mut self) -> Result<Vec<Message>, TransportError> {
        self.reader.read_until_terminate().await
    }

    /// Half-close so the server's session loop sees end of stream.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("timed out")]
    Timeout,
    #[error("connection closed mid-exchange")]
    Closed,
    #[error("frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("encode: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("malformed message: {0}")]
    Decode(#[from] MessageDecodeError),
    #[error("peer replied ERROR")]
    ErrorReply,
    #[error("unexpected {0:?} reply")]
    Unexpected(Command),
}

impl TransportError {
    /// Timeout, refusal, reset and other socket-level failures: the peer is unreachable
    /// and the exchange may be retried. Everything else is a protocol failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Timeout | TransportError::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkpod_core::FileId;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn reads_frames_split_across_writes() {
        let (client, mut server) = tokio::io::duplex(64);
        let node = Node::new(Ipv4Addr::new(10, 10, 10, 10), 10);
        let peer = Message::Peer { node }.encode().unwrap();
        let writer = tokio::spawn(async move {
            for b in peer.iter().chain(b"TER:\n".iter()) {
                server.write_all(&[*b]).await.unwrap();
            }
        });
        let mut reader = FrameReader::new(client);
        let msgs = reader.read_until_terminate().await.unwrap();
        assert_eq!(msgs, vec![Message::Peer { node }]);
        writer.await.unwrap();
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"ACK:abc").await.unwrap();
        drop(server);
        let mut reader = FrameReader::new(client);
        assert!(matches!(
            reader.read_frame().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn error_reply_ends_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"ERR:\n").await.unwrap();
        let mut reader = FrameReader::new(client);
        let err = reader.read_until_terminate().await.unwrap_err();
        assert!(matches!(err, TransportError::ErrorReply));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = Connection::connect(Node::new(Ipv4Addr::LOCALHOST, port), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn write_then_read_message() {
        let (client, server) = tokio::io::duplex(1024);
        let (_, mut w) = tokio::io::split(server);
        let id = FileId::generate();
        write_message(&mut w, &Message::Acknowledge { file_id: id })
            .await
            .unwrap();
        let mut reader = FrameReader::new(client);
        assert_eq!(
            reader.read_message().await.unwrap(),
            Message::Acknowledge { file_id: id }
        );
    }
}
