//! Server role: accept connections, hand them to a fixed worker pool, and answer
//! each framed request from the chunk store and peer registry.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chunkpod_core::{Frame, Message, MessageDecodeError, Node};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::registry::PeerRegistry;
use crate::store::ChunkStore;
use crate::transport::{write_message, FrameReader, TransportError};

/// Everything a worker needs to answer requests.
#[derive(Clone)]
pub struct ServerState {
    pub listen_port: u16,
    pub registry: PeerRegistry,
    pub store: ChunkStore,
}

/// What to send back for one request and whether the session ends afterwards.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub messages: Vec<Message>,
    pub close: bool,
}

impl Reply {
    fn send(messages: Vec<Message>) -> Self {
        Self {
            messages,
            close: false,
        }
    }

    fn error() -> Self {
        Self::send(vec![Message::Error])
    }

    fn close() -> Self {
        Self {
            messages: Vec::new(),
            close: true,
        }
    }
}

impl ServerState {
    pub fn new(listen_port: u16, registry: PeerRegistry, store: ChunkStore) -> Self {
        Self {
            listen_port,
            registry,
            store,
        }
    }

    /// Dispatch one decoded frame. `caller` is the remote end of the session, if known.
    pub async fn handle(&self, caller: Option<Node>, frame: &Frame) -> Reply {
        let msg = match Message::decode(frame) {
            Ok(msg) => msg,
            Err(MessageDecodeError::Reserved(cmd)) => {
                debug!(?cmd, "reserved command");
                return Reply::error();
            }
            Err(e) => {
                debug!(error = %e, "undecodable request");
                return Reply::error();
            }
        };
        match msg {
            Message::Connect { node } => self.on_connect(caller, node).await,
            Message::Upload { chunk } => {
                let file_id = chunk.file_id;
                let order = chunk.order;
                match self.store.insert(chunk).await {
                    Ok(added) => {
                        debug!(%file_id, order, added, "stored chunk");
                        Reply::send(vec![Message::Acknowledge { file_id }])
                    }
                    Err(e) => {
                        warn!(%file_id, order, error = %e, "store insert failed");
                        Reply::error()
                    }
                }
            }
            Message::Download { file_id } => match self.store.chunks_for_file(file_id).await {
                Ok(chunks) => {
                    debug!(%file_id, held = chunks.len(), "serving download");
                    let mut messages: Vec<Message> =
                        chunks.into_iter().map(|chunk| Message::Data { chunk }).collect();
                    messages.push(Message::Terminate);
                    Reply::send(messages)
                }
                Err(e) => {
                    warn!(%file_id, error = %e, "store lookup failed");
                    Reply::error()
                }
            },
            Message::Retry { file_id, order } => match self.store.chunk(file_id, order).await {
                Ok(found) => {
                    let mut messages: Vec<Message> =
                        found.into_iter().map(|chunk| Message::Data { chunk }).collect();
                    messages.push(Message::Terminate);
                    Reply::send(messages)
                }
                Err(e) => {
                    warn!(%file_id, order, error = %e, "store lookup failed");
                    Reply::error()
                }
            },
            Message::Disconnect => Reply::close(),
            // Reply-only messages are not valid requests.
            other => {
                debug!(cmd = ?other.command(), "unexpected request");
                Reply::error()
            }
        }
    }

    async fn on_connect(&self, caller: Option<Node>, announced: Node) -> Reply {
        if self.registry.insert(announced).await {
            info!(peer = %announced, "registered peer");
        }
        let mut messages: Vec<Message> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|n| Some(*n) != caller && *n != announced)
            .map(|node| Message::Peer { node })
            .collect();
        messages.push(Message::Terminate);
        Reply::send(messages)
    }

    /// Serve one session until the caller disconnects, goes idle, or breaks framing.
    pub async fn serve_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        idle_timeout: Duration,
    ) -> Result<(), TransportError> {
        let caller = match remote {
            SocketAddr::V4(v4) => Some(Node::new(*v4.ip(), self.listen_port)),
            SocketAddr::V6(_) => None,
        };
        if let Some(node) = caller {
            if self.registry.insert(node).await {
                info!(peer = %node, "registered caller");
            }
        }

        let (r, mut w) = stream.into_split();
        let mut reader = FrameReader::new(r);
        loop {
            let frame = match tokio::time::timeout(idle_timeout, reader.read_frame()).await {
                Err(_) => {
                    debug!(%remote, "idle timeout");
                    break;
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    // Framing is lost; nothing more on this stream can be trusted.
                    let _ = write_message(&mut w, &Message::Error).await;
                    return Err(e);
                }
            };
            let reply = self.handle(caller, &frame).await;
            for msg in &reply.messages {
                write_message(&mut w, msg).await?;
            }
            w.flush().await?;
            if reply.close {
                break;
            }
        }
        let _ = w.shutdown().await;
        Ok(())
    }
}

/// Bind the listening socket on all interfaces.
pub async fn bind(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
}

/// Accept forever, queueing connections for `workers` tasks. Each worker serves one
/// connection at a time.
pub async fn run_server(
    listener: TcpListener,
    state: ServerState,
    workers: usize,
    idle_timeout: Duration,
) -> io::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel::<(TcpStream, SocketAddr)>();
    let rx = Arc::new(Mutex::new(rx));
    let state = Arc::new(state);
    for id in 0..workers.max(1) {
        let rx = rx.clone();
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                let Some((stream, remote)) = next else { break };
                debug!(worker = id, %remote, "session start");
                if let Err(e) = state.serve_connection(stream, remote, idle_timeout).await {
                    debug!(worker = id, %remote, error = %e, "session ended with error");
                }
            }
        });
    }

    info!(addr = %listener.local_addr()?, workers, "listening");
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        if tx.send((stream, remote)).is_err() {
            return Err(io::Error::new(io::ErrorKind::Other, "worker pool stopped"));
        }
    }
}
