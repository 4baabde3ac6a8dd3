//! Upload pipeline: checksum and split a file, scatter its chunks round-robin over a
//! capped sharing set, retry each transport failure once after a randomized backoff.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chunkpod_core::scheduler::{assign_chunks_to_peers, select_sharing_set};
use chunkpod_core::{split_into_chunks, ChunkRecord, FileId, Message, Node};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::transport::{Connection, TransportError};

/// Outcome of a fully delivered upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub file_id: FileId,
    pub num_chunks: u16,
    /// Receiving peer of each chunk order.
    pub receivers: BTreeMap<u16, Node>,
}

impl Client {
    /// Upload the file at `path`. Returns the file id to download it with later.
    pub async fn upload_file(&self, path: &Path) -> Result<UploadReport, UploadError> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(UploadError::FileName)?
            .to_string();

        let peers = self.registry.snapshot().await;
        let sharing = select_sharing_set(
            &peers,
            self.settings.max_sharing_peers,
            &mut rand::thread_rng(),
        );
        if sharing.is_empty() {
            return Err(UploadError::NoPeers);
        }

        let file_id = FileId::generate();
        let chunks = split_into_chunks(file_id, &file_name, &data)?;
        let num_chunks = chunks.len() as u16;
        info!(
            file = %file_name,
            %file_id,
            bytes = data.len(),
            chunks = num_chunks,
            peers = sharing.len(),
            "uploading"
        );

        // One sequential delivery task per receiver; receivers proceed concurrently.
        let mut per_receiver: BTreeMap<Node, Vec<ChunkRecord>> = BTreeMap::new();
        for (receiver, chunk) in assign_chunks_to_peers(chunks, &sharing) {
            per_receiver.entry(receiver).or_default().push(chunk);
        }
        let mut tasks = JoinSet::new();
        for (receiver, chunks) in per_receiver {
            let client = self.clone();
            tasks.spawn(async move { client.deliver_all(receiver, chunks).await });
        }

        let mut receivers = BTreeMap::new();
        let mut lost = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let results = joined.map_err(|e| UploadError::Task(e.to_string()))?;
            for (order, receiver, delivered) in results {
                if delivered {
                    receivers.insert(order, receiver);
                } else {
                    lost.push(order);
                }
            }
        }
        if !lost.is_empty() {
            lost.sort_unstable();
            return Err(UploadError::ChunksLost { file_id, lost });
        }
        info!(%file_id, "upload complete");
        Ok(UploadReport {
            file_id,
            num_chunks,
            receivers,
        })
    }

    async fn deliver_all(&self, receiver: Node, chunks: Vec<ChunkRecord>) -> Vec<(u16, Node, bool)> {
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let order = chunk.order;
            let delivered = self.deliver_with_retry(receiver, chunk).await;
            out.push((order, receiver, delivered));
        }
        out
    }

    /// Deliver one chunk; a transport failure is retried exactly once after a backoff,
    /// a protocol failure is not retried.
    async fn deliver_with_retry(&self, receiver: Node, chunk: ChunkRecord) -> bool {
        let order = chunk.order;
        let err = match self.upload_chunk(receiver, &chunk).await {
            Ok(()) => return true,
            Err(e) => e,
        };
        if !err.is_transport() {
            warn!(peer = %receiver, order, error = %err, "upload rejected");
            return false;
        }
        let backoff = self.backoff();
        debug!(peer = %receiver, order, error = %err, ?backoff, "upload failed, retrying");
        tokio::time::sleep(backoff).await;
        match self.upload_chunk(receiver, &chunk).await {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %receiver, order, error = %e, "upload failed twice, chunk lost");
                false
            }
        }
    }

    fn backoff(&self) -> Duration {
        let (min, max) = self.settings.retry_backoff;
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    /// One UPLOAD exchange: send the chunk, expect ACKNOWLEDGE with its file id.
    pub async fn upload_chunk(&self, receiver: Node, chunk: &ChunkRecord) -> Result<(), TransportError> {
        let mut conn = Connection::connect(receiver, self.settings.connect_timeout).await?;
        conn.send(&Message::Upload {
            chunk: chunk.clone(),
        })
        .await?;
        let reply = conn.recv().await?;
        conn.close().await;
        match reply {
            Message::Acknowledge { file_id } if file_id == chunk.file_id => Ok(()),
            Message::Error => Err(TransportError::ErrorReply),
            other => Err(TransportError::Unexpected(other.command())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("reading file: {0}")]
    Io(#[from] std::io::Error),
    #[error("file name is not valid UTF-8")]
    FileName,
    #[error("no peers available")]
    NoPeers,
    #[error(transparent)]
    Split(#[from] chunkpod_core::chunk::SplitError),
    #[error("file {file_id}: chunks {lost:?} could not be delivered")]
    ChunksLost { file_id: FileId, lost: Vec<u16> },
    #[error("delivery task failed: {0}")]
    Task(String),
}
