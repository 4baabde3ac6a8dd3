//! Download pipeline: ask every known peer for a file's chunks, fill gaps with
//! per-order RETRY requests, verify the whole-file checksum and write the result.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chunkpod_core::{ChunkRecord, ChunkSet, FileId, InsertOutcome, Message, Node, ReassemblyError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::transport::{Connection, TransportError};

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub file_id: FileId,
    pub path: PathBuf,
    pub size: usize,
    /// Orders that only arrived through RETRY.
    pub retried: Vec<u16>,
}

impl Client {
    pub async fn download_file(&self, file_id: FileId) -> Result<DownloadReport, DownloadError> {
        let mut peers = self.registry.snapshot().await;
        if peers.is_empty() {
            return Err(DownloadError::NoPeers);
        }
        peers.sort_unstable();
        info!(%file_id, peers = peers.len(), "downloading");

        let mut tasks = JoinSet::new();
        for peer in peers.iter().copied() {
            let client = self.clone();
            tasks.spawn(async move { (peer, client.request_chunks(peer, file_id).await) });
        }
        // Keyed by peer so the merge below does not depend on reply timing.
        let mut by_peer = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (peer, result) = joined.map_err(|e| DownloadError::Task(e.to_string()))?;
            match result {
                Ok(chunks) => {
                    debug!(%peer, count = chunks.len(), "received chunks");
                    by_peer.insert(peer, chunks);
                }
                Err(e) if e.is_transport() => {
                    warn!(%peer, error = %e, "peer unreachable, skipping");
                }
                Err(source) => return Err(DownloadError::Protocol { peer, source }),
            }
        }

        let mut received = collect(file_id, by_peer)?;
        let mut retried = Vec::new();
        for order in received.set.missing_orders() {
            if let Some(chunk) = self.retry_order(&peers, file_id, order).await? {
                if received.set.insert(chunk) == InsertOutcome::Added {
                    retried.push(order);
                }
            }
        }

        let data = received.reassemble().map_err(|e| match e {
            ReassemblyError::Incomplete(missing) => DownloadError::Incomplete { file_id, missing },
            ReassemblyError::ChecksumMismatch => DownloadError::Integrity { file_id },
        })?;
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;
        let path = self.settings.output_dir.join(received.set.output_file_name());
        tokio::fs::write(&path, &data).await?;
        info!(%file_id, path = %path.display(), bytes = data.len(), "download complete");
        Ok(DownloadReport {
            file_id,
            path,
            size: data.len(),
            retried,
        })
    }

    /// DOWNLOAD exchange with one peer: every DATA chunk it holds for `file_id`.
    pub async fn request_chunks(
        &self,
        peer: Node,
        file_id: FileId,
    ) -> Result<Vec<ChunkRecord>, TransportError> {
        let mut conn = Connection::connect(peer, self.settings.connect_timeout).await?;
        conn.send(&Message::Download { file_id }).await?;
        let replies = conn.recv_until_terminate().await?;
        conn.close().await;
        replies.into_iter().map(into_chunk).collect()
    }

    /// RETRY exchange with one peer: the chunk at `order`, if the peer holds it.
    pub async fn request_order(
        &self,
        peer: Node,
        file_id: FileId,
        order: u16,
    ) -> Result<Option<ChunkRecord>, TransportError> {
        let mut conn = Connection::connect(peer, self.settings.connect_timeout).await?;
        conn.send(&Message::Retry { file_id, order }).await?;
        let replies = conn.recv_until_terminate().await?;
        conn.close().await;
        Ok(replies
            .into_iter()
            .map(into_chunk)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .find(|c| c.file_id == file_id && c.order == order))
    }

    /// Ask each peer in turn; the first one that has the chunk wins. Unreachable peers
    /// are skipped, a malformed reply fails the download.
    async fn retry_order(
        &self,
        peers: &[Node],
        file_id: FileId,
        order: u16,
    ) -> Result<Option<ChunkRecord>, DownloadError> {
        for peer in peers.iter().copied() {
            match self.request_order(peer, file_id, order).await {
                Ok(Some(chunk)) => {
                    debug!(%peer, order, "recovered chunk");
                    return Ok(Some(chunk));
                }
                Ok(None) => {}
                Err(e) if e.is_transport() => debug!(%peer, order, error = %e, "retry failed"),
                Err(source) => return Err(DownloadError::Protocol { peer, source }),
            }
        }
        warn!(%file_id, order, "no peer holds chunk");
        Ok(None)
    }
}

fn into_chunk(msg: Message) -> Result<ChunkRecord, TransportError> {
    match msg {
        Message::Data { chunk } => Ok(chunk),
        other => Err(TransportError::Unexpected(other.command())),
    }
}

/// Chunks gathered for one file: the first copy of each order in `set`, every other
/// distinct copy of a held order in `spares`.
#[derive(Debug)]
struct Received {
    set: ChunkSet,
    spares: BTreeMap<u16, Vec<ChunkRecord>>,
}

impl Received {
    fn new(first: ChunkRecord) -> Self {
        Self {
            set: ChunkSet::new(first),
            spares: BTreeMap::new(),
        }
    }

    fn offer(&mut self, chunk: ChunkRecord) {
        let order = chunk.order;
        match self.set.get(order) {
            None => {
                self.set.insert(chunk);
            }
            Some(held) if held.data == chunk.data => {}
            Some(_) => {
                let spares = self.spares.entry(order).or_default();
                if !spares.iter().any(|s| s.data == chunk.data) {
                    spares.push(chunk);
                }
            }
        }
    }

    /// Reassemble; on a checksum failure try each spare copy in place of the held one.
    fn reassemble(&self) -> Result<Vec<u8>, ReassemblyError> {
        let err = match self.set.reassemble() {
            Ok(data) => return Ok(data),
            Err(e) => e,
        };
        if err != ReassemblyError::ChecksumMismatch {
            return Err(err);
        }
        for copy in self.spares.values().flatten() {
            let mut trial = self.set.clone();
            if trial.replace(copy.clone()).is_none() {
                continue;
            }
            if let Ok(data) = trial.reassemble() {
                debug!(order = copy.order, "checksum verified with alternate copy");
                return Ok(data);
            }
        }
        Err(err)
    }
}

/// Merge per-peer replies in peer order. Chunks of other files or outside their own
/// range are dropped. Chunks disagreeing on per-file metadata form separate candidates;
/// the one covering the most orders is kept (earliest on ties).
fn collect(
    file_id: FileId,
    by_peer: BTreeMap<Node, Vec<ChunkRecord>>,
) -> Result<Received, DownloadError> {
    let mut candidates: Vec<Received> = Vec::new();
    for (peer, chunks) in by_peer {
        for chunk in chunks {
            if chunk.file_id != file_id || chunk.order >= chunk.num_chunks {
                warn!(%peer, %file_id, order = chunk.order, "dropping chunk");
                continue;
            }
            match candidates.iter_mut().find(|c| c.set.matches_file(&chunk)) {
                Some(candidate) => candidate.offer(chunk),
                None => candidates.push(Received::new(chunk)),
            }
        }
    }
    let mut candidates = candidates.into_iter();
    let mut best = candidates.next().ok_or(DownloadError::NotFound(file_id))?;
    for candidate in candidates {
        let dropped = if candidate.set.len() > best.set.len() {
            std::mem::replace(&mut best, candidate)
        } else {
            candidate
        };
        warn!(%file_id, chunks = dropped.set.len(), "dropping chunks with conflicting metadata");
    }
    Ok(best)
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("no peers available")]
    NoPeers,
    #[error("no peer holds file {0}")]
    NotFound(FileId),
    #[error("peer {peer} sent a malformed reply: {source}")]
    Protocol {
        peer: Node,
        #[source]
        source: TransportError,
    },
    #[error("file {file_id}: chunks {missing:?} unavailable")]
    Incomplete { file_id: FileId, missing: BTreeSet<u16> },
    #[error("file {file_id}: checksum mismatch")]
    Integrity { file_id: FileId },
    #[error("writing output: {0}")]
    Io(#[from] std::io::Error),
    #[error("download task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSettings;
    use crate::registry::PeerRegistry;
    use crate::server::testing::spawn_server;
    use crate::store::ChunkStore;
    use crate::transport::{write_message, FrameReader};
    use chunkpod_core::split_into_chunks;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn sample(len: usize) -> (Vec<u8>, Vec<ChunkRecord>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 13 % 256) as u8).collect();
        let chunks = split_into_chunks(FileId::generate(), "report.pdf", &data).unwrap();
        (data, chunks)
    }

    async fn serving(chunks: &[ChunkRecord]) -> Node {
        let store = ChunkStore::open_in_memory().unwrap();
        for chunk in chunks {
            store.insert(chunk.clone()).await.unwrap();
        }
        spawn_server(store).await.0
    }

    async fn test_client(peers: &[Node], out: &tempfile::TempDir) -> Client {
        let registry = PeerRegistry::new(Node::new(Ipv4Addr::LOCALHOST, 1));
        registry.extend(peers.iter().copied()).await;
        let settings = ClientSettings {
            connect_timeout: Duration::from_secs(1),
            output_dir: out.path().to_path_buf(),
            ..ClientSettings::default()
        };
        Client::new(registry, settings)
    }

    /// A peer that answers DOWNLOAD with nothing and RETRY from `chunks`.
    async fn retry_only_peer(chunks: Vec<ChunkRecord>) -> Node {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let (r, mut w) = stream.into_split();
                let mut reader = FrameReader::new(r);
                while let Ok(msg) = reader.read_message().await {
                    if let Message::Retry { order, .. } = msg {
                        if let Some(c) = chunks.iter().find(|c| c.order == order) {
                            write_message(&mut w, &Message::Data { chunk: c.clone() })
                                .await
                                .unwrap();
                        }
                    }
                    write_message(&mut w, &Message::Terminate).await.unwrap();
                }
            }
        });
        Node::new(Ipv4Addr::LOCALHOST, port)
    }

    #[tokio::test]
    async fn merges_chunks_from_several_peers() {
        let (data, chunks) = sample(1300);
        let a = serving(&[chunks[0].clone(), chunks[2].clone()]).await;
        let b = serving(&[chunks[1].clone()]).await;
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&[a, b], &out).await;

        let report = client.download_file(chunks[0].file_id).await.unwrap();
        assert!(report.retried.is_empty());
        assert_eq!(report.size, 1300);
        let expected = out.path().join(chunkpod_core::reassembly::output_file_name(
            &chunks[0].file_checksum,
            "report.pdf",
        ));
        assert_eq!(report.path, expected);
        assert_eq!(std::fs::read(&report.path).unwrap(), data);
    }

    #[tokio::test]
    async fn fills_gaps_with_retry() {
        let (data, chunks) = sample(1300);
        let a = serving(&[chunks[0].clone(), chunks[2].clone()]).await;
        let c = retry_only_peer(vec![chunks[1].clone()]).await;
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&[a, c], &out).await;

        let report = client.download_file(chunks[0].file_id).await.unwrap();
        assert_eq!(report.retried, vec![1]);
        assert_eq!(std::fs::read(&report.path).unwrap(), data);
    }

    #[tokio::test]
    async fn missing_chunk_is_incomplete() {
        let (_, chunks) = sample(1300);
        let a = serving(&[chunks[0].clone()]).await;
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&[a], &out).await;

        match client.download_file(chunks[0].file_id).await {
            Err(DownloadError::Incomplete { missing, .. }) => {
                assert_eq!(missing, BTreeSet::from([1, 2]));
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn corrupted_chunk_fails_integrity() {
        let (_, chunks) = sample(1100);
        let mut bad = chunks[1].clone();
        bad.data[0] ^= 0xff;
        let a = serving(&[chunks[0].clone(), bad, chunks[2].clone()]).await;
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&[a], &out).await;

        assert!(matches!(
            client.download_file(chunks[0].file_id).await,
            Err(DownloadError::Integrity { .. })
        ));
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_file_and_dead_peer() {
        let (_, chunks) = sample(10);
        let a = serving(&chunks).await;
        let dead = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            Node::new(Ipv4Addr::LOCALHOST, l.local_addr().unwrap().port())
        };
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&[a, dead], &out).await;

        assert!(matches!(
            client.download_file(FileId::generate()).await,
            Err(DownloadError::NotFound(_))
        ));
        let report = client.download_file(chunks[0].file_id).await.unwrap();
        assert_eq!(report.size, 10);
    }

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let mut peers = Vec::new();
        for _ in 0..4 {
            peers.push(spawn_server(ChunkStore::open_in_memory().unwrap()).await.0);
        }
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&peers, &out).await;

        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("notes.txt");
        let data: Vec<u8> = (0..1300).map(|i| (i % 97) as u8 + b' ').collect();
        std::fs::write(&path, &data).unwrap();

        let uploaded = client.upload_file(&path).await.unwrap();
        assert_eq!(uploaded.num_chunks, 3);
        let report = client.download_file(uploaded.file_id).await.unwrap();
        assert!(report.retried.is_empty());
        assert_eq!(std::fs::read(&report.path).unwrap(), data);
        assert!(report
            .path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .ends_with("_notes.txt"));
    }

    /// A peer that answers DOWNLOAD with nothing and RETRY with an undecodable DATA line.
    async fn garbled_retry_peer() -> Node {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let (r, mut w) = stream.into_split();
                let mut reader = FrameReader::new(r);
                while let Ok(msg) = reader.read_message().await {
                    if let Message::Retry { .. } = msg {
                        let mut line = b"DAT:".to_vec();
                        line.extend_from_slice(&[b'0'; 108]);
                        line.push(b'\n');
                        w.write_all(&line).await.unwrap();
                    }
                    write_message(&mut w, &Message::Terminate).await.unwrap();
                }
            }
        });
        Node::new(Ipv4Addr::LOCALHOST, port)
    }

    fn corrupt(chunk: &ChunkRecord) -> ChunkRecord {
        let mut bad = chunk.clone();
        bad.data[0] ^= 0xff;
        bad
    }

    #[test]
    fn merge_does_not_depend_on_which_peer_sorts_first() {
        let (data, chunks) = sample(1300);
        let file_id = chunks[0].file_id;
        let mut stale = chunks[0].clone();
        stale.num_chunks = 5;
        stale.order = 3;
        let honest = chunks.clone();
        let faulty = vec![corrupt(&chunks[1]), stale];

        let lo = Node::new(Ipv4Addr::LOCALHOST, 1000);
        let hi = Node::new(Ipv4Addr::LOCALHOST, 2000);
        for (first, second) in [(honest.clone(), faulty.clone()), (faulty, honest)] {
            let by_peer = BTreeMap::from([(lo, first), (hi, second)]);
            let received = collect(file_id, by_peer).unwrap();
            assert_eq!(received.set.num_chunks(), 3);
            assert_eq!(received.reassemble().unwrap(), data);
        }
    }

    #[test]
    fn identical_copies_are_not_spares() {
        let (_, chunks) = sample(1300);
        let lo = Node::new(Ipv4Addr::LOCALHOST, 1000);
        let hi = Node::new(Ipv4Addr::LOCALHOST, 2000);
        let by_peer = BTreeMap::from([(lo, chunks.clone()), (hi, chunks.clone())]);
        let received = collect(chunks[0].file_id, by_peer).unwrap();
        assert!(received.spares.is_empty());
        assert!(received.set.is_complete());
    }

    #[tokio::test]
    async fn corrupt_duplicate_does_not_sink_download() {
        let (data, chunks) = sample(1300);
        let honest = serving(&chunks).await;
        let faulty = serving(&[corrupt(&chunks[1])]).await;
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&[honest, faulty], &out).await;

        let report = client.download_file(chunks[0].file_id).await.unwrap();
        assert_eq!(std::fs::read(&report.path).unwrap(), data);
    }

    #[tokio::test]
    async fn garbled_retry_reply_fails_download() {
        let (_, chunks) = sample(1300);
        let a = serving(&[chunks[0].clone(), chunks[2].clone()]).await;
        let garbled = garbled_retry_peer().await;
        let out = tempfile::tempdir().unwrap();
        let client = test_client(&[a, garbled], &out).await;

        match client.download_file(chunks[0].file_id).await {
            Err(DownloadError::Protocol { peer, source }) => {
                assert_eq!(peer, garbled);
                assert!(!source.is_transport());
            }
            other => panic!("expected Protocol, got {other:?}"),
        }
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }
}
