//! Reassembly: collect chunk records from any number of sources, detect gaps by order,
//! and rebuild the original bytes once the whole-file checksum verifies.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunk::ChunkRecord;
use crate::identity::{checksum_to_hex, Checksum, FileId};
use crate::integrity;

/// Result of offering one chunk to a [`ChunkSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First copy of this order; kept.
    Added,
    /// Order already present; the earlier copy is kept.
    Duplicate,
    /// `order >= num_chunks`; dropped.
    OutOfRange,
    /// File id, checksum, name or chunk count disagrees with the accepted chunks; dropped.
    Mismatched,
}

/// Chunks of one file keyed by order. Per-file metadata comes from the first chunk.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    file_id: FileId,
    num_chunks: u16,
    file_checksum: Checksum,
    file_name: String,
    chunks: BTreeMap<u16, ChunkRecord>,
}

impl ChunkSet {
    /// Start a set from its first chunk.
    pub fn new(first: ChunkRecord) -> Self {
        let mut set = Self {
            file_id: first.file_id,
            num_chunks: first.num_chunks,
            file_checksum: first.file_checksum,
            file_name: first.file_name.clone(),
            chunks: BTreeMap::new(),
        };
        set.insert(first);
        set
    }

    /// Build from an arbitrary collection, in iteration order. `None` if empty.
    pub fn from_chunks(chunks: impl IntoIterator<Item = ChunkRecord>) -> Option<Self> {
        let mut iter = chunks.into_iter();
        let mut set = Self::new(iter.next()?);
        for chunk in iter {
            set.insert(chunk);
        }
        Some(set)
    }

    pub fn insert(&mut self, chunk: ChunkRecord) -> InsertOutcome {
        if !self.matches_file(&chunk) {
            return InsertOutcome::Mismatched;
        }
        if chunk.order >= self.num_chunks {
            return InsertOutcome::OutOfRange;
        }
        if self.chunks.contains_key(&chunk.order) {
            return InsertOutcome::Duplicate;
        }
        self.chunks.insert(chunk.order, chunk);
        InsertOutcome::Added
    }

    /// Swap in another copy of an order already held. Returns the displaced copy, or
    /// `None` (and leaves the set untouched) if the chunk does not fit this set.
    pub fn replace(&mut self, chunk: ChunkRecord) -> Option<ChunkRecord> {
        if !self.matches_file(&chunk) || !self.chunks.contains_key(&chunk.order) {
            return None;
        }
        self.chunks.insert(chunk.order, chunk)
    }

    /// True if the chunk carries this set's file id and per-file metadata.
    pub fn matches_file(&self, chunk: &ChunkRecord) -> bool {
        chunk.file_id == self.file_id
            && chunk.num_chunks == self.num_chunks
            && chunk.file_checksum == self.file_checksum
            && chunk.file_name == self.file_name
    }

    pub fn get(&self, order: u16) -> Option<&ChunkRecord> {
        self.chunks.get(&order)
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn num_chunks(&self) -> u16 {
        self.num_chunks
    }

    pub fn file_checksum(&self) -> &Checksum {
        &self.file_checksum
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Number of distinct orders held.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Orders in `0..num_chunks` not yet held.
    pub fn missing_orders(&self) -> BTreeSet<u16> {
        (0..self.num_chunks)
            .filter(|o| !self.chunks.contains_key(o))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.num_chunks as usize
    }

    /// Concatenate chunk data in ascending order and verify the file checksum.
    /// Uses each order exactly once.
    pub fn reassemble(&self) -> Result<Vec<u8>, ReassemblyError> {
        let missing = self.missing_orders();
        if !missing.is_empty() {
            return Err(ReassemblyError::Incomplete(missing));
        }
        let digest = integrity::checksum_of_parts(self.chunks.values().map(|c| c.data.as_slice()));
        if digest != self.file_checksum {
            return Err(ReassemblyError::ChecksumMismatch);
        }
        let total: usize = self.chunks.values().map(|c| c.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for chunk in self.chunks.values() {
            out.extend_from_slice(&chunk.data);
        }
        Ok(out)
    }

    /// Name the reconstructed file is persisted under.
    pub fn output_file_name(&self) -> String {
        output_file_name(&self.file_checksum, &self.file_name)
    }
}

/// `<hex checksum>_<file name>`, using only the final component of the carried name.
pub fn output_file_name(checksum: &Checksum, file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty() && *part != "." && *part != "..")
        .unwrap_or("file");
    format!("{}_{}", checksum_to_hex(checksum), base)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("missing chunk orders {0:?}")]
    Incomplete(BTreeSet<u16>),
    #[error("checksum mismatch after reassembly")]
    ChecksumMismatch,
}
