//! Chunk records: split a file into fixed-size slices tagged with identity, order and
//! integrity metadata; binary encode/decode for the UPLOAD and DATA payloads.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::identity::{
    checksum_from_hex, checksum_to_hex, Checksum, FileId, FileIdError, CHECKSUM_HEX_LEN,
    FILE_ID_HEX_LEN,
};
use crate::integrity;
use crate::node::{Node, NodeDecodeError, NODE_LEN};

/// Fixed chunk size in bytes. Every chunk but the last carries exactly this much data.
pub const CHUNK_SIZE: usize = 512;

/// ASCII unit separator between file name and data inside the base64 block.
pub const UNIT_SEPARATOR: u8 = 0x1f;

/// Length of the fixed binary/hex header preceding the base64 block:
/// size(2) + order(2) + num_chunks(2) + file id hex(32) + checksum hex(64) + next node(6).
pub const CHUNK_HEADER_LEN: usize = 2 + 2 + 2 + FILE_ID_HEX_LEN + CHECKSUM_HEX_LEN + NODE_LEN;

/// One contiguous slice of an original file plus its distribution metadata.
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub file_id: FileId,
    /// 0-based position in the file.
    pub order: u16,
    /// Total chunk count for the file.
    pub num_chunks: u16,
    /// Digest of the entire original file, identical across all chunks of one file.
    pub file_checksum: Checksum,
    /// Chaining hint; kept for wire compatibility, not acted on.
    pub next_node: Node,
    pub file_name: String,
    pub data: Vec<u8>,
}

impl ChunkRecord {
    /// Actual bytes in this slice.
    pub fn size(&self) -> u16 {
        self.data.len() as u16
    }

    pub fn is_last(&self) -> bool {
        self.order.saturating_add(1) == self.num_chunks
    }

    /// Encode as the UPLOAD/DATA payload (without tag or trailing newline).
    pub fn encode(&self) -> Result<Vec<u8>, ChunkEncodeError> {
        if self.data.len() > CHUNK_SIZE {
            return Err(ChunkEncodeError::DataTooLarge(self.data.len()));
        }
        if self.file_name.as_bytes().contains(&UNIT_SEPARATOR) {
            return Err(ChunkEncodeError::SeparatorInFileName);
        }
        let mut misc = Vec::with_capacity(self.file_name.len() + 1 + self.data.len());
        misc.extend_from_slice(self.file_name.as_bytes());
        misc.push(UNIT_SEPARATOR);
        misc.extend_from_slice(&self.data);
        let encoded = STANDARD.encode(&misc);

        let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + encoded.len());
        out.extend_from_slice(&self.size().to_be_bytes());
        out.extend_from_slice(&self.order.to_be_bytes());
        out.extend_from_slice(&self.num_chunks.to_be_bytes());
        out.extend_from_slice(self.file_id.to_hex().as_bytes());
        out.extend_from_slice(checksum_to_hex(&self.file_checksum).as_bytes());
        out.extend_from_slice(&self.next_node.encode());
        out.extend_from_slice(encoded.as_bytes());
        Ok(out)
    }

    /// Decode an UPLOAD/DATA payload (without tag or trailing newline).
    pub fn decode(packet: &[u8]) -> Result<Self, ChunkDecodeError> {
        if packet.len() < CHUNK_HEADER_LEN {
            return Err(ChunkDecodeError::Truncated(packet.len()));
        }
        let size = u16::from_be_bytes([packet[0], packet[1]]);
        let order = u16::from_be_bytes([packet[2], packet[3]]);
        let num_chunks = u16::from_be_bytes([packet[4], packet[5]]);
        let mut pos = 6;
        let file_id = FileId::from_hex(&packet[pos..pos + FILE_ID_HEX_LEN])
            .map_err(ChunkDecodeError::FileId)?;
        pos += FILE_ID_HEX_LEN;
        let file_checksum = checksum_from_hex(&packet[pos..pos + CHECKSUM_HEX_LEN])
            .map_err(ChunkDecodeError::Checksum)?;
        pos += CHECKSUM_HEX_LEN;
        let next_node = Node::decode(&packet[pos..pos + NODE_LEN])?;
        pos += NODE_LEN;

        let misc = STANDARD
            .decode(&packet[pos..])
            .map_err(|_| ChunkDecodeError::Base64)?;
        let sep = misc
            .iter()
            .position(|&b| b == UNIT_SEPARATOR)
            .ok_or(ChunkDecodeError::MissingSeparator)?;
        let file_name = std::str::from_utf8(&misc[..sep])
            .map_err(|_| ChunkDecodeError::FileName)?
            .to_string();
        let data = misc[sep + 1..].to_vec();

        if data.len() != size as usize {
            return Err(ChunkDecodeError::SizeMismatch {
                declared: size,
                actual: data.len(),
            });
        }
        if data.len() > CHUNK_SIZE {
            return Err(ChunkDecodeError::DataTooLarge(data.len()));
        }
        Ok(Self {
            file_id,
            order,
            num_chunks,
            file_checksum,
            next_node,
            file_name,
            data,
        })
    }
}

/// Number of chunks needed for `len` bytes: `ceil(len / CHUNK_SIZE)`.
pub fn chunk_count(len: usize) -> Result<u16, SplitError> {
    let n = len.div_ceil(CHUNK_SIZE);
    u16::try_from(n).map_err(|_| SplitError::TooLarge(len))
}

/// Split file contents into chunk records in order. `next_node` is left null; the
/// scheduler fills it in once receivers are known.
pub fn split_into_chunks(
    file_id: FileId,
    file_name: &str,
    data: &[u8],
) -> Result<Vec<ChunkRecord>, SplitError> {
    if data.is_empty() {
        return Err(SplitError::Empty);
    }
    if file_name.as_bytes().contains(&UNIT_SEPARATOR) {
        return Err(SplitError::SeparatorInFileName);
    }
    let num_chunks = chunk_count(data.len())?;
    let file_checksum = integrity::file_checksum(data);
    Ok(data
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(i, slice)| ChunkRecord {
            file_id,
            order: i as u16,
            num_chunks,
            file_checksum,
            next_node: Node::NULL,
            file_name: file_name.to_string(),
            data: slice.to_vec(),
        })
        .collect())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkEncodeError {
    #[error("chunk data is {0} bytes, limit is 512")]
    DataTooLarge(usize),
    #[error("file name contains the 0x1f unit separator")]
    SeparatorInFileName,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkDecodeError {
    #[error("chunk payload truncated ({0} bytes)")]
    Truncated(usize),
    #[error("bad file id: {0}")]
    FileId(FileIdError),
    #[error("bad checksum: {0}")]
    Checksum(FileIdError),
    #[error("bad next node: {0}")]
    Node(#[from] NodeDecodeError),
    #[error("invalid base64 block")]
    Base64,
    #[error("missing file name separator")]
    MissingSeparator,
    #[error("file name is not valid UTF-8")]
    FileName,
    #[error("declared size {declared} but carried {actual} bytes")]
    SizeMismatch { declared: u16, actual: usize },
    #[error("chunk data is {0} bytes, limit is 512")]
    DataTooLarge(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("empty file")]
    Empty,
    #[error("file too large ({0} bytes exceeds 65535 chunks)")]
    TooLarge(usize),
    #[error("file name contains the 0x1f unit separator")]
    SeparatorInFileName,
}
