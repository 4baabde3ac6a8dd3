//! File identity: 128-bit random file identifier and 32-byte file checksum, with hex codecs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hex-encoded length of a [`FileId`] on the wire.
pub const FILE_ID_HEX_LEN: usize = 32;
/// Hex-encoded length of a [`Checksum`] on the wire.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// SHA-256 digest of an entire original file.
pub type Checksum = [u8; 32];

/// Identifier created once per upload; groups every chunk of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(Uuid);

impl FileId {
    /// Fresh random (v4) identifier.
    pub fn generate() -> Self {
        FileId(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        FileId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Lowercase 32-char hex of the raw 16 bytes (wire and storage form).
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse exactly [`FILE_ID_HEX_LEN`] hex ASCII bytes.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, FileIdError> {
        if bytes.len() != FILE_ID_HEX_LEN {
            return Err(FileIdError::Length(bytes.len()));
        }
        let mut raw = [0u8; 16];
        hex::decode_to_slice(bytes, &mut raw).map_err(|_| FileIdError::Hex)?;
        Ok(Self::from_bytes(raw))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Accepts the 32-char hex form as well as the hyphenated UUID form.
impl FromStr for FileId {
    type Err = FileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() == FILE_ID_HEX_LEN {
            return Self::from_hex(s.as_bytes());
        }
        Uuid::parse_str(s).map(FileId).map_err(|_| FileIdError::Hex)
    }
}

pub fn checksum_to_hex(checksum: &Checksum) -> String {
    hex::encode(checksum)
}

/// Parse exactly [`CHECKSUM_HEX_LEN`] hex ASCII bytes.
pub fn checksum_from_hex(bytes: &[u8]) -> Result<Checksum, FileIdError> {
    if bytes.len() != CHECKSUM_HEX_LEN {
        return Err(FileIdError::Length(bytes.len()));
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(bytes, &mut out).map_err(|_| FileIdError::Hex)?;
    Ok(out)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FileIdError {
    #[error("unexpected hex length {0}")]
    Length(usize),
    #[error("invalid hex")]
    Hex,
}
