//! Integrity: whole-file SHA-256 checksum carried on every chunk, verified after reassembly.

use sha2::{Digest, Sha256};

use crate::identity::Checksum;

/// Hash a complete file. Returns 32-byte digest.
pub fn file_checksum(data: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash the in-order concatenation of several slices without joining them first.
pub fn checksum_of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Checksum {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Verify reassembled bytes against the expected checksum.
pub fn verify_file(data: &[u8], expected: &Checksum) -> bool {
    file_checksum(data) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verify_roundtrip() {
        let data = b"hello chunk";
        let sum = file_checksum(data);
        assert!(verify_file(data, &sum));
    }

    #[test]
    fn verify_rejects_tampered() {
        let sum = file_checksum(b"hello chunk");
        assert!(!verify_file(b"hello chunK", &sum));
    }

    #[test]
    fn parts_match_whole() {
        let whole = file_checksum(b"abcdef");
        let parts = checksum_of_parts([&b"ab"[..], &b"cd"[..], &b"ef"[..]]);
        assert_eq!(whole, parts);
    }
}
