//! Content-addressed document storage.
//!
//! Documents (spec sources, indexed reference material, code snapshots)
//! are keyed by the SHA-256 of their bytes, which makes re-indexing
//! idempotent: saving the same content twice is a no-op. Embedding
//! vectors attached to documents are stored as little-endian `f32` bytes
//! and round-trip bit-exactly.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Hex SHA-256 of `bytes`; the store's addressing function.
    pub fn address(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Store `bytes`, returning the content address and whether the write
    /// actually happened (false when the document already existed).
    pub fn put(&self, bytes: &[u8]) -> Result<(String, bool)> {
        let hash = Self::address(bytes);
        let path = self.path_for(&hash);
        if path.exists() {
            return Ok((hash, false));
        }
        // Temp-and-rename keeps partially written documents invisible.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        std::io::Write::write_all(&mut tmp, bytes)?;
        tmp.persist(&path)
            .with_context(|| format!("failed to persist {}", path.display()))?;
        Ok((hash, true))
    }

    pub fn get(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(hash)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.path_for(hash).exists()
    }
}

// ── Embedding codec ──────────────────────────────────────────────

/// Encode an embedding vector as little-endian `f32` bytes.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode little-endian `f32` bytes back into a vector. The byte length
/// must be a multiple of four.
pub fn decode_embedding(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!("embedding byte length {} not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = DocumentStore::open(tmp.path()).unwrap();

        let (hash1, wrote1) = store.put(b"specification body").unwrap();
        let (hash2, wrote2) = store.put(b"specification body").unwrap();
        assert_eq!(hash1, hash2);
        assert!(wrote1);
        assert!(!wrote2, "duplicate save must be a no-op");

        assert_eq!(store.get(&hash1).unwrap().unwrap(), b"specification body");
    }

    #[test]
    fn distinct_content_distinct_addresses() {
        let tmp = TempDir::new().unwrap();
        let store = DocumentStore::open(tmp.path()).unwrap();
        let (a, _) = store.put(b"alpha").unwrap();
        let (b, _) = store.put(b"beta").unwrap();
        assert_ne!(a, b);
        assert!(store.contains(&a));
        assert!(!store.contains("0000"));
    }

    #[test]
    fn address_is_stable_sha256() {
        // Known digest of the empty string.
        assert_eq!(
            DocumentStore::address(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn embedding_round_trips_bit_exactly() {
        let vector: Vec<f32> = vec![
            0.0,
            -0.0,
            1.5,
            -3.25,
            f32::MIN_POSITIVE,
            f32::MAX,
            std::f32::consts::PI,
        ];
        let encoded = encode_embedding(&vector);
        assert_eq!(encoded.len(), vector.len() * 4);
        let decoded = decode_embedding(&encoded).unwrap();
        assert_eq!(decoded.len(), vector.len());
        for (a, b) in vector.iter().zip(&decoded) {
            assert_eq!(a.to_bits(), b.to_bits(), "bit-exact round trip");
        }
    }

    #[test]
    fn embedding_rejects_ragged_input() {
        assert!(decode_embedding(&[1, 2, 3]).is_err());
        assert!(decode_embedding(&[]).unwrap().is_empty());
    }
}
