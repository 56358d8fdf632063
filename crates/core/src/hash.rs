//! Fixed-width BLAKE3 digests
//!
//! Used for parent-path hashes in tree rows, row-key hashes in index keys,
//! and optional file content hashes.

use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Width of every digest stored by the engine.
pub const HASH_LEN: usize = 32;

/// A BLAKE3 (256-bit) digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Hash arbitrary bytes
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Wrap an already computed digest
    #[must_use]
    pub fn from_raw(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Read a digest back from the front of a stored value.
    #[must_use]
    pub fn from_prefix(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; HASH_LEN] = bytes.get(..HASH_LEN)?.try_into().ok()?;
        Some(Self(raw))
    }

    /// Stream a file through the hasher.
    ///
    /// # Errors
    /// Returns the I/O error of the open or a read.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(io::BufReader::with_capacity(64 * 1024, file))?;
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Lowercase hex, 64 characters.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&format_args!("{self}")).finish()
    }
}

/// Abbreviated to the first 8 bytes.
impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}
