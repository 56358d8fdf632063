//! Stored tree entries
//!
//! One [`Entry`] per path. The identifier is assigned when an entry is first
//! seen and kept across in-place updates; a rename is a remove plus a fresh
//! insert.

use std::ffi::OsStr;

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

use crate::clock::VectorStamp;
use crate::codec;
use crate::error::{Error, Result};
use crate::fs::FileStat;
use crate::hash::ContentHash;

/// What kind of object an entry mirrors.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
)]
#[rkyv(derive(Debug))]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    /// `weak` links close a cycle; `target` is then the ancestor's
    /// root-relative path rather than the on-disk link text.
    Link { target: String, weak: bool },
}

impl EntryKind {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory)
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "dir",
            Self::Link { weak: false, .. } => "link",
            Self::Link { weak: true, .. } => "weak-link",
        }
    }
}

/// Inode metadata snapshot.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
)]
#[rkyv(derive(Debug))]
pub struct Blob {
    pub size: u64,
    pub birthtime_ms: i64,
    pub mtime_ms: i64,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
    pub mode: u32,
    #[serde(with = "hex_hash")]
    pub hash: Option<[u8; 32]>,
}

impl Blob {
    #[must_use]
    pub fn from_stat(stat: &FileStat) -> Self {
        Self {
            size: stat.size,
            birthtime_ms: stat.birthtime_ms,
            mtime_ms: stat.mtime_ms,
            uid: stat.uid,
            gid: stat.gid,
            inode: stat.ino,
            mode: stat.mode,
            hash: None,
        }
    }

    /// Same size and timestamps.
    #[must_use]
    pub fn content_identical(&self, stat: &FileStat) -> bool {
        self.size == stat.size
            && self.mtime_ms == stat.mtime_ms
            && self.birthtime_ms == stat.birthtime_ms
    }

    /// Same size and timestamps as another blob.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.size == other.size
            && self.mtime_ms == other.mtime_ms
            && self.birthtime_ms == other.birthtime_ms
    }

    /// Content-identical with the same owner, mode and inode.
    #[must_use]
    pub fn fully_identical(&self, stat: &FileStat) -> bool {
        self.content_identical(stat)
            && self.uid == stat.uid
            && self.gid == stat.gid
            && self.mode == stat.mode
            && self.inode == stat.ino
    }

    /// New metadata, keeping the content hash only while content is unchanged.
    #[must_use]
    pub fn refresh(&self, stat: &FileStat) -> Self {
        let mut next = Self::from_stat(stat);
        if self.content_identical(stat) {
            next.hash = self.hash;
        }
        next
    }

    #[must_use]
    pub fn content_hash(&self) -> Option<ContentHash> {
        self.hash.map(ContentHash::from_raw)
    }
}

/// A mirrored filesystem object.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
)]
#[rkyv(derive(Debug))]
pub struct Entry {
    #[serde(with = "hex_id")]
    pub id: [u8; 16],
    /// Display name (lossy UTF-8).
    pub name: String,
    /// Raw on-disk name.
    #[serde(skip)]
    pub disk_name: Vec<u8>,
    pub modification: VectorStamp,
    pub synchronization: Option<VectorStamp>,
    /// `None` means unavailable.
    pub blob: Option<Blob>,
    pub kind: EntryKind,
}

impl Entry {
    /// A fresh entry with a new identifier and an empty stamp.
    #[must_use]
    pub fn new(disk_name: &OsStr, kind: EntryKind, blob: Option<Blob>) -> Self {
        Self {
            id: *uuid::Uuid::new_v4().as_bytes(),
            name: disk_name.to_string_lossy().into_owned(),
            disk_name: codec::os_bytes(disk_name).into_owned(),
            modification: VectorStamp::default(),
            synchronization: None,
            blob,
            kind,
        }
    }

    #[must_use]
    pub fn from_stat(disk_name: &OsStr, kind: EntryKind, stat: &FileStat) -> Self {
        Self::new(disk_name, kind, Some(Blob::from_stat(stat)))
    }

    #[must_use]
    pub fn uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.id)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Whether the live object still has the same content.
    ///
    /// Entries without a blob never match.
    #[must_use]
    pub fn content_identical(&self, stat: &FileStat) -> bool {
        self.blob.as_ref().is_some_and(|b| b.content_identical(stat))
    }

    /// The same entry (same identifier) with metadata refreshed from `stat`.
    #[must_use]
    pub fn refreshed(&self, stat: &FileStat) -> Self {
        let blob = match &self.blob {
            Some(blob) => blob.refresh(stat),
            None => Blob::from_stat(stat),
        };
        Self {
            blob: Some(blob),
            ..self.clone()
        }
    }

    /// Whether `live` describes the same object state as this stored entry.
    #[must_use]
    pub fn unchanged(&self, live: &Self) -> bool {
        self.kind == live.kind
            && match (&self.blob, &live.blob) {
                (Some(stored), Some(live)) => stored.same_content(live),
                (None, None) => true,
                _ => false,
            }
    }

    /// `live`'s state under this entry's identity and stamps.
    ///
    /// The stored content hash survives only if the content is unchanged.
    #[must_use]
    pub fn updated_from(&self, live: Entry) -> Self {
        let mut blob = live.blob;
        if let (Some(next), Some(prev)) = (blob.as_mut(), self.blob.as_ref()) {
            if next.hash.is_none() && prev.same_content(next) {
                next.hash = prev.hash;
            }
        }
        Self {
            id: self.id,
            modification: self.modification.clone(),
            synchronization: self.synchronization.clone(),
            blob,
            ..live
        }
    }

    /// # Errors
    /// Returns `Codec` if the entry cannot be archived.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<RkyvError>(self).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Decode an archived entry. The input need not be aligned.
    ///
    /// # Errors
    /// Returns `Codec` if the bytes are not a valid archive.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut aligned = AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, RkyvError>(&aligned).map_err(|e| Error::Codec(e.to_string()))
    }
}

mod hex_id {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &[u8; 16], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&uuid::Uuid::from_bytes(*id).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let text = String::deserialize(d)?;
        uuid::Uuid::parse_str(&text)
            .map(|id| *id.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(hash: &Option<[u8; 32]>, s: S) -> Result<S::Ok, S::Error> {
        match hash {
            Some(hash) => s.serialize_some(&hex::encode(hash)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<[u8; 32]>, D::Error> {
        let Some(text) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        let bytes = hex::decode(&text).map_err(serde::de::Error::custom)?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("content hash must be 32 bytes"))?;
        Ok(Some(hash))
    }
}
