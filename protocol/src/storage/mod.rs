//! # Persistent Storage
//!
//! All on-disk state flows through the [`Store`]: the decided log, the
//! highest-decided pointers, validator shares, and the slashing-protection
//! watermarks. Built on sled's embedded key-value store, one named tree per
//! collection:
//!
//! | Tree               | Key                        | Value                      |
//! |--------------------|----------------------------|----------------------------|
//! | `decided`          | identifier ++ seq (8B BE)  | `bincode(SignedMessage)`   |
//! | `highest_decided`  | identifier                 | `bincode(SignedMessage)`   |
//! | `shares`           | validator pk (48B)         | `bincode(Share)`           |
//! | `slashing_att`     | share pk (48B)             | `bincode(AttestationMark)` |
//! | `slashing_blk`     | share pk (48B)             | slot (8B BE)               |
//!
//! Sequence keys are big-endian so sled's lexicographic ordering matches
//! numeric ordering and range scans over a decided log just work.
//!
//! The exact encodings above are private to this module. What the rest of
//! the system relies on are the invariants: each identifier's decided log is
//! a contiguous prefix, the highest-decided pointer never trails a persisted
//! sequence, and slashing watermarks only move forward.

pub mod ibft;
pub mod shares;
pub mod slashing;

use std::path::Path;

use sled::{Db, Tree};

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent storage handle. sled trees are lock-free for concurrent
/// readers and serialize writers internally, so `Store` clones freely across
/// tasks without external synchronization.
#[derive(Debug, Clone)]
pub struct Store {
    db: Db,
    pub(crate) decided: Tree,
    pub(crate) highest: Tree,
    pub(crate) shares: Tree,
    pub(crate) slashing_att: Tree,
    pub(crate) slashing_blk: Tree,
}

impl Store {
    /// Opens (or creates) a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory store that evaporates on drop. For tests.
    pub fn open_temporary() -> StorageResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StorageResult<Self> {
        let decided = db.open_tree("decided")?;
        let highest = db.open_tree("highest_decided")?;
        let shares = db.open_tree("shares")?;
        let slashing_att = db.open_tree("slashing_att")?;
        let slashing_blk = db.open_tree("slashing_blk")?;
        Ok(Self {
            db,
            decided,
            highest,
            shares,
            slashing_att,
            slashing_blk,
        })
    }

    /// Blocks until all pending writes are durable on disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    bincode::deserialize(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}
