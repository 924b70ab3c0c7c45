use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod snapshot;
pub mod wal;

pub use snapshot::{SnapshotPayload, SnapshotStore};
pub use wal::CommandWal;

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Unrecoverable: the kernel refuses to serve on corrupted state rather
    /// than silently downgrading semantics.
    #[error("corrupted durable state: {0}")]
    Corruption(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Layout of the durable directory (`KERNEL_PERSIST_PATH`): the write-ahead
/// command log plus the latest state-machine snapshot.
#[derive(Clone, Debug)]
pub struct PersistDir {
    root: PathBuf,
}

impl PersistDir {
    pub async fn prepare(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join("commands.wal")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("snapshot.json")
    }
}
