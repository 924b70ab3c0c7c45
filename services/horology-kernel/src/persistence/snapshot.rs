use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use super::PersistenceError;
use crate::TimerInstance;

/// Serialised state machine at a log position. Recovery loads the newest
/// snapshot and replays the log suffix past `applied_sequence`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub applied_sequence: u64,
    pub taken_at: DateTime<Utc>,
    pub timers: Vec<TimerInstance>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    checksum: String,
    payload: SnapshotPayload,
}

fn payload_checksum(payload: &SnapshotPayload) -> Result<String, PersistenceError> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Clone, Debug)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Write-then-rename so a crash mid-save leaves the previous snapshot
    /// intact.
    pub async fn save(&self, payload: &SnapshotPayload) -> Result<(), PersistenceError> {
        let file = SnapshotFile {
            checksum: payload_checksum(payload)?,
            payload: payload.clone(),
        };
        let bytes = serde_json::to_vec(&file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        tmp.write_all(&bytes).await?;
        tmp.sync_all().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<SnapshotPayload>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let file: SnapshotFile = serde_json::from_slice(&bytes)
            .map_err(|err| PersistenceError::Corruption(format!("malformed snapshot: {err}")))?;
        let expected = payload_checksum(&file.payload)?;
        if expected != file.checksum {
            return Err(PersistenceError::Corruption(
                "snapshot checksum mismatch".into(),
            ));
        }
        Ok(Some(file.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_timer;

    #[tokio::test]
    async fn snapshots_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("snapshot.json"));
        assert!(store.load().await.expect("empty load").is_none());

        let payload = SnapshotPayload {
            applied_sequence: 42,
            taken_at: Utc::now(),
            timers: vec![sample_timer("tenant-a"), sample_timer("tenant-b")],
        };
        store.save(&payload).await.expect("save");

        let loaded = store.load().await.expect("load").expect("present");
        assert_eq!(loaded.applied_sequence, 42);
        assert_eq!(loaded.timers.len(), 2);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_fatal_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.json");
        let store = SnapshotStore::new(path.clone());
        let payload = SnapshotPayload {
            applied_sequence: 7,
            taken_at: Utc::now(),
            timers: vec![sample_timer("tenant-a")],
        };
        store.save(&payload).await.expect("save");

        let raw = std::fs::read_to_string(&path).expect("read snapshot");
        std::fs::write(&path, raw.replace("tenant-a", "tenant-x")).expect("tamper");

        let err = store.load().await.expect_err("corruption detected");
        assert!(matches!(err, PersistenceError::Corruption(_)));
    }
}
