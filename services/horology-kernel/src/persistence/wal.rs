use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::PersistenceError;
use crate::command::CommandEntry;

#[derive(Serialize, Deserialize)]
struct WalRecord {
    checksum: String,
    entry: CommandEntry,
}

fn entry_checksum(entry: &CommandEntry) -> Result<String, PersistenceError> {
    let bytes = serde_json::to_vec(entry)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Append-only JSON-lines command log. Written before the state machine
/// applies anything; every record carries its own checksum and a mismatch on
/// replay is fatal corruption.
#[derive(Debug)]
pub struct CommandWal {
    path: PathBuf,
    file: File,
    last_sequence: u64,
}

impl CommandWal {
    /// Open the log, replaying and verifying any existing records.
    pub async fn open(path: PathBuf) -> Result<(Self, Vec<CommandEntry>), PersistenceError> {
        let entries = Self::read_all(&path).await?;
        let last_sequence = entries.last().map(|entry| entry.sequence).unwrap_or(0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok((
            Self {
                path,
                file,
                last_sequence,
            },
            entries,
        ))
    }

    /// Read and verify every record in a log file without holding it open.
    pub async fn read_entries(path: &PathBuf) -> Result<Vec<CommandEntry>, PersistenceError> {
        Self::read_all(path).await
    }

    async fn read_all(path: &PathBuf) -> Result<Vec<CommandEntry>, PersistenceError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<(usize, &str)> = raw
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .collect();
        let last_position = lines.len().saturating_sub(1);

        let mut entries = Vec::new();
        let mut previous_sequence = 0u64;
        for (position, (index, line)) in lines.into_iter().enumerate() {
            // A damaged FINAL record is a torn append from a crash and is
            // dropped; damage anywhere earlier is real corruption and fatal.
            let torn_tail_ok = position == last_position;
            let record: WalRecord = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(err) if torn_tail_ok => {
                    warn!(line = index + 1, %err, "dropping torn record at log tail");
                    break;
                }
                Err(err) => {
                    return Err(PersistenceError::Corruption(format!(
                        "malformed log record at line {}: {err}",
                        index + 1
                    )))
                }
            };
            let expected = entry_checksum(&record.entry)?;
            if expected != record.checksum {
                if torn_tail_ok {
                    warn!(
                        line = index + 1,
                        sequence = record.entry.sequence,
                        "dropping log tail with checksum mismatch"
                    );
                    break;
                }
                return Err(PersistenceError::Corruption(format!(
                    "checksum mismatch at line {} (sequence {})",
                    index + 1,
                    record.entry.sequence
                )));
            }
            if record.entry.sequence <= previous_sequence {
                return Err(PersistenceError::Corruption(format!(
                    "log sequence went backwards at line {}: {} after {}",
                    index + 1,
                    record.entry.sequence,
                    previous_sequence
                )));
            }
            previous_sequence = record.entry.sequence;
            entries.push(record.entry);
        }
        Ok(entries)
    }

    pub async fn append(&mut self, entry: &CommandEntry) -> Result<(), PersistenceError> {
        let record = WalRecord {
            checksum: entry_checksum(entry)?,
            entry: entry.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file.write_all(&line).await?;
        self.file.sync_data().await?;
        self.last_sequence = entry.sequence;
        Ok(())
    }

    /// Drop the prefix covered by a snapshot: rewrite the suffix to a scratch
    /// file and atomically swap it in.
    pub async fn truncate_through(&mut self, sequence: u64) -> Result<(), PersistenceError> {
        let entries = Self::read_all(&self.path).await?;
        let tmp_path = self.path.with_extension("wal.tmp");
        let mut tmp = File::create(&tmp_path).await?;
        for entry in entries.iter().filter(|entry| entry.sequence > sequence) {
            let record = WalRecord {
                checksum: entry_checksum(entry)?,
                entry: entry.clone(),
            };
            let mut line = serde_json::to_vec(&record)?;
            line.push(b'\n');
            tmp.write_all(&line).await?;
        }
        tmp.sync_all().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &self.path).await?;

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        Ok(())
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fire_entry, sample_timer, schedule_entry};

    #[tokio::test]
    async fn appended_entries_replay_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("commands.wal");

        let timer = sample_timer("tenant-a");
        {
            let (mut wal, existing) = CommandWal::open(path.clone()).await.expect("open fresh");
            assert!(existing.is_empty());
            wal.append(&schedule_entry(1, timer.clone()))
                .await
                .expect("append schedule");
            wal.append(&fire_entry(2, &timer)).await.expect("append fire");
            assert_eq!(wal.last_sequence(), 2);
        }

        let (wal, replayed) = CommandWal::open(path).await.expect("reopen");
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].sequence, 1);
        assert_eq!(replayed[1].sequence, 2);
        assert_eq!(wal.last_sequence(), 2);
    }

    #[tokio::test]
    async fn truncation_drops_the_snapshotted_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("commands.wal");
        let timer = sample_timer("tenant-a");

        let (mut wal, _) = CommandWal::open(path.clone()).await.expect("open");
        wal.append(&schedule_entry(1, timer.clone()))
            .await
            .expect("append");
        wal.append(&fire_entry(2, &timer)).await.expect("append");
        wal.truncate_through(1).await.expect("truncate");

        // The log stays appendable after the swap.
        let other = sample_timer("tenant-a");
        wal.append(&schedule_entry(3, other)).await.expect("append");
        drop(wal);

        let (_, replayed) = CommandWal::open(path).await.expect("reopen");
        let sequences: Vec<_> = replayed.iter().map(|entry| entry.sequence).collect();
        assert_eq!(sequences, vec![2, 3]);
    }

    #[tokio::test]
    async fn interior_tampering_is_fatal_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("commands.wal");
        let timer = sample_timer("tenant-a");

        let (mut wal, _) = CommandWal::open(path.clone()).await.expect("open");
        wal.append(&schedule_entry(1, timer.clone()))
            .await
            .expect("append");
        wal.append(&fire_entry(2, &timer)).await.expect("append");
        drop(wal);

        let raw = std::fs::read_to_string(&path).expect("read log");
        std::fs::write(&path, raw.replace("tenant-a", "tenant-x")).expect("tamper");

        let err = CommandWal::open(path).await.expect_err("corruption detected");
        assert!(matches!(err, PersistenceError::Corruption(_)));
    }

    #[tokio::test]
    async fn a_torn_final_record_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("commands.wal");
        let timer = sample_timer("tenant-a");

        let (mut wal, _) = CommandWal::open(path.clone()).await.expect("open");
        wal.append(&schedule_entry(1, timer.clone()))
            .await
            .expect("append");
        wal.append(&fire_entry(2, &timer)).await.expect("append");
        drop(wal);

        // Simulate a crash mid-append: the last line is cut short.
        let raw = std::fs::read_to_string(&path).expect("read log");
        let truncated = &raw[..raw.len() - 20];
        std::fs::write(&path, truncated).expect("tear the tail");

        let (wal, replayed) = CommandWal::open(path).await.expect("torn tail tolerated");
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sequence, 1);
        assert_eq!(wal.last_sequence(), 1);
    }

    #[tokio::test]
    async fn regressing_sequences_are_fatal_corruption() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("commands.wal");
        let timer = sample_timer("tenant-a");

        let (mut wal, _) = CommandWal::open(path.clone()).await.expect("open");
        wal.append(&schedule_entry(5, timer.clone()))
            .await
            .expect("append");
        wal.append(&fire_entry(5, &timer)).await.expect("append");
        drop(wal);

        let err = CommandWal::open(path).await.expect_err("sequence regression");
        assert!(matches!(err, PersistenceError::Corruption(_)));
    }
}
