//! Append-only instance history with file-based persistence.
//!
//! Each instance owns a directory under the store root containing
//! `events.jsonl` (one JSON event per line) and, if replay ever found the
//! history unusable, a `quarantine.json` marker.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::domain::Event;

/// File-based history for one orchestration instance
#[derive(Debug, Clone)]
pub struct EventStore {
    /// Directory containing the instance
    instance_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Path to the quarantine marker
    quarantine_path: PathBuf,
}

/// Marker written when an instance can no longer be replayed safely
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

/// Another writer appended to the history since it was last read.
/// The caller should replay and decide again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("history moved on: expected to write sequence {attempted}, last recorded is {last}")]
pub struct SequenceConflict {
    pub attempted: u64,
    pub last: u64,
}

/// Whether `error` is a [`SequenceConflict`] rather than a real failure
pub fn is_sequence_conflict(error: &anyhow::Error) -> bool {
    error.downcast_ref::<SequenceConflict>().is_some()
}

/// Only the field needed to find where a history ends
#[derive(Deserialize)]
struct SequenceOnly {
    sequence: u64,
}

impl EventStore {
    /// Create or open the history of an instance under `root`
    pub async fn open(root: &Path, instance_id: Uuid) -> Result<Self> {
        let store = Self::at(root, instance_id);

        fs::create_dir_all(&store.instance_dir).await.with_context(|| {
            format!(
                "Failed to create instance directory: {}",
                store.instance_dir.display()
            )
        })?;

        Ok(store)
    }

    /// Paths for an instance without touching the filesystem
    pub fn at(root: &Path, instance_id: Uuid) -> Self {
        let instance_dir = root.join(instance_id.to_string());

        Self {
            events_path: instance_dir.join("events.jsonl"),
            quarantine_path: instance_dir.join("quarantine.json"),
            instance_dir,
        }
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the instance directory
    pub fn instance_dir(&self) -> &Path {
        &self.instance_dir
    }

    /// Whether any history exists for this instance
    pub fn exists(&self) -> bool {
        self.events_path.exists()
    }

    /// Append an event to the log.
    ///
    /// The write happens under an exclusive file lock and is synced before
    /// returning, so a recorded outcome survives a crash. While the lock is
    /// held the last recorded sequence is checked: unless the event directly
    /// follows it, nothing is written and a [`SequenceConflict`] is returned.
    /// This keeps appends from separate processes linearizable.
    pub async fn append(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        let path = self.events_path.clone();
        let sequence = event.sequence;

        tokio::task::spawn_blocking(move || append_line(&path, sequence, &json))
            .await
            .context("History append task failed")?
    }

    /// Replay all events in order.
    ///
    /// Reads under a shared lock, so a line another process is appending
    /// is never seen half-written.
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let path = self.events_path.clone();
        let content = tokio::task::spawn_blocking(move || read_locked(&path))
            .await
            .context("History read task failed")??;

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).with_context(|| format!("Failed to parse event: {}", line))
            })
            .collect()
    }

    /// Write the quarantine marker
    pub async fn quarantine(&self, reason: &str) -> Result<()> {
        let record = QuarantineRecord {
            reason: reason.to_string(),
            quarantined_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)
            .context("Failed to serialize quarantine record")?;

        fs::write(&self.quarantine_path, json).await.with_context(|| {
            format!(
                "Failed to write quarantine marker: {}",
                self.quarantine_path.display()
            )
        })
    }

    /// Read the quarantine marker, if present
    pub async fn quarantine_record(&self) -> Result<Option<QuarantineRecord>> {
        if !self.quarantine_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.quarantine_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to read quarantine marker: {}",
                    self.quarantine_path.display()
                )
            })?;

        let record = serde_json::from_str(&content).unwrap_or_else(|_| QuarantineRecord {
            reason: content.trim().to_string(),
            quarantined_at: Utc::now(),
        });

        Ok(Some(record))
    }

    /// List all instance IDs under `root`
    pub async fn list_instances(root: &Path) -> Result<Vec<Uuid>> {
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut instances = Vec::new();
        let mut entries = fs::read_dir(root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        instances.push(uuid);
                    }
                }
            }
        }

        Ok(instances)
    }
}

fn read_locked(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    file.lock_shared()
        .with_context(|| format!("Failed to lock events file: {}", path.display()))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("Failed to read events file: {}", path.display()))?;

    Ok(content)
}

fn append_line(path: &Path, sequence: u64, json: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open events file: {}", path.display()))?;

    file.lock_exclusive()
        .with_context(|| format!("Failed to lock events file: {}", path.display()))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("Failed to read events file: {}", path.display()))?;

    let last = last_sequence(&content)?;
    if sequence != last + 1 {
        return Err(SequenceConflict {
            attempted: sequence,
            last,
        }
        .into());
    }

    writeln!(file, "{}", json).context("Failed to write event")?;
    file.sync_data().context("Failed to sync event")?;

    // Lock is released when file is dropped
    Ok(())
}

/// Sequence of the last event in a history file, 0 when empty
fn last_sequence(content: &str) -> Result<u64> {
    let Some(line) = content.lines().rev().find(|l| !l.trim().is_empty()) else {
        return Ok(0);
    };

    let last: SequenceOnly = serde_json::from_str(line)
        .with_context(|| format!("Failed to parse event: {}", line))?;
    Ok(last.sequence)
}

/// Generate an idempotency key for an activity invocation.
///
/// Stable across attempts and replays of the same step, so an activity
/// can recognise repeated delivery of the same work.
pub fn generate_idempotency_key(instance_id: Uuid, step_name: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}", instance_id, step_name, input_hash)
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_store() -> (EventStore, Uuid, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let instance_id = Uuid::new_v4();
        let store = EventStore::open(temp_dir.path(), instance_id).await.unwrap();
        (store, instance_id, temp_dir)
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let (store, id, _temp) = create_test_store().await;

        let event1 = Event::new(
            id,
            1,
            EventKind::InstanceStarted {
                pipeline: "p".to_string(),
                input: json!("a.pdf"),
            },
        );
        let event2 = Event::new(
            id,
            2,
            EventKind::TimerFired {
                step_index: 0,
                attempt: 2,
            },
        );

        store.append(&event1).await.unwrap();
        store.append(&event2).await.unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events, vec![event1, event2]);
    }

    #[tokio::test]
    async fn test_append_rejects_stale_sequence() {
        let (store, id, _temp) = create_test_store().await;
        let started = Event::new(
            id,
            1,
            EventKind::InstanceStarted {
                pipeline: "p".to_string(),
                input: json!("a.pdf"),
            },
        );
        store.append(&started).await.unwrap();

        // Two writers that both read a one-event history
        let cancelled = Event::new(
            id,
            2,
            EventKind::InstanceCancelled {
                reason: "operator".to_string(),
            },
        );
        let fired = Event::new(
            id,
            2,
            EventKind::TimerFired {
                step_index: 0,
                attempt: 2,
            },
        );
        store.append(&cancelled).await.unwrap();

        let err = store.append(&fired).await.unwrap_err();
        assert!(is_sequence_conflict(&err));
        assert_eq!(
            err.downcast_ref::<SequenceConflict>(),
            Some(&SequenceConflict {
                attempted: 2,
                last: 2
            })
        );

        // Skipping ahead is refused as well
        let ahead = Event::new(id, 5, EventKind::TimerFired { step_index: 0, attempt: 2 });
        assert!(is_sequence_conflict(&store.append(&ahead).await.unwrap_err()));

        assert_eq!(store.replay().await.unwrap(), vec![started, cancelled]);
    }

    #[tokio::test]
    async fn test_append_after_torn_line_fails() {
        let (store, id, _temp) = create_test_store().await;
        tokio::fs::write(store.events_path(), "{\"id\":\"abc").await.unwrap();

        let event = Event::new(id, 1, EventKind::TimerFired { step_index: 0, attempt: 2 });
        let err = store.append(&event).await.unwrap_err();
        assert!(!is_sequence_conflict(&err));
    }

    #[tokio::test]
    async fn test_replay_missing_history_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = EventStore::at(temp_dir.path(), Uuid::new_v4());

        assert!(!store.exists());
        assert!(store.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_line_is_an_error() {
        let (store, _id, _temp) = create_test_store().await;
        tokio::fs::write(store.events_path(), "{not json}\n").await.unwrap();

        assert!(store.replay().await.is_err());
    }

    #[tokio::test]
    async fn test_quarantine_marker() {
        let (store, _id, _temp) = create_test_store().await;

        assert!(store.quarantine_record().await.unwrap().is_none());
        store.quarantine("history diverged").await.unwrap();

        let record = store.quarantine_record().await.unwrap().unwrap();
        assert_eq!(record.reason, "history diverged");
    }

    #[tokio::test]
    async fn test_list_instances() {
        let temp_dir = TempDir::new().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        EventStore::open(temp_dir.path(), a).await.unwrap();
        EventStore::open(temp_dir.path(), b).await.unwrap();
        std::fs::create_dir_all(temp_dir.path().join("not-a-uuid")).unwrap();

        let mut listed = EventStore::list_instances(temp_dir.path()).await.unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();

        assert_eq!(listed, expected);
    }

    #[test]
    fn test_idempotency_key_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = generate_idempotency_key(id, "summarize", "test input");

        assert!(key.starts_with("550e8400-e29b-41d4-a716-446655440000:summarize:"));

        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 16);
    }

    #[test]
    fn test_input_hash_consistency() {
        let hash1 = hash_input("test input");
        let hash2 = hash_input("test input");
        let hash3 = hash_input("different input");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }
}
