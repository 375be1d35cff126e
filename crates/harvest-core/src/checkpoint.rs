//! Durable resume state.
//!
//! One JSON document per process instance. Writes go to a sibling temp file
//! that is synced and then renamed over the target, so a reader only ever
//! sees a complete document.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::HarvestError;
use crate::models::Partition;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub run_id: Uuid,
    pub instance: String,
    /// Partition keys that are finished and must never be fetched again.
    pub completed: BTreeSet<String>,
    /// Next offset to fetch for partitions that were started.
    pub in_flight: BTreeMap<String, u64>,
    pub total_records: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            run_id: Uuid::new_v4(),
            instance: instance.into(),
            completed: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            total_records: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_completed(&self, partition: &Partition) -> bool {
        self.completed.contains(&partition.key())
    }

    /// Offset to resume `partition` from; 0 if it was never started.
    pub fn resume_offset(&self, partition: &Partition) -> u64 {
        self.in_flight.get(&partition.key()).copied().unwrap_or(0)
    }

    /// Record that everything before `next_offset` has been persisted.
    ///
    /// Offsets only move forward; a smaller value is ignored.
    pub fn mark_progress(&mut self, partition: &Partition, next_offset: u64, new_records: u64) {
        let entry = self.in_flight.entry(partition.key()).or_insert(0);
        *entry = (*entry).max(next_offset);
        self.total_records += new_records;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, partition: &Partition) {
        let key = partition.key();
        self.in_flight.remove(&key);
        self.completed.insert(key);
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Read the checkpoint back. `None` if none was ever saved.
    ///
    /// A leftover temp file from an interrupted save is ignored. A document
    /// that does not parse is an error, never an implicit fresh start.
    pub async fn load(&self) -> Result<Option<Checkpoint>, HarvestError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_str(&raw).map_err(|e| {
            HarvestError::Checkpoint(format!("{} is unreadable: {e}", self.path.display()))
        })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(HarvestError::Checkpoint(format!(
                "{} has version {}, expected {CHECKPOINT_VERSION}",
                self.path.display(),
                checkpoint.version
            )));
        }
        Ok(Some(checkpoint))
    }

    /// Atomically replace the stored checkpoint.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), HarvestError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(checkpoint)?;
        let temp_path = self.temp_path();

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct TrackerInner {
    checkpoint: Checkpoint,
    records_since_flush: u64,
}

/// Single writer for the process's checkpoint.
///
/// Walkers report progress here; the tracker decides when to persist:
/// at every partition boundary, whenever `flush_every` fetched records
/// accumulated (duplicates count, so fully-suppressed pages still persist),
/// and on explicit [`flush`](Self::flush). Saves are serialised by the
/// internal mutex.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    store: CheckpointStore,
    flush_every: u64,
    inner: Arc<Mutex<TrackerInner>>,
}

impl CheckpointTracker {
    pub fn new(store: CheckpointStore, checkpoint: Checkpoint, flush_every: u64) -> Self {
        Self {
            store,
            flush_every,
            inner: Arc::new(Mutex::new(TrackerInner {
                checkpoint,
                records_since_flush: 0,
            })),
        }
    }

    pub async fn snapshot(&self) -> Checkpoint {
        self.inner.lock().await.checkpoint.clone()
    }

    pub async fn is_completed(&self, partition: &Partition) -> bool {
        self.inner.lock().await.checkpoint.is_completed(partition)
    }

    pub async fn resume_offset(&self, partition: &Partition) -> u64 {
        self.inner.lock().await.checkpoint.resume_offset(partition)
    }

    /// A page of `partition` is durably in the sink; `next_offset` is where
    /// the walk continues.
    ///
    /// `fetched` counts every record the page returned, duplicates included,
    /// and drives the flush interval; `new_records` counts the ones written.
    pub async fn record_page(
        &self,
        partition: &Partition,
        next_offset: u64,
        fetched: u64,
        new_records: u64,
    ) -> Result<(), HarvestError> {
        let mut inner = self.inner.lock().await;
        inner
            .checkpoint
            .mark_progress(partition, next_offset, new_records);
        inner.records_since_flush += fetched;
        if inner.records_since_flush >= self.flush_every {
            self.persist(&mut inner).await?;
        }
        Ok(())
    }

    /// Partition boundary: mark complete and persist immediately.
    pub async fn complete(&self, partition: &Partition) -> Result<(), HarvestError> {
        let mut inner = self.inner.lock().await;
        inner.checkpoint.mark_completed(partition);
        self.persist(&mut inner).await
    }

    pub async fn flush(&self) -> Result<(), HarvestError> {
        let mut inner = self.inner.lock().await;
        self.persist(&mut inner).await
    }

    async fn persist(&self, inner: &mut TrackerInner) -> Result<(), HarvestError> {
        inner.checkpoint.updated_at = Utc::now();
        self.store.save(&inner.checkpoint).await?;
        tracing::debug!(
            path = %self.store.path().display(),
            completed = inner.checkpoint.completed.len(),
            in_flight = inner.checkpoint.in_flight.len(),
            total_records = inner.checkpoint.total_records,
            "Checkpoint saved"
        );
        inner.records_since_flush = 0;
        Ok(())
    }
}
