//! Per-instrument hand-off buffers between a worker and the stager.
//!
//! Both buffers are cheap to clone (shared handles). The worker appends, the
//! staging cycle drains; a drain takes the lock once, so a concurrent append
//! lands either wholly before or wholly after it.

use crate::core::{HarvestKey, HarvestedFile, Record};
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// Why a record was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record at {offered} is older than buffered record at {newest}")]
pub struct OutOfOrder {
    /// Timestamp of the rejected record
    pub offered: DateTime<Utc>,
    /// Newest timestamp already buffered
    pub newest: DateTime<Utc>,
}

/// Ordered, append-only record buffer.
#[derive(Debug, Clone, Default)]
pub struct RecordBuffer {
    inner: Arc<Mutex<BufferState>>,
}

#[derive(Debug, Default)]
struct BufferState {
    records: VecDeque<Record>,
    // Newest timestamp ever accepted, survives drains.
    newest: Option<DateTime<Utc>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the queue half-updated.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record. Records must arrive in non-decreasing time order.
    pub fn push(&self, record: Record) -> Result<(), OutOfOrder> {
        let mut state = lock(&self.inner);
        if let Some(newest) = state.newest {
            if record.timestamp < newest {
                return Err(OutOfOrder {
                    offered: record.timestamp,
                    newest,
                });
            }
        }
        state.newest = Some(record.timestamp);
        state.records.push_back(record);
        Ok(())
    }

    /// Atomically empty the buffer and return everything in append order.
    pub fn drain(&self) -> Vec<Record> {
        lock(&self.inner).records.drain(..).collect()
    }

    /// Remove and return the records timestamped strictly before `cutoff`.
    pub fn drain_before(&self, cutoff: DateTime<Utc>) -> Vec<Record> {
        let mut state = lock(&self.inner);
        let split = state.records.partition_point(|r| r.timestamp < cutoff);
        state.records.drain(..split).collect()
    }

    /// Put records that could not be staged back at the front, ahead of
    /// anything appended since they were drained.
    pub fn restore(&self, records: Vec<Record>) {
        let mut state = lock(&self.inner);
        for record in records.into_iter().rev() {
            state.records.push_front(record);
        }
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        lock(&self.inner).records.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Harvested files waiting for the staging cycle.
#[derive(Debug, Clone, Default)]
pub struct HarvestQueue {
    inner: Arc<Mutex<HarvestState>>,
}

#[derive(Debug, Default)]
struct HarvestState {
    files: VecDeque<HarvestedFile>,
    queued: HashSet<HarvestKey>,
}

impl HarvestQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a file unless the same path, size and mtime is already queued.
    pub fn push(&self, file: HarvestedFile) -> bool {
        let mut state = lock(&self.inner);
        if !state.queued.insert(file.key()) {
            return false;
        }
        state.files.push_back(file);
        true
    }

    /// Whether a file with this identity is waiting.
    pub fn contains(&self, key: &HarvestKey) -> bool {
        lock(&self.inner).queued.contains(key)
    }

    /// Atomically take every queued file.
    pub fn drain(&self) -> Vec<HarvestedFile> {
        let mut state = lock(&self.inner);
        state.queued.clear();
        state.files.drain(..).collect()
    }

    /// Return files that failed to stage to the front of the queue.
    pub fn restore(&self, files: Vec<HarvestedFile>) {
        let mut state = lock(&self.inner);
        for file in files.into_iter().rev() {
            if state.queued.insert(file.key()) {
                state.files.push_front(file);
            }
        }
    }

    /// Number of queued files.
    pub fn len(&self) -> usize {
        lock(&self.inner).files.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
