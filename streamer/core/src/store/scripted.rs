//! Scripted Result Store
//!
//! In-memory [`ResultStore`] that replays queued responses and records every
//! call. Useful for embedding the controller without a real store and for
//! asserting exact read sequences in tests.
//!
//! # Usage
//!
//! ```ignore
//! use grid_streamer_core::store::{ScriptedStore, SimulationId, SimulationStatus};
//!
//! let id = SimulationId::new(1234);
//! let store = ScriptedStore::new()
//!     .with_status(SimulationStatus::running(id))
//!     .with_batch(vec![record_a]);
//!
//! // ... run a controller ...
//!
//! assert_eq!(store.batch_hours(), vec![0]);
//! assert_eq!(store.open_handles(), 0);
//! ```
//!
//! Statuses are consumed in order; once one remains it is repeated forever.
//! Batches are consumed in order; once the queue is empty every hour is empty.
//! Every successful batch carries a tracked release handle.
//!
//! Reads complete immediately. Read counters are exact; the call log keeps
//! only the first [`CALL_LOG_LIMIT`] calls so a long-running session cannot
//! grow it without bound.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    GridBatch, ReleaseHandle, ResultStore, SimulationId, SimulationStatus, StatusField, StoreError,
};
use crate::messages::GridRecord;

/// A call observed by the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreCall {
    /// `fetch_status`
    Status {
        /// Requested simulation
        id: SimulationId,
        /// Requested fields
        fields: Vec<StatusField>,
    },
    /// `fetch_batch`
    Batch {
        /// Requested simulation
        id: SimulationId,
        /// Requested hour
        hour: u64,
    },
}

/// Maximum number of calls kept by [`ScriptedStore::calls`]
pub const CALL_LOG_LIMIT: usize = 4096;

type ReadHook = Box<dyn Fn(u64) + Send + Sync>;

#[derive(Default)]
struct Ledger {
    calls: Vec<StoreCall>,
    status_reads: usize,
    batch_reads: usize,
    releases: HashMap<u64, usize>,
    open: usize,
}

impl Ledger {
    fn record(&mut self, call: StoreCall) {
        match call {
            StoreCall::Status { .. } => self.status_reads += 1,
            StoreCall::Batch { .. } => self.batch_reads += 1,
        }
        if self.calls.len() < CALL_LOG_LIMIT {
            self.calls.push(call);
        }
    }
}

/// Scripted in-memory store
pub struct ScriptedStore {
    statuses: Mutex<VecDeque<Result<SimulationStatus, StoreError>>>,
    batches: Mutex<VecDeque<Result<Vec<GridRecord>, StoreError>>>,
    ledger: Arc<Mutex<Ledger>>,
    after_status: Option<ReadHook>,
    after_batch: Option<ReadHook>,
}

impl Default for ScriptedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedStore {
    /// Store with nothing scripted
    #[must_use]
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(VecDeque::new()),
            batches: Mutex::new(VecDeque::new()),
            ledger: Arc::new(Mutex::new(Ledger::default())),
            after_status: None,
            after_batch: None,
        }
    }

    /// Queue a status response
    #[must_use]
    pub fn with_status(self, status: SimulationStatus) -> Self {
        self.statuses.lock().push_back(Ok(status));
        self
    }

    /// Queue a failing status response
    #[must_use]
    pub fn with_status_error(self, error: StoreError) -> Self {
        self.statuses.lock().push_back(Err(error));
        self
    }

    /// Queue the records for the next hour
    #[must_use]
    pub fn with_batch(self, records: Vec<GridRecord>) -> Self {
        self.batches.lock().push_back(Ok(records));
        self
    }

    /// Queue a failing batch response
    #[must_use]
    pub fn with_batch_error(self, error: StoreError) -> Self {
        self.batches.lock().push_back(Err(error));
        self
    }

    /// Run `hook(read_number)` after each successful status read, before it
    /// is returned; `read_number` counts from 1
    #[must_use]
    pub fn after_status(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.after_status = Some(Box::new(hook));
        self
    }

    /// Run `hook(hour)` after each batch read completes, before it is returned
    ///
    /// Lets a test change the world (e.g. disconnect the client) at exactly
    /// the point where a read has finished.
    #[must_use]
    pub fn after_batch(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.after_batch = Some(Box::new(hook));
        self
    }

    /// Calls in order, up to [`CALL_LOG_LIMIT`]
    #[must_use]
    pub fn calls(&self) -> Vec<StoreCall> {
        self.ledger.lock().calls.clone()
    }

    /// Number of status reads
    #[must_use]
    pub fn status_reads(&self) -> usize {
        self.ledger.lock().status_reads
    }

    /// Number of batch reads
    #[must_use]
    pub fn batch_reads(&self) -> usize {
        self.ledger.lock().batch_reads
    }

    /// Hours requested by batch reads, in order, up to the call log limit
    #[must_use]
    pub fn batch_hours(&self) -> Vec<u64> {
        self.ledger
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                StoreCall::Batch { hour, .. } => Some(*hour),
                StoreCall::Status { .. } => None,
            })
            .collect()
    }

    /// Total number of reads of either kind
    #[must_use]
    pub fn total_reads(&self) -> usize {
        let ledger = self.ledger.lock();
        ledger.status_reads + ledger.batch_reads
    }

    /// How many times the handle for `hour` was released
    #[must_use]
    pub fn releases_for(&self, hour: u64) -> usize {
        self.ledger.lock().releases.get(&hour).copied().unwrap_or(0)
    }

    /// Handles handed out and not yet released
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.ledger.lock().open
    }

    fn next_status(&self, id: SimulationId) -> Result<SimulationStatus, StoreError> {
        let mut statuses = self.statuses.lock();
        if statuses.len() > 1 {
            return statuses
                .pop_front()
                .unwrap_or(Err(StoreError::NotFound(id)));
        }
        statuses
            .front()
            .cloned()
            .unwrap_or(Err(StoreError::NotFound(id)))
    }
}

struct TrackedHandle {
    hour: u64,
    ledger: Arc<Mutex<Ledger>>,
}

impl ReleaseHandle for TrackedHandle {
    fn release(self: Box<Self>) {
        let mut ledger = self.ledger.lock();
        *ledger.releases.entry(self.hour).or_insert(0) += 1;
        ledger.open = ledger.open.saturating_sub(1);
    }
}

#[async_trait]
impl ResultStore for ScriptedStore {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_status(
        &self,
        id: SimulationId,
        fields: &[StatusField],
    ) -> Result<SimulationStatus, StoreError> {
        let read_number = {
            let mut ledger = self.ledger.lock();
            ledger.record(StoreCall::Status {
                id,
                fields: fields.to_vec(),
            });
            ledger.status_reads as u64
        };

        let status = self.next_status(id)?;
        if let Some(hook) = &self.after_status {
            hook(read_number);
        }
        Ok(status)
    }

    async fn fetch_batch(&self, id: SimulationId, hour: u64) -> Result<GridBatch, StoreError> {
        self.ledger.lock().record(StoreCall::Batch { id, hour });

        let next = self.batches.lock().pop_front().unwrap_or(Ok(Vec::new()));
        let records = next?;

        self.ledger.lock().open += 1;
        let handle = TrackedHandle {
            hour,
            ledger: Arc::clone(&self.ledger),
        };
        let batch = GridBatch::with_handle(hour, records, Box::new(handle));

        if let Some(hook) = &self.after_batch {
            hook(hour);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RunStatus, STATUS_FIELDS};
    use serde_json::json;

    #[tokio::test]
    async fn test_last_status_repeats() {
        let id = SimulationId::new(7);
        let store = ScriptedStore::new()
            .with_status(SimulationStatus::running(id))
            .with_status(SimulationStatus::complete(id, RunStatus::Succeeded));

        assert!(!store.fetch_status(id, &STATUS_FIELDS).await.unwrap().results_complete);
        assert!(store.fetch_status(id, &STATUS_FIELDS).await.unwrap().results_complete);
        assert!(store.fetch_status(id, &STATUS_FIELDS).await.unwrap().results_complete);
        assert_eq!(store.status_reads(), 3);
    }

    #[tokio::test]
    async fn test_unscripted_status_is_not_found() {
        let store = ScriptedStore::new();
        let err = store
            .fetch_status(SimulationId::new(1), &STATUS_FIELDS)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(SimulationId::new(1)));
    }

    #[tokio::test]
    async fn test_batches_are_tracked() {
        let id = SimulationId::new(1);
        let store = ScriptedStore::new().with_batch(vec![GridRecord::new(json!({"hour": 0}))]);

        let first = store.fetch_batch(id, 0).await.unwrap();
        let second = store.fetch_batch(id, 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(store.open_handles(), 2);

        first.release();
        drop(second);
        assert_eq!(store.open_handles(), 0);
        assert_eq!(store.releases_for(0), 1);
        assert_eq!(store.releases_for(1), 1);
        assert_eq!(store.batch_hours(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_call_log_is_bounded() {
        let id = SimulationId::new(3);
        let store = ScriptedStore::new().with_status(SimulationStatus::running(id));

        for hour in 0..(CALL_LOG_LIMIT as u64) {
            store.fetch_status(id, &STATUS_FIELDS).await.unwrap();
            drop(store.fetch_batch(id, hour).await.unwrap());
        }

        assert_eq!(store.calls().len(), CALL_LOG_LIMIT);
        assert_eq!(store.status_reads(), CALL_LOG_LIMIT);
        assert_eq!(store.batch_reads(), CALL_LOG_LIMIT);
        assert_eq!(store.total_reads(), 2 * CALL_LOG_LIMIT);
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_after_status_hook_sees_read_number() {
        let id = SimulationId::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let store = ScriptedStore::new()
            .with_status(SimulationStatus::running(id))
            .after_status(move |n| sink.lock().push(n));

        store.fetch_status(id, &STATUS_FIELDS).await.unwrap();
        store.fetch_status(id, &STATUS_FIELDS).await.unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_batch_error_hands_out_no_handle() {
        let store =
            ScriptedStore::new().with_batch_error(StoreError::Unavailable("timeout".into()));
        let result = store.fetch_batch(SimulationId::new(1), 0).await;
        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(store.open_handles(), 0);
    }
}
