//! Result Store Abstraction
//!
//! Read-only access to simulation status and per-hour grid batches. The
//! streaming controller only ever talks to a [`ResultStore`]; retry policy,
//! timeouts and caching all belong to the implementation behind the trait.
//!
//! # Implementations
//!
//! - [`FsResultStore`]: reads status and hourly JSONL files from a data directory
//! - [`ScriptedStore`]: in-memory store with scripted responses and a call log

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::GridRecord;

pub mod fs;
pub mod scripted;

pub use fs::FsResultStore;
pub use scripted::{ScriptedStore, StoreCall, CALL_LOG_LIMIT};

// ============================================================================
// Identifiers
// ============================================================================

/// Store key of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SimulationId(u64);

impl SimulationId {
    /// Create from a raw key
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric key
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SimulationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a start-streaming payload is not a decimal integer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid simulation identifier: {0:?}")]
pub struct InvalidIdentifier(pub String);

impl FromStr for SimulationId {
    type Err = InvalidIdentifier;

    /// Parse a decimal integer, ignoring surrounding whitespace.
    ///
    /// Signs, hex prefixes and trailing garbage are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidIdentifier(s.to_string()));
        }
        trimmed
            .parse::<u64>()
            .map(Self)
            .map_err(|_| InvalidIdentifier(s.to_string()))
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of the producing simulation run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Not started yet
    Pending,
    /// Producing hours
    Running,
    /// Finished normally
    Succeeded,
    /// Finished with an error
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status fields the controller asks the store for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusField {
    /// [`SimulationStatus::run_status`]
    RunStatus,
    /// [`SimulationStatus::results_complete`]
    ResultsComplete,
    /// [`SimulationStatus::streaming_enabled`]
    StreamingEnabled,
}

/// Exactly the fields requested on every status read
pub const STATUS_FIELDS: [StatusField; 3] = [
    StatusField::RunStatus,
    StatusField::ResultsComplete,
    StatusField::StreamingEnabled,
];

/// Immutable status snapshot, re-fetched every cycle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationStatus {
    /// Simulation this snapshot describes
    pub id: SimulationId,
    /// Run lifecycle state
    pub run_status: RunStatus,
    /// True once no further batches will ever be produced, whatever the run outcome
    pub results_complete: bool,
    /// Whether the simulation was configured to publish grid data
    pub streaming_enabled: bool,
}

impl SimulationStatus {
    /// Status of a run that is still producing hours
    #[must_use]
    pub fn running(id: SimulationId) -> Self {
        Self {
            id,
            run_status: RunStatus::Running,
            results_complete: false,
            streaming_enabled: true,
        }
    }

    /// Status of a run whose results are complete
    #[must_use]
    pub fn complete(id: SimulationId, run_status: RunStatus) -> Self {
        Self {
            id,
            run_status,
            results_complete: true,
            streaming_enabled: true,
        }
    }
}

// ============================================================================
// Batches
// ============================================================================

/// A store-side resource backing a batch, such as a database cursor
pub trait ReleaseHandle: Send {
    /// Free the resource
    fn release(self: Box<Self>);
}

/// Records produced for one simulated hour
///
/// An attached [`ReleaseHandle`] is released exactly once: by [`GridBatch::release`],
/// or on drop if nobody released it.
pub struct GridBatch {
    hour: u64,
    records: Vec<GridRecord>,
    handle: Option<Box<dyn ReleaseHandle>>,
}

impl GridBatch {
    /// Batch without a backing resource
    #[must_use]
    pub fn new(hour: u64, records: Vec<GridRecord>) -> Self {
        Self {
            hour,
            records,
            handle: None,
        }
    }

    /// Batch whose resource must be released once consumed or abandoned
    #[must_use]
    pub fn with_handle(hour: u64, records: Vec<GridRecord>, handle: Box<dyn ReleaseHandle>) -> Self {
        Self {
            hour,
            records,
            handle: Some(handle),
        }
    }

    /// Empty batch for an hour with no data
    #[must_use]
    pub fn empty(hour: u64) -> Self {
        Self::new(hour, Vec::new())
    }

    /// Hour index this batch belongs to
    #[must_use]
    pub fn hour(&self) -> u64 {
        self.hour
    }

    /// Records in order
    #[must_use]
    pub fn records(&self) -> &[GridRecord] {
        &self.records
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the hour had no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether a resource is still attached
    #[must_use]
    pub fn holds_resource(&self) -> bool {
        self.handle.is_some()
    }

    /// Move the records out, leaving the handle attached
    pub fn take_records(&mut self) -> Vec<GridRecord> {
        std::mem::take(&mut self.records)
    }

    /// Release the backing resource now
    pub fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}

impl Drop for GridBatch {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(hour = self.hour, "Releasing batch resource on drop");
            handle.release();
        }
    }
}

impl fmt::Debug for GridBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridBatch")
            .field("hour", &self.hour)
            .field("records", &self.records.len())
            .field("holds_resource", &self.handle.is_some())
            .finish()
    }
}

// ============================================================================
// Errors and trait
// ============================================================================

/// Errors a result store can report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The simulation identifier is unknown to the store
    #[error("Simulation {0} not found")]
    NotFound(SimulationId),

    /// Transient store failure
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the error is a transient availability problem
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Read-only access to simulation results
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store name for diagnostics
    fn name(&self) -> &str;

    /// Fetch a status snapshot restricted to `fields`
    async fn fetch_status(
        &self,
        id: SimulationId,
        fields: &[StatusField],
    ) -> Result<SimulationStatus, StoreError>;

    /// Fetch the ordered, possibly-empty batch for one hour
    async fn fetch_batch(&self, id: SimulationId, hour: u64) -> Result<GridBatch, StoreError>;
}
