//! Streaming Controller
//!
//! The per-connection polling loop that turns a simulation's hourly grid
//! batches into an ordered stream of client messages.
//!
//! # State Machine
//!
//! ```text
//!            start
//!   Idle ───────────► AwaitingStatus ───► AwaitingBatch ───► Emitting
//!     │                    ▲  │                 │               │  │
//!     │                    │  │                 │   not complete│  │ complete
//!     │                    └──┼─────────────────┼───────────────┘  │
//!     │                       │   disconnected  │                  ▼
//!     └───────────────────────┴─────────────────┴──────────► Terminated
//! ```
//!
//! # Guarantees
//!
//! - Batches are emitted in strictly increasing hour order, no gaps, no duplicates
//! - At most one store read is outstanding per session
//! - The hour cursor advances by one after every batch, empty or not
//! - Liveness is checked before the first read and after every read completes
//! - A batch's release handle is released exactly once on every path
//! - Store failures end the loop without a completion message and are never retried

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionError};
use crate::messages::OutboundMessage;
use crate::store::{
    GridBatch, ResultStore, RunStatus, SimulationId, SimulationStatus, StoreError, STATUS_FIELDS,
};

// ============================================================================
// Configuration
// ============================================================================

/// Behaviour switches for a streaming session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Also end the stream when the run reports `failed`, even if the store
    /// has not flagged the results as complete
    pub end_on_failed_run: bool,
}

// ============================================================================
// State
// ============================================================================

/// Controller loop state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    /// Waiting for a start-streaming request
    Idle,
    /// Status read in flight
    AwaitingStatus,
    /// Batch read in flight
    AwaitingBatch,
    /// Sending the current batch to the client
    Emitting,
    /// Loop finished
    Terminated,
}

impl StreamState {
    /// Whether `next` is a legal successor of this state
    #[must_use]
    pub fn can_transition_to(self, next: StreamState) -> bool {
        use StreamState::{AwaitingBatch, AwaitingStatus, Emitting, Idle, Terminated};
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, AwaitingStatus)
            | (AwaitingStatus, AwaitingBatch)
            | (AwaitingBatch, Emitting)
            | (Emitting, AwaitingStatus) => true,
            _ => false,
        }
    }

    /// Whether the loop has finished
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::AwaitingStatus => write!(f, "awaiting_status"),
            Self::AwaitingBatch => write!(f, "awaiting_batch"),
            Self::Emitting => write!(f, "emitting"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Unique identifier for one streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Per-connection streaming state
#[derive(Clone, Debug)]
pub struct StreamSession {
    /// Session identity
    pub id: SessionId,
    /// Simulation being streamed
    pub simulation_id: SimulationId,
    /// Next hour to request
    pub hour_cursor: u64,
    /// Most recent status snapshot
    pub last_status: Option<SimulationStatus>,
}

impl StreamSession {
    /// New session positioned at hour 0
    #[must_use]
    pub fn new(simulation_id: SimulationId) -> Self {
        Self {
            id: SessionId::new(),
            simulation_id,
            hour_cursor: 0,
            last_status: None,
        }
    }
}

/// Counters collected over one session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Completed status reads
    pub status_reads: u64,
    /// Completed batch reads
    pub batch_reads: u64,
    /// Record messages delivered to the connection
    pub records_emitted: u64,
    /// Batches that carried no records
    pub empty_batches: u64,
}

// ============================================================================
// Outcome and errors
// ============================================================================

/// How a session ended when no store failure occurred
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamOutcome {
    /// All data was sent, followed by the completion message
    Completed,
    /// The client went away; nothing more was sent
    Disconnected,
}

/// Summary returned when the loop terminates normally
#[derive(Clone, Debug)]
pub struct StreamReport {
    /// Session identity
    pub session_id: SessionId,
    /// Simulation that was streamed
    pub simulation_id: SimulationId,
    /// Why the loop ended
    pub outcome: StreamOutcome,
    /// Hour cursor at termination (number of hours fully processed)
    pub next_hour: u64,
    /// Last status snapshot observed
    pub last_status: Option<SimulationStatus>,
    /// Session counters
    pub stats: StreamStats,
    /// Wall-clock lifetime of the loop
    pub duration: Duration,
}

/// Which read failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadKind {
    /// `fetch_status`
    Status,
    /// `fetch_batch`
    Batch,
}

impl fmt::Display for ReadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status => write!(f, "status"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Failure that terminated a session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A store read failed; the loop stopped without a completion message
    #[error("{read} read for simulation {simulation_id} failed at hour {hour}: {source}")]
    Store {
        /// Simulation being streamed
        simulation_id: SimulationId,
        /// Read that failed
        read: ReadKind,
        /// Hour cursor at the time of failure
        hour: u64,
        /// Store error
        #[source]
        source: StoreError,
    },
}

impl StreamError {
    /// The underlying store error
    #[must_use]
    pub fn store_error(&self) -> &StoreError {
        match self {
            Self::Store { source, .. } => source,
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Drives one session from the first status read to termination
pub struct StreamingController<C: Connection> {
    session: StreamSession,
    store: Arc<dyn ResultStore>,
    connection: C,
    config: StreamConfig,
    state: StreamState,
    stats: StreamStats,
    started_at: Instant,
    warned_streaming_disabled: bool,
}

impl<C: Connection> StreamingController<C> {
    /// Create a controller in the `Idle` state
    pub fn new(
        simulation_id: SimulationId,
        store: Arc<dyn ResultStore>,
        connection: C,
        config: StreamConfig,
    ) -> Self {
        Self {
            session: StreamSession::new(simulation_id),
            store,
            connection,
            config,
            state: StreamState::Idle,
            stats: StreamStats::default(),
            started_at: Instant::now(),
            warned_streaming_disabled: false,
        }
    }

    /// Current loop state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Session state
    #[must_use]
    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Run the loop to termination
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Store`] when a status or batch read fails.
    /// Disconnection is not an error and yields [`StreamOutcome::Disconnected`].
    pub async fn run(mut self) -> Result<StreamReport, StreamError> {
        let simulation_id = self.session.simulation_id;
        info!(
            simulation_id = %simulation_id,
            session_id = %self.session.id,
            store = self.store.name(),
            "Grid stream started"
        );
        self.started_at = Instant::now();

        loop {
            if self.connection.is_disconnected() {
                return Ok(self.finish(StreamOutcome::Disconnected));
            }

            self.transition(StreamState::AwaitingStatus);
            let status = match self.store.fetch_status(simulation_id, &STATUS_FIELDS).await {
                Ok(status) => status,
                Err(source) => return Err(self.fail(ReadKind::Status, source)),
            };
            self.stats.status_reads += 1;
            self.observe_status(&status);
            let end_after_batch = self.is_final(&status);
            self.session.last_status = Some(status);

            if self.connection.is_disconnected() {
                return Ok(self.finish(StreamOutcome::Disconnected));
            }

            self.transition(StreamState::AwaitingBatch);
            let hour = self.session.hour_cursor;
            let batch = match self.store.fetch_batch(simulation_id, hour).await {
                Ok(batch) => batch,
                Err(source) => return Err(self.fail(ReadKind::Batch, source)),
            };
            self.stats.batch_reads += 1;

            if self.connection.is_disconnected() {
                debug!(
                    hour,
                    records = batch.len(),
                    "Client gone after batch read, abandoning batch"
                );
                batch.release();
                return Ok(self.finish(StreamOutcome::Disconnected));
            }

            self.transition(StreamState::Emitting);
            if let Err(e) = self.emit_batch(batch) {
                debug!(hour, error = %e, "Emission stopped, client gone");
                return Ok(self.finish(StreamOutcome::Disconnected));
            }
            self.session.hour_cursor += 1;

            if end_after_batch {
                if let Err(e) = self.connection.send(OutboundMessage::completion()) {
                    debug!(error = %e, "Completion not delivered, client gone");
                    return Ok(self.finish(StreamOutcome::Disconnected));
                }
                return Ok(self.finish(StreamOutcome::Completed));
            }

            // Reads may complete without suspending; give the disconnect
            // handler a turn before the next cycle.
            tokio::task::yield_now().await;
        }
    }

    /// Send every record of `batch` in order, then release it
    fn emit_batch(&mut self, mut batch: GridBatch) -> Result<(), ConnectionError> {
        let hour = batch.hour();
        let records = batch.take_records();
        if records.is_empty() {
            self.stats.empty_batches += 1;
        }

        let count = records.len();
        for record in records {
            if let Err(e) = self.connection.send(OutboundMessage::record(record)) {
                batch.release();
                return Err(e);
            }
            self.stats.records_emitted += 1;
        }
        batch.release();

        debug!(hour, records = count, "Batch emitted");
        Ok(())
    }

    fn is_final(&self, status: &SimulationStatus) -> bool {
        status.results_complete
            || (self.config.end_on_failed_run && status.run_status == RunStatus::Failed)
    }

    fn observe_status(&mut self, status: &SimulationStatus) {
        debug!(
            run_status = %status.run_status,
            results_complete = status.results_complete,
            hour = self.session.hour_cursor,
            "Status read"
        );
        if !status.streaming_enabled && !self.warned_streaming_disabled {
            self.warned_streaming_disabled = true;
            warn!(
                simulation_id = %status.id,
                "Simulation was not configured to publish grid data, batches may stay empty"
            );
        }
    }

    fn transition(&mut self, next: StreamState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(from = %self.state, to = %next, "Stream state transition");
        self.state = next;
    }

    fn fail(&mut self, read: ReadKind, source: StoreError) -> StreamError {
        self.transition(StreamState::Terminated);
        debug!(read = %read, error = %source, "Store read failed, terminating stream");
        StreamError::Store {
            simulation_id: self.session.simulation_id,
            read,
            hour: self.session.hour_cursor,
            source,
        }
    }

    fn finish(&mut self, outcome: StreamOutcome) -> StreamReport {
        self.transition(StreamState::Terminated);
        let report = StreamReport {
            session_id: self.session.id,
            simulation_id: self.session.simulation_id,
            outcome,
            next_hour: self.session.hour_cursor,
            last_status: self.session.last_status.clone(),
            stats: self.stats.clone(),
            duration: self.started_at.elapsed(),
        };
        info!(
            outcome = ?report.outcome,
            hours = report.next_hour,
            records = report.stats.records_emitted,
            status_reads = report.stats.status_reads,
            batch_reads = report.stats.batch_reads,
            "Grid stream terminated"
        );
        report
    }
}
