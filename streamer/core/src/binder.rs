//! Connection Lifecycle Binder
//!
//! Wires the two inbound events of one connection to the streaming core:
//!
//! - **start-streaming**: parses the simulation identifier and spawns exactly
//!   one [`StreamingController`] task for the connection
//! - **disconnect**: records the reason once and flips connection liveness so
//!   the running controller stops at its next check
//!
//! The binder owns the controller's join handle and is the "session owner"
//! that receives store failures. Those are logged for diagnostics only and
//! never turned into client-visible events.
//!
//! Dropping a binder whose controller is still bound records a disconnect
//! and aborts the task, so no store reads outlive the connection handler.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};

use crate::connection::{ChannelConnection, Connection, ConnectionId};
use crate::controller::{SessionId, StreamConfig, StreamError, StreamReport, StreamingController};
use crate::events::ClientEvent;
use crate::store::{InvalidIdentifier, ResultStore, SimulationId};

/// Reasons a start-streaming request is refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    /// The payload is not a decimal integer; nothing was started
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),

    /// A controller is already bound to this connection
    #[error("Connection {connection_id} is already streaming simulation {simulation_id}")]
    AlreadyStreaming {
        /// Connection that sent the request
        connection_id: ConnectionId,
        /// Simulation already being streamed
        simulation_id: SimulationId,
    },

    /// The connection is already gone
    #[error("Connection {0} is disconnected")]
    Disconnected(ConnectionId),
}

/// Diagnostic record of a disconnect notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRecord {
    /// Connection that went away
    pub connection_id: ConnectionId,
    /// Reason supplied by the transport
    pub reason: String,
    /// Whether a controller was bound at the time
    pub streaming: bool,
    /// When the notification fired
    pub at: DateTime<Utc>,
}

/// Disconnect reason recorded when a binder is dropped mid-stream
pub const HANDLER_DROPPED_REASON: &str = "connection handler dropped";

/// Result of the bound controller task
pub type SessionResult = Result<StreamReport, StreamError>;

struct ActiveStream {
    session_id: SessionId,
    simulation_id: SimulationId,
    task: JoinHandle<SessionResult>,
}

/// Binds one connection's inbound events to at most one controller
pub struct ConnectionBinder {
    connection: ChannelConnection,
    store: Arc<dyn ResultStore>,
    config: StreamConfig,
    active: Option<ActiveStream>,
    disconnect: Option<DisconnectRecord>,
}

impl ConnectionBinder {
    /// Create a binder for `connection`
    pub fn new(
        connection: ChannelConnection,
        store: Arc<dyn ResultStore>,
        config: StreamConfig,
    ) -> Self {
        Self {
            connection,
            store,
            config,
            active: None,
            disconnect: None,
        }
    }

    /// Connection identity
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Whether a controller has been bound
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Session of the bound controller, if any
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.active.as_ref().map(|a| a.session_id)
    }

    /// The disconnect record, once one has been written
    #[must_use]
    pub fn disconnect_record(&self) -> Option<&DisconnectRecord> {
        self.disconnect.as_ref()
    }

    /// Dispatch one inbound event
    ///
    /// Refused start requests are logged; the connection stays usable.
    pub fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::StartStreaming { simulation_id } => {
                if let Err(e) = self.start_streaming(&simulation_id) {
                    warn!(conn_id = %self.connection.id(), error = %e, "Start-streaming request refused");
                }
            }
            ClientEvent::Disconnected { reason } => {
                self.on_disconnect(reason);
            }
        }
    }

    /// Handle a start-streaming request
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`StartError::InvalidIdentifier`] if `raw_id` is not a decimal integer
    /// - [`StartError::AlreadyStreaming`] if a controller is already bound
    /// - [`StartError::Disconnected`] if the connection is already gone
    pub fn start_streaming(&mut self, raw_id: &str) -> Result<SessionId, StartError> {
        let simulation_id: SimulationId = raw_id.parse()?;

        if let Some(active) = &self.active {
            return Err(StartError::AlreadyStreaming {
                connection_id: self.connection.id(),
                simulation_id: active.simulation_id,
            });
        }
        if self.connection.is_disconnected() {
            return Err(StartError::Disconnected(self.connection.id()));
        }

        let controller = StreamingController::new(
            simulation_id,
            Arc::clone(&self.store),
            self.connection.clone(),
            self.config.clone(),
        );
        let session_id = controller.session().id;
        let span = tracing::info_span!(
            "stream",
            conn_id = %self.connection.id(),
            simulation_id = %simulation_id,
            session_id = %session_id,
        );

        let task = tokio::spawn(
            async move {
                let result = controller.run().await;
                if let Err(e) = &result {
                    warn!(error = %e, "Grid stream terminated by store failure");
                }
                result
            }
            .instrument(span),
        );

        self.active = Some(ActiveStream {
            session_id,
            simulation_id,
            task,
        });
        Ok(session_id)
    }

    /// Handle the disconnect notification
    ///
    /// Returns the diagnostic record the first time; later notifications for
    /// the same connection return `None`.
    pub fn on_disconnect(&mut self, reason: impl Into<String>) -> Option<DisconnectRecord> {
        if self.disconnect.is_some() {
            return None;
        }
        let reason = reason.into();
        self.connection.mark_disconnected(reason.clone());

        let record = DisconnectRecord {
            connection_id: self.connection.id(),
            reason,
            streaming: self.active.is_some(),
            at: Utc::now(),
        };
        info!(
            conn_id = %record.connection_id,
            reason = %record.reason,
            streaming = record.streaming,
            "Disconnect"
        );
        self.disconnect = Some(record.clone());
        Some(record)
    }

    /// Wait for the bound controller to terminate
    ///
    /// Returns `None` if no controller was ever started or if the task
    /// panicked or was aborted.
    pub async fn finish(mut self) -> Option<SessionResult> {
        let active = self.active.take()?;
        match active.task.await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    conn_id = %self.connection.id(),
                    session_id = %active.session_id,
                    error = %e,
                    "Grid stream task did not complete"
                );
                None
            }
        }
    }
}

impl Drop for ConnectionBinder {
    fn drop(&mut self) {
        if self.active.is_none() {
            return;
        }
        self.on_disconnect(HANDLER_DROPPED_REASON);
        if let Some(active) = self.active.take() {
            // The aborted task drops any batch it holds, releasing it
            active.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::StreamOutcome;
    use crate::messages::OutboundMessage;
    use crate::store::{RunStatus, ScriptedStore, SimulationStatus};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn binder_with(
        store: ScriptedStore,
    ) -> (
        ConnectionBinder,
        Arc<ScriptedStore>,
        UnboundedReceiver<OutboundMessage>,
    ) {
        let store = Arc::new(store);
        let (conn, rx) = ChannelConnection::new_pair(ConnectionId::new());
        let binder = ConnectionBinder::new(conn, store.clone(), StreamConfig::default());
        (binder, store, rx)
    }

    #[tokio::test]
    async fn test_invalid_identifier_starts_nothing() {
        let (mut binder, store, _rx) = binder_with(ScriptedStore::new());
        let err = binder.start_streaming("12abc").unwrap_err();
        assert!(matches!(err, StartError::InvalidIdentifier(_)));
        assert!(!binder.is_streaming());
        assert!(binder.finish().await.is_none());
        assert_eq!(store.total_reads(), 0);
    }

    #[tokio::test]
    async fn test_second_start_is_refused() {
        let id = SimulationId::new(1);
        let (mut binder, store, mut rx) = binder_with(
            ScriptedStore::new().with_status(SimulationStatus::complete(id, RunStatus::Succeeded)),
        );

        let session = binder.start_streaming("1").unwrap();
        let err = binder.start_streaming("2").unwrap_err();
        assert!(matches!(
            err,
            StartError::AlreadyStreaming { simulation_id, .. } if simulation_id == id
        ));
        assert_eq!(binder.session_id(), Some(session));

        let report = binder.finish().await.unwrap().unwrap();
        assert_eq!(report.session_id, session);
        assert_eq!(store.status_reads(), 1);
        assert!(rx.recv().await.unwrap().is_completion());
    }

    #[tokio::test]
    async fn test_disconnect_recorded_once_without_stream() {
        let (mut binder, _store, _rx) = binder_with(ScriptedStore::new());

        let record = binder.on_disconnect("transport close").unwrap();
        assert_eq!(record.reason, "transport close");
        assert!(!record.streaming);
        assert_eq!(record.connection_id, binder.connection_id());

        assert!(binder.on_disconnect("ping timeout").is_none());
        assert_eq!(
            binder.disconnect_record().map(|r| r.reason.as_str()),
            Some("transport close")
        );
    }

    #[tokio::test]
    async fn test_start_after_disconnect_is_refused() {
        let (mut binder, store, _rx) = binder_with(ScriptedStore::new());
        binder.handle_event(ClientEvent::disconnected("client namespace disconnect"));
        binder.handle_event(ClientEvent::start("1"));
        assert!(!binder.is_streaming());
        assert_eq!(store.total_reads(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_reaches_never_ending_stream() {
        let id = SimulationId::new(7);
        let (mut binder, store, _rx) =
            binder_with(ScriptedStore::new().with_status(SimulationStatus::running(id)));

        binder.start_streaming("7").unwrap();
        tokio::task::yield_now().await;
        assert!(store.status_reads() >= 1);

        binder.on_disconnect("transport close");
        let result = tokio::time::timeout(Duration::from_secs(5), binder.finish())
            .await
            .expect("controller stops after disconnect");
        let report = result.unwrap().unwrap();
        assert_eq!(report.outcome, StreamOutcome::Disconnected);
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_dropped_binder_stops_its_stream() {
        let id = SimulationId::new(9);
        let store = Arc::new(ScriptedStore::new().with_status(SimulationStatus::running(id)));
        let (conn, mut rx) = ChannelConnection::new_pair(ConnectionId::new());
        let liveness = conn.liveness().clone();
        let mut binder = ConnectionBinder::new(conn, store.clone(), StreamConfig::default());

        binder.start_streaming("9").unwrap();
        tokio::task::yield_now().await;
        drop(binder);

        assert!(liveness.is_disconnected());
        assert_eq!(liveness.reason().as_deref(), Some(HANDLER_DROPPED_REASON));

        // Every sender is gone once the aborted task has been torn down
        while rx.recv().await.is_some() {}
        let reads = store.total_reads();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.total_reads(), reads);
        assert_eq!(store.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_drop_after_finish_records_nothing() {
        let id = SimulationId::new(2);
        let store = Arc::new(
            ScriptedStore::new().with_status(SimulationStatus::complete(id, RunStatus::Succeeded)),
        );
        let (conn, _rx) = ChannelConnection::new_pair(ConnectionId::new());
        let liveness = conn.liveness().clone();
        let mut binder = ConnectionBinder::new(conn, store, StreamConfig::default());

        binder.start_streaming("2").unwrap();
        assert!(binder.finish().await.unwrap().is_ok());
        assert!(!liveness.is_disconnected());
    }
}
