//! Connection Handle
//!
//! Abstraction over one client connection as the streaming controller sees
//! it: a non-blocking `send`, a liveness query, and a way for the transport
//! to report that the peer went away.
//!
//! # Architecture
//!
//! ```text
//!   transport task                         controller task
//!  ┌─────────────────┐   OutboundMessage  ┌──────────────────┐
//!  │ outbound rx ◄───┼────────────────────┼── send()         │
//!  │                 │                    │                  │
//!  │ mark_disconnected()──► Liveness ◄────┼── is_disconnected()
//!  └─────────────────┘   (AtomicBool)     └──────────────────┘
//! ```
//!
//! Sending never blocks: messages go into an unbounded channel drained by the
//! transport, so emission is not a suspension point of the controller loop.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::OutboundMessage;

/// Unique identifier for a client connection
///
/// Stable for the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Build an ID from a raw value
    #[must_use]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw numeric value
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Errors raised when emitting to a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The peer is gone; nothing further can be delivered
    #[error("Connection {0} closed")]
    Closed(ConnectionId),
}

/// One client connection, as seen by the controller
pub trait Connection: Send + Sync {
    /// Connection identity for diagnostics
    fn id(&self) -> ConnectionId;

    /// Queue one message for delivery without blocking
    fn send(&self, message: OutboundMessage) -> Result<(), ConnectionError>;

    /// Whether the peer has disconnected
    fn is_disconnected(&self) -> bool;
}

/// Shared liveness flag plus the reason recorded when it flipped
#[derive(Clone, Debug, Default)]
pub struct Liveness {
    disconnected: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl Liveness {
    /// Fresh, connected state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the connection has been marked disconnected
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Mark disconnected, returning `true` only for the first call
    pub fn mark_disconnected(&self, reason: impl Into<String>) -> bool {
        let first = !self.disconnected.swap(true, Ordering::SeqCst);
        if first {
            *self.reason.lock() = Some(reason.into());
        }
        first
    }

    /// Reason recorded by the first disconnect
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Channel-backed connection handle
///
/// Cheap to clone; clones share the same channel and liveness flag.
#[derive(Clone, Debug)]
pub struct ChannelConnection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<OutboundMessage>,
    liveness: Liveness,
}

impl ChannelConnection {
    /// Create a connection and the receiver the transport drains
    #[must_use]
    pub fn new_pair(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            id,
            tx,
            liveness: Liveness::new(),
        };
        (connection, rx)
    }

    /// The shared liveness state
    #[must_use]
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Flip liveness; see [`Liveness::mark_disconnected`]
    pub fn mark_disconnected(&self, reason: impl Into<String>) -> bool {
        self.liveness.mark_disconnected(reason)
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, message: OutboundMessage) -> Result<(), ConnectionError> {
        if self.liveness.is_disconnected() {
            return Err(ConnectionError::Closed(self.id));
        }
        self.tx
            .send(message)
            .map_err(|_| ConnectionError::Closed(self.id))
    }

    fn is_disconnected(&self) -> bool {
        self.liveness.is_disconnected() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::from_raw(17);
        assert_eq!(id.to_string(), "conn-17");
        assert_eq!(id.as_u64(), 17);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let (conn, mut rx) = ChannelConnection::new_pair(ConnectionId::new());
        conn.send(OutboundMessage::completion()).unwrap();
        let msg = rx.recv().await.unwrap();
        assert!(msg.is_completion());
    }

    #[test]
    fn test_disconnect_recorded_once() {
        let (conn, _rx) = ChannelConnection::new_pair(ConnectionId::new());
        assert!(!conn.is_disconnected());

        assert!(conn.mark_disconnected("transport close"));
        assert!(!conn.mark_disconnected("ping timeout"));

        assert!(conn.is_disconnected());
        assert_eq!(conn.liveness().reason().as_deref(), Some("transport close"));
    }

    #[test]
    fn test_send_after_disconnect_fails() {
        let (conn, _rx) = ChannelConnection::new_pair(ConnectionId::from_raw(3));
        conn.mark_disconnected("bye");
        let err = conn.send(OutboundMessage::completion()).unwrap_err();
        assert_eq!(err, ConnectionError::Closed(ConnectionId::from_raw(3)));
    }

    #[test]
    fn test_dropped_receiver_reads_as_disconnected() {
        let (conn, rx) = ChannelConnection::new_pair(ConnectionId::new());
        drop(rx);
        assert!(conn.is_disconnected());
        assert!(conn.send(OutboundMessage::completion()).is_err());
    }

    #[test]
    fn test_clones_share_liveness() {
        let (conn, _rx) = ChannelConnection::new_pair(ConnectionId::new());
        let clone = conn.clone();
        conn.mark_disconnected("gone");
        assert!(clone.is_disconnected());
    }
}
