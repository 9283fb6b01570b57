//! Outbound Messages
//!
//! Messages sent from the streaming controller to a connected client. Every
//! message carries the `gridData` event tag; the payload is either a single
//! grid record or the completion marker.
//!
//! # Design Philosophy
//!
//! The client renders incrementally, so records travel one per message and
//! never as a whole batch. The completion marker is structurally distinct
//! from any record so a client can tell "no more data" apart from data.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Event tag used for every grid message sent to the client
pub const GRID_DATA_EVENT: &str = "gridData";

/// One record of simulation output for a single hour
///
/// The core treats records as opaque JSON and only preserves their order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridRecord(pub serde_json::Value);

impl GridRecord {
    /// Wrap an arbitrary JSON value
    #[must_use]
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Borrow the underlying JSON value
    #[must_use]
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Consume the record, returning the JSON value
    #[must_use]
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for GridRecord {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Terminal payload telling the client that no further data will arrive
///
/// Only the exact object `{"simulation_ended": true}` decodes as a marker;
/// anything else in a `gridData` payload is a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompletionMarker {
    /// Always `true`
    #[serde(deserialize_with = "ended_flag")]
    pub simulation_ended: bool,
}

fn ended_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    if bool::deserialize(deserializer)? {
        Ok(true)
    } else {
        Err(serde::de::Error::custom("simulation_ended must be true"))
    }
}

impl Default for CompletionMarker {
    fn default() -> Self {
        Self {
            simulation_ended: true,
        }
    }
}

/// Payload of a `gridData` message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GridPayload {
    /// End of stream
    ///
    /// Listed first so that `{"simulation_ended": true}` never decodes as a record.
    Ended(CompletionMarker),
    /// A single grid record
    Record(GridRecord),
}

/// A message from the controller to the client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Event tag (always [`GRID_DATA_EVENT`] for messages produced by the core)
    pub event: String,
    /// Message payload
    #[serde(rename = "data")]
    pub payload: GridPayload,
}

impl OutboundMessage {
    /// Build a per-record message
    #[must_use]
    pub fn record(record: GridRecord) -> Self {
        Self {
            event: GRID_DATA_EVENT.to_string(),
            payload: GridPayload::Record(record),
        }
    }

    /// Build the terminal completion message
    #[must_use]
    pub fn completion() -> Self {
        Self {
            event: GRID_DATA_EVENT.to_string(),
            payload: GridPayload::Ended(CompletionMarker::default()),
        }
    }

    /// Whether this message is the completion marker
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self.payload, GridPayload::Ended(_))
    }

    /// The record carried by this message, if any
    #[must_use]
    pub fn as_record(&self) -> Option<&GridRecord> {
        match &self.payload {
            GridPayload::Record(record) => Some(record),
            GridPayload::Ended(_) => None,
        }
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            GridPayload::Record(_) => write!(f, "{}(record)", self.event),
            GridPayload::Ended(_) => write!(f, "{}(ended)", self.event),
        }
    }
}
