//! Client Events
//!
//! Events sent from a connected client to the streaming core. Only two
//! matter: the request to start streaming one simulation, and the
//! disconnect notification raised by the transport.

use serde::{Deserialize, Serialize};

/// Inbound event name carrying the simulation identifier
pub const START_STREAMING_EVENT: &str = "simulation_id";

/// Inbound event name for the disconnect notification
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Identifier as it arrives on the wire
///
/// Browsers usually send the identifier as a string, some send a bare number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawIdentifier {
    /// Decimal string, e.g. `"1234"`
    Text(String),
    /// JSON integer
    Number(u64),
}

impl RawIdentifier {
    /// Textual form handed to the identifier parser
    #[must_use]
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// Events from a client connection to the core
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// Client asked to stream one simulation's grid results
    StartStreaming {
        /// Simulation identifier, unparsed
        simulation_id: String,
    },

    /// Connection went away
    Disconnected {
        /// Human-readable reason supplied by the transport
        reason: String,
    },
}

impl ClientEvent {
    /// Build a start-streaming event
    pub fn start(simulation_id: impl Into<String>) -> Self {
        Self::StartStreaming {
            simulation_id: simulation_id.into(),
        }
    }

    /// Build a disconnect event
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Wire name of this event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartStreaming { .. } => START_STREAMING_EVENT,
            Self::Disconnected { .. } => DISCONNECT_EVENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(ClientEvent::start("1").name(), "simulation_id");
        assert_eq!(ClientEvent::disconnected("bye").name(), "disconnect");
    }

    #[test]
    fn test_raw_identifier_accepts_string_or_number() {
        let text: RawIdentifier = serde_json::from_str("\"1234\"").unwrap();
        assert_eq!(text.into_text(), "1234");

        let number: RawIdentifier = serde_json::from_str("1234").unwrap();
        assert_eq!(number.into_text(), "1234");
    }
}
