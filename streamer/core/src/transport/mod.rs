//! Transport Layer
//!
//! Wire codec between client frames and the core's event/message types.
//!
//! Every frame is a JSON object of the form `{"event": <name>, "data": <payload>}`:
//!
//! | Direction | Event           | Payload                                   |
//! |-----------|-----------------|-------------------------------------------|
//! | inbound   | `simulation_id` | identifier as string or integer           |
//! | inbound   | `disconnect`    | optional reason string                    |
//! | outbound  | `gridData`      | one grid record, or `{"simulation_ended": true}` |
//!
//! The `websocket` feature adds an adapter to and from
//! `tokio_tungstenite` messages.

pub mod frame;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use frame::{decode_event, encode_message, MAX_FRAME_SIZE};

use thiserror::Error;

/// Errors raised while decoding or encoding frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Frame is not the expected JSON shape
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Frame names an event the core does not handle
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Required payload missing or of the wrong type
    #[error("Invalid payload for event {event}: {reason}")]
    InvalidPayload {
        /// Event name
        event: String,
        /// What was wrong
        reason: String,
    },

    /// Frame exceeds the size limit
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),
}
