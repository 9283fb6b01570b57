//! WebSocket Frame Adapter
//!
//! Converts between `tokio_tungstenite` messages and the core's events and
//! messages. Text frames carry JSON; binary frames are accepted when they
//! hold UTF-8 JSON. Ping/pong are left to the WebSocket library.

use std::borrow::Cow;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use super::frame::{decode_event_with_limit, encode_message};
use super::TransportError;
use crate::events::ClientEvent;
use crate::messages::OutboundMessage;

/// Disconnect reason when the peer closes without giving one
pub const TRANSPORT_CLOSE_REASON: &str = "transport close";

/// Disconnect reason when the socket fails
pub const TRANSPORT_ERROR_REASON: &str = "transport error";

/// What one inbound WebSocket message means to the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsInbound {
    /// A decoded client event
    Event(ClientEvent),
    /// Peer sent a close frame
    Closed {
        /// Reason from the close frame, or [`TRANSPORT_CLOSE_REASON`]
        reason: String,
    },
    /// Control frame with no meaning for the core
    Control,
}

/// Classify one inbound message
///
/// # Errors
///
/// Returns the decode error for data frames that are not valid event JSON.
pub fn decode_ws_message(message: Message, max_size: usize) -> Result<WsInbound, TransportError> {
    match message {
        Message::Text(text) => decode_event_with_limit(&text, max_size).map(WsInbound::Event),
        Message::Binary(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| TransportError::Malformed(format!("binary frame is not UTF-8: {e}")))?;
            decode_event_with_limit(text, max_size).map(WsInbound::Event)
        }
        Message::Close(frame) => {
            let reason = frame
                .map(|f| f.reason.into_owned())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| TRANSPORT_CLOSE_REASON.to_string());
            Ok(WsInbound::Closed { reason })
        }
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(WsInbound::Control),
    }
}

/// Encode one outbound message as a text frame
///
/// # Errors
///
/// Returns [`TransportError::SerializationError`] if serialization fails.
pub fn encode_ws_message(message: &OutboundMessage) -> Result<Message, TransportError> {
    encode_message(message).map(Message::Text)
}

/// Normal-closure frame sent when the server ends a connection
#[must_use]
pub fn close_message(reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: Cow::Owned(reason.to_string()),
    }))
}
