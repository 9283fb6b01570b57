//! JSON Event Frames
//!
//! Decodes inbound text frames into [`ClientEvent`]s and encodes
//! [`OutboundMessage`]s into text frames.
//!
//! # Security
//!
//! - Frame size is checked before parsing
//! - Unknown events are rejected, never guessed at

use serde::Deserialize;
use serde_json::Value;

use super::TransportError;
use crate::events::{ClientEvent, RawIdentifier, DISCONNECT_EVENT, START_STREAMING_EVENT};
use crate::messages::OutboundMessage;

/// Maximum frame size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Reason used when a client-initiated disconnect carries none
pub const CLIENT_DISCONNECT_REASON: &str = "client namespace disconnect";

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Decode one inbound text frame using [`MAX_FRAME_SIZE`]
///
/// # Errors
///
/// See [`decode_event_with_limit`].
pub fn decode_event(text: &str) -> Result<ClientEvent, TransportError> {
    decode_event_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode one inbound text frame
///
/// The start-streaming payload is passed through as text; identifier
/// validation happens when the stream is started.
///
/// # Errors
///
/// - [`TransportError::FrameTooLarge`] if `text` exceeds `max_size`
/// - [`TransportError::Malformed`] if the frame is not `{"event", "data"}` JSON
/// - [`TransportError::UnknownEvent`] for any other event name
/// - [`TransportError::InvalidPayload`] if the identifier is missing or not
///   a string or non-negative integer
pub fn decode_event_with_limit(text: &str, max_size: usize) -> Result<ClientEvent, TransportError> {
    if text.len() > max_size {
        return Err(TransportError::FrameTooLarge {
            size: text.len(),
            max: max_size,
        });
    }

    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))?;

    match frame.event.as_str() {
        START_STREAMING_EVENT => {
            let data = frame.data.ok_or_else(|| TransportError::InvalidPayload {
                event: frame.event.clone(),
                reason: "missing data".to_string(),
            })?;
            let raw: RawIdentifier =
                serde_json::from_value(data).map_err(|e| TransportError::InvalidPayload {
                    event: frame.event.clone(),
                    reason: e.to_string(),
                })?;
            Ok(ClientEvent::start(raw.into_text()))
        }
        DISCONNECT_EVENT => {
            let reason = match frame.data {
                Some(Value::String(reason)) if !reason.is_empty() => reason,
                _ => CLIENT_DISCONNECT_REASON.to_string(),
            };
            Ok(ClientEvent::disconnected(reason))
        }
        _ => Err(TransportError::UnknownEvent(frame.event)),
    }
}

/// Encode one outbound message as a text frame
///
/// # Errors
///
/// Returns [`TransportError::SerializationError`] if serialization fails.
pub fn encode_message(message: &OutboundMessage) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|e| TransportError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::GridRecord;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_decode_string_identifier() {
        let event = decode_event(r#"{"event":"simulation_id","data":"1234"}"#).unwrap();
        assert_eq!(event, ClientEvent::start("1234"));
    }

    #[test]
    fn test_decode_numeric_identifier() {
        let event = decode_event(r#"{"event":"simulation_id","data":42}"#).unwrap();
        assert_eq!(event, ClientEvent::start("42"));
    }

    #[test]
    fn test_identifier_is_not_validated_here() {
        // "12abc" is refused by the binder, not the codec
        let event = decode_event(r#"{"event":"simulation_id","data":"12abc"}"#).unwrap();
        assert_eq!(event, ClientEvent::start("12abc"));
    }

    #[test]
    fn test_missing_or_bad_identifier() {
        assert!(matches!(
            decode_event(r#"{"event":"simulation_id"}"#),
            Err(TransportError::InvalidPayload { .. })
        ));
        assert!(matches!(
            decode_event(r#"{"event":"simulation_id","data":{"id":1}}"#),
            Err(TransportError::InvalidPayload { .. })
        ));
        assert!(matches!(
            decode_event(r#"{"event":"simulation_id","data":-3}"#),
            Err(TransportError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_decode_disconnect() {
        assert_eq!(
            decode_event(r#"{"event":"disconnect"}"#).unwrap(),
            ClientEvent::disconnected(CLIENT_DISCONNECT_REASON)
        );
        assert_eq!(
            decode_event(r#"{"event":"disconnect","data":"tab closed"}"#).unwrap(),
            ClientEvent::disconnected("tab closed")
        );
    }

    #[test]
    fn test_unknown_event_and_garbage() {
        assert_eq!(
            decode_event(r#"{"event":"pause","data":null}"#).unwrap_err(),
            TransportError::UnknownEvent("pause".to_string())
        );
        assert!(matches!(
            decode_event("not json"),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_frame_size_limit() {
        let text = r#"{"event":"simulation_id","data":"1"}"#;
        let err = decode_event_with_limit(text, 8).unwrap_err();
        assert_eq!(
            err,
            TransportError::FrameTooLarge {
                size: text.len(),
                max: 8
            }
        );
    }

    #[test]
    fn test_encode_record_and_completion() {
        let record = encode_message(&OutboundMessage::record(GridRecord::new(
            json!({"hour": 3, "load": 1.5}),
        )))
        .unwrap();
        let value: Value = serde_json::from_str(&record).unwrap();
        assert_eq!(
            value,
            json!({"event": "gridData", "data": {"hour": 3, "load": 1.5}})
        );

        let done = encode_message(&OutboundMessage::completion()).unwrap();
        let value: Value = serde_json::from_str(&done).unwrap();
        assert_eq!(
            value,
            json!({"event": "gridData", "data": {"simulation_ended": true}})
        );
    }
}
