//! Envelope decoder
//!
//! Turns a raw inbound payload into a [`ServerEvent`]. Unknown event types
//! become [`ServerEvent::Unrecognized`]; payloads that are not JSON objects
//! with a string `type`, or whose fields do not match a known type, become a
//! [`DecodeError`]. Neither case is a fault: the caller logs and moves on.

use crate::error::DecodeError;
use crate::protocol::ServerEvent;
use serde_json::Value;

/// Decode one inbound payload.
pub fn decode(raw: &[u8]) -> Result<ServerEvent, DecodeError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| DecodeError::new(e.to_string(), raw))?;

    let Some(event_type) = value.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::new("missing string field 'type'", raw));
    };

    if !ServerEvent::KNOWN_TYPES.contains(&event_type) {
        return Ok(ServerEvent::Unrecognized {
            raw_type: event_type.to_string(),
            raw_payload: value,
        });
    }

    serde_json::from_value(value).map_err(|e| DecodeError::new(e.to_string(), raw))
}
