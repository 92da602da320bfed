//! Codecs for Herald events.
//!
//! Text frames are plain JSON envelopes. Binary frames use MessagePack with
//! length-prefixed framing, so several events may share one buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::events::{ClientEvent, ServerEvent};

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a server event as a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_text(event: &ServerEvent) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a client event from a JSON text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or not a known event.
pub fn decode_text(text: &str) -> Result<ClientEvent, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Extract the `event` name from a JSON frame without decoding the body.
///
/// Useful for logging frames that fail to decode.
#[must_use]
pub fn peek_event_name(text: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Envelope {
        event: String,
    }

    serde_json::from_str::<Envelope>(text).ok().map(|e| e.event)
}

/// Encode an event as a length-prefixed MessagePack frame.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded event
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_binary<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_binary_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_binary_into<T: Serialize>(event: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_binary_from<T: DeserializeOwned>(
    buf: &mut BytesMut,
) -> Result<Option<T>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{PingEvent, PongAck, Registration, Typing};

    #[test]
    fn test_decode_text_events() {
        let event = decode_text(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(event, ClientEvent::Heartbeat);

        let event = decode_text(
            r#"{"event":"user_typing","data":{"chatId":"c1","typing":true,"userName":"Bob"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::UserTyping(Typing {
                chat_id: "c1".into(),
                typing: true,
                user_name: Some("Bob".into()),
            })
        );

        let event = decode_text(r#"{"event":"register","data":{"deviceId":"d-1"}}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::Register(Registration {
                user_id: None,
                device_id: Some("d-1".into()),
            })
        );
    }

    #[test]
    fn test_decode_unknown_event() {
        let text = r#"{"event":"radio_status","data":{"playing":true}}"#;
        assert!(matches!(decode_text(text), Err(ProtocolError::Json(_))));
        assert_eq!(peek_event_name(text).as_deref(), Some("radio_status"));
        assert_eq!(peek_event_name("not json"), None);
    }

    #[test]
    fn test_encode_text_ping() {
        let text = encode_text(&ServerEvent::Ping(PingEvent { id: 3, timestamp: 10 })).unwrap();
        assert_eq!(text, r#"{"event":"ping","data":{"id":3,"timestamp":10}}"#);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode_binary(&ClientEvent::Pong(PongAck { id: Some(1) })).unwrap();

        match decode_binary::<ClientEvent>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match decode_binary_from::<ClientEvent>(&mut buf) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::Heartbeat;
        let second = ClientEvent::Pong(PongAck { id: Some(42) });

        let mut buf = BytesMut::new();
        encode_binary_into(&first, &mut buf).unwrap();
        encode_binary_into(&second, &mut buf).unwrap();

        let decoded: ClientEvent = decode_binary_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, first);
        let decoded: ClientEvent = decode_binary_from(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, second);
        assert!(buf.is_empty());
        assert!(decode_binary_from::<ClientEvent>(&mut buf).unwrap().is_none());
    }
}
