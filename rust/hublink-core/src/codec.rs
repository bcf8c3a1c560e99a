//! Wire protocol codec.
//!
//! The engine is agnostic to the serialization format: it depends on the
//! [`HubCodec`] contract and nothing else. Exactly one codec is agreed per
//! physical channel during the handshake; the codec's `name`/`version` exist
//! purely for that negotiation.
//!
//! Handshake records are a distinct framing layer exchanged once per physical
//! channel, before any [`Message`] traffic. They are always JSON text
//! terminated by the record separator, regardless of the negotiated codec.

use bytes::Bytes;
use serde_json::{Map, Value, json};

use hublink_protocol::{
    HandshakeRequest, HandshakeResponse, Message, RECORD_SEPARATOR, message_type,
};

use crate::error::{HandshakeError, ProtocolError};

/// Encode/decode contract between the engine and a concrete wire format.
///
/// `decode(encode(m))` must round-trip every [`Message`] variant losslessly.
/// Decode failures are reported as [`ProtocolError`], never panics, and must
/// not leave partial state behind.
pub trait HubCodec: Send + Sync + 'static {
    /// Protocol name used during handshake negotiation, e.g. `"json"`.
    fn name(&self) -> &'static str;

    /// Protocol version used during handshake negotiation.
    fn version(&self) -> u32;

    /// Serialize one message into a channel frame.
    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError>;

    /// Parse one message out of a channel record. The record separator, if
    /// present, has already been stripped.
    fn decode(&self, record: &[u8]) -> Result<Message, ProtocolError>;
}

/// The JSON codec: each message is a JSON object carrying its integer type
/// tag in a `type` field, terminated by the record separator.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl HubCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> u32 {
        1
    }

    fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let value = match message {
            Message::Invocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut obj = json_object(message_type::INVOCATION);
                if let Some(id) = invocation_id {
                    obj.insert("invocationId".into(), json!(id));
                }
                obj.insert("target".into(), json!(target));
                obj.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    obj.insert("streamIds".into(), json!(stream_ids));
                }
                Value::Object(obj)
            }
            Message::StreamItem {
                invocation_id,
                item,
            } => {
                let mut obj = json_object(message_type::STREAM_ITEM);
                obj.insert("invocationId".into(), json!(invocation_id));
                obj.insert("item".into(), item.clone());
                Value::Object(obj)
            }
            Message::Completion {
                invocation_id,
                result,
                error,
            } => {
                if result.is_some() && error.is_some() {
                    return Err(ProtocolError::Malformed(
                        "completion carries both result and error".into(),
                    ));
                }
                let mut obj = json_object(message_type::COMPLETION);
                obj.insert("invocationId".into(), json!(invocation_id));
                if let Some(result) = result {
                    obj.insert("result".into(), result.clone());
                }
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                }
                Value::Object(obj)
            }
            Message::StreamInvocation {
                invocation_id,
                target,
                arguments,
                stream_ids,
            } => {
                let mut obj = json_object(message_type::STREAM_INVOCATION);
                obj.insert("invocationId".into(), json!(invocation_id));
                obj.insert("target".into(), json!(target));
                obj.insert("arguments".into(), Value::Array(arguments.clone()));
                if !stream_ids.is_empty() {
                    obj.insert("streamIds".into(), json!(stream_ids));
                }
                Value::Object(obj)
            }
            Message::CancelInvocation { invocation_id } => {
                let mut obj = json_object(message_type::CANCEL_INVOCATION);
                obj.insert("invocationId".into(), json!(invocation_id));
                Value::Object(obj)
            }
            Message::Ping => Value::Object(json_object(message_type::PING)),
            Message::Close {
                error,
                allow_reconnect,
            } => {
                let mut obj = json_object(message_type::CLOSE);
                if let Some(error) = error {
                    obj.insert("error".into(), json!(error));
                }
                if *allow_reconnect {
                    obj.insert("allowReconnect".into(), json!(true));
                }
                Value::Object(obj)
            }
        };

        let mut bytes = serde_json::to_vec(&value)
            .map_err(|e| ProtocolError::Malformed(format!("encode failed: {e}")))?;
        bytes.push(RECORD_SEPARATOR);
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, record: &[u8]) -> Result<Message, ProtocolError> {
        let value: Value = serde_json::from_slice(record)
            .map_err(|e| ProtocolError::Malformed(format!("invalid JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("message is not a JSON object".into()))?;

        let tag = obj
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProtocolError::Malformed("missing integer 'type' field".into()))?;
        let tag = u8::try_from(tag).map_err(|_| ProtocolError::Malformed("type tag overflows".into()))?;

        match tag {
            message_type::INVOCATION => Ok(Message::Invocation {
                invocation_id: optional_string(obj, "invocationId"),
                target: required_string(obj, tag, "target")?,
                arguments: arguments(obj),
                stream_ids: string_list(obj, "streamIds"),
            }),
            message_type::STREAM_ITEM => Ok(Message::StreamItem {
                invocation_id: required_string(obj, tag, "invocationId")?,
                item: obj.get("item").cloned().unwrap_or(Value::Null),
            }),
            message_type::COMPLETION => {
                let result = obj.get("result").cloned();
                let error = optional_string(obj, "error");
                if result.is_some() && error.is_some() {
                    return Err(ProtocolError::Malformed(
                        "completion carries both result and error".into(),
                    ));
                }
                Ok(Message::Completion {
                    invocation_id: required_string(obj, tag, "invocationId")?,
                    result,
                    error,
                })
            }
            message_type::STREAM_INVOCATION => Ok(Message::StreamInvocation {
                invocation_id: required_string(obj, tag, "invocationId")?,
                target: required_string(obj, tag, "target")?,
                arguments: arguments(obj),
                stream_ids: string_list(obj, "streamIds"),
            }),
            message_type::CANCEL_INVOCATION => Ok(Message::CancelInvocation {
                invocation_id: required_string(obj, tag, "invocationId")?,
            }),
            message_type::PING => Ok(Message::Ping),
            message_type::CLOSE => Ok(Message::Close {
                error: optional_string(obj, "error"),
                allow_reconnect: obj
                    .get("allowReconnect")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            }),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

fn json_object(tag: u8) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("type".into(), json!(tag));
    obj
}

fn required_string(
    obj: &Map<String, Value>,
    message_type: u8,
    field: &'static str,
) -> Result<String, ProtocolError> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ProtocolError::MissingField {
            message_type,
            field,
        })
}

fn optional_string(obj: &Map<String, Value>, field: &str) -> Option<String> {
    obj.get(field).and_then(Value::as_str).map(str::to_owned)
}

fn arguments(obj: &Map<String, Value>) -> Vec<Value> {
    obj.get("arguments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn string_list(obj: &Map<String, Value>, field: &str) -> Vec<String> {
    obj.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Split a channel frame into records on the record separator.
///
/// A frame usually carries a single record, but a peer may coalesce several
/// messages (or a handshake response and the first messages) into one frame.
/// Empty records are skipped.
pub fn split_records(frame: &[u8]) -> impl Iterator<Item = &[u8]> {
    frame
        .split(|b| *b == RECORD_SEPARATOR)
        .filter(|record| !record.is_empty())
}

/// Encode the handshake request for `codec` as a record-separated frame.
pub fn encode_handshake_request(codec: &dyn HubCodec) -> Bytes {
    let request = HandshakeRequest {
        protocol: codec.name().to_string(),
        version: codec.version(),
    };
    let mut bytes = serde_json::to_vec(&request).expect("handshake request serializes");
    bytes.push(RECORD_SEPARATOR);
    Bytes::from(bytes)
}

/// Encode a handshake response as a record-separated frame.
pub fn encode_handshake_response(response: &HandshakeResponse) -> Bytes {
    let mut bytes = serde_json::to_vec(response).expect("handshake response serializes");
    bytes.push(RECORD_SEPARATOR);
    Bytes::from(bytes)
}

/// Parse the handshake response at the front of `frame`.
///
/// Returns the response and any bytes following the record separator: a peer
/// may coalesce its response and first messages into one frame, and those
/// trailing bytes must be fed through the message path, not dropped.
pub fn parse_handshake_response(frame: &[u8]) -> Result<(HandshakeResponse, Bytes), HandshakeError> {
    let separator = frame
        .iter()
        .position(|b| *b == RECORD_SEPARATOR)
        .ok_or_else(|| HandshakeError::Malformed("missing record separator".into()))?;
    let response: HandshakeResponse = serde_json::from_slice(&frame[..separator])
        .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    Ok((response, Bytes::copy_from_slice(&frame[separator + 1..])))
}

/// Parse a handshake request frame (the accepting side of the exchange).
pub fn parse_handshake_request(frame: &[u8]) -> Result<HandshakeRequest, HandshakeError> {
    let end = frame
        .iter()
        .position(|b| *b == RECORD_SEPARATOR)
        .unwrap_or(frame.len());
    serde_json::from_slice(&frame[..end]).map_err(|e| HandshakeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: Message) {
        let codec = JsonCodec::new();
        let frame = codec.encode(&message).expect("encode");
        let record = split_records(&frame).next().expect("one record");
        let back = codec.decode(record).expect("decode");
        assert_eq!(back, message);
    }

    #[test]
    fn every_variant_round_trips() {
        round_trip(Message::Invocation {
            invocation_id: Some("1".into()),
            target: "Add".into(),
            arguments: vec![json!(2), json!(3)],
            stream_ids: vec!["s1".into()],
        });
        round_trip(Message::Invocation {
            invocation_id: None,
            target: "Notify".into(),
            arguments: vec![],
            stream_ids: vec![],
        });
        round_trip(Message::StreamItem {
            invocation_id: "7".into(),
            item: json!({"n": 1}),
        });
        round_trip(Message::Completion {
            invocation_id: "7".into(),
            result: Some(json!(42)),
            error: None,
        });
        round_trip(Message::Completion {
            invocation_id: "8".into(),
            result: None,
            error: Some("boom".into()),
        });
        round_trip(Message::Completion {
            invocation_id: "9".into(),
            result: None,
            error: None,
        });
        round_trip(Message::StreamInvocation {
            invocation_id: "10".into(),
            target: "Counter".into(),
            arguments: vec![json!(5)],
            stream_ids: vec![],
        });
        round_trip(Message::CancelInvocation {
            invocation_id: "10".into(),
        });
        round_trip(Message::Ping);
        round_trip(Message::Close {
            error: Some("going away".into()),
            allow_reconnect: true,
        });
        round_trip(Message::Close {
            error: None,
            allow_reconnect: false,
        });
    }

    #[test]
    fn unknown_type_tag_is_a_protocol_error() {
        let codec = JsonCodec::new();
        let err = codec.decode(br#"{"type":12}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessageType(12));
    }

    #[test]
    fn missing_required_field_is_reported() {
        let codec = JsonCodec::new();
        let err = codec.decode(br#"{"type":2,"item":1}"#).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingField {
                message_type: message_type::STREAM_ITEM,
                field: "invocationId",
            }
        );
    }

    #[test]
    fn completion_with_result_and_error_is_rejected() {
        let codec = JsonCodec::new();
        let err = codec
            .decode(br#"{"type":3,"invocationId":"1","result":1,"error":"x"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let codec = JsonCodec::new();
        let message = codec
            .decode(br#"{"type":6,"headers":{"x":"y"}}"#)
            .expect("decode");
        assert_eq!(message, Message::Ping);
    }

    #[test]
    fn handshake_response_keeps_trailing_bytes() {
        let mut frame = b"{}".to_vec();
        frame.push(RECORD_SEPARATOR);
        frame.extend_from_slice(br#"{"type":6}"#);
        frame.push(RECORD_SEPARATOR);

        let (response, rest) = parse_handshake_response(&frame).expect("parse");
        assert!(response.error.is_none());
        let records: Vec<&[u8]> = split_records(&rest).collect();
        assert_eq!(records, vec![br#"{"type":6}"# as &[u8]]);
    }

    #[test]
    fn handshake_rejection_carries_the_reason() {
        let frame = encode_handshake_response(&HandshakeResponse::rejected("unsupported protocol"));
        let (response, rest) = parse_handshake_response(&frame).expect("parse");
        assert_eq!(response.error.as_deref(), Some("unsupported protocol"));
        assert!(rest.is_empty());
    }
}
