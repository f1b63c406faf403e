//! Datagram frame encoding.
//!
//! Every datagram carries exactly one frame. Calls and responses are JSON arrays, chosen so that a
//! captured datagram can be read by eye:
//!
//! ```text
//! call:     ["add", [5, 10], {}, 0]
//! response: [{"Ok": 15}, 0]
//!           [{"Err": {"FunctionNotFound": "divide"}}, 2]
//! ack:      ACK
//! ```
//!
//! The datagram boundary delimits the frame, so no length prefix is written. Frames are never
//! fragmented; an envelope which does not fit in the configured frame size is rejected at encode
//! time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The distinguished handshake frame.
pub const ACK_FRAME: &[u8; 3] = b"ACK";

/// Application-level failure carried inside a completed response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RemoteError {
    #[error("function '{0}' not found")]
    FunctionNotFound(String),
    #[error("error while executing function: {0}")]
    HandlerError(String),
    #[error("invalid request format: {0}")]
    DecodeError(String),
}

/// The outcome of a remote call as seen by the caller.
pub type RpcResult = Result<Value, RemoteError>;

#[derive(Clone, Debug, PartialEq)]
pub struct CallEnvelope {
    pub function_name: String,
    pub positional_args: Vec<Value>,
    pub named_args: Map<String, Value>,
    pub sequence_number: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResponseEnvelope {
    pub result: RpcResult,
    pub sequence_number: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Ack,
    Call(CallEnvelope),
    Response(ResponseEnvelope),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encoded frame of {size} bytes exceeds the {limit} byte limit")]
    Oversized { size: usize, limit: usize },
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not an array")]
    NotAnArray,
    #[error("unexpected frame arity {0}")]
    Arity(usize),
}

// Tuple structs serialize as JSON arrays, which gives the wire layout directly.
#[derive(Serialize)]
struct CallFrameRef<'a>(&'a str, &'a [Value], &'a Map<String, Value>, u64);

#[derive(Deserialize)]
struct CallFrame(String, Vec<Value>, Map<String, Value>, u64);

#[derive(Serialize)]
struct ResponseFrameRef<'a>(&'a RpcResult, u64);

#[derive(Deserialize)]
struct ResponseFrame(RpcResult, u64);

fn check_size(bytes: Vec<u8>, limit: usize) -> Result<Box<[u8]>, EncodeError> {
    if bytes.len() > limit {
        return Err(EncodeError::Oversized {
            size: bytes.len(),
            limit,
        });
    }

    Ok(bytes.into_boxed_slice())
}

impl CallEnvelope {
    pub fn new(
        function_name: impl Into<String>,
        positional_args: Vec<Value>,
        named_args: Map<String, Value>,
        sequence_number: u64,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            positional_args,
            named_args,
            sequence_number,
        }
    }

    /// Encodes this envelope as a call frame no larger than `limit` bytes.
    pub fn encode(&self, limit: usize) -> Result<Box<[u8]>, EncodeError> {
        let frame = CallFrameRef(
            &self.function_name,
            &self.positional_args,
            &self.named_args,
            self.sequence_number,
        );

        check_size(serde_json::to_vec(&frame)?, limit)
    }
}

impl ResponseEnvelope {
    /// Encodes this envelope as a response frame no larger than `limit` bytes.
    pub fn encode(&self, limit: usize) -> Result<Box<[u8]>, EncodeError> {
        let frame = ResponseFrameRef(&self.result, self.sequence_number);

        check_size(serde_json::to_vec(&frame)?, limit)
    }
}

pub fn is_ack(bytes: &[u8]) -> bool {
    bytes == ACK_FRAME
}

/// Decodes a single datagram.
pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }

    if is_ack(bytes) {
        return Ok(Frame::Ack);
    }

    let value: Value = serde_json::from_slice(bytes)?;

    let arity = match &value {
        Value::Array(items) => items.len(),
        _ => return Err(DecodeError::NotAnArray),
    };

    match arity {
        4 => {
            let CallFrame(function_name, positional_args, named_args, sequence_number) =
                serde_json::from_value(value)?;

            Ok(Frame::Call(CallEnvelope {
                function_name,
                positional_args,
                named_args,
                sequence_number,
            }))
        }
        2 => {
            let ResponseFrame(result, sequence_number) = serde_json::from_value(value)?;

            Ok(Frame::Response(ResponseEnvelope {
                result,
                sequence_number,
            }))
        }
        n => Err(DecodeError::Arity(n)),
    }
}

/// Extracts the trailing sequence number from a frame that failed to decode, if the frame is at
/// least a JSON array ending in an unsigned integer.
pub fn recover_sequence(bytes: &[u8]) -> Option<u64> {
    match serde_json::from_slice::<Value>(bytes).ok()? {
        Value::Array(items) => items.last()?.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn call_wire_layout() {
        let call = CallEnvelope::new("add", vec![json!(5), json!(10)], Map::new(), 0);
        let bytes = call.encode(1024).unwrap();

        assert_eq!(&*bytes, br#"["add",[5,10],{},0]"#);
    }

    #[test]
    fn response_wire_layout() {
        let ok = ResponseEnvelope {
            result: Ok(json!(15)),
            sequence_number: 0,
        };
        assert_eq!(&*ok.encode(1024).unwrap(), br#"[{"Ok":15},0]"#);

        let err = ResponseEnvelope {
            result: Err(RemoteError::FunctionNotFound("divide".into())),
            sequence_number: 2,
        };
        assert_eq!(
            &*err.encode(1024).unwrap(),
            br#"[{"Err":{"FunctionNotFound":"divide"}},2]"#
        );
    }

    #[test]
    fn call_round_trip_with_nested_values() {
        let call = CallEnvelope::new(
            "store",
            vec![
                json!(null),
                json!(true),
                json!(-3),
                json!(2.5),
                json!("text"),
                json!([1, [2, [3]]]),
            ],
            kwargs(json!({ "nested": { "list": [1, 2], "flag": false }, "empty": {} })),
            u64::MAX,
        );

        let bytes = call.encode(4096).unwrap();

        assert_eq!(decode(&bytes).unwrap(), Frame::Call(call));
    }

    #[test]
    fn response_round_trip() {
        for result in [
            Ok(json!({ "sum": 15 })),
            Ok(json!(null)),
            Err(RemoteError::HandlerError("boom".into())),
            Err(RemoteError::DecodeError("bad".into())),
        ] {
            let response = ResponseEnvelope {
                result,
                sequence_number: 7,
            };
            let bytes = response.encode(4096).unwrap();

            assert_eq!(decode(&bytes).unwrap(), Frame::Response(response));
        }
    }

    #[test]
    fn error_shaped_value_is_not_an_error() {
        let response = ResponseEnvelope {
            result: Ok(json!({ "Err": "not really" })),
            sequence_number: 1,
        };
        let bytes = response.encode(4096).unwrap();

        match decode(&bytes).unwrap() {
            Frame::Response(decoded) => assert!(decoded.result.is_ok()),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn ack_marker() {
        assert_eq!(ACK_FRAME.len(), 3);
        assert_eq!(decode(b"ACK").unwrap(), Frame::Ack);
        assert!(decode(b"ACK ").is_err());
    }

    #[test]
    fn malformed_frames() {
        assert!(matches!(decode(b""), Err(DecodeError::Empty)));
        assert!(matches!(decode(b"{not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode(br#"{"a": 1}"#), Err(DecodeError::NotAnArray)));
        assert!(matches!(decode(br#"[1, 2, 3]"#), Err(DecodeError::Arity(3))));
        assert!(matches!(
            decode(br#"[5, [], {}, 0]"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode(br#"["add", [], {}, -1]"#),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn recover_sequence_from_bad_call() {
        assert_eq!(recover_sequence(br#"[5, "args", {}, 42]"#), Some(42));
        assert_eq!(recover_sequence(br#"["add", [1]]"#), None);
        assert_eq!(recover_sequence(b"garbage"), None);
        assert_eq!(recover_sequence(br#"{"seq": 3}"#), None);
    }

    #[test]
    fn oversized_call_rejected() {
        let call = CallEnvelope::new("echo", vec![json!("x".repeat(64))], Map::new(), 0);

        match call.encode(32) {
            Err(EncodeError::Oversized { size, limit }) => {
                assert!(size > 32);
                assert_eq!(limit, 32);
            }
            other => panic!("expected oversized error, found {:?}", other),
        }
    }
}
