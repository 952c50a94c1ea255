//! Wire frames exchanged with the peer.
//!
//! Each WebSocket text message carries one JSON object:
//!
//! - outbound: `{ "id": string, "command": string, "params": object }`
//! - inbound:  `{ "id": string, "result": any }` or `{ "id": string, "error": string }`

use serde_json::{json, Map, Value};
use thiserror::Error;

use super::CorrelationId;

/// Encodes a command frame.
#[must_use]
pub fn encode_command(id: CorrelationId, command: &str, params: &Map<String, Value>) -> String {
    json!({
        "id": id.to_string(),
        "command": command,
        "params": params,
    })
    .to_string()
}

/// A reply frame from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyFrame {
    /// The command succeeded.
    Result {
        /// Echoed correlation id.
        id: String,
        /// Result payload, opaque to the relay.
        result: Value,
    },
    /// The command failed on the peer side.
    Error {
        /// Echoed correlation id.
        id: String,
        /// Error message.
        error: String,
    },
}

impl ReplyFrame {
    /// Returns the echoed correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Result { id, .. } | Self::Error { id, .. } => id,
        }
    }
}

/// Reasons an inbound frame is not a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not a JSON object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    /// No string `id` field.
    #[error("frame has no id")]
    MissingId,

    /// An `id` but neither `result` nor `error`.
    #[error("frame {0} carries neither result nor error")]
    NoOutcome(String),
}

/// Parses an inbound frame.
///
/// An `error` that is present and non-null takes precedence over `result`.
/// Non-string error payloads are kept as their JSON text.
///
/// # Errors
///
/// Returns a [`FrameError`] if the text is not a reply frame.
pub fn parse_reply(text: &str) -> Result<ReplyFrame, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|_| FrameError::NotAnObject)?;
    let Value::Object(mut obj) = value else {
        return Err(FrameError::NotAnObject);
    };

    let id = match obj.remove("id") {
        Some(Value::String(id)) => id,
        _ => return Err(FrameError::MissingId),
    };

    match obj.remove("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(error)) => return Ok(ReplyFrame::Error { id, error }),
        Some(other) => {
            return Ok(ReplyFrame::Error {
                id,
                error: other.to_string(),
            })
        }
    }

    match obj.remove("result") {
        Some(result) => Ok(ReplyFrame::Result { id, result }),
        None => Err(FrameError::NoOutcome(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_shape() {
        let id = CorrelationId::new();
        let mut params = Map::new();
        params.insert("nodeId".to_string(), json!("1:23"));

        let text = encode_command(id, "get_node_info", &params);
        let value: Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["id"], json!(id.to_string()));
        assert_eq!(value["command"], json!("get_node_info"));
        assert_eq!(value["params"]["nodeId"], json!("1:23"));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn params_keep_insertion_order() {
        let mut params = Map::new();
        params.insert("zeta".to_string(), json!(1));
        params.insert("alpha".to_string(), json!(2));

        let text = encode_command(CorrelationId::new(), "cmd", &params);
        assert!(text.find("zeta").unwrap() < text.find("alpha").unwrap());
    }

    #[test]
    fn parse_result_reply() {
        let frame = parse_reply(r#"{"id":"abc","result":{"name":"Page 1"}}"#).unwrap();
        assert_eq!(
            frame,
            ReplyFrame::Result {
                id: "abc".to_string(),
                result: json!({"name": "Page 1"}),
            }
        );
    }

    #[test]
    fn null_result_is_still_a_result() {
        let frame = parse_reply(r#"{"id":"abc","result":null}"#).unwrap();
        assert_eq!(frame.id(), "abc");
        assert!(matches!(frame, ReplyFrame::Result { result: Value::Null, .. }));
    }

    #[test]
    fn error_wins_over_result() {
        let frame = parse_reply(r#"{"id":"abc","result":1,"error":"Node not found"}"#).unwrap();
        assert_eq!(
            frame,
            ReplyFrame::Error {
                id: "abc".to_string(),
                error: "Node not found".to_string(),
            }
        );
    }

    #[test]
    fn structured_error_becomes_text() {
        let frame = parse_reply(r#"{"id":"abc","error":{"code":7}}"#).unwrap();
        assert_eq!(
            frame,
            ReplyFrame::Error {
                id: "abc".to_string(),
                error: r#"{"code":7}"#.to_string(),
            }
        );
    }

    #[test]
    fn rejects_non_replies() {
        assert_eq!(parse_reply("hello"), Err(FrameError::NotAnObject));
        assert_eq!(parse_reply("[1,2]"), Err(FrameError::NotAnObject));
        assert_eq!(parse_reply(r#"{"result":1}"#), Err(FrameError::MissingId));
        assert_eq!(parse_reply(r#"{"id":5,"result":1}"#), Err(FrameError::MissingId));
        assert_eq!(
            parse_reply(r#"{"id":"abc","progress":50}"#),
            Err(FrameError::NoOutcome("abc".to_string()))
        );
    }
}
