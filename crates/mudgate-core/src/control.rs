//! Control-plane framing for the client transport.
//!
//! A frame whose first byte is `0x00` carries a UTF-8 JSON control message
//! in the remainder; anything else is opaque upstream payload. Control
//! messages never reach the upstream and upstream bytes never reach the
//! JSON parser.

use crate::config::SessionConfig;
use crate::error::{ProxyError, ProxyResult};
use serde::{Deserialize, Deserializer, Serialize};

/// Leading byte that marks a control frame.
pub const CONTROL_PREFIX: u8 = 0x00;

/// Control frames larger than this are treated as malformed.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

/// Classification of a single transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// 0x00-prefixed JSON control payload (prefix stripped).
    Control(&'a [u8]),
    /// Opaque bytes destined for the upstream, verbatim.
    Data(&'a [u8]),
}

/// Classify an inbound frame by its first byte.
pub fn classify_frame(payload: &[u8]) -> Frame<'_> {
    match payload.first() {
        Some(&CONTROL_PREFIX) => Frame::Control(&payload[1..]),
        _ => Frame::Data(payload),
    }
}

/// Control messages sent proxy → client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerControl {
    /// Sent once when a fresh session is created.
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
        config: SessionConfig,
    },
    /// Sent on successful reattach, before the buffer drains.
    Reconnected {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "bufferedCount")]
        buffered_count: usize,
    },
    /// Sent when a reattach fails; the transport closes afterwards.
    Error { error: String },
    /// Acknowledges an `updateConfig` request with the clamped values.
    ConfigUpdated { config: SessionConfig },
}

impl ServerControl {
    /// Encode into a complete transport frame: prefix byte + JSON.
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of these variants cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut frame = Vec::with_capacity(1 + json.len());
        frame.push(CONTROL_PREFIX);
        frame.extend(json);
        frame
    }
}

/// Control messages sent client → proxy.
///
/// Unknown keys inside a known message are ignored; non-numeric values for
/// numeric keys are treated as absent rather than rejecting the frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientControl {
    UpdateConfig {
        #[serde(
            rename = "persistenceTimeout",
            default,
            deserialize_with = "lenient_i64"
        )]
        persistence_timeout: Option<i64>,
        #[serde(
            rename = "maxBufferLines",
            default,
            deserialize_with = "lenient_i64"
        )]
        max_buffer_lines: Option<i64>,
    },
}

impl ClientControl {
    /// Decode the JSON remainder of a control frame (prefix already
    /// stripped).
    pub fn decode(payload: &[u8]) -> ProxyResult<Self> {
        if payload.len() > MAX_CONTROL_FRAME {
            return Err(ProxyError::MalformedControl(format!(
                "control frame too large: {} bytes",
                payload.len()
            )));
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Accept any JSON value, yielding `Some` only for integral numbers.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_i64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_by_first_byte() {
        assert_eq!(classify_frame(b"\x00{}"), Frame::Control(b"{}"));
        assert_eq!(classify_frame(b"look\n"), Frame::Data(b"look\n"));
        assert_eq!(classify_frame(b""), Frame::Data(b""));
    }

    #[test]
    fn session_wire_shape() {
        let msg = ServerControl::Session {
            session_id: "abc".into(),
            config: SessionConfig::default(),
        };
        let frame = msg.encode();
        assert_eq!(frame[0], CONTROL_PREFIX);
        let json: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
        assert_eq!(json["type"], "session");
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(json["config"]["persistenceTimeout"], 300_000);
        assert_eq!(json["config"]["maxBufferLines"], 1_000);
    }

    #[test]
    fn reconnected_wire_shape() {
        let msg = ServerControl::Reconnected {
            session_id: "s".into(),
            buffered_count: 5,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode()[1..]).unwrap();
        assert_eq!(json["type"], "reconnected");
        assert_eq!(json["bufferedCount"], 5);
    }

    #[test]
    fn error_wire_shape() {
        let msg = ServerControl::Error {
            error: "Session not found".into(),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode()[1..]).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "Session not found");
    }

    #[test]
    fn update_config_decodes() {
        let msg = ClientControl::decode(
            br#"{"type":"updateConfig","persistenceTimeout":1000,"maxBufferLines":50}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientControl::UpdateConfig {
                persistence_timeout: Some(1000),
                max_buffer_lines: Some(50),
            }
        );
    }

    #[test]
    fn update_config_ignores_extras_and_non_numeric() {
        let msg = ClientControl::decode(
            br#"{"type":"updateConfig","persistenceTimeout":"soon","bogus":true}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientControl::UpdateConfig {
                persistence_timeout: None,
                max_buffer_lines: None,
            }
        );
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(ClientControl::decode(br#"{"type":"selfDestruct"}"#).is_err());
        assert!(ClientControl::decode(b"not json").is_err());
    }
}
