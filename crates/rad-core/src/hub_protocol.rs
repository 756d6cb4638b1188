//! Wire format of the hub's WebSocket event API.
//!
//! Only the slice of the protocol the display needs is modelled: the auth
//! handshake, event subscriptions, keep-alive pings and the messages those
//! produce. Anything else the hub sends decodes to [`ServerMsg::Unknown`].

use crate::value_path::ValuePath;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
pub const WEBSOCKET_PATH: &str = "/api/websocket";

pub const EVENT_TYPE_PATH: ValuePath = ValuePath::new(&["event_type"]);
pub const DEVICE_ID_PATH: ValuePath = ValuePath::new(&["data", "device_id"]);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    Auth { access_token: String },
    SubscribeEvents { id: u64, event_type: String },
    UnsubscribeEvents { id: u64, subscription: u64 },
    Ping { id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    AuthRequired {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthOk {
        #[serde(default)]
        ha_version: Option<String>,
    },
    AuthInvalid {
        #[serde(default)]
        message: Option<String>,
    },
    Result(ResultPayload),
    Event(EventPayload),
    Pong {
        id: u64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultPayload {
    pub id: u64,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<ResultError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    pub id: u64,
    pub event: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message exceeds max size: {size} > {max}")]
    OversizedMessage { size: usize, max: usize },
    #[error("message encode failed: {0}")]
    Encode(String),
    #[error("message decode failed: {0}")]
    Decode(String),
    #[error("unsupported hub url scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
}

/// An event as delivered by the hub. Immutable once built; consumers only
/// ever read the projection they care about out of `payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    pub event_type: String,
    pub device_id: Option<String>,
    pub payload: Value,
}

impl HubEvent {
    pub fn from_payload(payload: Value) -> Self {
        let event_type = EVENT_TYPE_PATH
            .lookup_str(&payload)
            .unwrap_or_default()
            .to_string();
        let device_id = DEVICE_ID_PATH.lookup_str(&payload).map(str::to_string);
        Self {
            event_type,
            device_id,
            payload,
        }
    }

    pub fn field(&self, path: ValuePath) -> Option<&Value> {
        path.lookup(&self.payload)
    }

    pub fn field_str(&self, path: ValuePath) -> Option<&str> {
        path.lookup_str(&self.payload)
    }
}

pub fn encode_client_msg(msg: &ClientMsg) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn decode_server_msg(text: &str, max_message_bytes: usize) -> Result<ServerMsg, ProtocolError> {
    if text.len() > max_message_bytes {
        return Err(ProtocolError::OversizedMessage {
            size: text.len(),
            max: max_message_bytes,
        });
    }
    serde_json::from_str(text).map_err(|err| ProtocolError::Decode(err.to_string()))
}

/// Maps the hub's base URL (as a browser would open it) onto its WebSocket
/// endpoint.
pub fn websocket_url(hub_base_url: &str) -> Result<Url, ProtocolError> {
    let mut url =
        Url::parse(hub_base_url.trim()).map_err(|err| ProtocolError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ProtocolError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| ProtocolError::UnsupportedScheme(scheme.to_string()))?;
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base_path}{WEBSOCKET_PATH}"));
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_messages_use_hub_field_names() {
        let auth = encode_client_msg(&ClientMsg::Auth {
            access_token: "secret".to_string(),
        })
        .expect("encode");
        assert_eq!(
            serde_json::from_str::<Value>(&auth).expect("json"),
            json!({ "type": "auth", "access_token": "secret" })
        );

        let subscribe = encode_client_msg(&ClientMsg::SubscribeEvents {
            id: 3,
            event_type: "assist_card".to_string(),
        })
        .expect("encode");
        assert_eq!(
            serde_json::from_str::<Value>(&subscribe).expect("json"),
            json!({ "type": "subscribe_events", "id": 3, "event_type": "assist_card" })
        );

        let unsubscribe = encode_client_msg(&ClientMsg::UnsubscribeEvents {
            id: 4,
            subscription: 3,
        })
        .expect("encode");
        assert_eq!(
            serde_json::from_str::<Value>(&unsubscribe).expect("json"),
            json!({ "type": "unsubscribe_events", "id": 4, "subscription": 3 })
        );
    }

    #[test]
    fn decodes_handshake_messages() {
        let required = decode_server_msg(
            r#"{"type":"auth_required","ha_version":"2024.6.0"}"#,
            DEFAULT_MAX_MESSAGE_BYTES,
        )
        .expect("decode");
        assert_eq!(
            required,
            ServerMsg::AuthRequired {
                ha_version: Some("2024.6.0".to_string())
            }
        );

        let invalid = decode_server_msg(
            r#"{"type":"auth_invalid","message":"bad token"}"#,
            DEFAULT_MAX_MESSAGE_BYTES,
        )
        .expect("decode");
        assert_eq!(
            invalid,
            ServerMsg::AuthInvalid {
                message: Some("bad token".to_string())
            }
        );
    }

    #[test]
    fn decodes_results_and_events() {
        let failed = decode_server_msg(
            r#"{"id":2,"type":"result","success":false,"error":{"code":"unknown_command","message":"nope"}}"#,
            DEFAULT_MAX_MESSAGE_BYTES,
        )
        .expect("decode");
        match failed {
            ServerMsg::Result(result) => {
                assert_eq!(result.id, 2);
                assert!(!result.success);
                assert_eq!(result.error.expect("error").code, "unknown_command");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let event = decode_server_msg(
            r#"{"id":1,"type":"event","event":{"event_type":"assist_card","data":{"device_id":"assist_1"}}}"#,
            DEFAULT_MAX_MESSAGE_BYTES,
        )
        .expect("decode");
        match event {
            ServerMsg::Event(payload) => {
                let event = HubEvent::from_payload(payload.event);
                assert_eq!(event.event_type, "assist_card");
                assert_eq!(event.device_id.as_deref(), Some("assist_1"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_types_are_tolerated() {
        let msg = decode_server_msg(r#"{"type":"supported_features","id":9}"#, DEFAULT_MAX_MESSAGE_BYTES)
            .expect("decode");
        assert_eq!(msg, ServerMsg::Unknown);
    }

    #[test]
    fn rejects_oversized_and_malformed_messages() {
        let err = decode_server_msg(r#"{"type":"pong","id":1}"#, 4).expect_err("too big");
        assert!(matches!(err, ProtocolError::OversizedMessage { max: 4, .. }));

        let err = decode_server_msg("not json", DEFAULT_MAX_MESSAGE_BYTES).expect_err("bad json");
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn event_without_device_keeps_payload() {
        let event = HubEvent::from_payload(json!({ "event_type": "other", "data": {} }));
        assert_eq!(event.device_id, None);
        assert_eq!(event.event_type, "other");
        assert!(event.field(DEVICE_ID_PATH).is_none());
    }

    #[test]
    fn websocket_url_maps_schemes_and_path() {
        assert_eq!(
            websocket_url("http://hub.local:8123").expect("url").as_str(),
            "ws://hub.local:8123/api/websocket"
        );
        assert_eq!(
            websocket_url("https://hub.example.com/").expect("url").as_str(),
            "wss://hub.example.com/api/websocket"
        );
        assert_eq!(
            websocket_url("http://proxy.local/ha?x=1").expect("url").as_str(),
            "ws://proxy.local/ha/api/websocket"
        );
        assert!(matches!(
            websocket_url("ftp://hub.local"),
            Err(ProtocolError::UnsupportedScheme(_))
        ));
        assert!(matches!(websocket_url("not a url"), Err(ProtocolError::InvalidUrl(_))));
    }
}
