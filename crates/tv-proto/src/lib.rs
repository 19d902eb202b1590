// tv-proto: control-plane protocol for the daemon, its workers, and
// subscribers.
//
// Every control connection speaks length-prefixed JSON-RPC:
//
// ```text
// LEN\r\n{"id":"1","method":"start_stream","params":"{...}"}
// ```
//
// Dialect notes (shared by all three peers):
// - `id` is a stringified monotone counter assigned by the sender; a request
//   without `id` is a notification and never gets a reply;
// - `method` is drawn from the closed vocabulary in [`methods`];
// - `params` / `result`, when present, are JSON *strings* whose contents is
//   itself a JSON object serialized from a typed struct (see [`commands`]).

pub mod codec;
pub mod commands;

use serde::{Deserialize, Serialize};

pub use codec::{CodecError, RpcCodec};

/// Stringified monotone sequence id.
pub type SeqId = String;

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// The closed set of error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidConfig,
    InvalidMessage,
    NotFound,
    Unauthorized,
    AlreadyExists,
    Busy,
    Timeout,
    PeerGone,
    Io,
    Internal,
}

/// The `error` member of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RpcError {
    pub code: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorKind, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

/// A request; with `id: None` it is a notification (no reply expected,
/// distinguished only by method).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: Option<SeqId>,
    pub method: String,
    pub params: Option<String>,
}

impl Request {
    pub fn new(id: SeqId, method: &str, params: Option<String>) -> Self {
        Request {
            id: Some(id),
            method: method.to_owned(),
            params,
        }
    }

    pub fn notification(method: &str, params: Option<String>) -> Self {
        Request {
            id: None,
            method: method.to_owned(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A reply correlated to a request by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: SeqId,
    pub result: Result<String, RpcError>,
}

impl Response {
    pub fn ok(id: SeqId, result: impl Into<String>) -> Self {
        Response {
            id,
            result: Ok(result.into()),
        }
    }

    pub fn err(id: SeqId, code: ErrorKind, message: impl Into<String>) -> Self {
        Response {
            id,
            result: Err(RpcError::new(code, message)),
        }
    }
}

/// Any frame on a control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

// Requests and responses share one wire shape; which one a frame is falls
// out of which members are present.
#[derive(Serialize, Deserialize)]
struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<SeqId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl Message {
    pub fn to_json(&self) -> String {
        let frame = match self {
            Message::Request(req) => WireFrame {
                id: req.id.clone(),
                method: Some(req.method.clone()),
                params: req.params.clone(),
                result: None,
                error: None,
            },
            Message::Response(resp) => match &resp.result {
                Ok(result) => WireFrame {
                    id: Some(resp.id.clone()),
                    method: None,
                    params: None,
                    result: Some(result.clone()),
                    error: None,
                },
                Err(error) => WireFrame {
                    id: Some(resp.id.clone()),
                    method: None,
                    params: None,
                    result: None,
                    error: Some(error.clone()),
                },
            },
        };
        serde_json::to_string(&frame).expect("wire frame serialization cannot fail")
    }

    pub fn from_json(json: &str) -> Result<Message, RpcError> {
        let frame: WireFrame = serde_json::from_str(json)
            .map_err(|e| RpcError::new(ErrorKind::InvalidMessage, e.to_string()))?;

        if let Some(method) = frame.method {
            return Ok(Message::Request(Request {
                id: frame.id,
                method,
                params: frame.params,
            }));
        }

        let id = frame
            .id
            .ok_or_else(|| RpcError::new(ErrorKind::InvalidMessage, "response without id"))?;
        match (frame.result, frame.error) {
            (Some(result), None) => Ok(Message::Response(Response { id, result: Ok(result) })),
            (None, Some(error)) => Ok(Message::Response(Response {
                id,
                result: Err(error),
            })),
            _ => Err(RpcError::new(
                ErrorKind::InvalidMessage,
                "response must carry exactly one of result/error",
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Method vocabulary (closed)
// ---------------------------------------------------------------------------

pub mod methods {
    // Upstream -> daemon.
    pub const ACTIVATE: &str = "activate";
    pub const PREPARE_SERVICE: &str = "prepare_service";
    pub const SYNC_SERVICE: &str = "sync_service";
    pub const STOP_SERVICE: &str = "stop_service";
    pub const PING_SERVICE: &str = "ping_service";
    pub const START_STREAM: &str = "start_stream";
    pub const STOP_STREAM: &str = "stop_stream";
    pub const RESTART_STREAM: &str = "restart_stream";
    pub const STATE_SERVICE: &str = "state_service";
    pub const GET_LOG_STREAM: &str = "get_log_stream";

    // Daemon -> upstream, all notifications.
    pub const STATISTIC_SERVICE: &str = "statistic_service";
    pub const QUIT_STATUS_STREAM: &str = "quit_status_stream";
    pub const CHANGED_SOURCES_STREAM: &str = "changed_sources_stream";
    pub const STATISTIC_STREAM: &str = "statistic_stream";

    // Supervisor <-> worker.
    pub const RESTART: &str = "restart";
    pub const STOP: &str = "stop";
    pub const CHANGED_SOURCE_STREAM: &str = "changed_source_stream";

    // Subscriber endpoint.
    pub const CLIENT_ACTIVATE: &str = "client_activate";
    pub const CLIENT_PING: &str = "client_ping";
    pub const CLIENT_GET_SERVER_INFO: &str = "client_get_server_info";
    pub const CLIENT_GET_CHANNELS: &str = "client_get_channels";
    pub const CLIENT_GET_RUNTIME_CHANNEL_INFO: &str = "client_get_runtime_channel_info";
    pub const SERVER_PING: &str = "server_ping";
    pub const SERVER_GET_CLIENT_INFO: &str = "server_get_client_info";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let msg = Message::Request(Request::new(
            "7".to_owned(),
            methods::START_STREAM,
            Some(r#"{"config":"..."}"#.to_owned()),
        ));
        assert_eq!(Message::from_json(&msg.to_json()).unwrap(), msg);
    }

    #[test]
    fn notification_round_trip_omits_id() {
        let msg = Message::Request(Request::notification(
            methods::STATISTIC_STREAM,
            Some("{}".to_owned()),
        ));
        let json = msg.to_json();
        assert!(!json.contains("\"id\""), "{json}");
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn response_ok_round_trip() {
        let msg = Message::Response(Response::ok("1".to_owned(), ""));
        let json = msg.to_json();
        assert_eq!(json, r#"{"id":"1","result":""}"#);
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn response_err_round_trip() {
        let msg = Message::Response(Response::err(
            "2".to_owned(),
            ErrorKind::AlreadyExists,
            "Double connection reject",
        ));
        let json = msg.to_json();
        assert_eq!(
            json,
            r#"{"id":"2","error":{"code":"AlreadyExists","message":"Double connection reject"}}"#
        );
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        for bad in [
            "not json",
            "{}",
            r#"{"id":"1"}"#,
            r#"{"id":"1","result":"","error":{"code":"Io","message":"x"}}"#,
        ] {
            assert!(Message::from_json(bad).is_err(), "{bad}");
        }
    }
}
