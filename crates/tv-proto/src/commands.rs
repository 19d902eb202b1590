//! Typed command payloads and request constructors.
//!
//! Payloads travel through the `params`/`result` members as JSON strings;
//! [`pack`] and [`unpack`] bridge between the typed structs and that
//! double-encoded form.

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tv_core::input_uri::InputUri;
use tv_core::{StreamConfig, StreamId, StreamStatus, TimestampMs};

use crate::{ErrorKind, Request, RpcError, SeqId, methods};

/// Serialize a payload into the `params`/`result` string form.
pub fn pack<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("command payload serialization cannot fail")
}

/// Parse a typed payload out of a `params`/`result` string.
pub fn unpack<T: DeserializeOwned>(params: Option<&str>) -> Result<T, RpcError> {
    let params =
        params.ok_or_else(|| RpcError::new(ErrorKind::InvalidMessage, "missing params"))?;
    serde_json::from_str(params).map_err(|e| RpcError::new(ErrorKind::InvalidMessage, e.to_string()))
}

// ---------------------------------------------------------------------------
// Service payloads (upstream <-> daemon)
// ---------------------------------------------------------------------------

/// Carried by `activate`, `prepare_service` and `stop_service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateInfo {
    pub license: String,
}

/// Reply to a successful activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub version: String,
    pub fingerprint: String,
}

/// `sync_service`: the full set of streams this daemon should be running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartStreamInfo {
    pub config: StreamConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamIdInfo {
    pub id: StreamId,
}

/// Reply to `get_log_stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLogInfo {
    pub id: StreamId,
    pub content: String,
}

/// One row of the `state_service` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub id: StreamId,
    pub status: StreamStatus,
    pub uptime_secs: u64,
    pub restarts_left: u32,
    #[serde(default)]
    pub bps_input: Vec<u64>,
    #[serde(default)]
    pub bps_output: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateServiceInfo {
    pub streams: Vec<StreamSummary>,
}

/// Aggregate daemon statistics, broadcast as `statistic_service`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatisticInfo {
    pub timestamp: TimestampMs,
    pub cpu_load: f64,
    pub rss_bytes: u64,
    pub streams_running: u64,
    pub subscribers_online: u64,
    pub total_bps_input: u64,
    pub total_bps_output: u64,
}

// ---------------------------------------------------------------------------
// Stream payloads (worker -> supervisor -> upstream)
// ---------------------------------------------------------------------------

/// Per-stream metrics, broadcast as `statistic_stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticInfo {
    pub id: StreamId,
    pub status: StreamStatus,
    pub cpu_load: f64,
    pub rss_bytes: u64,
    pub timestamp: TimestampMs,
    pub restarts_left: u32,
    pub bps_input: Vec<u64>,
    pub bps_output: Vec<u64>,
    pub total_bytes_input: Vec<u64>,
    pub total_bytes_output: Vec<u64>,
}

/// Broadcast as `changed_source_stream` whenever a worker's active source
/// set changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedSourcesInfo {
    pub id: StreamId,
    pub source: InputUri,
}

/// Emitted by the supervisor on every worker reap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuitStatusInfo {
    pub id: StreamId,
    pub exit_status: i32,
    /// Terminating signal number, 0 when the worker exited normally.
    pub signal: i32,
}

// ---------------------------------------------------------------------------
// Subscriber payloads
// ---------------------------------------------------------------------------

/// Credentials presented by `client_activate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub login: String,
    pub password: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPingInfo {
    pub timestamp: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPingInfo {
    pub timestamp: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub bandwidth_host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelsInfo {
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeChannelRequest {
    pub channel_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Official,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeChannelInfo {
    pub channel_id: String,
    pub watchers_count: u64,
    pub channel_type: ChannelType,
}

// ---------------------------------------------------------------------------
// Request constructors
// ---------------------------------------------------------------------------

pub fn restart_stream_request(id: SeqId) -> Request {
    Request::new(id, methods::RESTART, None)
}

pub fn stop_stream_request(id: SeqId) -> Request {
    Request::new(id, methods::STOP, None)
}

pub fn changed_source_stream_broadcast(info: &ChangedSourcesInfo) -> Request {
    Request::notification(methods::CHANGED_SOURCE_STREAM, Some(pack(info)))
}

pub fn statistic_stream_broadcast(info: &StatisticInfo) -> Request {
    Request::notification(methods::STATISTIC_STREAM, Some(pack(info)))
}

pub fn quit_status_stream_broadcast(info: &QuitStatusInfo) -> Request {
    Request::notification(methods::QUIT_STATUS_STREAM, Some(pack(info)))
}

pub fn statistic_service_broadcast(info: &ServiceStatisticInfo) -> Request {
    Request::notification(methods::STATISTIC_SERVICE, Some(pack(info)))
}

pub fn server_ping_request(id: SeqId, info: &ServerPingInfo) -> Request {
    Request::new(id, methods::SERVER_PING, Some(pack(info)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    #[test]
    fn pack_unpack_round_trip() {
        let auth = AuthInfo {
            login: "u".to_owned(),
            password: "p".to_owned(),
            device_id: "d1".to_owned(),
        };
        let packed = pack(&auth);
        let back: AuthInfo = unpack(Some(&packed)).unwrap();
        assert_eq!(back, auth);
    }

    #[test]
    fn unpack_rejects_missing_and_malformed() {
        assert!(unpack::<AuthInfo>(None).is_err());
        assert!(unpack::<AuthInfo>(Some("{}")).is_err());
        assert!(unpack::<AuthInfo>(Some("not json")).is_err());
    }

    #[test]
    fn params_are_double_encoded_on_the_wire() {
        let info = QuitStatusInfo {
            id: "s42".to_owned(),
            exit_status: 1,
            signal: 11,
        };
        let msg = Message::Request(quit_status_stream_broadcast(&info));
        let json = msg.to_json();
        // The params member is a string, not an object.
        assert!(json.contains(r#""params":"{\"id\":\"s42\""#), "{json}");

        let Message::Request(req) = Message::from_json(&json).unwrap() else {
            panic!("expected request");
        };
        let back: QuitStatusInfo = unpack(req.params.as_deref()).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn channel_type_uses_upper_snake() {
        let info = RuntimeChannelInfo {
            channel_id: "C".to_owned(),
            watchers_count: 3,
            channel_type: ChannelType::Official,
        };
        assert!(pack(&info).contains(r#""channel_type":"OFFICIAL""#));
    }
}
