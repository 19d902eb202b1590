// tv-core: domain types shared by the daemon and its stream workers.
//
// Identifier aliases, input/output URI descriptors, the tagged stream
// configuration, and the per-worker metrics records live here.  Nothing in
// this crate touches the network; the wire protocol is in `tv-proto`.

pub mod config;
pub mod input_uri;
pub mod procstat;
pub mod stats;

pub use config::{EncodeSettings, StreamConfig, TimeshiftSettings};
pub use input_uri::{InputUri, OutputUri, Scheme, Uri, UserAgent};
pub use stats::{ChannelStats, StatsRegion, StreamStruct};

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// File names inside a stream's feedback directory.
pub const LOGS_FILE_NAME: &str = "worker.log";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONTROL_SOCKET_NAME: &str = "control.sock";
pub const DUMP_FILE_NAME: &str = "dump.html";

/// Opaque stream identifier, unique within one daemon.
pub type StreamId = String;

/// Scopes per-source byte counters inside a stream.
pub type ChannelId = u64;

/// Wall-clock milliseconds since the UNIX epoch.
pub type TimestampMs = i64;

/// The closed set of stream kinds a worker can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Relay,
    Encode,
    TimeshiftPlayer,
    TimeshiftRecorder,
    Catchup,
    TestLife,
    VodRelay,
    VodEncode,
    /// Inner use only (desktop capture); never produced by configuration.
    Screen,
}

/// Worker lifecycle status as published in its metrics record.
///
/// Transitions form a DAG: `New -> Init -> (Playing <-> Frozen)`, with `Waiting`
/// entered while the pipeline reports buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    New,
    Init,
    Playing,
    Frozen,
    Waiting,
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}

impl StreamStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::New => "new",
            StreamStatus::Init => "init",
            StreamStatus::Playing => "playing",
            StreamStatus::Frozen => "frozen",
            StreamStatus::Waiting => "waiting",
        }
    }
}
