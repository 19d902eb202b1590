//! Stream configuration.
//!
//! One tagged enum discriminated by stream type replaces a polymorphic
//! hierarchy: the pipeline factory downstream is an exhaustive match over
//! this type, so every variant/field combination has a single point of truth.
//!
//! ```json
//! { "type": "encode", "id": "s42", "input": [...], "output": [...], ... }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::input_uri::{InputUri, OutputUri, Scheme};
use crate::{StreamId, StreamType};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ---------------------------------------------------------------------------
// Shared sections
// ---------------------------------------------------------------------------

/// Fields common to every stream variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseConfig {
    pub id: StreamId,
    pub input: Vec<InputUri>,
    #[serde(default)]
    pub output: Vec<OutputUri>,
    /// Per-stream working directory: logs, HLS playlists and dumps land here.
    pub feedback_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between metric publications; also the broadcast interval.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Abnormal-exit respawn budget; the supervisor's counter is
    /// authoritative, this value only seeds it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_attempts: Option<u32>,
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_stats_interval() -> u64 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Logo {
    pub path: String,
    pub position: LogoPosition,
    pub alpha: f64,
}

/// Vendor post-processing backend; when set, scale, framerate and
/// deinterlace collapse into a single hardware element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuBackend {
    Vaapi,
    Nvidia,
}

/// Transcoding knobs carried by the encode family of variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeSettings {
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<u32>,
    #[serde(default)]
    pub deinterlace: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<Rational>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<Logo>,
    /// Raw `key=value` pairs appended to the encoder element.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_encoder_args: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_backend: Option<GpuBackend>,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        EncodeSettings {
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            bit_rate: None,
            size: None,
            framerate: None,
            deinterlace: false,
            aspect_ratio: None,
            volume: None,
            audio_channels: None,
            logo: None,
            extra_encoder_args: BTreeMap::new(),
            gpu_backend: None,
        }
    }
}

fn default_video_codec() -> String {
    "x264enc".to_owned()
}

fn default_audio_codec() -> String {
    "faac".to_owned()
}

/// Chunked-recording knobs for the timeshift family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeshiftSettings {
    pub chunk_duration_secs: u64,
    /// How long recorded chunks are kept before pruning.
    #[serde(default = "default_chunk_lifetime")]
    pub chunk_lifetime_secs: u64,
    pub dir: String,
}

fn default_chunk_lifetime() -> u64 {
    12 * 60 * 60
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(default)]
    pub encode: EncodeSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeshiftPlayerConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    pub timeshift: TimeshiftSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeshiftRecorderConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    pub timeshift: TimeshiftSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchupConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    pub timeshift: TimeshiftSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLifeConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VodRelayConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(default)]
    pub is_vod: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VodEncodeConfig {
    #[serde(flatten)]
    pub base: BaseConfig,
    #[serde(default)]
    pub encode: EncodeSettings,
    #[serde(default)]
    pub is_vod: bool,
}

/// A complete stream description, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamConfig {
    Relay(RelayConfig),
    Encode(EncodeConfig),
    TimeshiftPlayer(TimeshiftPlayerConfig),
    TimeshiftRecorder(TimeshiftRecorderConfig),
    Catchup(CatchupConfig),
    TestLife(TestLifeConfig),
    VodRelay(VodRelayConfig),
    VodEncode(VodEncodeConfig),
}

impl StreamConfig {
    pub fn base(&self) -> &BaseConfig {
        match self {
            StreamConfig::Relay(c) => &c.base,
            StreamConfig::Encode(c) => &c.base,
            StreamConfig::TimeshiftPlayer(c) => &c.base,
            StreamConfig::TimeshiftRecorder(c) => &c.base,
            StreamConfig::Catchup(c) => &c.base,
            StreamConfig::TestLife(c) => &c.base,
            StreamConfig::VodRelay(c) => &c.base,
            StreamConfig::VodEncode(c) => &c.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseConfig {
        match self {
            StreamConfig::Relay(c) => &mut c.base,
            StreamConfig::Encode(c) => &mut c.base,
            StreamConfig::TimeshiftPlayer(c) => &mut c.base,
            StreamConfig::TimeshiftRecorder(c) => &mut c.base,
            StreamConfig::Catchup(c) => &mut c.base,
            StreamConfig::TestLife(c) => &mut c.base,
            StreamConfig::VodRelay(c) => &mut c.base,
            StreamConfig::VodEncode(c) => &mut c.base,
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.base().id
    }

    pub fn stream_type(&self) -> StreamType {
        match self {
            StreamConfig::Relay(_) => StreamType::Relay,
            StreamConfig::Encode(_) => StreamType::Encode,
            StreamConfig::TimeshiftPlayer(_) => StreamType::TimeshiftPlayer,
            StreamConfig::TimeshiftRecorder(_) => StreamType::TimeshiftRecorder,
            StreamConfig::Catchup(_) => StreamType::Catchup,
            StreamConfig::TestLife(_) => StreamType::TestLife,
            StreamConfig::VodRelay(_) => StreamType::VodRelay,
            StreamConfig::VodEncode(_) => StreamType::VodEncode,
        }
    }

    /// Reject combinations no pipeline variant exists for.
    ///
    /// The daemon validates before spawning so a bad config fails the
    /// originating `start_stream` instead of crash-looping a child.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base();
        if base.id.is_empty() {
            return Err(invalid("stream id is empty"));
        }
        if base.input.is_empty() {
            return Err(invalid("stream has no inputs"));
        }
        if base.feedback_dir.is_empty() {
            return Err(invalid("feedback_dir is empty"));
        }

        match self {
            StreamConfig::Relay(c) => {
                // Multiple relay inputs are only meaningful as a file
                // playlist; a multi-input network relay has no variant.
                if c.base.input.len() > 1 && !all_file_inputs(&c.base.input) {
                    return Err(invalid("multi-input relay requires file:// inputs only"));
                }
                Ok(())
            }
            StreamConfig::Encode(_) | StreamConfig::TestLife(_) => Ok(()),
            StreamConfig::TimeshiftPlayer(c) => validate_timeshift(&c.timeshift),
            StreamConfig::TimeshiftRecorder(c) => validate_timeshift(&c.timeshift),
            StreamConfig::Catchup(c) => validate_timeshift(&c.timeshift),
            StreamConfig::VodRelay(c) => {
                if !c.is_vod {
                    return Err(invalid("vod_relay stream without is_vod marker"));
                }
                Ok(())
            }
            StreamConfig::VodEncode(c) => {
                if !c.is_vod {
                    return Err(invalid("vod_encode stream without is_vod marker"));
                }
                Ok(())
            }
        }
    }
}

pub fn all_file_inputs(input: &[InputUri]) -> bool {
    input.iter().all(|i| i.uri.scheme() == Scheme::File)
}

fn validate_timeshift(ts: &TimeshiftSettings) -> Result<(), ConfigError> {
    if ts.chunk_duration_secs == 0 {
        return Err(invalid("timeshift chunk_duration_secs must be positive"));
    }
    if ts.dir.is_empty() {
        return Err(invalid("timeshift dir is empty"));
    }
    Ok(())
}
