//! Pipeline variant selection and element planning.
//!
//! [`select_variant`] is the single point of truth mapping a stream config
//! to the concrete pipeline it gets; [`build_spec`] additionally lays out
//! the encoder element chains as data for the media backend to realize.

use tv_core::config::{EncodeSettings, GpuBackend, Logo, Rational, Size, all_file_inputs};
use tv_core::input_uri::Scheme;
use tv_core::{StreamConfig, config::ConfigError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FactoryError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl From<ConfigError> for FactoryError {
    fn from(e: ConfigError) -> Self {
        let ConfigError::Invalid(msg) = e;
        FactoryError::InvalidConfig(msg)
    }
}

/// The concrete pipeline shapes a worker can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineVariant {
    Relay,
    PlaylistRelay,
    Encoding,
    EncodingOnlyAudio,
    EncodingOnlyVideo,
    PlaylistEncoding,
    Mosaic,
    TestInput,
    Device,
    TimeshiftPlayer,
    TimeshiftRecorder,
    Catchup,
    TestLife,
    VodRelay,
    VodEncode,
}

/// Pick the pipeline variant for a config.
///
/// Multi-input relays are only supported as file playlists; anything else
/// multi-input on the relay path is rejected rather than guessed at.
pub fn select_variant(config: &StreamConfig) -> Result<PipelineVariant, FactoryError> {
    config.validate()?;

    Ok(match config {
        StreamConfig::Relay(c) => {
            if c.base.input.len() > 1 {
                // validate() already guaranteed an all-file input set.
                PipelineVariant::PlaylistRelay
            } else {
                PipelineVariant::Relay
            }
        }
        StreamConfig::Encode(c) => {
            let input = &c.base.input;
            if input.len() > 1 {
                if all_file_inputs(input) {
                    PipelineVariant::PlaylistEncoding
                } else {
                    PipelineVariant::Mosaic
                }
            } else {
                let first = &input[0];
                if first.is_test() {
                    PipelineVariant::TestInput
                } else if first.uri.scheme() == Scheme::Dev {
                    PipelineVariant::Device
                } else if first.relay_video {
                    PipelineVariant::EncodingOnlyAudio
                } else if first.relay_audio {
                    PipelineVariant::EncodingOnlyVideo
                } else {
                    PipelineVariant::Encoding
                }
            }
        }
        StreamConfig::TimeshiftPlayer(_) => PipelineVariant::TimeshiftPlayer,
        StreamConfig::TimeshiftRecorder(_) => PipelineVariant::TimeshiftRecorder,
        StreamConfig::Catchup(_) => PipelineVariant::Catchup,
        StreamConfig::TestLife(_) => PipelineVariant::TestLife,
        StreamConfig::VodRelay(_) => PipelineVariant::VodRelay,
        StreamConfig::VodEncode(_) => PipelineVariant::VodEncode,
    })
}

// ---------------------------------------------------------------------------
// Element plans
// ---------------------------------------------------------------------------

/// One element in a declarative chain the backend realizes in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementSpec {
    VideoConvert,
    VideoScale(Size),
    AspectRatio(Rational),
    Framerate(u32),
    Deinterlace,
    LogoOverlay(Logo),
    /// Hardware post-processing; replaces scale, framerate and deinterlace.
    VendorPostProc {
        backend: GpuBackend,
        size: Option<Size>,
        framerate: Option<u32>,
        deinterlace: bool,
    },
    VideoEncoder {
        codec: String,
        bit_rate: Option<u32>,
        extra_args: Vec<(String, String)>,
    },
    H264Parse,
    AacParse,
    AudioConvert {
        volume: Option<f64>,
        channels: Option<u32>,
    },
    AudioEncoder {
        codec: String,
    },
    AudioResample,
    MpegAudioParse,
    Tee,
}

/// A selected variant plus the element chains the backend should build.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSpec {
    pub variant: PipelineVariant,
    pub config: StreamConfig,
    pub video_plan: Vec<ElementSpec>,
    pub audio_plan: Vec<ElementSpec>,
}

pub fn build_spec(config: &StreamConfig) -> Result<PipelineSpec, FactoryError> {
    let variant = select_variant(config)?;
    let (video_plan, audio_plan) = match config {
        StreamConfig::Encode(c) => (
            build_video_plan(&c.encode),
            build_audio_plan(&c.encode),
        ),
        StreamConfig::VodEncode(c) => (
            build_video_plan(&c.encode),
            build_audio_plan(&c.encode),
        ),
        _ => (Vec::new(), Vec::new()),
    };
    Ok(PipelineSpec {
        variant,
        config: config.clone(),
        video_plan,
        audio_plan,
    })
}

pub fn is_h264_encoder(codec: &str) -> bool {
    matches!(codec, "x264enc" | "openh264enc" | "nvh264enc" | "vaapih264enc")
}

pub fn is_aac_encoder(codec: &str) -> bool {
    matches!(codec, "faac" | "voaacenc" | "avenc_aac")
}

pub fn is_mp3_encoder(codec: &str) -> bool {
    codec == "lamemp3enc"
}

/// `convert -> post-proc -> (logo) -> encoder -> (parser) -> tee`.
pub fn build_video_plan(enc: &EncodeSettings) -> Vec<ElementSpec> {
    let mut plan = vec![ElementSpec::VideoConvert];

    if let Some(backend) = enc.gpu_backend {
        plan.push(ElementSpec::VendorPostProc {
            backend,
            size: enc.size,
            framerate: enc.framerate,
            deinterlace: enc.deinterlace,
        });
        if let Some(ratio) = enc.aspect_ratio {
            plan.push(ElementSpec::AspectRatio(ratio));
        }
    } else {
        if let Some(size) = enc.size {
            plan.push(ElementSpec::VideoScale(size));
        }
        if let Some(ratio) = enc.aspect_ratio {
            plan.push(ElementSpec::AspectRatio(ratio));
        }
        if let Some(fps) = enc.framerate {
            plan.push(ElementSpec::Framerate(fps));
        }
        if enc.deinterlace {
            plan.push(ElementSpec::Deinterlace);
        }
    }

    if let Some(logo) = &enc.logo {
        plan.push(ElementSpec::LogoOverlay(logo.clone()));
    }

    plan.push(ElementSpec::VideoEncoder {
        codec: enc.video_codec.clone(),
        bit_rate: enc.bit_rate,
        extra_args: enc
            .extra_encoder_args
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    });
    if is_h264_encoder(&enc.video_codec) {
        plan.push(ElementSpec::H264Parse);
    }
    plan.push(ElementSpec::Tee);
    plan
}

/// `converter(volume, channels) -> encoder -> (parse) -> tee`.
pub fn build_audio_plan(enc: &EncodeSettings) -> Vec<ElementSpec> {
    let mut plan = vec![ElementSpec::AudioConvert {
        volume: enc.volume,
        channels: enc.audio_channels,
    }];
    plan.push(ElementSpec::AudioEncoder {
        codec: enc.audio_codec.clone(),
    });
    if is_mp3_encoder(&enc.audio_codec) {
        plan.push(ElementSpec::AudioResample);
        plan.push(ElementSpec::MpegAudioParse);
    } else if is_aac_encoder(&enc.audio_codec) {
        plan.push(ElementSpec::AacParse);
    }
    plan.push(ElementSpec::Tee);
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use tv_core::config::{
        BaseConfig, CatchupConfig, EncodeConfig, RelayConfig, TimeshiftRecorderConfig,
        TimeshiftSettings, VodRelayConfig,
    };
    use tv_core::input_uri::{InputUri, Uri};

    fn base(inputs: &[&str]) -> BaseConfig {
        BaseConfig {
            id: "s1".to_owned(),
            input: inputs
                .iter()
                .enumerate()
                .map(|(i, raw)| InputUri::new(i as u64, raw.parse::<Uri>().unwrap()))
                .collect(),
            output: vec![],
            feedback_dir: "/tmp/feedback".to_owned(),
            log_level: "info".to_owned(),
            stats_interval_secs: 1,
            restart_attempts: None,
        }
    }

    fn timeshift() -> TimeshiftSettings {
        TimeshiftSettings {
            chunk_duration_secs: 10,
            chunk_lifetime_secs: 3600,
            dir: "/tmp/ts".to_owned(),
        }
    }

    #[test]
    fn relay_rules() {
        let single = StreamConfig::Relay(RelayConfig {
            base: base(&["udp://239.0.0.1:1234"]),
        });
        assert_eq!(select_variant(&single).unwrap(), PipelineVariant::Relay);

        let playlist = StreamConfig::Relay(RelayConfig {
            base: base(&["file:///a.ts", "file:///b.ts"]),
        });
        assert_eq!(
            select_variant(&playlist).unwrap(),
            PipelineVariant::PlaylistRelay
        );

        let mixed = StreamConfig::Relay(RelayConfig {
            base: base(&["udp://239.0.0.1:1234", "udp://239.0.0.2:1234"]),
        });
        assert!(matches!(
            select_variant(&mixed),
            Err(FactoryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn encode_rules() {
        let cases: &[(&[&str], PipelineVariant)] = &[
            (&["file:///a.ts", "file:///b.ts"], PipelineVariant::PlaylistEncoding),
            (&["udp://239.0.0.1:1", "udp://239.0.0.2:2"], PipelineVariant::Mosaic),
            (&["test://"], PipelineVariant::TestInput),
            (&["dev:///dev/video3"], PipelineVariant::Device),
            (&["http://host/a.m3u8"], PipelineVariant::Encoding),
        ];
        for (inputs, expected) in cases {
            let config = StreamConfig::Encode(EncodeConfig {
                base: base(inputs),
                encode: EncodeSettings::default(),
            });
            assert_eq!(select_variant(&config).unwrap(), *expected, "{inputs:?}");
        }
    }

    #[test]
    fn encode_relay_hints_pick_half_pipelines() {
        let mut cfg = EncodeConfig {
            base: base(&["http://host/a.m3u8"]),
            encode: EncodeSettings::default(),
        };
        cfg.base.input[0].relay_video = true;
        assert_eq!(
            select_variant(&StreamConfig::Encode(cfg.clone())).unwrap(),
            PipelineVariant::EncodingOnlyAudio
        );

        cfg.base.input[0].relay_video = false;
        cfg.base.input[0].relay_audio = true;
        assert_eq!(
            select_variant(&StreamConfig::Encode(cfg)).unwrap(),
            PipelineVariant::EncodingOnlyVideo
        );
    }

    #[test]
    fn named_variants_map_straight_through() {
        let rec = StreamConfig::TimeshiftRecorder(TimeshiftRecorderConfig {
            base: base(&["udp://239.0.0.1:1234"]),
            timeshift: timeshift(),
        });
        assert_eq!(
            select_variant(&rec).unwrap(),
            PipelineVariant::TimeshiftRecorder
        );

        let catchup = StreamConfig::Catchup(CatchupConfig {
            base: base(&["udp://239.0.0.1:1234"]),
            timeshift: timeshift(),
        });
        assert_eq!(select_variant(&catchup).unwrap(), PipelineVariant::Catchup);
    }

    #[test]
    fn vod_without_marker_is_invalid() {
        let vod = StreamConfig::VodRelay(VodRelayConfig {
            base: base(&["file:///movie.ts"]),
            is_vod: false,
        });
        assert!(matches!(
            select_variant(&vod),
            Err(FactoryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cpu_video_plan_orders_post_processing() {
        let enc = EncodeSettings {
            size: Some(Size {
                width: 1280,
                height: 720,
            }),
            framerate: Some(25),
            deinterlace: true,
            ..EncodeSettings::default()
        };
        let plan = build_video_plan(&enc);
        assert_eq!(
            plan,
            vec![
                ElementSpec::VideoConvert,
                ElementSpec::VideoScale(Size {
                    width: 1280,
                    height: 720
                }),
                ElementSpec::Framerate(25),
                ElementSpec::Deinterlace,
                ElementSpec::VideoEncoder {
                    codec: "x264enc".to_owned(),
                    bit_rate: None,
                    extra_args: vec![],
                },
                ElementSpec::H264Parse,
                ElementSpec::Tee,
            ]
        );
    }

    #[test]
    fn gpu_backend_collapses_post_processing() {
        let enc = EncodeSettings {
            size: Some(Size {
                width: 1280,
                height: 720,
            }),
            framerate: Some(25),
            deinterlace: true,
            gpu_backend: Some(GpuBackend::Vaapi),
            ..EncodeSettings::default()
        };
        let plan = build_video_plan(&enc);
        assert!(matches!(plan[1], ElementSpec::VendorPostProc { .. }));
        assert!(!plan.iter().any(|e| matches!(
            e,
            ElementSpec::VideoScale(_) | ElementSpec::Framerate(_) | ElementSpec::Deinterlace
        )));
    }

    #[test]
    fn mp3_audio_plan_gets_resample_and_parse() {
        let enc = EncodeSettings {
            audio_codec: "lamemp3enc".to_owned(),
            volume: Some(0.8),
            audio_channels: Some(2),
            ..EncodeSettings::default()
        };
        let plan = build_audio_plan(&enc);
        assert_eq!(
            plan,
            vec![
                ElementSpec::AudioConvert {
                    volume: Some(0.8),
                    channels: Some(2),
                },
                ElementSpec::AudioEncoder {
                    codec: "lamemp3enc".to_owned()
                },
                ElementSpec::AudioResample,
                ElementSpec::MpegAudioParse,
                ElementSpec::Tee,
            ]
        );

        let aac = build_audio_plan(&EncodeSettings::default());
        assert!(aac.contains(&ElementSpec::AacParse));
    }
}
