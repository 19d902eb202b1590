//! Input and output endpoint descriptors.
//!
//! A `Uri` is a raw URL string paired with its parsed scheme; the scheme set
//! is closed.  `test://` (or the bare word `test`) selects the synthetic
//! source used by test pipelines.  Equality on `InputUri`/`OutputUri` is
//! structural.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ChannelId;

/// The closed set of endpoint schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
    Rtmp,
    Rtmps,
    Udp,
    Rtp,
    File,
    Dev,
    Screen,
    Test,
}

impl Scheme {
    fn from_prefix(s: &str) -> Option<Scheme> {
        let scheme = s.split("://").next()?;
        match scheme {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "rtmp" => Some(Scheme::Rtmp),
            "rtmps" => Some(Scheme::Rtmps),
            "udp" => Some(Scheme::Udp),
            "rtp" => Some(Scheme::Rtp),
            "file" => Some(Scheme::File),
            "dev" => Some(Scheme::Dev),
            "screen" => Some(Scheme::Screen),
            "test" => Some(Scheme::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("empty url")]
    Empty,
    #[error("unsupported scheme in '{0}'")]
    UnsupportedScheme(String),
}

/// A validated endpoint URL.  Serialized as the raw string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    scheme: Scheme,
    raw: String,
}

impl Uri {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The part after `scheme://` (path, host, device name...).
    pub fn rest(&self) -> &str {
        match self.raw.split_once("://") {
            Some((_, rest)) => rest,
            None => "",
        }
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UriError::Empty);
        }
        // The synthetic source is accepted both as a bare word and a url.
        if s == "test" {
            return Ok(Uri {
                scheme: Scheme::Test,
                raw: "test://".to_owned(),
            });
        }
        match Scheme::from_prefix(s) {
            Some(scheme) if s.contains("://") => Ok(Uri {
                scheme,
                raw: s.to_owned(),
            }),
            _ => Err(UriError::UnsupportedScheme(s.to_owned())),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Uri {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Uri {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Which HTTP user agent the source should present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAgent {
    #[default]
    Gstreamer,
    Vlc,
}

/// One ingest endpoint of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputUri {
    pub id: ChannelId,
    pub uri: Uri,
    #[serde(default)]
    pub user_agent: UserAgent,
    #[serde(default)]
    pub mute: bool,
    /// Pass the video track through untouched; encode audio only.
    #[serde(default)]
    pub relay_video: bool,
    /// Pass the audio track through untouched; encode video only.
    #[serde(default)]
    pub relay_audio: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl InputUri {
    pub fn new(id: ChannelId, uri: Uri) -> Self {
        InputUri {
            id,
            uri,
            user_agent: UserAgent::default(),
            mute: false,
            relay_video: false,
            relay_audio: false,
            volume: None,
        }
    }

    pub fn is_test(&self) -> bool {
        self.uri.scheme() == Scheme::Test
    }
}

/// One publish endpoint of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputUri {
    pub id: ChannelId,
    pub uri: Uri,
    /// Root directory for HLS playlists and chunks, for `http` sinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hls_root: Option<String>,
}

impl OutputUri {
    pub fn new(id: ChannelId, uri: Uri) -> Self {
        OutputUri {
            id,
            uri,
            hls_root: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_schemes() {
        for (raw, scheme) in [
            ("http://example.com/a.m3u8", Scheme::Http),
            ("https://example.com/a.m3u8", Scheme::Https),
            ("rtmp://4.31.30.153:1935/devapp/one", Scheme::Rtmp),
            ("udp://239.0.0.1:1234", Scheme::Udp),
            ("file:///home/media/2.ts", Scheme::File),
            ("dev:///dev/video3", Scheme::Dev),
            ("test://", Scheme::Test),
            ("test", Scheme::Test),
        ] {
            let uri: Uri = raw.parse().unwrap();
            assert_eq!(uri.scheme(), scheme, "{raw}");
        }
    }

    #[test]
    fn rejects_unknown_and_empty() {
        assert!("".parse::<Uri>().is_err());
        assert!("gopher://old".parse::<Uri>().is_err());
        assert!("not a url".parse::<Uri>().is_err());
    }

    #[test]
    fn dev_uri_keeps_device_path() {
        let uri: Uri = "dev:///dev/video3?audio=hw:3,0".parse().unwrap();
        assert_eq!(uri.scheme(), Scheme::Dev);
        assert_eq!(uri.rest(), "/dev/video3?audio=hw:3,0");
    }

    #[test]
    fn input_uri_round_trips_with_hints() {
        let json = r#"{"id":1,"uri":"rtmp://host/app","user_agent":"vlc","mute":false,"relay_video":true,"relay_audio":false,"volume":1.0}"#;
        let uri: InputUri = serde_json::from_str(json).unwrap();
        assert_eq!(uri.id, 1);
        assert_eq!(uri.user_agent, UserAgent::Vlc);
        assert!(uri.relay_video);
        assert!(!uri.relay_audio);
        assert_eq!(uri.volume, Some(1.0));

        let back: InputUri = serde_json::from_str(&serde_json::to_string(&uri).unwrap()).unwrap();
        assert_eq!(back, uri);
    }

    #[test]
    fn hint_defaults_are_off() {
        let uri: InputUri = serde_json::from_str(r#"{"id":0,"uri":"udp://239.0.0.1:1234"}"#).unwrap();
        assert!(!uri.mute && !uri.relay_video && !uri.relay_audio);
        assert_eq!(uri.user_agent, UserAgent::Gstreamer);
        assert!(!uri.is_test());
    }
}
