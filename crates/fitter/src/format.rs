use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target audio codec and container for the fitted output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetFormat {
    /// AAC in an MPEG-4 audio container (.m4a)
    #[default]
    AacM4a,
    /// Opus in an Ogg container
    OpusOgg,
    /// MPEG-1 Layer III
    Mp3,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 3] = [
        TargetFormat::AacM4a,
        TargetFormat::OpusOgg,
        TargetFormat::Mp3,
    ];

    /// FFmpeg encoder name for this format
    pub fn encoder_name(&self) -> &'static str {
        match self {
            TargetFormat::AacM4a => "aac",
            TargetFormat::OpusOgg => "libopus",
            TargetFormat::Mp3 => "libmp3lame",
        }
    }

    /// FFmpeg muxer passed with `-f`
    pub fn muxer_name(&self) -> &'static str {
        match self {
            TargetFormat::AacM4a => "mp4",
            TargetFormat::OpusOgg => "ogg",
            TargetFormat::Mp3 => "mp3",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::AacM4a => "m4a",
            TargetFormat::OpusOgg => "ogg",
            TargetFormat::Mp3 => "mp3",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TargetFormat::AacM4a => "aac-m4a",
            TargetFormat::OpusOgg => "opus-ogg",
            TargetFormat::Mp3 => "mp3",
        }
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for TargetFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        TargetFormat::ALL
            .into_iter()
            .find(|f| f.label() == wanted)
            .ok_or_else(|| {
                format!(
                    "unknown target format '{}' (expected one of: aac-m4a, opus-ogg, mp3)",
                    s
                )
            })
    }
}
