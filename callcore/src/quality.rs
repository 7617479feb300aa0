//! Video quality presets and audio capture settings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QualityPreset {
    #[default]
    #[serde(rename = "4k")]
    Uhd4k,
    #[serde(rename = "1080p")]
    FullHd1080p,
    #[serde(rename = "720p")]
    Hd720p,
    #[serde(rename = "480p")]
    Sd480p,
    /// Let the transport adapt the bitrate on its own.
    #[serde(rename = "auto")]
    Auto,
    /// Reduced bitrate requested when the analyzer flags the remote video.
    #[serde(rename = "mitigation")]
    Mitigation,
}

/// Concrete capture and encoding targets for a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// `None` leaves the bitrate to the transport.
    pub max_bitrate_bps: Option<u32>,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 6] = [
        Self::Uhd4k,
        Self::FullHd1080p,
        Self::Hd720p,
        Self::Sd480p,
        Self::Auto,
        Self::Mitigation,
    ];

    pub fn profile(self) -> VideoProfile {
        let (width, height, frame_rate, max_bitrate_bps) = match self {
            Self::Uhd4k => (3840, 2160, 60, Some(12_000_000)),
            Self::FullHd1080p => (1920, 1080, 60, Some(6_000_000)),
            Self::Hd720p => (1280, 720, 60, Some(3_500_000)),
            Self::Sd480p => (854, 480, 30, Some(1_500_000)),
            Self::Auto => (1920, 1080, 60, None),
            Self::Mitigation => (854, 480, 30, Some(500_000)),
        };
        VideoProfile {
            width,
            height,
            frame_rate,
            max_bitrate_bps,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uhd4k => "4k",
            Self::FullHd1080p => "1080p",
            Self::Hd720p => "720p",
            Self::Sd480p => "480p",
            Self::Auto => "auto",
            Self::Mitigation => "mitigation",
        }
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown quality preset: {0}")]
pub struct UnknownPreset(pub String);

impl FromStr for QualityPreset {
    type Err = UnknownPreset;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == lowered)
            .ok_or_else(|| UnknownPreset(s.to_string()))
    }
}

/// Audio capture settings applied to every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioProfile {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate_hz: u32,
    pub bitrate_bps: u32,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            sample_rate_hz: 48_000,
            bitrate_bps: 128_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_presets() {
        assert_eq!("4K".parse::<QualityPreset>(), Ok(QualityPreset::Uhd4k));
        assert_eq!("720p".parse::<QualityPreset>(), Ok(QualityPreset::Hd720p));
        assert!("8k".parse::<QualityPreset>().is_err());
        for preset in QualityPreset::ALL {
            assert_eq!(preset.as_str().parse::<QualityPreset>(), Ok(preset));
        }
    }

    #[test]
    fn test_mitigation_is_cheapest() {
        let mitigation = QualityPreset::Mitigation.profile().max_bitrate_bps;
        assert_eq!(mitigation, Some(500_000));
        for preset in [
            QualityPreset::Uhd4k,
            QualityPreset::FullHd1080p,
            QualityPreset::Hd720p,
            QualityPreset::Sd480p,
        ] {
            assert!(preset.profile().max_bitrate_bps > mitigation);
        }
        assert_eq!(QualityPreset::Auto.profile().max_bitrate_bps, None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&QualityPreset::FullHd1080p).unwrap();
        assert_eq!(json, "\"1080p\"");
        let back: QualityPreset = serde_json::from_str("\"4k\"").unwrap();
        assert_eq!(back, QualityPreset::Uhd4k);
    }
}
