use callcore::quality::QualityPreset;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::calls::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Analyzer sampling and mitigation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub enabled: bool,
    /// Minimum spacing between sampled frames.
    pub sample_interval_ms: u64,
    /// Consecutive flagged frames before the mitigation preset is requested.
    pub high_risk_streak: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 3_000,
            high_risk_streak: 3,
        }
    }
}

/// Timers, limits and policies shared by every call in the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Unanswered calls are auto-declined after this long.
    pub ring_timeout_secs: u64,
    /// Ringing records older than this are ignored.
    pub stale_after_secs: u64,
    /// How long a disconnected transport may take to come back.
    pub disconnect_grace_secs: u64,
    /// Hard cap on connected time.
    pub max_duration_secs: u64,
    pub tick_interval_ms: u64,
    /// Ended records are deleted after this delay.
    pub ended_retention_secs: u64,
    pub default_quality: QualityPreset,
    pub signaling_retry: RetryPolicy,
    pub attach_retry: RetryPolicy,
    pub analysis: AnalysisConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            stale_after_secs: 300,
            disconnect_grace_secs: 5,
            max_duration_secs: 1_800,
            tick_interval_ms: 1_000,
            ended_retention_secs: 5,
            default_quality: QualityPreset::Uhd4k,
            signaling_retry: RetryPolicy::default(),
            attach_retry: RetryPolicy::attach(),
            analysis: AnalysisConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("ring_timeout_secs", self.ring_timeout_secs),
            ("stale_after_secs", self.stale_after_secs),
            ("max_duration_secs", self.max_duration_secs),
            ("tick_interval_ms", self.tick_interval_ms),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.tick_interval_ms > self.max_duration_secs.saturating_mul(1_000) {
            return Err(ConfigError::Invalid(
                "tick_interval_ms must not exceed the duration cap".into(),
            ));
        }
        if self.default_quality == QualityPreset::Mitigation {
            return Err(ConfigError::Invalid(
                "the mitigation preset cannot be the default quality".into(),
            ));
        }
        if self.analysis.enabled && self.analysis.high_risk_streak == 0 {
            return Err(ConfigError::Invalid(
                "analysis.high_risk_streak must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn ended_retention(&self) -> Duration {
        Duration::from_secs(self.ended_retention_secs)
    }
}
