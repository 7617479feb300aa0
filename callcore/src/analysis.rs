//! Authenticity analysis of remote video frames.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::call::CallId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Liveness indicators. An indicator the analyzer did not report is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Liveness {
    pub blink_detected: Option<bool>,
    pub micro_movements: Option<bool>,
    pub natural_lighting: Option<bool>,
}

impl Liveness {
    /// True if at least one indicator passed. Unreported indicators count as passing.
    pub fn any(&self) -> bool {
        [
            self.blink_detected,
            self.micro_movements,
            self.natural_lighting,
        ]
        .into_iter()
        .any(|indicator| indicator.unwrap_or(true))
    }
}

/// Raw analyzer output for one sampled frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameAnalysis {
    /// Authenticity score in `0.0..=1.0`.
    pub score: f32,
    pub risk: RiskLevel,
    #[serde(default)]
    pub liveness: Liveness,
}

/// Handle to one decoded remote video frame.
#[derive(Debug, Clone)]
pub struct FrameRef {
    pub call_id: CallId,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Classified result relayed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub analysis: FrameAnalysis,
    pub is_real: bool,
    pub ai_detected: bool,
}

impl Verdict {
    pub fn classify(analysis: FrameAnalysis) -> Self {
        let live = analysis.liveness.any();
        let score = analysis.score;

        let is_real = analysis.risk == RiskLevel::Low && score > 0.75 && live;
        let ai_detected = analysis.risk == RiskLevel::High
            || (analysis.risk == RiskLevel::Medium && score < 0.6)
            || score < 0.5
            || !live;

        Self {
            analysis,
            is_real,
            ai_detected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyzerError {
    #[error("analyzer unavailable: {0}")]
    Unavailable(String),
    #[error("frame rejected: {0}")]
    Rejected(String),
    #[error("analysis timed out")]
    Timeout,
}

/// External authenticity/liveness analyzer.
#[async_trait]
pub trait FrameAnalyzer: Send + Sync {
    async fn analyze(&self, frame: &FrameRef) -> Result<FrameAnalysis, AnalyzerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(score: f32, risk: RiskLevel, liveness: Liveness) -> FrameAnalysis {
        FrameAnalysis {
            score,
            risk,
            liveness,
        }
    }

    #[test]
    fn test_clean_frame_is_real() {
        let v = Verdict::classify(analysis(0.9, RiskLevel::Low, Liveness::default()));
        assert!(v.is_real);
        assert!(!v.ai_detected);
    }

    #[test]
    fn test_high_risk_is_flagged() {
        let v = Verdict::classify(analysis(0.95, RiskLevel::High, Liveness::default()));
        assert!(v.ai_detected);
        assert!(!v.is_real);
    }

    #[test]
    fn test_medium_risk_threshold() {
        assert!(Verdict::classify(analysis(0.55, RiskLevel::Medium, Liveness::default())).ai_detected);
        let borderline = Verdict::classify(analysis(0.7, RiskLevel::Medium, Liveness::default()));
        assert!(!borderline.ai_detected);
        assert!(!borderline.is_real);
    }

    #[test]
    fn test_low_score_is_flagged_regardless_of_risk() {
        assert!(Verdict::classify(analysis(0.4, RiskLevel::Low, Liveness::default())).ai_detected);
    }

    #[test]
    fn test_failed_liveness() {
        let dead = Liveness {
            blink_detected: Some(false),
            micro_movements: Some(false),
            natural_lighting: Some(false),
        };
        let v = Verdict::classify(analysis(0.9, RiskLevel::Low, dead));
        assert!(v.ai_detected);
        assert!(!v.is_real);

        let partial = Liveness {
            blink_detected: Some(false),
            micro_movements: None,
            natural_lighting: Some(false),
        };
        assert!(partial.any());
    }
}
