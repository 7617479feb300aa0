//! Media transport seam.
//!
//! The transport is a black box that captures local devices, negotiates with
//! the peer and carries audio/video. The call core only drives it through
//! [`MediaTransport`] and listens to the [`MediaEvent`] stream handed out by
//! [`MediaTransportFactory::create_transport`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::quality::{AudioProfile, QualityPreset, VideoProfile};
use crate::types::call::{CallId, CallRole, CallType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackInfo {
    pub id: TrackId,
    pub kind: TrackKind,
}

/// Tracks captured from local devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalStream {
    pub tracks: Vec<TrackInfo>,
}

impl LocalStream {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some()
    }
}

/// Stream received from the peer.
///
/// Two streams are the same stream when they carry the same track ids, no
/// matter which object delivered them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub tracks: Vec<TrackInfo>,
}

impl RemoteStream {
    pub fn identity(&self) -> BTreeSet<TrackId> {
        self.tracks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// What to capture for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: AudioProfile,
    /// `None` for voice calls.
    pub video: Option<VideoProfile>,
}

impl CaptureConstraints {
    /// Audio always, video only for video calls.
    pub fn for_call(call_type: CallType, preset: QualityPreset) -> Self {
        Self {
            audio: AudioProfile::default(),
            video: call_type.has_video().then(|| preset.profile()),
        }
    }
}

/// Why local capture could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionError {
    #[error("permission to use the camera or microphone was denied")]
    PermissionDenied,
    #[error("camera or microphone is already in use")]
    DeviceBusy,
    #[error("no camera or microphone was found")]
    DeviceMissing,
    #[error("the device cannot satisfy the requested capture settings")]
    ConstraintsUnsatisfied,
}

impl AcquisitionError {
    pub fn kind(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission",
            Self::DeviceBusy => "busy",
            Self::DeviceMissing => "missing",
            Self::ConstraintsUnsatisfied => "constraints",
        }
    }

    /// Something the user can actually do about it.
    pub fn remediation(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Allow camera and microphone access in your browser or system settings, then retry."
            }
            Self::DeviceBusy => "Close other applications using the camera or microphone, then retry.",
            Self::DeviceMissing => "Connect a camera or microphone, then retry.",
            Self::ConstraintsUnsatisfied => "Choose a lower video quality, then retry.",
        }
    }
}

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Output routing and volume of the remote audio sink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SinkState {
    pub volume: f32,
    pub muted: bool,
}

impl SinkState {
    pub fn speaker_on() -> Self {
        Self {
            volume: 1.0,
            muted: false,
        }
    }

    pub fn speaker_off() -> Self {
        Self {
            volume: 0.0,
            muted: true,
        }
    }
}

/// Events pushed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    RemoteStream(RemoteStream),
    ConnectionState(TransportState),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("no local {0} track")]
    NoTrack(TrackKind),
    #[error("remote stream attach failed: {0}")]
    AttachFailed(String),
    #[error("output device selection failed: {0}")]
    OutputSelection(String),
    #[error("transport error: {0}")]
    Other(String),
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Acquire capture devices. Audio always; video iff `constraints.video` is set.
    async fn acquire_local(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, AcquisitionError>;

    /// Start negotiating with the other side of `call_id`.
    async fn connect(&self, call_id: &CallId, role: CallRole) -> Result<(), TransportError>;

    /// Bind a remote stream to the local sink.
    async fn attach_remote(&self, stream: &RemoteStream) -> Result<(), TransportError>;

    /// Flip a local track on or off without renegotiating.
    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), TransportError>;

    /// Read back the enabled flag; `None` when no such track exists.
    fn track_enabled(&self, kind: TrackKind) -> Option<bool>;

    async fn apply_quality(&self, preset: QualityPreset) -> Result<(), TransportError>;

    /// Whether an explicit audio output device can be selected.
    fn supports_output_selection(&self) -> bool;

    async fn select_output(&self, speaker: bool) -> Result<(), TransportError>;

    fn set_sink(&self, state: SinkState);

    fn sink(&self) -> SinkState;

    /// Stop every live local track and tear the connection down.
    /// Returns the ids of the tracks that were stopped by this call.
    async fn release_all(&self) -> Vec<TrackId>;

    /// Local tracks that are still live.
    fn live_tracks(&self) -> Vec<TrackId>;
}

/// Creates a fresh transport per call session.
#[async_trait]
pub trait MediaTransportFactory: Send + Sync {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn MediaTransport>, mpsc::Receiver<MediaEvent>), anyhow::Error>;
}
