//! Local media lifecycle for one session: capture, remote attach, toggles,
//! output routing and release.

use callcore::media::{
    CaptureConstraints, LocalStream, MediaTransport, RemoteStream, SinkState, TrackId, TrackKind,
    TransportError,
};
use callcore::quality::QualityPreset;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::error::CallError;
use super::events::MediaFlags;
use super::retry::RetryPolicy;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MediaController {
    /// Owner used in log lines, e.g. `alice/initiator`.
    label: String,
    transport: Arc<dyn MediaTransport>,
    attach_retry: RetryPolicy,
    local: Mutex<Option<LocalStream>>,
    attached: Mutex<Option<BTreeSet<TrackId>>>,
    flags: Mutex<MediaFlags>,
    released: AtomicBool,
}

impl MediaController {
    pub fn new(
        label: String,
        transport: Arc<dyn MediaTransport>,
        attach_retry: RetryPolicy,
        flags: MediaFlags,
    ) -> Self {
        Self {
            label,
            transport,
            attach_retry,
            local: Mutex::new(None),
            attached: Mutex::new(None),
            flags: Mutex::new(flags),
            released: AtomicBool::new(false),
        }
    }

    pub fn transport(&self) -> &Arc<dyn MediaTransport> {
        &self.transport
    }

    pub fn flags(&self) -> MediaFlags {
        *lock(&self.flags)
    }

    /// Overwrite the confirmed flags, e.g. after capture reveals no camera.
    pub fn set_flags(&self, flags: MediaFlags) {
        *lock(&self.flags) = flags;
    }

    pub fn local_stream(&self) -> Option<LocalStream> {
        lock(&self.local).clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Acquire capture devices.
    ///
    /// If the session is released while the devices are being opened, the
    /// fresh tracks are stopped again and the call is reported as ended.
    pub async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalStream, CallError> {
        if self.is_released() {
            return Err(CallError::SessionEnded);
        }
        let stream = self.transport.acquire_local(constraints).await?;
        if self.is_released() {
            let stopped = self.transport.release_all().await;
            debug!(
                target: "Call/Media",
                "Released {} track(s) acquired after {} ended",
                stopped.len(),
                self.label
            );
            return Err(CallError::SessionEnded);
        }
        info!(
            target: "Call/Media",
            "Acquired {} local track(s) for {}",
            stream.tracks.len(),
            self.label
        );
        *lock(&self.local) = Some(stream.clone());
        Ok(stream)
    }

    /// Attach a remote stream. Returns `false` when a stream with the same
    /// track ids is already attached.
    pub async fn attach_remote(&self, stream: &RemoteStream) -> Result<bool, CallError> {
        let identity = stream.identity();
        {
            let mut attached = lock(&self.attached);
            if attached.as_ref() == Some(&identity) {
                debug!(target: "Call/Media", "Remote stream for {} already attached", self.label);
                return Ok(false);
            }
            *attached = Some(identity);
        }

        let result = self
            .attach_retry
            .run(
                "attach remote stream",
                |e: &TransportError| matches!(e, TransportError::AttachFailed(_)),
                || self.transport.attach_remote(stream),
            )
            .await;

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                *lock(&self.attached) = None;
                Err(e.into_inner().into())
            }
        }
    }

    pub fn has_remote(&self) -> bool {
        lock(&self.attached).is_some()
    }

    /// Flip the enabled flag of the local `kind` track and confirm it by
    /// reading it back, writing once more if the track did not follow.
    /// Returns the new enabled state.
    pub fn toggle_track(&self, kind: TrackKind) -> Result<bool, CallError> {
        let current = self
            .transport
            .track_enabled(kind)
            .ok_or(CallError::TrackUnavailable(kind))?;
        let target = !current;

        self.transport.set_track_enabled(kind, target)?;
        if self.transport.track_enabled(kind) != Some(target) {
            warn!(
                target: "Call/Media",
                "{kind} track for {} did not reflect toggle, retrying",
                self.label
            );
            self.transport.set_track_enabled(kind, target)?;
            if self.transport.track_enabled(kind) != Some(target) {
                return Err(CallError::TransportFailed(format!(
                    "{kind} track did not switch to enabled={target}"
                )));
            }
        }

        let mut flags = lock(&self.flags);
        match kind {
            TrackKind::Audio => flags.muted = !target,
            TrackKind::Video => flags.video_off = !target,
        }
        Ok(target)
    }

    /// Route remote audio to the speaker or silence it.
    ///
    /// Selects an output device when the transport can; the sink volume and
    /// mute flag are always written and read back.
    pub async fn set_speaker(&self, on: bool) -> Result<(), CallError> {
        if self.transport.supports_output_selection()
            && let Err(e) = self.transport.select_output(on).await
        {
            warn!(target: "Call/Media", "Output selection failed for {}: {e}", self.label);
        }

        let desired = if on {
            SinkState::speaker_on()
        } else {
            SinkState::speaker_off()
        };
        self.transport.set_sink(desired);
        if self.transport.sink() != desired {
            warn!(
                target: "Call/Media",
                "Sink for {} did not take speaker={on}, correcting",
                self.label
            );
            self.transport.set_sink(desired);
        }
        if self.transport.sink() != desired {
            warn!(
                target: "Call/Media",
                "Sink for {} still mismatched after correction",
                self.label
            );
        }

        lock(&self.flags).speaker_on = on;
        Ok(())
    }

    pub async fn apply_quality(&self, preset: QualityPreset) -> Result<(), CallError> {
        self.transport.apply_quality(preset).await?;
        lock(&self.flags).quality = preset;
        info!(target: "Call/Media", "Applied {preset} quality to {}", self.label);
        Ok(())
    }

    /// Stop capture and forget the remote stream so setup can run again.
    /// Unlike [`release`](Self::release) the controller stays usable.
    pub async fn reset(&self) -> Vec<TrackId> {
        let stopped = self.transport.release_all().await;
        *lock(&self.local) = None;
        *lock(&self.attached) = None;
        if !stopped.is_empty() {
            debug!(
                target: "Call/Media",
                "Stopped {} track(s) for {} before retrying",
                stopped.len(),
                self.label
            );
        }
        stopped
    }

    /// Stop every local track. Only the first call does anything.
    pub async fn release(&self) -> Vec<TrackId> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        let mut stopped = self.transport.release_all().await;

        let lingering = self.transport.live_tracks();
        if !lingering.is_empty() {
            warn!(
                target: "Call/Media",
                "{} track(s) still live after release for {}, releasing again",
                lingering.len(),
                self.label
            );
            stopped.extend(self.transport.release_all().await);
        }
        *lock(&self.local) = None;
        debug!(
            target: "Call/Media",
            "Released {} track(s) for {}",
            stopped.len(),
            self.label
        );
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::{FakeMediaFactory, LoopbackHub};
    use callcore::media::{MediaTransportFactory, TrackInfo};
    use callcore::types::call::CallType;

    async fn controller(factory: &FakeMediaFactory, call_type: CallType) -> MediaController {
        let (transport, _rx) = factory.create_transport().await.unwrap();
        let controller = MediaController::new(
            "media-test".into(),
            transport,
            RetryPolicy::attach(),
            MediaFlags {
                muted: false,
                video_off: !call_type.has_video(),
                speaker_on: true,
                quality: QualityPreset::Hd720p,
            },
        );
        controller
            .acquire(&CaptureConstraints::for_call(call_type, QualityPreset::Hd720p))
            .await
            .unwrap();
        controller
    }

    fn remote(ids: &[&str]) -> RemoteStream {
        RemoteStream {
            tracks: ids
                .iter()
                .map(|id| TrackInfo {
                    id: TrackId::new(*id),
                    kind: TrackKind::Audio,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_mute_twice_restores() {
        let factory = FakeMediaFactory::new("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Voice).await;

        assert!(!c.toggle_track(TrackKind::Audio).unwrap());
        assert!(c.flags().muted);
        assert_eq!(c.transport().track_enabled(TrackKind::Audio), Some(false));

        assert!(c.toggle_track(TrackKind::Audio).unwrap());
        assert!(!c.flags().muted);
        assert_eq!(c.transport().track_enabled(TrackKind::Audio), Some(true));
    }

    #[tokio::test]
    async fn test_toggle_retries_once_on_mismatch() {
        let factory = FakeMediaFactory::new("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Video).await;
        let fake = factory.last_transport().unwrap();

        fake.ignore_toggles(1);
        assert!(!c.toggle_track(TrackKind::Video).unwrap());
        assert!(c.flags().video_off);

        fake.ignore_toggles(2);
        assert!(c.toggle_track(TrackKind::Video).is_err());
    }

    #[tokio::test]
    async fn test_voice_call_has_no_video_toggle() {
        let factory = FakeMediaFactory::new("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Voice).await;
        assert_eq!(
            c.toggle_track(TrackKind::Video),
            Err(CallError::TrackUnavailable(TrackKind::Video))
        );
    }

    #[tokio::test]
    async fn test_attach_dedupes_by_track_ids() {
        let factory = FakeMediaFactory::new("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Voice).await;

        assert!(c.attach_remote(&remote(&["r1", "r2"])).await.unwrap());
        assert!(!c.attach_remote(&remote(&["r2", "r1"])).await.unwrap());
        assert!(c.attach_remote(&remote(&["r3"])).await.unwrap());
        assert_eq!(factory.last_transport().unwrap().attached_streams().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_retries_then_gives_up() {
        let factory = FakeMediaFactory::new("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Voice).await;
        let fake = factory.last_transport().unwrap();

        fake.fail_attaches(2);
        assert!(c.attach_remote(&remote(&["r1"])).await.unwrap());

        fake.fail_attaches(10);
        assert!(c.attach_remote(&remote(&["r9"])).await.is_err());
        assert!(!c.has_remote());
    }

    #[tokio::test]
    async fn test_speaker_fallback_corrects_sink() {
        let factory = FakeMediaFactory::without_output_selection("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Voice).await;
        let fake = factory.last_transport().unwrap();

        fake.ignore_sink_writes(1);
        c.set_speaker(false).await.unwrap();
        assert_eq!(c.transport().sink(), SinkState::speaker_off());
        assert!(!c.flags().speaker_on);
        assert_eq!(fake.selected_output(), None);
    }

    #[tokio::test]
    async fn test_speaker_selects_output_when_supported() {
        let factory = FakeMediaFactory::new("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Voice).await;
        c.set_speaker(true).await.unwrap();
        assert_eq!(factory.last_transport().unwrap().selected_output(), Some(true));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let factory = FakeMediaFactory::new("m", LoopbackHub::new());
        let c = controller(&factory, CallType::Video).await;

        assert_eq!(c.release().await.len(), 2);
        assert!(c.release().await.is_empty());
        assert!(c.transport().live_tracks().is_empty());
        let counts = factory.last_transport().unwrap().release_counts();
        assert_eq!(counts.len(), 2);
        assert!(counts.values().all(|n| *n == 1));

        // nothing can be acquired after release
        assert!(
            c.acquire(&CaptureConstraints::for_call(CallType::Voice, QualityPreset::Auto))
                .await
                .is_err()
        );
    }
}
