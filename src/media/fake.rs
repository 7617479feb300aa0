//! Scriptable media transport.
//!
//! [`LoopbackHub`] links transports that connect to the same call id, so two
//! in-process participants exchange remote streams and connection states as
//! a real peer connection would. Faults (denied capture, a track that ignores
//! a toggle, a sink that ignores a volume write, failed attaches or connects)
//! are injected through [`FakeMediaFactory`] and [`FakeMediaTransport`].

use async_trait::async_trait;
use callcore::media::{
    AcquisitionError, CaptureConstraints, LocalStream, MediaEvent, MediaTransport,
    MediaTransportFactory, RemoteStream, SinkState, TrackId, TrackInfo, TrackKind, TransportError,
    TransportState,
};
use callcore::quality::QualityPreset;
use callcore::types::call::{CallId, CallRole};
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const EVENT_CAPACITY: usize = 32;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Endpoint {
    transport_id: u64,
    tracks: Vec<TrackInfo>,
    tx: mpsc::Sender<MediaEvent>,
}

/// Connects transports that join the same call.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    calls: Arc<Mutex<HashMap<CallId, Vec<Endpoint>>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn join(&self, call_id: &CallId, endpoint: Endpoint) {
        let mut calls = lock(&self.calls);
        let peers = calls.entry(call_id.clone()).or_default();
        peers.retain(|p| p.transport_id != endpoint.transport_id);
        for peer in peers.iter() {
            let _ = peer.tx.try_send(MediaEvent::RemoteStream(RemoteStream {
                tracks: endpoint.tracks.clone(),
            }));
            let _ = peer
                .tx
                .try_send(MediaEvent::ConnectionState(TransportState::Connected));
            let _ = endpoint.tx.try_send(MediaEvent::RemoteStream(RemoteStream {
                tracks: peer.tracks.clone(),
            }));
            let _ = endpoint
                .tx
                .try_send(MediaEvent::ConnectionState(TransportState::Connected));
        }
        debug!(
            target: "Call/Media",
            "Transport {} joined loopback for {call_id} ({} peer(s))",
            endpoint.transport_id,
            peers.len()
        );
        peers.push(endpoint);
    }

    fn leave(&self, call_id: &CallId, transport_id: u64) {
        let mut calls = lock(&self.calls);
        let Some(peers) = calls.get_mut(call_id) else {
            return;
        };
        peers.retain(|p| p.transport_id != transport_id);
        // In a mesh of three or more the rest still reach each other.
        if let [last] = peers.as_slice() {
            let _ = last
                .tx
                .try_send(MediaEvent::ConnectionState(TransportState::Disconnected));
        }
        if peers.is_empty() {
            calls.remove(call_id);
        }
    }
}

#[derive(Default)]
struct FactoryControls {
    acquire_failures: Mutex<VecDeque<AcquisitionError>>,
    acquire_calls: AtomicU32,
    connect_failures: AtomicU32,
    output_selection: bool,
}

/// Hands out [`FakeMediaTransport`]s wired to a shared [`LoopbackHub`].
pub struct FakeMediaFactory {
    label: String,
    hub: LoopbackHub,
    controls: Arc<FactoryControls>,
    created: Mutex<Vec<Arc<FakeMediaTransport>>>,
    next_id: AtomicU64,
}

impl FakeMediaFactory {
    pub fn new(label: impl Into<String>, hub: LoopbackHub) -> Self {
        Self::build(label.into(), hub, true)
    }

    /// Transports without an output-device API; speaker control falls back
    /// to sink volume.
    pub fn without_output_selection(label: impl Into<String>, hub: LoopbackHub) -> Self {
        Self::build(label.into(), hub, false)
    }

    fn build(label: String, hub: LoopbackHub, output_selection: bool) -> Self {
        Self {
            label,
            hub,
            controls: Arc::new(FactoryControls {
                output_selection,
                ..Default::default()
            }),
            created: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make the next capture attempt fail with `error`. Queued failures are
    /// consumed in order.
    pub fn fail_next_acquire(&self, error: AcquisitionError) {
        lock(&self.controls.acquire_failures).push_back(error);
    }

    /// The next `n` transport connects fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.controls.connect_failures.store(n, Ordering::SeqCst);
    }

    /// Capture attempts made by every transport of this factory.
    pub fn acquire_calls(&self) -> u32 {
        self.controls.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<FakeMediaTransport>> {
        lock(&self.created).clone()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeMediaTransport>> {
        lock(&self.created).last().cloned()
    }
}

#[async_trait]
impl MediaTransportFactory for FakeMediaFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn MediaTransport>, mpsc::Receiver<MediaEvent>), anyhow::Error> {
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport = Arc::new(FakeMediaTransport {
            id,
            label: format!("{}-{id}", self.label),
            hub: self.hub.clone(),
            controls: self.controls.clone(),
            tx,
            tracks: Mutex::new(Vec::new()),
            releases: Mutex::new(HashMap::new()),
            connected_to: Mutex::new(None),
            attached: Mutex::new(Vec::new()),
            attach_failures: AtomicU32::new(0),
            stuck_toggles: AtomicU32::new(0),
            ignored_sink_writes: AtomicU32::new(0),
            sink: Mutex::new(SinkState::speaker_on()),
            selected_output: Mutex::new(None),
            quality: Mutex::new(Vec::new()),
        });
        lock(&self.created).push(transport.clone());
        Ok((transport, rx))
    }
}

struct FakeTrack {
    info: TrackInfo,
    enabled: bool,
    live: bool,
}

pub struct FakeMediaTransport {
    id: u64,
    label: String,
    hub: LoopbackHub,
    controls: Arc<FactoryControls>,
    tx: mpsc::Sender<MediaEvent>,
    tracks: Mutex<Vec<FakeTrack>>,
    releases: Mutex<HashMap<TrackId, u32>>,
    connected_to: Mutex<Option<CallId>>,
    attached: Mutex<Vec<RemoteStream>>,
    attach_failures: AtomicU32,
    stuck_toggles: AtomicU32,
    ignored_sink_writes: AtomicU32,
    sink: Mutex<SinkState>,
    selected_output: Mutex<Option<bool>>,
    quality: Mutex<Vec<QualityPreset>>,
}

impl FakeMediaTransport {
    /// Push an event to the owning session as if the transport produced it.
    pub async fn emit(&self, event: MediaEvent) {
        let _ = self.tx.send(event).await;
    }

    /// Times each track id was stopped.
    pub fn release_counts(&self) -> HashMap<TrackId, u32> {
        lock(&self.releases).clone()
    }

    /// Every remote stream that was actually attached.
    pub fn attached_streams(&self) -> Vec<RemoteStream> {
        lock(&self.attached).clone()
    }

    pub fn applied_qualities(&self) -> Vec<QualityPreset> {
        lock(&self.quality).clone()
    }

    pub fn selected_output(&self) -> Option<bool> {
        *lock(&self.selected_output)
    }

    /// The next `n` attaches fail.
    pub fn fail_attaches(&self, n: u32) {
        self.attach_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` enable/disable writes are silently ignored.
    pub fn ignore_toggles(&self, n: u32) {
        self.stuck_toggles.store(n, Ordering::SeqCst);
    }

    /// The next `n` sink writes are silently ignored.
    pub fn ignore_sink_writes(&self, n: u32) {
        self.ignored_sink_writes.store(n, Ordering::SeqCst);
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn new_track(&self, kind: TrackKind) -> FakeTrack {
        FakeTrack {
            info: TrackInfo {
                id: TrackId::new(format!("{}-{kind}", self.label)),
                kind,
            },
            enabled: true,
            live: true,
        }
    }
}

#[async_trait]
impl MediaTransport for FakeMediaTransport {
    async fn acquire_local(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, AcquisitionError> {
        self.controls.acquire_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.controls.acquire_failures).pop_front() {
            debug!(target: "Call/Media", "{}: capture refused ({})", self.label, error.kind());
            return Err(error);
        }

        let mut tracks = lock(&self.tracks);
        if tracks.iter().any(|t| t.live) {
            return Err(AcquisitionError::DeviceBusy);
        }
        tracks.clear();
        tracks.push(self.new_track(TrackKind::Audio));
        if constraints.video.is_some() {
            tracks.push(self.new_track(TrackKind::Video));
        }
        Ok(LocalStream {
            tracks: tracks.iter().map(|t| t.info.clone()).collect(),
        })
    }

    async fn connect(&self, call_id: &CallId, role: CallRole) -> Result<(), TransportError> {
        if Self::consume(&self.controls.connect_failures) {
            return Err(TransportError::Other("negotiation failed".into()));
        }
        let tracks: Vec<TrackInfo> = lock(&self.tracks)
            .iter()
            .filter(|t| t.live)
            .map(|t| t.info.clone())
            .collect();
        if tracks.is_empty() {
            return Err(TransportError::NotConnected);
        }
        *lock(&self.connected_to) = Some(call_id.clone());
        let _ = self
            .tx
            .try_send(MediaEvent::ConnectionState(TransportState::Connecting));
        trace!(target: "Call/Media", "{} connecting to {call_id} as {role:?}", self.label);
        self.hub.join(
            call_id,
            Endpoint {
                transport_id: self.id,
                tracks,
                tx: self.tx.clone(),
            },
        );
        Ok(())
    }

    async fn attach_remote(&self, stream: &RemoteStream) -> Result<(), TransportError> {
        if Self::consume(&self.attach_failures) {
            return Err(TransportError::AttachFailed("sink not ready".into()));
        }
        lock(&self.attached).push(stream.clone());
        Ok(())
    }

    fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), TransportError> {
        let mut tracks = lock(&self.tracks);
        let track = tracks
            .iter_mut()
            .find(|t| t.info.kind == kind && t.live)
            .ok_or(TransportError::NoTrack(kind))?;
        if !Self::consume(&self.stuck_toggles) {
            track.enabled = enabled;
        }
        Ok(())
    }

    fn track_enabled(&self, kind: TrackKind) -> Option<bool> {
        lock(&self.tracks)
            .iter()
            .find(|t| t.info.kind == kind && t.live)
            .map(|t| t.enabled)
    }

    async fn apply_quality(&self, preset: QualityPreset) -> Result<(), TransportError> {
        lock(&self.quality).push(preset);
        Ok(())
    }

    fn supports_output_selection(&self) -> bool {
        self.controls.output_selection
    }

    async fn select_output(&self, speaker: bool) -> Result<(), TransportError> {
        if !self.controls.output_selection {
            return Err(TransportError::OutputSelection(
                "no output device API".into(),
            ));
        }
        *lock(&self.selected_output) = Some(speaker);
        Ok(())
    }

    fn set_sink(&self, state: SinkState) {
        if Self::consume(&self.ignored_sink_writes) {
            return;
        }
        *lock(&self.sink) = state;
    }

    fn sink(&self) -> SinkState {
        *lock(&self.sink)
    }

    async fn release_all(&self) -> Vec<TrackId> {
        let stopped: Vec<TrackId> = {
            let mut tracks = lock(&self.tracks);
            tracks
                .iter_mut()
                .filter(|t| t.live)
                .map(|t| {
                    t.live = false;
                    t.info.id.clone()
                })
                .collect()
        };
        {
            let mut releases = lock(&self.releases);
            for id in &stopped {
                *releases.entry(id.clone()).or_default() += 1;
            }
        }
        if let Some(call_id) = lock(&self.connected_to).take() {
            self.hub.leave(&call_id, self.id);
        }
        let _ = self
            .tx
            .try_send(MediaEvent::ConnectionState(TransportState::Closed));
        stopped
    }

    fn live_tracks(&self) -> Vec<TrackId> {
        lock(&self.tracks)
            .iter()
            .filter(|t| t.live)
            .map(|t| t.info.id.clone())
            .collect()
    }
}
