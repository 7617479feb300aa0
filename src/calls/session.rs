//! One participant's side of one call attempt.
//!
//! A [`CallSession`] owns the local media for the call, watches the shared
//! record through the [`SignalingChannel`], listens to the media transport and
//! runs the disconnect grace and duration timers. Everything that stops a call
//! goes through [`CallSession::end`], which runs its body once no matter how
//! many callers race into it.

use callcore::analysis::FrameRef;
use callcore::media::{CaptureConstraints, MediaEvent, RemoteStream, TrackKind, TransportState};
use callcore::quality::QualityPreset;
use callcore::types::call::{
    CallId, CallInit, CallRecord, CallRole, CallStatus, CallType, EndReason, UserRef,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::analysis::AnalysisBridge;
use super::duration::DurationGuard;
use super::error::CallError;
use super::events::{CallTerminated, CallTick, DurationTick, MediaFlags, MediaFlagsChanged, StateChanged};
use super::manager::CallContext;
use super::media_controller::MediaController;
use super::signaling::ChannelEvent;
use super::state::{InvalidTransition, LocalState, SessionTransition};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the initiator asks for. Kept so a failed start can be retried.
#[derive(Debug, Clone)]
pub struct StartCall {
    pub room_id: String,
    pub call_type: CallType,
    pub invitees: Vec<UserRef>,
}

#[derive(Default)]
struct SessionTasks {
    signaling_pump: Option<JoinHandle<()>>,
    media_pump: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
    duration: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_timers(&mut self) {
        for handle in [self.grace.take(), self.duration.take()].into_iter().flatten() {
            handle.abort();
        }
    }

    fn abort_all(&mut self) {
        self.abort_timers();
        for handle in [self.signaling_pump.take(), self.media_pump.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

pub struct CallSession {
    ctx: Arc<CallContext>,
    role: CallRole,
    call_type: OnceLock<CallType>,
    call_id: Mutex<Option<CallId>>,
    plan: Mutex<Option<StartCall>>,
    state: watch::Sender<LocalState>,
    media: Arc<MediaController>,
    media_events: Mutex<Option<mpsc::Receiver<MediaEvent>>>,
    channel_tx: mpsc::UnboundedSender<ChannelEvent>,
    channel_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    tasks: Mutex<SessionTasks>,
    duration: Mutex<Option<Arc<DurationGuard>>>,
    analysis: Mutex<Option<Arc<AnalysisBridge>>>,
    /// Latest record seen by this session.
    record: Mutex<Option<CallRecord>>,
    started: AtomicBool,
    ended: AtomicBool,
    /// Our participant entry is marked connected on the record.
    joined: AtomicBool,
    /// Id of the record already known to be ended, so nothing writes it twice.
    closed: Mutex<Option<CallId>>,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("role", &self.role)
            .field("call_id", &self.call_id())
            .field("state", &self.state().name())
            .finish_non_exhaustive()
    }
}

impl CallSession {
    /// Create an idle session with its own media transport.
    pub async fn new(ctx: Arc<CallContext>, role: CallRole) -> Result<Arc<Self>, CallError> {
        let (transport, media_events) = ctx
            .media
            .create_transport()
            .await
            .map_err(|e| CallError::TransportFailed(e.to_string()))?;
        let label = format!(
            "{}/{}",
            ctx.me.id,
            match role {
                CallRole::Initiator => "initiator",
                CallRole::Joiner => "joiner",
            }
        );
        let media = Arc::new(MediaController::new(
            label,
            transport,
            ctx.config.attach_retry,
            MediaFlags {
                muted: false,
                video_off: false,
                speaker_on: true,
                quality: ctx.config.default_quality,
            },
        ));
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            ctx,
            role,
            call_type: OnceLock::new(),
            call_id: Mutex::new(None),
            plan: Mutex::new(None),
            state: watch::channel(LocalState::Initializing).0,
            media,
            media_events: Mutex::new(Some(media_events)),
            channel_tx,
            channel_rx: Mutex::new(Some(channel_rx)),
            tasks: Mutex::new(SessionTasks::default()),
            duration: Mutex::new(None),
            analysis: Mutex::new(None),
            record: Mutex::new(None),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            joined: AtomicBool::new(false),
            closed: Mutex::new(None),
        }))
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn call_id(&self) -> Option<CallId> {
        lock(&self.call_id).clone()
    }

    pub fn call_type(&self) -> Option<CallType> {
        self.call_type.get().copied()
    }

    pub fn state(&self) -> LocalState {
        self.state.borrow().clone()
    }

    /// Watch local state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<LocalState> {
        self.state.subscribe()
    }

    pub fn flags(&self) -> MediaFlags {
        self.media.flags()
    }

    pub fn media(&self) -> &Arc<MediaController> {
        &self.media
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Elapsed and remaining time, once connected.
    pub fn duration(&self) -> Option<DurationTick> {
        lock(&self.duration).as_ref().map(|g| g.snapshot())
    }

    pub fn analysis(&self) -> Option<Arc<AnalysisBridge>> {
        lock(&self.analysis).clone()
    }

    /// Initiator path: create the record, acquire capture, go `connecting`.
    pub async fn start(self: &Arc<Self>, request: StartCall) -> Result<CallId, CallError> {
        if self.role != CallRole::Initiator {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: self.state().name(),
                attempted: "start as joiner".into(),
            }));
        }
        self.ensure_live()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyStarted);
        }
        let _ = self.call_type.set(request.call_type);
        *lock(&self.plan) = Some(request);
        self.run_initiator().await
    }

    /// Joiner path: check the record, acquire capture, mark ourselves joined.
    pub async fn join(self: &Arc<Self>, call_id: CallId) -> Result<(), CallError> {
        if self.role != CallRole::Joiner {
            return Err(CallError::InvalidTransition(InvalidTransition {
                current_state: self.state().name(),
                attempted: "join as initiator".into(),
            }));
        }
        self.ensure_live()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CallError::AlreadyStarted);
        }
        *lock(&self.call_id) = Some(call_id);
        self.run_joiner().await
    }

    /// Create a joiner session and join `call_id`. A session that fails to
    /// join is torn down before the error is returned.
    pub async fn join_new(ctx: Arc<CallContext>, call_id: CallId) -> Result<Arc<Self>, CallError> {
        let session = Self::new(ctx, CallRole::Joiner).await?;
        if let Err(e) = session.join(call_id).await {
            session.discard().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Tear down a session whose setup never completed. The call itself is
    /// left running; a joiner that already marked itself joined leaves it.
    pub async fn discard(&self) {
        if self.joined.swap(false, Ordering::SeqCst)
            && let Some(id) = self.call_id()
            && let Err(e) = self.ctx.signaling.leave(&id, &self.ctx.me).await
        {
            warn!(target: "Call/Session", "Could not leave {id}: {e}");
        }
        self.end(EndReason::SetupFailed).await;
    }

    /// Re-run the full setup path after a failure.
    pub async fn retry(self: &Arc<Self>) -> Result<(), CallError> {
        let state = self.state();
        if !state.is_failed() {
            return Err(CallError::NothingToRetry(state.name()));
        }
        if self.role == CallRole::Initiator
            && let Some(previous) = self.call_id()
            && !self.is_closed(&previous)
        {
            self.abandon_record(&previous, EndReason::SetupFailed).await;
        }
        lock(&self.duration).take();
        if let Some(bridge) = lock(&self.analysis).take() {
            bridge.stop();
        }
        self.media.reset().await;

        self.transition(SessionTransition::Retry)?;
        info!(target: "Call/Session", "Retrying {:?} setup for {}", self.role, self.ctx.me.id);
        match self.role {
            CallRole::Initiator => self.run_initiator().await.map(|_| ()),
            CallRole::Joiner => self.run_joiner().await,
        }
    }

    async fn run_initiator(self: &Arc<Self>) -> Result<CallId, CallError> {
        let Some(request) = lock(&self.plan).clone() else {
            return Err(CallError::NothingToRetry("initializing"));
        };

        let record = match self
            .ctx
            .signaling
            .create_record(CallInit {
                room_id: request.room_id.clone(),
                call_type: request.call_type,
                caller: self.ctx.me.clone(),
                invitees: request.invitees.clone(),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e)),
        };
        let call_id = record.id.clone();
        *lock(&self.call_id) = Some(call_id.clone());
        *lock(&self.record) = Some(record);
        self.close_if_ended(&call_id).await?;

        if let Err(e) = self.watch_record(&call_id).await {
            self.abandon_record(&call_id, EndReason::SetupFailed).await;
            return Err(self.fail(e));
        }
        self.close_if_ended(&call_id).await?;

        let constraints = CaptureConstraints::for_call(request.call_type, self.media.flags().quality);
        if let Err(e) = self.media.acquire(&constraints).await {
            self.close_if_ended(&call_id).await?;
            self.abandon_record(&call_id, EndReason::MediaUnavailable).await;
            return Err(self.fail(e));
        }
        self.sync_video_flag(request.call_type);

        self.transition(SessionTransition::CaptureAcquired)?;
        self.connect_transport(&call_id).await?;
        info!(target: "Call/Session", "Calling {} ({})", call_id, request.call_type);
        Ok(call_id)
    }

    async fn run_joiner(self: &Arc<Self>) -> Result<(), CallError> {
        let Some(call_id) = self.call_id() else {
            return Err(CallError::NothingToRetry("initializing"));
        };

        let record = match self.ctx.signaling.fetch(&call_id).await {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e)),
        };
        if record.status.is_ended() {
            return Err(self.fail(CallError::AlreadyEnded(call_id)));
        }
        let _ = self.call_type.set(record.call_type);

        if let Err(e) = self.watch_record(&call_id).await {
            return Err(self.fail(e));
        }
        self.close_if_ended(&call_id).await?;

        let constraints = CaptureConstraints::for_call(record.call_type, self.media.flags().quality);
        if let Err(e) = self.media.acquire(&constraints).await {
            return Err(self.fail(e));
        }
        self.sync_video_flag(record.call_type);

        match self.ctx.signaling.mark_joined(&call_id, &self.ctx.me).await {
            Ok(merged) => {
                self.joined.store(true, Ordering::SeqCst);
                *lock(&self.record) = Some(merged);
            }
            Err(e) => return Err(self.fail(e)),
        }

        self.transition(SessionTransition::CaptureAcquired)?;
        self.connect_transport(&call_id).await?;
        info!(target: "Call/Session", "Joined {} ({})", call_id, record.call_type);
        Ok(())
    }

    fn sync_video_flag(&self, call_type: CallType) {
        let has_video = self
            .media
            .local_stream()
            .is_some_and(|s| s.has(TrackKind::Video));
        let mut flags = self.media.flags();
        flags.video_off = !(call_type.has_video() && has_video);
        self.media.set_flags(flags);
        self.publish_flags();
    }

    /// End an initiator's record after a setup failure and stop watching it
    /// first, so the failed session survives for a retry.
    async fn abandon_record(&self, call_id: &CallId, reason: EndReason) {
        self.ctx.signaling.unsubscribe(call_id).await;
        if !self.claim_close(call_id) {
            return;
        }
        if let Err(e) = self.ctx.signaling.end_call(call_id, reason).await {
            warn!(target: "Call/Session", "Could not end abandoned call {call_id}: {e}");
            let mut closed = lock(&self.closed);
            if closed.as_ref() == Some(call_id) {
                *closed = None;
            }
        }
    }

    /// Returns `true` for the one caller allowed to end `call_id`.
    fn claim_close(&self, call_id: &CallId) -> bool {
        let mut closed = lock(&self.closed);
        if closed.as_ref() == Some(call_id) {
            return false;
        }
        *closed = Some(call_id.clone());
        true
    }

    fn is_closed(&self, call_id: &CallId) -> bool {
        lock(&self.closed).as_ref() == Some(call_id)
    }

    /// `end` may run while setup waits on the store or the devices and miss
    /// whatever setup did after that. Undo it here and stop the setup.
    async fn close_if_ended(&self, call_id: &CallId) -> Result<(), CallError> {
        if !self.is_ended() {
            return Ok(());
        }
        lock(&self.tasks).abort_all();
        self.ctx.signaling.unsubscribe(call_id).await;
        if self.role == CallRole::Initiator && self.claim_close(call_id) {
            let reason = match self.state() {
                LocalState::Ended { reason, .. } if reason.propagates() => reason,
                _ => EndReason::SetupFailed,
            };
            info!(target: "Call/Session", "Closing {call_id}, session ended during setup");
            if let Err(e) = self.ctx.signaling.end_call(call_id, reason).await {
                warn!(target: "Call/Session", "Could not end {call_id}: {e}");
            }
        }
        Err(CallError::SessionEnded)
    }

    async fn watch_record(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        self.ctx
            .signaling
            .subscribe(call_id, self.channel_tx.clone())
            .await?;

        let Some(mut rx) = lock(&self.channel_rx).take() else {
            return Ok(());
        };
        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_channel_event(event);
            }
        });
        lock(&self.tasks).signaling_pump = Some(pump);
        Ok(())
    }

    async fn connect_transport(self: &Arc<Self>, call_id: &CallId) -> Result<(), CallError> {
        if let Some(mut rx) = lock(&self.media_events).take() {
            let weak: Weak<Self> = Arc::downgrade(self);
            let pump = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let Some(session) = weak.upgrade() else {
                        break;
                    };
                    session.on_media_event(event).await;
                }
            });
            lock(&self.tasks).media_pump = Some(pump);
        }

        if let Err(e) = self.media.transport().connect(call_id, self.role).await {
            return Err(self.fail(e.into()));
        }
        Ok(())
    }

    fn on_channel_event(self: &Arc<Self>, event: ChannelEvent) {
        let current = self.call_id();
        match event {
            ChannelEvent::Updated(record) => {
                if current.as_ref() != Some(&record.id) {
                    return;
                }
                debug!(
                    target: "Call/Session",
                    "Record {} is {} ({} participant(s))",
                    record.id,
                    record.status,
                    record.participants.len()
                );
                *lock(&self.record) = Some(record);
            }
            ChannelEvent::Terminated {
                call_id,
                reason,
                deleted,
            } => {
                if current.as_ref() != Some(&call_id) {
                    return;
                }
                info!(
                    target: "Call/Session",
                    "Call {call_id} {} remotely ({reason})",
                    if deleted { "deleted" } else { "ended" }
                );
                *lock(&self.closed) = Some(call_id);
                self.end_detached(reason);
            }
        }
    }

    async fn on_media_event(self: &Arc<Self>, event: MediaEvent) {
        match event {
            MediaEvent::RemoteStream(stream) => {
                if let Err(e) = self.on_remote_media_attached(&stream).await {
                    warn!(target: "Call/Session", "Remote media not attached: {e}");
                }
            }
            MediaEvent::ConnectionState(state) => self.on_transport_state(state),
        }
    }

    /// `connecting → connected` on the first remote stream. Re-delivery of
    /// the same stream is a no-op.
    pub async fn on_remote_media_attached(
        self: &Arc<Self>,
        stream: &RemoteStream,
    ) -> Result<(), CallError> {
        if self.is_ended() {
            return Ok(());
        }
        if !self.media.attach_remote(stream).await? {
            return Ok(());
        }
        if self.state().is_connected() {
            debug!(target: "Call/Session", "Replaced remote stream while connected");
            return Ok(());
        }
        self.transition(SessionTransition::RemoteMediaAttached)?;

        let Some(call_id) = self.call_id() else {
            return Ok(());
        };
        info!(target: "Call/Session", "Call {call_id} connected");

        let signaling = self.ctx.signaling.clone();
        let id = call_id.clone();
        tokio::spawn(async move {
            if let Err(e) = signaling.update_status(&id, CallStatus::Connected).await {
                warn!(target: "Call/Session", "Could not mark {id} connected: {e}");
            }
        });

        self.start_duration_guard(&call_id);
        self.start_analysis(&call_id);
        Ok(())
    }

    /// React to the transport's connection state.
    ///
    /// A disconnect starts the grace timer whether or not media was already
    /// flowing; a reconnect inside the window cancels it.
    pub fn on_transport_state(self: &Arc<Self>, state: TransportState) {
        if self.is_ended() {
            return;
        }
        match state {
            TransportState::Connected => {
                if let Some(grace) = lock(&self.tasks).grace.take() {
                    grace.abort();
                    info!(target: "Call/Session", "Transport reconnected within grace window");
                }
            }
            TransportState::Disconnected => {
                let local = self.state();
                if !matches!(local, LocalState::Connecting { .. } | LocalState::Connected { .. }) {
                    return;
                }
                let mut tasks = lock(&self.tasks);
                if tasks.grace.as_ref().is_some_and(|h| !h.is_finished()) {
                    return;
                }
                let grace = self.ctx.config.disconnect_grace();
                warn!(target: "Call/Session", "Transport disconnected, waiting {grace:?} for recovery");
                let weak = Arc::downgrade(self);
                tasks.grace = Some(tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(session) = weak.upgrade() {
                        session.fail(CallError::TransportFailed(format!(
                            "transport did not recover within {}s",
                            grace.as_secs()
                        )));
                    }
                }));
            }
            TransportState::Failed => {
                self.fail(CallError::TransportFailed("transport failed".into()));
            }
            TransportState::New | TransportState::Connecting | TransportState::Closed => {}
        }
    }

    fn start_duration_guard(self: &Arc<Self>, call_id: &CallId) {
        let guard = Arc::new(DurationGuard::new(
            std::time::Duration::from_secs(self.ctx.config.max_duration_secs),
            self.ctx.config.tick_interval(),
        ));
        *lock(&self.duration) = Some(guard.clone());

        let events = self.ctx.events.clone();
        let tick_id = call_id.clone();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(guard.run(
            move |tick| {
                let _ = events.ticks.send(Arc::new(CallTick {
                    call_id: tick_id.clone(),
                    tick,
                }));
            },
            move || {
                if let Some(session) = weak.upgrade() {
                    session.end_detached(EndReason::DurationCap);
                }
            },
        ));
        lock(&self.tasks).duration = Some(handle);
    }

    fn start_analysis(self: &Arc<Self>, call_id: &CallId) {
        let Some(analyzer) = self.ctx.analyzer.clone() else {
            return;
        };
        let call_type = self.call_type().unwrap_or(CallType::Voice);
        if !call_type.has_video() || !self.ctx.config.analysis.enabled {
            return;
        }
        let bridge = AnalysisBridge::new(
            call_id.clone(),
            call_type,
            self.ctx.config.analysis,
            analyzer,
            Arc::downgrade(&self.media),
            self.state.subscribe(),
            self.ctx.events.clone(),
        );
        *lock(&self.analysis) = Some(bridge);
    }

    /// Forward a decoded remote video frame to the analyzer, if one runs.
    pub fn push_frame(&self, frame: FrameRef) -> bool {
        self.analysis().is_some_and(|bridge| bridge.push_frame(frame))
    }

    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        self.ensure_live()?;
        let enabled = self.media.toggle_track(TrackKind::Audio)?;
        self.publish_flags();
        Ok(!enabled)
    }

    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.ensure_live()?;
        let enabled = self.media.toggle_track(TrackKind::Video)?;
        self.publish_flags();
        Ok(!enabled)
    }

    pub async fn set_speaker(&self, on: bool) -> Result<(), CallError> {
        self.ensure_live()?;
        self.media.set_speaker(on).await?;
        self.publish_flags();
        Ok(())
    }

    pub async fn set_quality(&self, preset: QualityPreset) -> Result<(), CallError> {
        self.ensure_live()?;
        self.media.apply_quality(preset).await?;
        self.publish_flags();
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), CallError> {
        if self.is_ended() {
            Err(CallError::SessionEnded)
        } else {
            Ok(())
        }
    }

    /// End the session. Only the first call has any effect.
    ///
    /// Writes the end to the shared record unless the record is already
    /// closed or `reason` does not propagate. A hangup in a group call that
    /// keeps two other participants connected only leaves it. Local tracks
    /// are released, timers stopped and one termination event emitted.
    pub async fn end(&self, reason: EndReason) {
        if self
            .ended
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(target: "Call/Session", "end({reason}) ignored, session already ended");
            return;
        }

        let _ = self.transition(SessionTransition::End { reason });

        if let Some(guard) = lock(&self.duration).as_ref() {
            guard.stop();
        }
        if let Some(bridge) = lock(&self.analysis).as_ref() {
            bridge.stop();
        }
        lock(&self.tasks).abort_all();

        let call_id = self.call_id();
        if let Some(id) = &call_id {
            self.ctx.signaling.unsubscribe(id).await;
        }

        let released = self.media.release().await;
        debug!(target: "Call/Session", "Released {} track(s)", released.len());

        if let Some(id) = &call_id
            && reason.propagates()
            && self.claim_close(id)
        {
            let outcome = if reason == EndReason::Hangup && self.others_stay(id).await {
                self.ctx.signaling.leave(id, &self.ctx.me).await
            } else {
                self.ctx.signaling.end_call(id, reason).await
            };
            if let Err(e) = outcome {
                warn!(target: "Call/Session", "Could not propagate end of {id}: {e}");
            }
        }

        let duration_secs = match self.state() {
            LocalState::Ended { duration_secs, .. } => duration_secs,
            _ => None,
        };
        if let Some(id) = call_id {
            info!(target: "Call/Session", "Call {id} ended ({reason})");
            let _ = self.ctx.events.terminated.send(Arc::new(CallTerminated {
                call_id: id,
                reason,
                duration_secs,
            }));
        }
    }

    /// Whether at least two other participants are still connected, so a
    /// hangup only leaves the call. One-to-one calls never hit the store here.
    async fn others_stay(&self, call_id: &CallId) -> bool {
        let Some(seen) = lock(&self.record).clone() else {
            return false;
        };
        if seen.participants.len() <= 2 {
            return false;
        }
        let record = match self.ctx.signaling.fetch(call_id).await {
            Ok(record) => record,
            Err(e) => {
                debug!(target: "Call/Session", "Using cached record for {call_id}: {e}");
                seen
            }
        };
        record.connected_others(&self.ctx.me.id) >= 2
    }

    /// Run `end` on its own task. Used from pumps and timers, which `end`
    /// itself aborts.
    pub fn end_detached(self: &Arc<Self>, reason: EndReason) {
        let session = self.clone();
        tokio::spawn(async move { session.end(reason).await });
    }

    /// Move to `failed` and stop the timers. Returns the error for `?`-style use.
    fn fail(&self, error: CallError) -> CallError {
        match self.transition(SessionTransition::Fail {
            error: error.clone(),
        }) {
            Ok(_) => {
                warn!(target: "Call/Session", "Session failed: {error}");
                if let Some(guard) = lock(&self.duration).as_ref() {
                    guard.stop();
                }
                if let Some(bridge) = lock(&self.analysis).as_ref() {
                    bridge.stop();
                }
                lock(&self.tasks).abort_timers();
            }
            Err(e) => debug!(target: "Call/Session", "Not failing: {e}"),
        }
        error
    }

    fn transition(&self, transition: SessionTransition) -> Result<LocalState, CallError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.apply_transition(transition) {
            Ok(()) => true,
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome?;

        let state = self.state();
        debug!(target: "Call/Session", "{} → {}", self.ctx.me.id, state.name());
        if let Some(call_id) = self.call_id() {
            let _ = self.ctx.events.state_changed.send(Arc::new(StateChanged {
                call_id,
                state: state.clone(),
            }));
        }
        Ok(state)
    }

    fn publish_flags(&self) {
        if let Some(call_id) = self.call_id() {
            let _ = self.ctx.events.media_flags.send(Arc::new(MediaFlagsChanged {
                call_id,
                flags: self.media.flags(),
            }));
        }
    }
}
