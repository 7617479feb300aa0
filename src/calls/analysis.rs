//! Forwards remote video frames to the authenticity analyzer and relays its
//! verdicts.
//!
//! The bridge never affects the call: frames outside a connected video call
//! are ignored, analyzer errors are logged and dropped, and the only action it
//! takes on its own is a one-time bitrate downgrade after a sustained run of
//! flagged frames.

use callcore::analysis::{FrameAnalyzer, FrameRef, Verdict};
use callcore::quality::QualityPreset;
use callcore::types::call::{CallId, CallType};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use super::error::CallError;
use super::events::{EventBus, VerdictReceived};
use super::media_controller::MediaController;
use super::state::LocalState;
use crate::config::AnalysisConfig;

type VerdictCallback = Arc<dyn Fn(&Verdict) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct AnalysisBridge {
    call_id: CallId,
    call_type: CallType,
    config: AnalysisConfig,
    analyzer: Arc<dyn FrameAnalyzer>,
    media: Weak<MediaController>,
    state: watch::Receiver<LocalState>,
    events: Arc<EventBus>,
    verdicts: broadcast::Sender<Verdict>,
    callbacks: Mutex<Vec<VerdictCallback>>,
    last_sample: Mutex<Option<Instant>>,
    in_flight: AtomicBool,
    flagged_streak: AtomicU32,
    mitigated: AtomicBool,
    stopped: AtomicBool,
}

impl AnalysisBridge {
    pub fn new(
        call_id: CallId,
        call_type: CallType,
        config: AnalysisConfig,
        analyzer: Arc<dyn FrameAnalyzer>,
        media: Weak<MediaController>,
        state: watch::Receiver<LocalState>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            call_id,
            call_type,
            config,
            analyzer,
            media,
            state,
            events,
            verdicts: broadcast::channel(16).0,
            callbacks: Mutex::new(Vec::new()),
            last_sample: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            flagged_streak: AtomicU32::new(0),
            mitigated: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Register a verdict observer.
    pub fn on_verdict(&self, callback: impl Fn(&Verdict) + Send + Sync + 'static) {
        lock(&self.callbacks).push(Arc::new(callback));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Verdict> {
        self.verdicts.subscribe()
    }

    pub fn is_mitigated(&self) -> bool {
        self.mitigated.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(target: "Call/Analysis", "Analysis stopped for {}", self.call_id);
        }
    }

    fn accepting(&self) -> bool {
        self.config.enabled
            && self.call_type.has_video()
            && !self.stopped.load(Ordering::SeqCst)
            && self.state.borrow().is_connected()
    }

    /// Offer a decoded frame. Returns whether it was sampled for analysis.
    pub fn push_frame(self: &Arc<Self>, frame: FrameRef) -> bool {
        if !self.accepting() {
            return false;
        }
        {
            let mut last = lock(&self.last_sample);
            let now = Instant::now();
            let spacing = Duration::from_millis(self.config.sample_interval_ms);
            if last.is_some_and(|at| now.duration_since(at) < spacing) {
                return false;
            }
            if self.in_flight.swap(true, Ordering::SeqCst) {
                return false;
            }
            *last = Some(now);
        }

        let bridge = self.clone();
        tokio::spawn(async move {
            let result = bridge.analyzer.analyze(&frame).await;
            bridge.in_flight.store(false, Ordering::SeqCst);
            match result {
                Ok(analysis) => bridge.publish(Verdict::classify(analysis)).await,
                Err(e) => {
                    let e = CallError::from(e);
                    warn!(target: "Call/Analysis", "Dropping frame {} of {}: {e}", frame.sequence, bridge.call_id);
                }
            }
        });
        true
    }

    async fn publish(&self, verdict: Verdict) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.verdicts.send(verdict);
        let _ = self.events.verdicts.send(Arc::new(VerdictReceived {
            call_id: self.call_id.clone(),
            verdict,
        }));
        let callbacks: Vec<VerdictCallback> = lock(&self.callbacks).clone();
        for callback in callbacks {
            callback(&verdict);
        }

        let streak = if verdict.ai_detected {
            self.flagged_streak.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.flagged_streak.store(0, Ordering::SeqCst);
            0
        };
        if streak >= self.config.high_risk_streak && !self.mitigated.swap(true, Ordering::SeqCst) {
            self.mitigate().await;
        }
    }

    async fn mitigate(&self) {
        let Some(media) = self.media.upgrade() else {
            return;
        };
        info!(
            target: "Call/Analysis",
            "Sustained high risk on {}, requesting {} quality",
            self.call_id,
            QualityPreset::Mitigation
        );
        if let Err(e) = media.apply_quality(QualityPreset::Mitigation).await {
            warn!(target: "Call/Analysis", "Mitigation failed for {}: {e}", self.call_id);
        }
    }
}
