//! Hard cap on connected time.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use super::events::DurationTick;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Running(DurationTick),
    /// The cap was reached on this tick. Reported once.
    Expired(DurationTick),
    /// Already expired or stopped.
    Finished,
}

/// Elapsed and remaining counters driven by one periodic tick.
#[derive(Debug)]
pub struct DurationGuard {
    cap_ms: u64,
    step_ms: u64,
    elapsed_ms: AtomicU64,
    finished: AtomicBool,
    shutdown: Notify,
}

impl DurationGuard {
    pub fn new(cap: Duration, step: Duration) -> Self {
        Self {
            cap_ms: u64::try_from(cap.as_millis()).unwrap_or(u64::MAX),
            step_ms: u64::try_from(step.as_millis()).unwrap_or(u64::MAX).max(1),
            elapsed_ms: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed_ms.load(Ordering::SeqCst) / 1_000
    }

    pub fn remaining_secs(&self) -> u64 {
        self.cap_ms
            .saturating_sub(self.elapsed_ms.load(Ordering::SeqCst))
            .div_ceil(1_000)
    }

    pub fn snapshot(&self) -> DurationTick {
        DurationTick {
            elapsed_secs: self.elapsed_secs(),
            remaining_secs: self.remaining_secs(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Advance by one step.
    pub fn tick(&self) -> TickOutcome {
        if self.is_finished() {
            return TickOutcome::Finished;
        }
        let elapsed = self.elapsed_ms.fetch_add(self.step_ms, Ordering::SeqCst) + self.step_ms;
        let tick = self.snapshot();
        if elapsed < self.cap_ms {
            return TickOutcome::Running(tick);
        }
        if self.finished.swap(true, Ordering::SeqCst) {
            TickOutcome::Finished
        } else {
            TickOutcome::Expired(tick)
        }
    }

    /// Stop counting. The run loop exits at its next wakeup.
    pub fn stop(&self) {
        self.finished.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Tick loop. This should be spawned as a background task.
    ///
    /// `on_tick` sees every step, `on_expired` runs once when the cap is hit.
    pub async fn run(
        self: Arc<Self>,
        on_tick: impl Fn(DurationTick) + Send,
        on_expired: impl FnOnce() + Send,
    ) {
        let step = Duration::from_millis(self.step_ms);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + step, step);
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
        let mut on_expired = Some(on_expired);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick() {
                        TickOutcome::Running(tick) => on_tick(tick),
                        TickOutcome::Expired(tick) => {
                            on_tick(tick);
                            info!(target: "Call/Duration", "Duration cap reached after {}s", tick.elapsed_secs);
                            if let Some(on_expired) = on_expired.take() {
                                on_expired();
                            }
                            return;
                        }
                        TickOutcome::Finished => return,
                    }
                },
                _ = self.shutdown.notified() => {
                    debug!(target: "Call/Duration", "Duration guard stopped at {}s", self.elapsed_secs());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_counts_up_and_down() {
        let guard = DurationGuard::new(Duration::from_secs(3), Duration::from_secs(1));
        assert_eq!(guard.remaining_secs(), 3);
        assert!(matches!(
            guard.tick(),
            TickOutcome::Running(DurationTick {
                elapsed_secs: 1,
                remaining_secs: 2
            })
        ));
        assert!(matches!(guard.tick(), TickOutcome::Running(_)));
        assert!(matches!(
            guard.tick(),
            TickOutcome::Expired(DurationTick {
                elapsed_secs: 3,
                remaining_secs: 0
            })
        ));
        // expiry fires exactly once
        assert_eq!(guard.tick(), TickOutcome::Finished);
        assert_eq!(guard.tick(), TickOutcome::Finished);
    }

    #[test]
    fn test_oversized_cap_saturates() {
        let guard = DurationGuard::new(Duration::from_secs(u64::MAX), Duration::from_secs(1));
        assert_eq!(guard.remaining_secs(), u64::MAX.div_ceil(1_000));
        assert!(matches!(guard.tick(), TickOutcome::Running(_)));
    }

    #[test]
    fn test_stop_prevents_expiry() {
        let guard = DurationGuard::new(Duration::from_secs(1), Duration::from_secs(1));
        guard.stop();
        assert_eq!(guard.tick(), TickOutcome::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_expires_once() {
        let guard = Arc::new(DurationGuard::new(
            Duration::from_secs(5),
            Duration::from_secs(1),
        ));
        let ticks = Arc::new(Mutex::new(Vec::new()));
        let expired = Arc::new(AtomicU64::new(0));

        let t = ticks.clone();
        let e = expired.clone();
        let handle = tokio::spawn(guard.clone().run(
            move |tick| t.lock().unwrap().push(tick.remaining_secs),
            move || {
                e.fetch_add(1, Ordering::SeqCst);
            },
        ));
        handle.await.unwrap();

        assert_eq!(*ticks.lock().unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert!(guard.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_stops_on_shutdown() {
        let guard = Arc::new(DurationGuard::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let handle = tokio::spawn(guard.clone().run(|_| {}, || panic!("must not expire")));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        guard.stop();
        handle.await.unwrap();
        assert_eq!(guard.elapsed_secs(), 2);
    }
}
