//! Cooperative timer scheduler for background jobs.
//!
//! Each registered job owns its own timer loop. Every tick is spawned as an
//! independent tracked task, so a slow run never delays the next tick or any
//! other job; overlapping runs are the job's own concern (try-locks,
//! per-tenant locks, coalescing operations).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Spread `base` by up to `fraction` of itself so a fleet of processes
/// started together does not fire in lockstep.
pub fn jittered(base: Duration, fraction: f64) -> Duration {
    if base.is_zero() || fraction <= 0.0 {
        return base;
    }
    let max_extra = base.as_millis() as f64 * fraction;
    let extra = rand::thread_rng().gen_range(0.0..=max_extra);
    base + Duration::from_millis(extra as u64)
}

#[derive(Clone)]
pub struct Periodic {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Periodic {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tracker: TaskTracker::new(),
        }
    }

    /// Run `job` every `period`, first after `initial_delay`.
    pub fn every<F, Fut>(&self, name: &'static str, period: Duration, initial_delay: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let tracker = self.tracker.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(initial_delay) => {}
            }

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(job = name, "Periodic job stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        tracker.spawn(job());
                    }
                }
            }
        });
    }

    /// Run `job` once after `delay`, unless stopped first.
    pub fn once_after<Fut>(&self, name: &'static str, delay: Duration, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(job = name, "One-shot job cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => job.await,
            }
        });
    }

    /// Stop every timer and wait for in-flight runs to finish.
    pub async fn stop(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(base, 0.1);
            assert!(d >= base && d <= Duration::from_millis(1100));
        }
        assert_eq!(jittered(Duration::ZERO, 0.5), Duration::ZERO);
    }

    #[tokio::test]
    async fn every_fires_repeatedly_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let periodic = Periodic::new(CancellationToken::new());

        let c = count.clone();
        periodic.every("count", Duration::from_millis(10), Duration::ZERO, move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        periodic.stop().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several ticks, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn slow_run_does_not_block_next_tick() {
        let started = Arc::new(AtomicUsize::new(0));
        let periodic = Periodic::new(CancellationToken::new());

        let s = started.clone();
        periodic.every("slow", Duration::from_millis(10), Duration::ZERO, move || {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(started.load(Ordering::SeqCst) >= 3);
        periodic.stop().await;
    }

    #[tokio::test]
    async fn once_after_cancelled_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let periodic = Periodic::new(CancellationToken::new());

        let f = fired.clone();
        periodic.once_after("late", Duration::from_secs(5), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        periodic.stop().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
