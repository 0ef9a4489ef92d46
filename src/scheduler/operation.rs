//! Per-tenant single-flight scheduling loop.
//!
//! An [`Operation`] runs at most one scheduling pass for its tenant at a
//! time. Triggers that arrive while a pass is running are coalesced into a
//! single `should_continue` flag, which the loop checks after each pass, so
//! no trigger is lost and pressure never turns into a pile of queued passes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::alerting::{AlertData, Alerter};
use crate::error::Result;
use crate::supervisor::supervise;
use crate::sync::lock;

/// One scheduling pass for a tenant. Resolves to `true` when more work may
/// be ready right away.
pub type ScheduleFn = Arc<dyn Fn(Uuid) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

pub fn schedule_fn<F, Fut>(f: F) -> ScheduleFn
where
    F: Fn(Uuid) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(move |tenant_id| f(tenant_id).boxed())
}

#[derive(Debug, Default)]
struct OperationState {
    running: bool,
    should_continue: bool,
    last_run: Option<DateTime<Utc>>,
}

pub struct Operation {
    tenant_id: Uuid,
    state: Mutex<OperationState>,
    schedule: ScheduleFn,
    alerter: Arc<dyn Alerter>,
    deadline: Duration,
}

impl Operation {
    pub fn new(
        tenant_id: Uuid,
        schedule: ScheduleFn,
        alerter: Arc<dyn Alerter>,
        deadline: Duration,
    ) -> Self {
        Self {
            tenant_id,
            state: Mutex::new(OperationState::default()),
            schedule,
            alerter,
            deadline,
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).last_run
    }

    /// Ask for one more pass after the current one.
    pub fn set_continue(&self) {
        lock(&self.state).should_continue = true;
    }

    /// Start a pass on `tracker` unless one is already running, in which
    /// case the trigger is folded into the running loop. Returns whether a
    /// new loop was started.
    pub fn run(self: &Arc<Self>, tracker: &TaskTracker) -> bool {
        {
            let mut state = lock(&self.state);
            if state.running {
                state.should_continue = true;
                return false;
            }
            state.running = true;
        }

        let op = self.clone();
        tracker.spawn(async move { op.drive().await });
        true
    }

    async fn drive(self: Arc<Self>) {
        let mut passes = 0u32;
        loop {
            {
                let mut state = lock(&self.state);
                state.should_continue = false;
                state.last_run = Some(Utc::now());
            }
            passes += 1;

            let mut data = AlertData::new();
            data.insert("tenant_id".into(), self.tenant_id.to_string().into());
            let more = supervise(
                "schedule-step-runs",
                self.deadline,
                self.alerter.as_ref(),
                data,
                (self.schedule)(self.tenant_id),
            )
            .await
            .unwrap_or(false);

            let idle = {
                let mut state = lock(&self.state);
                if !more && !state.should_continue {
                    state.running = false;
                }
                !state.running
            };
            if idle {
                tracing::debug!(tenant_id = %self.tenant_id, passes, "Scheduling loop idle");
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationStatus {
    pub tenant_id: Uuid,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
}

/// Lazily populated tenant -> [`Operation`] map.
pub struct OperationPool {
    operations: Mutex<HashMap<Uuid, Arc<Operation>>>,
    schedule: ScheduleFn,
    alerter: Arc<dyn Alerter>,
    deadline: Duration,
    tracker: TaskTracker,
}

impl OperationPool {
    pub fn new(schedule: ScheduleFn, alerter: Arc<dyn Alerter>, deadline: Duration) -> Self {
        Self {
            operations: Mutex::new(HashMap::new()),
            schedule,
            alerter,
            deadline,
            tracker: TaskTracker::new(),
        }
    }

    pub fn get(&self, tenant_id: Uuid) -> Option<Arc<Operation>> {
        lock(&self.operations).get(&tenant_id).cloned()
    }

    pub fn get_or_create(&self, tenant_id: Uuid) -> Arc<Operation> {
        lock(&self.operations)
            .entry(tenant_id)
            .or_insert_with(|| {
                Arc::new(Operation::new(
                    tenant_id,
                    self.schedule.clone(),
                    self.alerter.clone(),
                    self.deadline,
                ))
            })
            .clone()
    }

    /// Run (or coalesce into) the tenant's loop, creating the operation if needed.
    pub fn run(&self, tenant_id: Uuid) -> bool {
        self.get_or_create(tenant_id).run(&self.tracker)
    }

    /// Force another pass for a tenant that already has an operation.
    /// Returns false when the tenant has none yet.
    pub fn trigger(&self, tenant_id: Uuid) -> bool {
        let Some(op) = self.get(tenant_id) else {
            return false;
        };
        op.set_continue();
        op.run(&self.tracker);
        true
    }

    pub fn snapshot(&self) -> Vec<OperationStatus> {
        let mut out: Vec<OperationStatus> = lock(&self.operations)
            .values()
            .map(|op| OperationStatus {
                tenant_id: op.tenant_id,
                running: op.is_running(),
                last_run: op.last_run(),
            })
            .collect();
        out.sort_by_key(|s| s.tenant_id);
        out
    }

    /// Wait for running loops to finish; no new ones start afterwards.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::alerting::MemoryAlerter;

    struct PassCounter {
        passes: AtomicUsize,
        active: AtomicUsize,
        overlapped: AtomicBool,
    }

    fn counting_schedule(counter: Arc<PassCounter>, pass_time: Duration) -> ScheduleFn {
        schedule_fn(move |_tenant| {
            let counter = counter.clone();
            async move {
                if counter.active.fetch_add(1, Ordering::SeqCst) > 0 {
                    counter.overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(pass_time).await;
                counter.passes.fetch_add(1, Ordering::SeqCst);
                counter.active.fetch_sub(1, Ordering::SeqCst);
                Ok(false)
            }
        })
    }

    fn counter() -> Arc<PassCounter> {
        Arc::new(PassCounter {
            passes: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rapid_triggers_coalesce_into_one_extra_pass() {
        let counter = counter();
        let pool = OperationPool::new(
            counting_schedule(counter.clone(), Duration::from_millis(100)),
            Arc::new(MemoryAlerter::new()),
            Duration::from_secs(5),
        );
        let tenant = Uuid::new_v4();

        assert!(pool.run(tenant));
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..50 {
            assert!(!pool.run(tenant));
        }

        pool.close().await;
        assert_eq!(counter.passes.load(Ordering::SeqCst), 2);
        assert!(!counter.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_never_overlap() {
        let counter = counter();
        let pool = Arc::new(OperationPool::new(
            counting_schedule(counter.clone(), Duration::from_millis(5)),
            Arc::new(MemoryAlerter::new()),
            Duration::from_secs(5),
        ));
        let tenant = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    pool.run(tenant);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        pool.close().await;
        assert!(!counter.overlapped.load(Ordering::SeqCst));
        assert!(counter.passes.load(Ordering::SeqCst) >= 1);
        assert!(!pool.get(tenant).unwrap().is_running());
    }

    #[tokio::test]
    async fn more_work_keeps_the_loop_going() {
        let remaining = Arc::new(AtomicUsize::new(3));
        let r = remaining.clone();
        let schedule = schedule_fn(move |_tenant| {
            let r = r.clone();
            async move { Ok(r.fetch_sub(1, Ordering::SeqCst) > 1) }
        });
        let pool = OperationPool::new(schedule, Arc::new(MemoryAlerter::new()), Duration::from_secs(5));

        pool.run(Uuid::new_v4());
        pool.close().await;
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trigger_only_reaches_known_tenants() {
        let counter = counter();
        let pool = OperationPool::new(
            counting_schedule(counter.clone(), Duration::from_millis(1)),
            Arc::new(MemoryAlerter::new()),
            Duration::from_secs(5),
        );
        let tenant = Uuid::new_v4();

        assert!(!pool.trigger(tenant));
        pool.get_or_create(tenant);
        assert!(pool.trigger(tenant));
        pool.close().await;
        assert_eq!(counter.passes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_pass_is_alerted_and_loop_goes_idle() {
        let alerter = Arc::new(MemoryAlerter::new());
        let schedule = schedule_fn(|_tenant| async {
            Err(crate::error::ControllerError::Internal("db down".into()))
        });
        let pool = OperationPool::new(schedule, alerter.clone(), Duration::from_secs(5));
        let tenant = Uuid::new_v4();

        pool.run(tenant);
        pool.close().await;
        assert!(!pool.get(tenant).unwrap().is_running());
        assert_eq!(alerter.alerts().len(), 1);
    }
}
