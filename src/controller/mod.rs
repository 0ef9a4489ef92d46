//! Job/step-run lifecycle controller.
//!
//! Consumes the job processing queue and owns every state transition of job
//! runs and step runs. Each message runs behind [`supervise`], so a failing
//! or panicking handler is logged, alerted and handed back to the queue for
//! redelivery instead of taking the consumer down. Two periodic sweeps
//! recover step runs stuck on dead workers and fail step runs that ran past
//! their deadline.

mod input;
mod job_runs;
mod step_runs;
mod sweeps;

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alerting::{AlertData, Alerter};
use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::mq::{handler_fn, AckMode, Message, MessageQueue, QueueName, Subscription, TaskKind};
use crate::periodic::Periodic;
use crate::repository::Repository;
use crate::supervisor::supervise;

pub use input::{build_input, merge_overrides};
use sweeps::TenantLocks;

#[derive(Clone)]
pub struct JobsController {
    repo: Arc<dyn Repository>,
    mq: Arc<dyn MessageQueue>,
    alerter: Arc<dyn Alerter>,
    partition: watch::Receiver<String>,
    config: Arc<ControllerConfig>,
    started_at: Instant,
    reassign_locks: Arc<TenantLocks>,
    timeout_locks: Arc<TenantLocks>,
}

impl JobsController {
    pub fn new(
        repo: Arc<dyn Repository>,
        mq: Arc<dyn MessageQueue>,
        alerter: Arc<dyn Alerter>,
        partition: watch::Receiver<String>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            repo,
            mq,
            alerter,
            partition,
            config: Arc::new(config),
            started_at: Instant::now(),
            reassign_locks: Arc::new(TenantLocks::default()),
            timeout_locks: Arc::new(TenantLocks::default()),
        }
    }

    /// Subscribe to the job processing queue and schedule the sweeps.
    pub async fn start(&self, token: CancellationToken) -> Result<ControllerHandle> {
        let ctrl = self.clone();
        let handler = handler_fn(move |message: Message| {
            let ctrl = ctrl.clone();
            async move { ctrl.handle(message).await }
        });
        let subscription = self
            .mq
            .subscribe(&QueueName::JobProcessing, handler, AckMode::PostAck)
            .await?;

        let periodic = Periodic::new(token.child_token());
        {
            let ctrl = self.clone();
            let interval = self.config.reassign_interval;
            periodic.every("reassign-step-runs", interval, interval, move || {
                let ctrl = ctrl.clone();
                async move {
                    let sweep = ctrl.clone();
                    let _ = ctrl
                        .supervised("reassign-step-runs", async move { sweep.run_reassign().await })
                        .await;
                }
            });
        }
        {
            let ctrl = self.clone();
            let interval = self.config.timeout_interval;
            periodic.every("timeout-step-runs", interval, interval, move || {
                let ctrl = ctrl.clone();
                async move {
                    let sweep = ctrl.clone();
                    let _ = ctrl
                        .supervised("timeout-step-runs", async move { sweep.run_timeouts().await })
                        .await;
                }
            });
        }

        tracing::info!("Jobs controller started");
        Ok(ControllerHandle {
            subscription,
            periodic,
        })
    }

    /// Handle one message behind the panic and deadline boundary.
    pub async fn handle(&self, message: Message) -> Result<()> {
        let mut data = AlertData::new();
        data.insert("task".into(), Value::String(message.id.clone()));
        if let Some(tenant_id) = message.metadata.get("tenant_id") {
            data.insert("tenant_id".into(), tenant_id.clone());
        }
        data.insert("retries".into(), message.retries.into());

        let context = message.id.clone();
        let ctrl = self.clone();
        supervise(
            &context,
            self.config.handler_timeout,
            self.alerter.as_ref(),
            data,
            async move { ctrl.handle_task(message).await },
        )
        .await
    }

    async fn supervised<F>(&self, context: &'static str, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        supervise(
            context,
            self.config.handler_timeout,
            self.alerter.as_ref(),
            AlertData::new(),
            fut,
        )
        .await
    }

    async fn handle_task(&self, message: Message) -> Result<()> {
        let task = message.task()?;
        let tenant_id = message.tenant_id()?;
        tracing::debug!(task = %task, tenant_id = %tenant_id, retries = message.retries, "Handling task");

        match task {
            TaskKind::JobRunQueued => self.job_run_queued(tenant_id, message.decode()?).await,
            TaskKind::JobRunCancelled => self.job_run_cancelled(tenant_id, message.decode()?).await,
            TaskKind::StepRunQueued => self.step_run_queued(tenant_id, message.decode()?).await,
            TaskKind::StepRunStarted => self.step_run_started(tenant_id, message.decode()?).await,
            TaskKind::StepRunFinished => self.step_run_finished(tenant_id, message.decode()?).await,
            TaskKind::StepRunFailed => self.step_run_failed(tenant_id, message.decode()?).await,
            TaskKind::StepRunTimedOut => self.step_run_timed_out(tenant_id, message.decode()?).await,
            TaskKind::StepRunRetry => self.step_run_retry(tenant_id, message.decode()?).await,
            TaskKind::StepRunReplay => self.step_run_replay(tenant_id, message.decode()?).await,
            TaskKind::StepRunCancel => self.step_run_cancel(tenant_id, message.decode()?).await,
            other => Err(ControllerError::UnknownTask(other.to_string())),
        }
    }

    async fn send<P: Serialize>(
        &self,
        queue: &QueueName,
        task: TaskKind,
        tenant_id: Uuid,
        payload: &P,
    ) -> Result<()> {
        let message = Message::new(task, tenant_id, payload)?;
        self.mq.add_message(queue, message).await
    }

    /// Nudge the scheduling loop of the controller partition owning the tenant.
    async fn check_tenant_queue(&self, tenant_id: Uuid) -> Result<()> {
        let tenant = self.repo.get_tenant(tenant_id).await?;
        let Some(partition_id) = tenant.controller_partition_id else {
            tracing::warn!(tenant_id = %tenant_id, "Tenant has no controller partition, skipping queue check");
            return Ok(());
        };
        self.send(
            &QueueName::partition(partition_id),
            TaskKind::CheckTenantQueue,
            tenant_id,
            &(),
        )
        .await
    }
}

pub struct ControllerHandle {
    subscription: Box<dyn Subscription>,
    periodic: Periodic,
}

impl ControllerHandle {
    /// Stop the sweeps, then drain in-flight message handlers.
    pub async fn stop(self) {
        self.periodic.stop().await;
        self.subscription.close().await;
        tracing::info!("Jobs controller stopped");
    }
}
