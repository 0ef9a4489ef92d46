//! Local stand-in for the dispatcher and its workers.
//!
//! The real dispatcher holds live connections to workers; this one runs the
//! assigned step runs in-process so a single `steward` node can execute
//! workflows end to end:
//!
//! - **Dispatcher**: consumes its dispatcher queue, runs `step-run-assigned`
//!   work through a [`StepExecutor`] and reports `step-run-started` and
//!   `step-run-finished` / `step-run-failed` back to the controller.
//!   `step-run-cancelled` stops the matching execution.
//! - **Heartbeat**: keeps the worker alive in the repository, see
//!   [`heartbeat::HeartbeatSender`].

pub mod executor;
pub mod heartbeat;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ControllerError, Result};
use crate::mq::tasks::{
    StepRunAssignedTaskPayload, StepRunCancelledTaskPayload, StepRunFailedTaskPayload,
    StepRunFinishedTaskPayload, StepRunStartedTaskPayload,
};
use crate::mq::{handler_fn, AckMode, Message, MessageQueue, QueueName, Subscription, TaskKind};
use crate::repository::Repository;
use crate::sync::lock;

pub use executor::{StepExecutor, StepOutcome};
pub use heartbeat::HeartbeatSender;

type Running = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

#[derive(Clone)]
pub struct Dispatcher {
    id: Uuid,
    repo: Arc<dyn Repository>,
    mq: Arc<dyn MessageQueue>,
    executor: StepExecutor,
    running: Running,
}

impl Dispatcher {
    pub fn new(repo: Arc<dyn Repository>, mq: Arc<dyn MessageQueue>, executor: StepExecutor) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo,
            mq,
            executor,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn actions(&self) -> Vec<String> {
        self.executor.actions()
    }

    pub async fn start(&self) -> Result<DispatcherHandle> {
        let dispatcher = self.clone();
        let handler = handler_fn(move |message: Message| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.handle(message).await }
        });
        let subscription = self
            .mq
            .subscribe(&QueueName::dispatcher(self.id), handler, AckMode::PreAck)
            .await?;
        tracing::info!(dispatcher_id = %self.id, actions = ?self.actions(), "Dispatcher started");

        Ok(DispatcherHandle {
            subscription,
            running: self.running.clone(),
        })
    }

    async fn handle(&self, message: Message) -> Result<()> {
        let tenant_id = message.tenant_id()?;
        match message.task()? {
            TaskKind::StepRunAssigned => {
                let payload: StepRunAssignedTaskPayload = message.decode()?;
                self.run_step(tenant_id, payload).await
            }
            TaskKind::StepRunCancelled => {
                let payload: StepRunCancelledTaskPayload = message.decode()?;
                if let Some(token) = lock(&self.running).get(&payload.step_run_id) {
                    tracing::info!(
                        step_run_id = %payload.step_run_id,
                        reason = %payload.cancelled_reason,
                        "Cancelling step run on worker"
                    );
                    token.cancel();
                }
                Ok(())
            }
            other => Err(ControllerError::UnknownTask(other.to_string())),
        }
    }

    async fn run_step(&self, tenant_id: Uuid, payload: StepRunAssignedTaskPayload) -> Result<()> {
        let step_run_id = payload.step_run_id;
        let sr = self.repo.get_step_run(tenant_id, step_run_id).await?;

        let token = CancellationToken::new();
        lock(&self.running).insert(step_run_id, token.clone());

        self.report(
            tenant_id,
            TaskKind::StepRunStarted,
            &StepRunStartedTaskPayload {
                step_run_id,
                started_at: Utc::now(),
            },
        )
        .await?;

        let outcome = self
            .executor
            .execute(&sr.action, sr.input.unwrap_or(Value::Null), token)
            .await;
        lock(&self.running).remove(&step_run_id);

        match outcome {
            StepOutcome::Succeeded(output) => {
                self.report(
                    tenant_id,
                    TaskKind::StepRunFinished,
                    &StepRunFinishedTaskPayload {
                        step_run_id,
                        finished_at: Utc::now(),
                        step_output_data: output,
                    },
                )
                .await
            }
            StepOutcome::Failed(error) => {
                self.report(
                    tenant_id,
                    TaskKind::StepRunFailed,
                    &StepRunFailedTaskPayload {
                        step_run_id,
                        failed_at: Utc::now(),
                        error,
                    },
                )
                .await
            }
            StepOutcome::Cancelled => {
                tracing::debug!(step_run_id = %step_run_id, "Step run stopped after cancellation");
                Ok(())
            }
        }
    }

    async fn report<P: serde::Serialize>(&self, tenant_id: Uuid, task: TaskKind, payload: &P) -> Result<()> {
        let message = Message::new(task, tenant_id, payload)?;
        self.mq.add_message(&QueueName::JobProcessing, message).await
    }
}

pub struct DispatcherHandle {
    subscription: Box<dyn Subscription>,
    running: Running,
}

impl DispatcherHandle {
    /// Cancel running step runs and stop consuming.
    pub async fn stop(self) {
        for token in lock(&self.running).values() {
            token.cancel();
        }
        self.subscription.close().await;
    }
}
