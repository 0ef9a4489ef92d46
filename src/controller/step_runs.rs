use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::controller::input::{build_input, merge_overrides};
use crate::error::Result;
use crate::mq::tasks::{
    StepRunCancelTaskPayload, StepRunCancelledTaskPayload, StepRunFailedTaskPayload,
    StepRunFinishedTaskPayload, StepRunReplayTaskPayload, StepRunStartedTaskPayload,
    StepRunTaskPayload, WorkflowRunFinishedTaskPayload, SCHEDULING_TIMED_OUT, TIMED_OUT,
};
use crate::mq::{QueueName, TaskKind};
use crate::repository::{
    span, EventSeverity, JobRun, QueueStepRunOpts, ReplayStepRunOpts, StepRunEvent,
    StepRunEventReason, StepRunStatus, StepRunUpdate,
};

use super::JobsController;

impl JobsController {
    pub(super) async fn step_run_queued(&self, tenant_id: Uuid, payload: StepRunTaskPayload) -> Result<()> {
        let step_run_id = payload.step_run_id;
        let sr = self.repo.get_step_run(tenant_id, step_run_id).await?;

        let mut opts = QueueStepRunOpts::default();
        if sr.input.is_none() {
            let job_run = self.repo.get_job_run(tenant_id, sr.job_run_id).await?;
            let parents = self.repo.list_parent_outputs(tenant_id, step_run_id).await?;
            opts.input = Some(build_input(&job_run, parents));
        }
        if sr.schedule_timeout_at.is_none() {
            let timeout = sr
                .schedule_timeout
                .unwrap_or(self.config.default_schedule_timeout);
            opts.schedule_timeout_at = Some(Utc::now() + span(timeout));
        }

        match self.repo.queue_step_run(tenant_id, step_run_id, opts).await {
            Ok(_) => {}
            Err(e) if e.is_not_pending() => {
                tracing::debug!(step_run_id = %step_run_id, "Step run already left pending, nothing to queue");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.check_tenant_queue(tenant_id).await
    }

    pub(super) async fn step_run_started(
        &self,
        tenant_id: Uuid,
        payload: StepRunStartedTaskPayload,
    ) -> Result<()> {
        let sr = self.repo.get_step_run(tenant_id, payload.step_run_id).await?;
        if sr.status.is_final() {
            tracing::debug!(step_run_id = %sr.id, status = %sr.status, "Ignoring start of finished step run");
            return Ok(());
        }

        let update = StepRunUpdate {
            status: Some(StepRunStatus::Running),
            started_at: Some(payload.started_at),
            event: Some(StepRunEvent::info(
                StepRunEventReason::Started,
                "Step run started running on worker",
            )),
            ..Default::default()
        };
        self.repo.update_step_run(tenant_id, sr.id, update).await?;
        Ok(())
    }

    pub(super) async fn step_run_finished(
        &self,
        tenant_id: Uuid,
        payload: StepRunFinishedTaskPayload,
    ) -> Result<()> {
        let step_run_id = payload.step_run_id;
        let sr = self.repo.get_step_run(tenant_id, step_run_id).await?;

        match sr.status {
            StepRunStatus::Failed | StepRunStatus::Cancelled => {
                tracing::debug!(step_run_id = %step_run_id, status = %sr.status, "Ignoring result of finished step run");
                return Ok(());
            }
            // Redelivery: the transition is done, only the follow-ups remain
            StepRunStatus::Succeeded => {}
            _ => {
                let update = StepRunUpdate {
                    status: Some(StepRunStatus::Succeeded),
                    finished_at: Some(payload.finished_at),
                    output: Some(payload.step_output_data),
                    event: Some(StepRunEvent::info(
                        StepRunEventReason::Finished,
                        "Step run finished",
                    )),
                    ..Default::default()
                };
                let result = self.repo.update_step_run(tenant_id, step_run_id, update).await?;
                if result.workflow_run_final_state {
                    self.workflow_run_finished(tenant_id, &result.job_run).await?;
                }
            }
        }

        // The worker slot is free again
        self.check_tenant_queue(tenant_id).await?;

        let children = self
            .repo
            .list_startable_step_runs(tenant_id, sr.job_run_id, Some(step_run_id))
            .await?;
        self.queue_step_runs(tenant_id, children.into_iter().map(|c| c.id), "step-run-finished")
            .await
    }

    pub(super) async fn step_run_failed(
        &self,
        tenant_id: Uuid,
        payload: StepRunFailedTaskPayload,
    ) -> Result<()> {
        self.fail_step_run(tenant_id, payload.step_run_id, payload.error, payload.failed_at)
            .await
    }

    pub(super) async fn step_run_timed_out(
        &self,
        tenant_id: Uuid,
        payload: StepRunTaskPayload,
    ) -> Result<()> {
        self.fail_step_run(tenant_id, payload.step_run_id, TIMED_OUT.to_string(), Utc::now())
            .await
    }

    /// Shared failure path: retry while attempts remain, otherwise fail for
    /// good. A worker still holding the step run is told to stop.
    pub(super) async fn fail_step_run(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        error: String,
        failed_at: DateTime<Utc>,
    ) -> Result<()> {
        let sr = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if sr.status.is_final() {
            tracing::debug!(step_run_id = %step_run_id, status = %sr.status, "Ignoring failure of finished step run");
            return Ok(());
        }

        let retrying = sr.retry_count < sr.max_retries;
        let timed_out = error == TIMED_OUT;

        let (reason, message) = if timed_out {
            (StepRunEventReason::TimedOut, "Step run exceeded its timeout".to_string())
        } else {
            (StepRunEventReason::Failed, format!("Step run failed: {}", error))
        };
        let severity = if retrying {
            EventSeverity::Warning
        } else {
            EventSeverity::Critical
        };

        let update = StepRunUpdate {
            status: Some(if retrying {
                StepRunStatus::Pending
            } else {
                StepRunStatus::Failed
            }),
            error: Some(error.clone()),
            failed_at: Some(failed_at),
            event: Some(StepRunEvent::new(reason, severity, message)),
            ..Default::default()
        };
        let result = self.repo.update_step_run(tenant_id, step_run_id, update).await?;

        match sr.worker_id {
            Some(worker_id) => self.cancel_on_worker(tenant_id, step_run_id, worker_id, &error).await?,
            None => tracing::debug!(step_run_id = %step_run_id, "No worker attached, nothing to cancel"),
        }

        if retrying {
            tracing::info!(
                step_run_id = %step_run_id,
                retry_count = sr.retry_count,
                max_retries = sr.max_retries,
                "Step run failed, retrying"
            );
            self.send(
                &QueueName::JobProcessing,
                TaskKind::StepRunRetry,
                tenant_id,
                &StepRunTaskPayload { step_run_id },
            )
            .await
        } else {
            tracing::info!(step_run_id = %step_run_id, error = %error, "Step run failed");
            if result.workflow_run_final_state {
                self.workflow_run_finished(tenant_id, &result.job_run).await?;
            }
            Ok(())
        }
    }

    pub(super) async fn step_run_retry(&self, tenant_id: Uuid, payload: StepRunTaskPayload) -> Result<()> {
        let step_run_id = payload.step_run_id;
        let sr = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if sr.status != StepRunStatus::Pending {
            tracing::debug!(step_run_id = %step_run_id, status = %sr.status, "Step run is not waiting for a retry");
            return Ok(());
        }

        // A redelivered retry finds the failed attempt already archived
        if sr.failed_at.is_some() {
            self.repo
                .archive_step_run_result(tenant_id, step_run_id)
                .await?;

            let attempt = sr.retry_count + 1;
            let update = StepRunUpdate {
                status: Some(StepRunStatus::Pending),
                retry_count: Some(attempt),
                input: sr.input.clone(),
                clear_result: true,
                clear_schedule_timeout: true,
                event: Some(StepRunEvent::new(
                    StepRunEventReason::Retrying,
                    EventSeverity::Info,
                    format!("Retrying step run ({}/{})", attempt, sr.max_retries),
                )),
                ..Default::default()
            };
            self.repo.update_step_run(tenant_id, step_run_id, update).await?;
        }

        self.send(
            &QueueName::JobProcessing,
            TaskKind::StepRunQueued,
            tenant_id,
            &StepRunTaskPayload { step_run_id },
        )
        .await
    }

    pub(super) async fn step_run_replay(
        &self,
        tenant_id: Uuid,
        payload: StepRunReplayTaskPayload,
    ) -> Result<()> {
        let step_run_id = payload.step_run_id;
        let sr = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if !sr.status.is_final() {
            tracing::info!(step_run_id = %step_run_id, status = %sr.status, "Step run is still in progress, ignoring replay");
            return Ok(());
        }

        self.repo
            .archive_step_run_result(tenant_id, step_run_id)
            .await?;
        self.repo
            .unlink_step_run_from_worker(tenant_id, step_run_id)
            .await?;

        let (input, retry_count) = match payload.input_data {
            Some(data) => (Some(merge_overrides(sr.input.as_ref(), data)?), 0),
            None => (None, sr.retry_count + 1),
        };

        let opts = ReplayStepRunOpts {
            input,
            retry_count,
            event: StepRunEvent::info(
                StepRunEventReason::RetriedByUser,
                "This step was manually replayed by a user",
            ),
        };
        self.repo.replay_step_run(tenant_id, step_run_id, opts).await?;

        self.send(
            &QueueName::JobProcessing,
            TaskKind::StepRunQueued,
            tenant_id,
            &StepRunTaskPayload { step_run_id },
        )
        .await
    }

    pub(super) async fn step_run_cancel(
        &self,
        tenant_id: Uuid,
        payload: StepRunCancelTaskPayload,
    ) -> Result<()> {
        let step_run_id = payload.step_run_id;
        let sr = self.repo.get_step_run(tenant_id, step_run_id).await?;
        if sr.status.is_final() {
            tracing::debug!(step_run_id = %step_run_id, status = %sr.status, "Step run already finished, nothing to cancel");
            return Ok(());
        }

        let reason = payload.cancelled_reason;
        let event = if reason == SCHEDULING_TIMED_OUT {
            StepRunEvent::new(
                StepRunEventReason::SchedulingTimedOut,
                EventSeverity::Critical,
                "No worker picked up the step run before its scheduling deadline",
            )
        } else {
            StepRunEvent::new(
                StepRunEventReason::Cancelled,
                EventSeverity::Warning,
                format!("Step run was cancelled: {}", reason),
            )
        };

        let update = StepRunUpdate {
            status: Some(StepRunStatus::Cancelled),
            cancelled_at: Some(Utc::now()),
            cancelled_reason: Some(reason.clone()),
            event: Some(event),
            ..Default::default()
        };
        let result = self.repo.update_step_run(tenant_id, step_run_id, update).await?;

        if let Some(worker_id) = sr.worker_id {
            self.cancel_on_worker(tenant_id, step_run_id, worker_id, &reason)
                .await?;
        }
        if result.workflow_run_final_state {
            self.workflow_run_finished(tenant_id, &result.job_run).await?;
        }
        Ok(())
    }

    /// Ask the dispatcher holding the worker to stop the step run. A worker
    /// that no longer exists has nothing to stop.
    async fn cancel_on_worker(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        worker_id: Uuid,
        reason: &str,
    ) -> Result<()> {
        let worker = match self.repo.get_worker(tenant_id, worker_id).await {
            Ok(worker) => worker,
            Err(e) => {
                tracing::warn!(step_run_id = %step_run_id, worker_id = %worker_id, error = %e, "Cannot reach worker to cancel step run");
                return Ok(());
            }
        };

        let payload = StepRunCancelledTaskPayload {
            step_run_id,
            worker_id,
            cancelled_reason: reason.to_string(),
        };
        self.send(
            &QueueName::dispatcher(worker.dispatcher_id),
            TaskKind::StepRunCancelled,
            tenant_id,
            &payload,
        )
        .await
    }

    async fn workflow_run_finished(&self, tenant_id: Uuid, job_run: &JobRun) -> Result<()> {
        tracing::info!(
            job_run_id = %job_run.id,
            workflow_run_id = %job_run.workflow_run_id,
            status = %job_run.status,
            "Job run reached a final state"
        );
        self.send(
            &QueueName::WorkflowProcessing,
            TaskKind::WorkflowRunFinished,
            tenant_id,
            &WorkflowRunFinishedTaskPayload {
                workflow_run_id: job_run.workflow_run_id,
            },
        )
        .await
    }
}
