use uuid::Uuid;

use crate::error::Result;
use crate::mq::tasks::{
    JobRunCancelledTaskPayload, JobRunTaskPayload, StepRunCancelTaskPayload, StepRunTaskPayload,
    JOB_RUN_CANCELLED,
};
use crate::mq::{QueueName, TaskKind};
use crate::task_group::TaskGroup;

use super::JobsController;

impl JobsController {
    pub(super) async fn job_run_queued(&self, tenant_id: Uuid, payload: JobRunTaskPayload) -> Result<()> {
        let job_run_id = payload.job_run_id;
        self.repo
            .set_job_run_status_running(tenant_id, job_run_id)
            .await?;

        let startable = self
            .repo
            .list_startable_step_runs(tenant_id, job_run_id, None)
            .await?;
        tracing::debug!(job_run_id = %job_run_id, count = startable.len(), "Queueing initial step runs");

        self.queue_step_runs(tenant_id, startable.into_iter().map(|sr| sr.id), "job-run-queued")
            .await
    }

    pub(super) async fn job_run_cancelled(
        &self,
        tenant_id: Uuid,
        payload: JobRunCancelledTaskPayload,
    ) -> Result<()> {
        let reason = payload
            .reason
            .unwrap_or_else(|| JOB_RUN_CANCELLED.to_string());
        let step_runs = self
            .repo
            .list_step_runs_by_job_run(tenant_id, payload.job_run_id)
            .await?;

        let mut group = TaskGroup::collect("job-run-cancelled");
        for sr in step_runs.into_iter().filter(|sr| !sr.status.is_final()) {
            let ctrl = self.clone();
            let payload = StepRunCancelTaskPayload {
                step_run_id: sr.id,
                cancelled_reason: reason.clone(),
            };
            group.spawn(async move {
                ctrl.send(&QueueName::JobProcessing, TaskKind::StepRunCancel, tenant_id, &payload)
                    .await
            });
        }
        group.wait().await.map(|_| ())
    }

    /// Emit one `step-run-queued` per step run. The first failure aborts the
    /// rest so the caller's message is redelivered as a whole.
    pub(super) async fn queue_step_runs(
        &self,
        tenant_id: Uuid,
        step_run_ids: impl Iterator<Item = Uuid>,
        context: &'static str,
    ) -> Result<()> {
        let mut group = TaskGroup::fail_fast(context);
        for step_run_id in step_run_ids {
            let ctrl = self.clone();
            group.spawn(async move {
                ctrl.send(
                    &QueueName::JobProcessing,
                    TaskKind::StepRunQueued,
                    tenant_id,
                    &StepRunTaskPayload { step_run_id },
                )
                .await
            });
        }
        group.wait().await.map(|_| ())
    }
}
