use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{with_deadline, ControllerError, Result};
use crate::mq::tasks::{
    StepRunAssignedTaskPayload, StepRunCancelTaskPayload, SCHEDULING_TIMED_OUT,
};
use crate::mq::{Message, MessageQueue, QueueName, TaskKind};
use crate::repository::Repository;
use crate::task_group::TaskGroup;

/// Outcome of one scheduling pass.
#[derive(Debug, Default)]
pub struct ScheduleReport {
    pub assigned: usize,
    pub timed_out: usize,
    pub should_continue: bool,
    /// Messages of this pass that could not be delivered
    pub delivery_error: Option<ControllerError>,
}

/// Claim every assignable step run of the tenant and notify the dispatchers.
///
/// Only a failed claim is an error. Delivery failures come back in
/// [`ScheduleReport::delivery_error`]: the claim already committed, and the
/// reassignment sweep recovers step runs whose assignment never reached a
/// worker.
pub async fn schedule_step_runs(
    repo: Arc<dyn Repository>,
    mq: Arc<dyn MessageQueue>,
    tenant_id: Uuid,
    budget: Duration,
) -> Result<ScheduleReport> {
    let claimed = with_deadline("claim step runs", budget, repo.queue_step_runs(tenant_id)).await?;

    let mut report = ScheduleReport {
        assigned: claimed.queued.len(),
        timed_out: claimed.scheduling_timed_out.len(),
        should_continue: claimed.should_continue,
        delivery_error: None,
    };

    let mut group = TaskGroup::collect("step run assignment");
    for queued in claimed.queued {
        let mq = mq.clone();
        group.spawn(async move {
            let payload = StepRunAssignedTaskPayload {
                step_run_id: queued.step_run_id,
                worker_id: queued.worker_id,
            };
            let message = Message::new(TaskKind::StepRunAssigned, tenant_id, &payload)?;
            mq.add_message(&QueueName::dispatcher(queued.dispatcher_id), message)
                .await
        });
    }

    for step_run_id in claimed.scheduling_timed_out {
        let mq = mq.clone();
        group.spawn(async move {
            let payload = StepRunCancelTaskPayload {
                step_run_id,
                cancelled_reason: SCHEDULING_TIMED_OUT.to_string(),
            };
            let message = Message::new(TaskKind::StepRunCancel, tenant_id, &payload)?;
            mq.add_message(&QueueName::JobProcessing, message).await
        });
    }

    report.delivery_error = group.wait().await.err();

    if report.assigned > 0 || report.timed_out > 0 {
        tracing::debug!(
            tenant_id = %tenant_id,
            assigned = report.assigned,
            timed_out = report.timed_out,
            "Scheduled step runs"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::InMemoryQueue;
    use crate::repository::memory::{JobRunSpec, StepSpec};
    use crate::repository::{InMemoryRepository, QueueStepRunOpts};

    #[tokio::test]
    async fn assignments_go_to_the_dispatcher_queue() {
        let repo = Arc::new(InMemoryRepository::default());
        let mq = Arc::new(InMemoryQueue::new());
        let tenant = repo.create_tenant("acme");
        let dispatcher = Uuid::new_v4();
        repo.register_worker(tenant.id, dispatcher, vec!["echo".into()], 4)
            .unwrap();
        let jr = repo
            .create_job_run(tenant.id, JobRunSpec::new(vec![StepSpec::new("a", "echo")]))
            .unwrap();
        let a = repo.step_run_by_readable_id(jr.id, "a").unwrap();
        repo.queue_step_run(tenant.id, a.id, QueueStepRunOpts::default())
            .await
            .unwrap();

        let report = schedule_step_runs(repo.clone(), mq.clone(), tenant.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.assigned, 1);

        let sent = mq.messages_for_task(&QueueName::dispatcher(dispatcher), TaskKind::StepRunAssigned);
        assert_eq!(sent.len(), 1);
        let payload: StepRunAssignedTaskPayload = sent[0].decode().unwrap();
        assert_eq!(payload.step_run_id, a.id);
    }

    struct ClosedQueue;

    #[async_trait::async_trait]
    impl MessageQueue for ClosedQueue {
        async fn subscribe(
            &self,
            queue: &QueueName,
            _handler: crate::mq::MessageHandler,
            _mode: crate::mq::AckMode,
        ) -> Result<Box<dyn crate::mq::Subscription>> {
            Err(ControllerError::QueueClosed(queue.to_string()))
        }

        async fn add_message(&self, queue: &QueueName, _message: Message) -> Result<()> {
            Err(ControllerError::QueueClosed(queue.to_string()))
        }
    }

    #[tokio::test]
    async fn undelivered_assignment_is_reported_but_claim_stands() {
        let repo = Arc::new(InMemoryRepository::default());
        let tenant = repo.create_tenant("acme");
        repo.register_worker(tenant.id, Uuid::new_v4(), vec!["echo".into()], 4)
            .unwrap();
        let jr = repo
            .create_job_run(tenant.id, JobRunSpec::new(vec![StepSpec::new("a", "echo")]))
            .unwrap();
        let a = repo.step_run_by_readable_id(jr.id, "a").unwrap();
        repo.queue_step_run(tenant.id, a.id, QueueStepRunOpts::default())
            .await
            .unwrap();

        let report = schedule_step_runs(repo.clone(), Arc::new(ClosedQueue), tenant.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.assigned, 1);
        assert!(matches!(report.delivery_error, Some(ControllerError::QueueClosed(_))));

        let a = repo.step_run_by_readable_id(jr.id, "a").unwrap();
        assert_eq!(a.status, crate::repository::StepRunStatus::Assigned);
    }

    #[tokio::test]
    async fn expired_deadlines_become_cancel_messages() {
        let repo = Arc::new(InMemoryRepository::default());
        let mq = Arc::new(InMemoryQueue::new());
        let tenant = repo.create_tenant("acme");
        let jr = repo
            .create_job_run(tenant.id, JobRunSpec::new(vec![StepSpec::new("a", "echo")]))
            .unwrap();
        let a = repo.step_run_by_readable_id(jr.id, "a").unwrap();
        let opts = QueueStepRunOpts {
            input: None,
            schedule_timeout_at: Some(chrono::Utc::now()),
        };
        repo.queue_step_run(tenant.id, a.id, opts).await.unwrap();

        let report = schedule_step_runs(repo, mq.clone(), tenant.id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.timed_out, 1);

        let sent = mq.messages_for_task(&QueueName::JobProcessing, TaskKind::StepRunCancel);
        let payload: StepRunCancelTaskPayload = sent[0].decode().unwrap();
        assert_eq!(payload.cancelled_reason, SCHEDULING_TIMED_OUT);
    }
}
