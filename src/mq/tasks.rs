//! Task identifier catalog and typed payloads.
//!
//! These ids are the stable contract between the lifecycle controller, the
//! tenant queue service, the dispatchers and anything else producing
//! lifecycle events.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ControllerError;

/// Cancellation reason used when a job run is cancelled without one.
pub const JOB_RUN_CANCELLED: &str = "JOB_RUN_CANCELLED";
/// Cancellation reason for step runs no worker picked up in time.
pub const SCHEDULING_TIMED_OUT: &str = "SCHEDULING_TIMED_OUT";
/// Failure reason for step runs that exceeded their execution timeout.
pub const TIMED_OUT: &str = "TIMED_OUT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    JobRunQueued,
    JobRunCancelled,
    StepRunQueued,
    StepRunStarted,
    StepRunFinished,
    StepRunFailed,
    StepRunTimedOut,
    StepRunRetry,
    StepRunReplay,
    StepRunCancel,
    CheckTenantQueue,
    WorkflowRunFinished,
    StepRunAssigned,
    StepRunCancelled,
}

impl TaskKind {
    pub const ALL: [TaskKind; 14] = [
        TaskKind::JobRunQueued,
        TaskKind::JobRunCancelled,
        TaskKind::StepRunQueued,
        TaskKind::StepRunStarted,
        TaskKind::StepRunFinished,
        TaskKind::StepRunFailed,
        TaskKind::StepRunTimedOut,
        TaskKind::StepRunRetry,
        TaskKind::StepRunReplay,
        TaskKind::StepRunCancel,
        TaskKind::CheckTenantQueue,
        TaskKind::WorkflowRunFinished,
        TaskKind::StepRunAssigned,
        TaskKind::StepRunCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::JobRunQueued => "job-run-queued",
            TaskKind::JobRunCancelled => "job-run-cancelled",
            TaskKind::StepRunQueued => "step-run-queued",
            TaskKind::StepRunStarted => "step-run-started",
            TaskKind::StepRunFinished => "step-run-finished",
            TaskKind::StepRunFailed => "step-run-failed",
            TaskKind::StepRunTimedOut => "step-run-timed-out",
            TaskKind::StepRunRetry => "step-run-retry",
            TaskKind::StepRunReplay => "step-run-replay",
            TaskKind::StepRunCancel => "step-run-cancel",
            TaskKind::CheckTenantQueue => "check-tenant-queue",
            TaskKind::WorkflowRunFinished => "workflow-run-finished",
            TaskKind::StepRunAssigned => "step-run-assigned",
            TaskKind::StepRunCancelled => "step-run-cancelled",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ControllerError::UnknownTask(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunTaskPayload {
    pub job_run_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunCancelledTaskPayload {
    pub job_run_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload of `step-run-queued`, `step-run-retry` and `step-run-timed-out`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunTaskPayload {
    pub step_run_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunStartedTaskPayload {
    pub step_run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunFinishedTaskPayload {
    pub step_run_id: Uuid,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub step_output_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunFailedTaskPayload {
    pub step_run_id: Uuid,
    pub failed_at: DateTime<Utc>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunReplayTaskPayload {
    pub step_run_id: Uuid,
    /// New input; merged into the existing input's `overrides`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunCancelTaskPayload {
    pub step_run_id: Uuid,
    pub cancelled_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunFinishedTaskPayload {
    pub workflow_run_id: Uuid,
}

/// Sent to a dispatcher when one of its workers receives a step run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunAssignedTaskPayload {
    pub step_run_id: Uuid,
    pub worker_id: Uuid,
}

/// Sent to a dispatcher to stop a step run on one of its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunCancelledTaskPayload {
    pub step_run_id: Uuid,
    pub worker_id: Uuid,
    pub cancelled_reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_task_is_rejected() {
        assert!(matches!(
            "step-run-exploded".parse::<TaskKind>(),
            Err(ControllerError::UnknownTask(_))
        ));
    }

    #[test]
    fn cancel_reason_is_optional() {
        let payload: JobRunCancelledTaskPayload =
            serde_json::from_value(serde_json::json!({ "job_run_id": Uuid::nil() })).unwrap();
        assert!(payload.reason.is_none());
    }
}
