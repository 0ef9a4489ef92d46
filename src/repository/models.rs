use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Controller,
    Worker,
}

impl fmt::Display for PartitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKind::Controller => write!(f, "controller"),
            PartitionKind::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub id: String,
    pub kind: PartitionKind,
    /// Process that owns the partition
    pub name: String,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub controller_partition_id: Option<String>,
    pub worker_partition_id: Option<String>,
}

impl Tenant {
    pub fn partition_id(&self, kind: PartitionKind) -> Option<&str> {
        match kind {
            PartitionKind::Controller => self.controller_partition_id.as_deref(),
            PartitionKind::Worker => self.worker_partition_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub dispatcher_id: Uuid,
    /// Actions this worker can run
    pub actions: Vec<String>,
    /// Concurrent step runs the worker accepts
    pub max_runs: usize,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Default,
    /// Runs when its workflow run failed; never finishes the workflow run
    OnFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobRunStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobRunStatus::Succeeded | JobRunStatus::Failed | JobRunStatus::Cancelled
        )
    }
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobRunStatus::Pending => write!(f, "pending"),
            JobRunStatus::Running => write!(f, "running"),
            JobRunStatus::Succeeded => write!(f, "succeeded"),
            JobRunStatus::Failed => write!(f, "failed"),
            JobRunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_run_id: Uuid,
    pub kind: JobKind,
    pub status: JobRunStatus,
    /// Data of the event (or manual trigger) that started the workflow run
    pub trigger_data: Value,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    PendingAssignment,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepRunStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepRunStatus::Succeeded | StepRunStatus::Failed | StepRunStatus::Cancelled
        )
    }
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRunStatus::Pending => write!(f, "pending"),
            StepRunStatus::PendingAssignment => write!(f, "pending_assignment"),
            StepRunStatus::Assigned => write!(f, "assigned"),
            StepRunStatus::Running => write!(f, "running"),
            StepRunStatus::Succeeded => write!(f, "succeeded"),
            StepRunStatus::Failed => write!(f, "failed"),
            StepRunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_run_id: Uuid,
    /// Name of the step within its job, unique per job run
    pub readable_id: String,
    pub action: String,
    pub parents: Vec<Uuid>,
    pub status: StepRunStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<Uuid>,
    /// Execution budget once assigned
    pub timeout: Duration,
    pub timeout_at: Option<DateTime<Utc>>,
    /// How long the step run may wait for a worker
    pub schedule_timeout: Option<Duration>,
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    /// Last time a claim reported the expired schedule timeout
    pub schedule_timeout_reported_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepRunEventReason {
    Assigned,
    Started,
    Finished,
    Failed,
    Cancelled,
    Retrying,
    RetriedByUser,
    SchedulingTimedOut,
    TimedOut,
    Reassigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunEvent {
    pub reason: StepRunEventReason,
    pub severity: EventSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StepRunEvent {
    pub fn new(reason: StepRunEventReason, severity: EventSeverity, message: impl Into<String>) -> Self {
        Self {
            reason,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(reason: StepRunEventReason, message: impl Into<String>) -> Self {
        Self::new(reason, EventSeverity::Info, message)
    }
}

/// Snapshot of a step run's result taken before a retry or replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedStepRunResult {
    pub step_run_id: Uuid,
    pub retry_count: u32,
    pub status: StepRunStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<String>,
    pub archived_at: DateTime<Utc>,
}

/// Partial update of a step run. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct StepRunUpdate {
    pub status: Option<StepRunStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_reason: Option<String>,
    /// Forget the previous scheduling deadline so the next queue sets a new one
    pub clear_schedule_timeout: bool,
    /// Clear output, error and the timestamps of the previous attempt
    pub clear_result: bool,
    pub event: Option<StepRunEvent>,
}

#[derive(Debug, Clone)]
pub struct StepRunUpdateResult {
    pub step_run: StepRun,
    /// Set exactly once: when this update moved a default-kind job run into a
    /// final state.
    pub workflow_run_final_state: bool,
    pub job_run: JobRun,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStepRunOpts {
    /// Input to store when the step run has none yet
    pub input: Option<Value>,
    /// Scheduling deadline to store when the step run has none yet
    pub schedule_timeout_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ReplayStepRunOpts {
    pub input: Option<Value>,
    pub retry_count: u32,
    pub event: StepRunEvent,
}

/// One successful assignment made by a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedStepRun {
    pub step_run_id: Uuid,
    pub worker_id: Uuid,
    pub dispatcher_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct QueueStepRunsResult {
    pub queued: Vec<QueuedStepRun>,
    /// Step runs whose scheduling deadline passed before a worker was found
    pub scheduling_timed_out: Vec<Uuid>,
    /// More assignable step runs may remain
    pub should_continue: bool,
}
