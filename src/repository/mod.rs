//! Persistent state contract.
//!
//! The controller never touches storage directly; it goes through the
//! [`Repository`] trait. Implementations own their transactional discipline:
//! in particular [`Repository::queue_step_run`] and
//! [`Repository::queue_step_runs`] must be conditioned on the current status so
//! stale or duplicated triggers are harmless.

pub mod memory;
mod models;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;

pub use memory::{InMemoryRepository, JobRunSpec, StepSpec};
pub use models::*;

/// Convert a std duration for timestamp arithmetic, saturating at a century.
pub(crate) fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[async_trait]
pub trait Repository: Send + Sync {
    // Tenants

    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant>;

    /// Tenants currently owned by the given partition.
    async fn list_tenants_by_partition(
        &self,
        kind: PartitionKind,
        partition_id: &str,
    ) -> Result<Vec<Tenant>>;

    // Partitions

    /// Create a partition owned by the process called `name`; returns its id.
    async fn create_partition(&self, kind: PartitionKind, name: &str) -> Result<String>;

    /// Delete a partition; its tenants become unassigned until the next rebalance.
    async fn delete_partition(&self, kind: PartitionKind, partition_id: &str) -> Result<()>;

    /// Refresh the partition's heartbeat. Returns the id the caller owns from
    /// now on, which differs from `partition_id` if the partition was already
    /// reclaimed and the caller has been given a new one.
    async fn heartbeat_partition(&self, kind: PartitionKind, partition_id: &str) -> Result<String>;

    /// Spread every tenant evenly across the live partitions.
    async fn rebalance_all_partitions(&self, kind: PartitionKind) -> Result<()>;

    /// Delete partitions with missed heartbeats and move their tenants to
    /// live partitions.
    async fn rebalance_inactive_partitions(&self, kind: PartitionKind) -> Result<()>;

    // Workers

    async fn get_worker(&self, tenant_id: Uuid, worker_id: Uuid) -> Result<Worker>;

    async fn heartbeat_worker(&self, tenant_id: Uuid, worker_id: Uuid) -> Result<()>;

    // Job runs

    async fn get_job_run(&self, tenant_id: Uuid, job_run_id: Uuid) -> Result<JobRun>;

    async fn set_job_run_status_running(&self, tenant_id: Uuid, job_run_id: Uuid) -> Result<()>;

    /// Pending step runs of the job run whose dependencies are all satisfied.
    ///
    /// Without `parent`, these are the step runs with no dependencies at all.
    /// With `parent`, only children of that (just finished) step run are
    /// considered.
    async fn list_startable_step_runs(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        parent: Option<Uuid>,
    ) -> Result<Vec<StepRun>>;

    async fn list_step_runs_by_job_run(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
    ) -> Result<Vec<StepRun>>;

    // Step runs

    async fn get_step_run(&self, tenant_id: Uuid, step_run_id: Uuid) -> Result<StepRun>;

    /// Outputs of the step run's parents, keyed by parent readable id.
    async fn list_parent_outputs(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
    ) -> Result<Map<String, Value>>;

    async fn update_step_run(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        update: StepRunUpdate,
    ) -> Result<StepRunUpdateResult>;

    /// Move a step run from `pending` to `pending_assignment`.
    ///
    /// Fails with [`ControllerError::StepRunNotPending`](crate::error::ControllerError::StepRunNotPending)
    /// when the step run has already left `pending`.
    async fn queue_step_run(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        opts: QueueStepRunOpts,
    ) -> Result<StepRun>;

    /// Reset a finished step run and its descendants for a manual re-run.
    async fn replay_step_run(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        opts: ReplayStepRunOpts,
    ) -> Result<StepRun>;

    /// Keep a copy of the step run's current result before it is overwritten.
    async fn archive_step_run_result(&self, tenant_id: Uuid, step_run_id: Uuid) -> Result<()>;

    async fn unlink_step_run_from_worker(&self, tenant_id: Uuid, step_run_id: Uuid) -> Result<()>;

    /// Atomically assign every assignable step run of the tenant to a worker.
    async fn queue_step_runs(&self, tenant_id: Uuid) -> Result<QueueStepRunsResult>;

    /// Find step runs stuck on a worker and put them back up for assignment.
    /// Returns the ids that were re-queued.
    async fn list_step_runs_to_reassign(&self, tenant_id: Uuid) -> Result<Vec<Uuid>>;

    /// Step runs that exceeded their execution deadline.
    async fn list_step_runs_to_timeout(&self, tenant_id: Uuid) -> Result<Vec<StepRun>>;
}
