use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::{with_deadline, ControllerError, Result};
use crate::mq::tasks::TIMED_OUT;
use crate::repository::{PartitionKind, Tenant};
use crate::sync::lock;
use crate::task_group::TaskGroup;

use super::JobsController;

/// One async mutex per tenant, created on first use. A sweep that finds its
/// tenant's lock taken skips the tenant instead of waiting.
#[derive(Default)]
pub(super) struct TenantLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantLocks {
    pub(super) fn try_acquire(&self, tenant_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        let tenant_lock = lock(&self.locks).entry(tenant_id).or_default().clone();
        tenant_lock.try_lock_owned().ok()
    }
}

impl JobsController {
    async fn owned_tenants(&self, operation: &'static str, timeout: std::time::Duration) -> Result<Vec<Tenant>> {
        let partition_id = self.partition.borrow().clone();
        with_deadline(
            operation,
            timeout,
            self.repo
                .list_tenants_by_partition(PartitionKind::Controller, &partition_id),
        )
        .await
    }

    pub(super) async fn run_reassign(&self) -> Result<()> {
        let tenants = self
            .owned_tenants("list tenants for reassignment", self.config.reassign_list_timeout)
            .await?;

        let mut group = TaskGroup::collect("reassign-step-runs");
        for tenant in tenants {
            let ctrl = self.clone();
            group.spawn(async move { ctrl.reassign_tenant(tenant.id).await });
        }
        group.wait().await.map(|_| ())
    }

    async fn reassign_tenant(&self, tenant_id: Uuid) -> Result<()> {
        let Some(_guard) = self.reassign_locks.try_acquire(tenant_id) else {
            tracing::debug!(tenant_id = %tenant_id, "Reassignment already running for tenant, skipping");
            return Ok(());
        };

        let reassigned = self.repo.list_step_runs_to_reassign(tenant_id).await?;
        if reassigned.is_empty() {
            return Ok(());
        }

        tracing::info!(tenant_id = %tenant_id, count = reassigned.len(), "Reassigned step runs from unresponsive workers");
        self.check_tenant_queue(tenant_id).await
    }

    pub(super) async fn run_timeouts(&self) -> Result<()> {
        if self.started_at.elapsed() < self.config.timeout_grace_period {
            return Ok(());
        }

        let tenants = self
            .owned_tenants("list tenants for timeouts", self.config.timeout_list_timeout)
            .await?;

        let mut group = TaskGroup::collect("timeout-step-runs");
        for tenant in tenants {
            let ctrl = self.clone();
            group.spawn(async move { ctrl.timeout_tenant(tenant.id).await });
        }
        group.wait().await.map(|_| ())
    }

    async fn timeout_tenant(&self, tenant_id: Uuid) -> Result<()> {
        let Some(_guard) = self.timeout_locks.try_acquire(tenant_id) else {
            tracing::debug!(tenant_id = %tenant_id, "Timeout sweep already running for tenant, skipping");
            return Ok(());
        };

        let expired = self.repo.list_step_runs_to_timeout(tenant_id).await?;
        if expired.is_empty() {
            return Ok(());
        }
        tracing::info!(tenant_id = %tenant_id, count = expired.len(), "Timing out step runs");

        let mut errors = Vec::new();
        for batch in expired.chunks(self.config.timeout_batch_size.max(1)) {
            let mut group = TaskGroup::collect("timeout-step-run");
            for sr in batch {
                let ctrl = self.clone();
                let step_run_id = sr.id;
                group.spawn(async move {
                    ctrl.fail_step_run(tenant_id, step_run_id, TIMED_OUT.to_string(), Utc::now())
                        .await
                });
            }
            if let Err(e) = group.wait().await {
                errors.push(e);
            }
        }
        ControllerError::from_many(errors)
    }
}
