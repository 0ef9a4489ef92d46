//! In-memory [`Repository`] used by the `steward` binary and the test suite.
//!
//! All state lives behind one mutex, so every operation is atomic with
//! respect to every other one; that is the in-memory analogue of the row
//! locks a SQL implementation would take for claims and status transitions.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{ControllerError, Result};
use crate::repository::*;
use crate::sync::lock;

const PREVIOUS_STEP_FAILED: &str = "PREVIOUS_STEP_FAILED";
const PREVIOUS_STEP_CANCELLED: &str = "PREVIOUS_STEP_CANCELLED";

/// Definition of one step when creating a job run.
#[derive(Debug, Clone)]
pub struct StepSpec {
    pub readable_id: String,
    pub action: String,
    /// Readable ids of the steps this one depends on
    pub parents: Vec<String>,
    pub max_retries: u32,
    pub timeout: Duration,
    pub schedule_timeout: Option<Duration>,
}

impl StepSpec {
    pub fn new(readable_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            readable_id: readable_id.into(),
            action: action.into(),
            parents: Vec::new(),
            max_retries: 0,
            timeout: Duration::from_secs(60),
            schedule_timeout: None,
        }
    }

    pub fn after(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_schedule_timeout(mut self, schedule_timeout: Duration) -> Self {
        self.schedule_timeout = Some(schedule_timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct JobRunSpec {
    pub kind: JobKind,
    pub trigger_data: Value,
    pub triggered_by: String,
    pub steps: Vec<StepSpec>,
}

impl JobRunSpec {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self {
            kind: JobKind::Default,
            trigger_data: Value::Object(Map::new()),
            triggered_by: "manual".to_string(),
            steps,
        }
    }

    pub fn with_trigger_data(mut self, data: Value) -> Self {
        self.trigger_data = data;
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Default)]
struct State {
    tenants: BTreeMap<Uuid, Tenant>,
    partitions: BTreeMap<String, Partition>,
    /// Owner names of partitions reclaimed as inactive, by old id
    reclaimed: HashMap<String, String>,
    workers: HashMap<Uuid, Worker>,
    job_runs: HashMap<Uuid, JobRun>,
    step_runs: HashMap<Uuid, StepRun>,
    /// Creation order of step runs; claims are FIFO
    step_order: Vec<Uuid>,
    events: HashMap<Uuid, Vec<StepRunEvent>>,
    archives: HashMap<Uuid, Vec<ArchivedStepRunResult>>,
}

impl State {
    fn job_run(&self, tenant_id: Uuid, job_run_id: Uuid) -> Result<&JobRun> {
        self.job_runs
            .get(&job_run_id)
            .filter(|jr| jr.tenant_id == tenant_id)
            .ok_or(ControllerError::JobRunNotFound(job_run_id))
    }

    fn step_run(&self, tenant_id: Uuid, step_run_id: Uuid) -> Result<&StepRun> {
        self.step_runs
            .get(&step_run_id)
            .filter(|sr| sr.tenant_id == tenant_id)
            .ok_or(ControllerError::StepRunNotFound(step_run_id))
    }

    fn step_run_mut(&mut self, tenant_id: Uuid, step_run_id: Uuid) -> Result<&mut StepRun> {
        self.step_runs
            .get_mut(&step_run_id)
            .filter(|sr| sr.tenant_id == tenant_id)
            .ok_or(ControllerError::StepRunNotFound(step_run_id))
    }

    fn push_event(&mut self, step_run_id: Uuid, event: StepRunEvent) {
        self.events.entry(step_run_id).or_default().push(event);
    }

    fn job_step_runs(&self, job_run_id: Uuid) -> impl Iterator<Item = &StepRun> {
        self.step_order
            .iter()
            .filter_map(|id| self.step_runs.get(id))
            .filter(move |sr| sr.job_run_id == job_run_id)
    }

    /// Every step run that transitively depends on `step_run_id`.
    fn descendants(&self, step_run_id: Uuid) -> Vec<Uuid> {
        let Some(root) = self.step_runs.get(&step_run_id) else {
            return Vec::new();
        };
        let siblings: Vec<&StepRun> = self.job_step_runs(root.job_run_id).collect();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut frontier = VecDeque::from([step_run_id]);
        while let Some(current) = frontier.pop_front() {
            for child in siblings.iter().filter(|sr| sr.parents.contains(&current)) {
                if seen.insert(child.id) {
                    out.push(child.id);
                    frontier.push_back(child.id);
                }
            }
        }
        out
    }

    /// Recompute the job run's status from its step runs. Returns the job run
    /// and whether this call moved it into a final state.
    fn resolve_job_run(&mut self, job_run_id: Uuid) -> Result<(JobRun, bool)> {
        let statuses: Vec<StepRunStatus> =
            self.job_step_runs(job_run_id).map(|sr| sr.status).collect();

        let next = if statuses.iter().any(|s| *s == StepRunStatus::Failed) {
            JobRunStatus::Failed
        } else if statuses.iter().any(|s| *s == StepRunStatus::Cancelled) {
            JobRunStatus::Cancelled
        } else if statuses.iter().all(|s| *s == StepRunStatus::Succeeded) {
            JobRunStatus::Succeeded
        } else if statuses.iter().all(|s| *s == StepRunStatus::Pending) {
            JobRunStatus::Pending
        } else {
            JobRunStatus::Running
        };

        let job_run = self
            .job_runs
            .get_mut(&job_run_id)
            .ok_or(ControllerError::JobRunNotFound(job_run_id))?;

        let became_final = !job_run.status.is_final() && next.is_final();
        if next.is_final() {
            if became_final {
                job_run.finished_at = Some(Utc::now());
            }
        } else {
            job_run.finished_at = None;
        }
        if next == JobRunStatus::Running && job_run.started_at.is_none() {
            job_run.started_at = Some(Utc::now());
        }
        job_run.status = next;

        Ok((job_run.clone(), became_final))
    }

    fn cancel_pending_descendants(&mut self, step_run_id: Uuid, reason: &str) {
        let now = Utc::now();
        for id in self.descendants(step_run_id) {
            let cancelled = match self.step_runs.get_mut(&id) {
                Some(sr) if sr.status == StepRunStatus::Pending => {
                    sr.status = StepRunStatus::Cancelled;
                    sr.cancelled_at = Some(now);
                    sr.cancelled_reason = Some(reason.to_string());
                    true
                }
                _ => false,
            };
            if cancelled {
                self.push_event(
                    id,
                    StepRunEvent::info(
                        StepRunEventReason::Cancelled,
                        format!("Cancelled because an upstream step ended: {}", reason),
                    ),
                );
            }
        }
    }

    fn partition_ids(&self, kind: PartitionKind) -> Vec<String> {
        self.partitions
            .values()
            .filter(|p| p.kind == kind)
            .map(|p| p.id.clone())
            .collect()
    }

    fn set_tenant_partition(tenant: &mut Tenant, kind: PartitionKind, id: Option<String>) {
        match kind {
            PartitionKind::Controller => tenant.controller_partition_id = id,
            PartitionKind::Worker => tenant.worker_partition_id = id,
        }
    }

    /// Give every tenant without a live partition the least-loaded one.
    fn assign_orphans(&mut self, kind: PartitionKind) {
        let live = self.partition_ids(kind);
        if live.is_empty() {
            return;
        }

        let mut load: BTreeMap<String, usize> = live.iter().map(|id| (id.clone(), 0)).collect();
        for tenant in self.tenants.values() {
            if let Some(count) = tenant.partition_id(kind).and_then(|id| load.get_mut(id)) {
                *count += 1;
            }
        }

        for tenant in self.tenants.values_mut() {
            let owned = tenant
                .partition_id(kind)
                .is_some_and(|id| load.contains_key(id));
            if owned {
                continue;
            }
            let Some((target, count)) = load.iter_mut().min_by_key(|(_, c)| **c) else {
                return;
            };
            *count += 1;
            tracing::debug!(tenant_id = %tenant.id, partition_id = %target, %kind, "Tenant assigned to partition");
            Self::set_tenant_partition(tenant, kind, Some(target.clone()));
        }
    }

    fn live_workers(&self, tenant_id: Uuid, cutoff: DateTime<Utc>) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| w.tenant_id == tenant_id && w.last_heartbeat >= cutoff)
            .collect();
        workers.sort_by_key(|w| w.id);
        workers
    }

    fn worker_loads(&self) -> HashMap<Uuid, usize> {
        let mut loads = HashMap::new();
        for sr in self.step_runs.values() {
            if matches!(sr.status, StepRunStatus::Assigned | StepRunStatus::Running) {
                if let Some(worker_id) = sr.worker_id {
                    *loads.entry(worker_id).or_insert(0) += 1;
                }
            }
        }
        loads
    }
}

pub struct InMemoryRepository {
    config: StoreConfig,
    state: Mutex<State>,
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl InMemoryRepository {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Create a tenant, assigning it to the least-loaded live partitions.
    pub fn create_tenant(&self, name: impl Into<String>) -> Tenant {
        let mut state = lock(&self.state);
        let tenant = Tenant {
            id: Uuid::new_v4(),
            name: name.into(),
            controller_partition_id: None,
            worker_partition_id: None,
        };
        let id = tenant.id;
        state.tenants.insert(id, tenant);
        state.assign_orphans(PartitionKind::Controller);
        state.assign_orphans(PartitionKind::Worker);
        state.tenants[&id].clone()
    }

    pub fn tenants(&self) -> Vec<Tenant> {
        lock(&self.state).tenants.values().cloned().collect()
    }

    pub fn partitions(&self, kind: PartitionKind) -> Vec<Partition> {
        lock(&self.state)
            .partitions
            .values()
            .filter(|p| p.kind == kind)
            .cloned()
            .collect()
    }

    pub fn register_worker(
        &self,
        tenant_id: Uuid,
        dispatcher_id: Uuid,
        actions: Vec<String>,
        max_runs: usize,
    ) -> Result<Worker> {
        let mut state = lock(&self.state);
        if !state.tenants.contains_key(&tenant_id) {
            return Err(ControllerError::TenantNotFound(tenant_id));
        }
        let worker = Worker {
            id: Uuid::new_v4(),
            tenant_id,
            dispatcher_id,
            actions,
            max_runs,
            last_heartbeat: Utc::now(),
        };
        state.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    /// Create a job run and one pending step run per step.
    pub fn create_job_run(&self, tenant_id: Uuid, spec: JobRunSpec) -> Result<JobRun> {
        let mut state = lock(&self.state);
        if !state.tenants.contains_key(&tenant_id) {
            return Err(ControllerError::TenantNotFound(tenant_id));
        }

        let now = Utc::now();
        let job_run = JobRun {
            id: Uuid::new_v4(),
            tenant_id,
            workflow_run_id: Uuid::new_v4(),
            kind: spec.kind,
            status: JobRunStatus::Pending,
            trigger_data: spec.trigger_data,
            triggered_by: spec.triggered_by,
            created_at: now,
            started_at: None,
            finished_at: None,
        };

        let ids: HashMap<&str, Uuid> = spec
            .steps
            .iter()
            .map(|s| (s.readable_id.as_str(), Uuid::new_v4()))
            .collect();

        let mut step_runs = Vec::with_capacity(spec.steps.len());
        for step in &spec.steps {
            let mut parents = Vec::with_capacity(step.parents.len());
            for parent in &step.parents {
                let id = ids.get(parent.as_str()).ok_or_else(|| {
                    ControllerError::InvalidInput(format!(
                        "step {} depends on unknown step {}",
                        step.readable_id, parent
                    ))
                })?;
                parents.push(*id);
            }

            step_runs.push(StepRun {
                id: ids[step.readable_id.as_str()],
                tenant_id,
                job_run_id: job_run.id,
                readable_id: step.readable_id.clone(),
                action: step.action.clone(),
                parents,
                status: StepRunStatus::Pending,
                retry_count: 0,
                max_retries: step.max_retries,
                input: None,
                output: None,
                error: None,
                worker_id: None,
                timeout: step.timeout,
                timeout_at: None,
                schedule_timeout: step.schedule_timeout,
                schedule_timeout_at: None,
                schedule_timeout_reported_at: None,
                created_at: now,
                assigned_at: None,
                started_at: None,
                finished_at: None,
                failed_at: None,
                cancelled_at: None,
                cancelled_reason: None,
            });
        }

        for sr in step_runs {
            state.step_order.push(sr.id);
            state.step_runs.insert(sr.id, sr);
        }
        state.job_runs.insert(job_run.id, job_run.clone());
        Ok(job_run)
    }

    pub fn step_run_by_readable_id(&self, job_run_id: Uuid, readable_id: &str) -> Option<StepRun> {
        lock(&self.state)
            .job_step_runs(job_run_id)
            .find(|sr| sr.readable_id == readable_id)
            .cloned()
    }

    pub fn events(&self, step_run_id: Uuid) -> Vec<StepRunEvent> {
        lock(&self.state)
            .events
            .get(&step_run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn archived_results(&self, step_run_id: Uuid) -> Vec<ArchivedStepRunResult> {
        lock(&self.state)
            .archives
            .get(&step_run_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Tenant> {
        lock(&self.state)
            .tenants
            .get(&tenant_id)
            .cloned()
            .ok_or(ControllerError::TenantNotFound(tenant_id))
    }

    async fn list_tenants_by_partition(
        &self,
        kind: PartitionKind,
        partition_id: &str,
    ) -> Result<Vec<Tenant>> {
        Ok(lock(&self.state)
            .tenants
            .values()
            .filter(|t| t.partition_id(kind) == Some(partition_id))
            .cloned()
            .collect())
    }

    async fn create_partition(&self, kind: PartitionKind, name: &str) -> Result<String> {
        let mut state = lock(&self.state);
        let id = Uuid::new_v4().to_string();
        state.partitions.insert(
            id.clone(),
            Partition {
                id: id.clone(),
                kind,
                name: name.to_string(),
                last_heartbeat: Utc::now(),
            },
        );
        state.assign_orphans(kind);
        Ok(id)
    }

    async fn delete_partition(&self, kind: PartitionKind, partition_id: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.partitions.remove(partition_id);
        for tenant in state.tenants.values_mut() {
            if tenant.partition_id(kind) == Some(partition_id) {
                State::set_tenant_partition(tenant, kind, None);
            }
        }
        Ok(())
    }

    async fn heartbeat_partition(&self, kind: PartitionKind, partition_id: &str) -> Result<String> {
        let mut state = lock(&self.state);
        let now = Utc::now();

        if let Some(partition) = state
            .partitions
            .get_mut(partition_id)
            .filter(|p| p.kind == kind)
        {
            partition.last_heartbeat = now;
            return Ok(partition.id.clone());
        }

        // Reclaimed while we were away: hand the owner a fresh partition
        let name = state
            .reclaimed
            .remove(partition_id)
            .unwrap_or_else(|| "unknown".to_string());
        let id = Uuid::new_v4().to_string();
        state.partitions.insert(
            id.clone(),
            Partition {
                id: id.clone(),
                kind,
                name,
                last_heartbeat: now,
            },
        );
        state.assign_orphans(kind);
        Ok(id)
    }

    async fn rebalance_all_partitions(&self, kind: PartitionKind) -> Result<()> {
        let mut state = lock(&self.state);
        let live = state.partition_ids(kind);

        for (i, tenant) in state.tenants.values_mut().enumerate() {
            let target = if live.is_empty() {
                None
            } else {
                Some(live[i % live.len()].clone())
            };
            State::set_tenant_partition(tenant, kind, target);
        }
        Ok(())
    }

    async fn rebalance_inactive_partitions(&self, kind: PartitionKind) -> Result<()> {
        let mut state = lock(&self.state);
        let cutoff = Utc::now() - span(self.config.partition_inactive_after);

        let stale: Vec<(String, String)> = state
            .partitions
            .values()
            .filter(|p| p.kind == kind && p.last_heartbeat < cutoff)
            .map(|p| (p.id.clone(), p.name.clone()))
            .collect();

        for (id, name) in stale {
            tracing::info!(partition_id = %id, %kind, "Reclaiming inactive partition");
            state.partitions.remove(&id);
            state.reclaimed.insert(id, name);
        }

        state.assign_orphans(kind);
        Ok(())
    }

    async fn get_worker(&self, tenant_id: Uuid, worker_id: Uuid) -> Result<Worker> {
        lock(&self.state)
            .workers
            .get(&worker_id)
            .filter(|w| w.tenant_id == tenant_id)
            .cloned()
            .ok_or(ControllerError::WorkerNotFound(worker_id))
    }

    async fn heartbeat_worker(&self, tenant_id: Uuid, worker_id: Uuid) -> Result<()> {
        let mut state = lock(&self.state);
        let worker = state
            .workers
            .get_mut(&worker_id)
            .filter(|w| w.tenant_id == tenant_id)
            .ok_or(ControllerError::WorkerNotFound(worker_id))?;
        worker.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn get_job_run(&self, tenant_id: Uuid, job_run_id: Uuid) -> Result<JobRun> {
        lock(&self.state).job_run(tenant_id, job_run_id).cloned()
    }

    async fn set_job_run_status_running(&self, tenant_id: Uuid, job_run_id: Uuid) -> Result<()> {
        let mut state = lock(&self.state);
        state.job_run(tenant_id, job_run_id)?;
        if let Some(job_run) = state.job_runs.get_mut(&job_run_id) {
            job_run.status = JobRunStatus::Running;
            job_run.started_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn list_startable_step_runs(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
        parent: Option<Uuid>,
    ) -> Result<Vec<StepRun>> {
        let state = lock(&self.state);
        state.job_run(tenant_id, job_run_id)?;

        let succeeded = |id: &Uuid| {
            state
                .step_runs
                .get(id)
                .is_some_and(|p| p.status == StepRunStatus::Succeeded)
        };

        Ok(state
            .job_step_runs(job_run_id)
            .filter(|sr| sr.status == StepRunStatus::Pending)
            .filter(|sr| match parent {
                None => sr.parents.is_empty(),
                Some(parent) => {
                    sr.parents.contains(&parent) && sr.parents.iter().all(|id| succeeded(id))
                }
            })
            .cloned()
            .collect())
    }

    async fn list_step_runs_by_job_run(
        &self,
        tenant_id: Uuid,
        job_run_id: Uuid,
    ) -> Result<Vec<StepRun>> {
        let state = lock(&self.state);
        state.job_run(tenant_id, job_run_id)?;
        Ok(state.job_step_runs(job_run_id).cloned().collect())
    }

    async fn get_step_run(&self, tenant_id: Uuid, step_run_id: Uuid) -> Result<StepRun> {
        lock(&self.state).step_run(tenant_id, step_run_id).cloned()
    }

    async fn list_parent_outputs(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
    ) -> Result<Map<String, Value>> {
        let state = lock(&self.state);
        let sr = state.step_run(tenant_id, step_run_id)?;
        Ok(sr
            .parents
            .iter()
            .filter_map(|id| state.step_runs.get(id))
            .map(|p| (p.readable_id.clone(), p.output.clone().unwrap_or(Value::Null)))
            .collect())
    }

    async fn update_step_run(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        update: StepRunUpdate,
    ) -> Result<StepRunUpdateResult> {
        let mut state = lock(&self.state);
        let sr = state.step_run_mut(tenant_id, step_run_id)?;

        // The first terminal transition wins; late reports from a worker
        // must not move a finished step run again.
        if sr.status.is_final() && update.status.is_some_and(|s| s != sr.status) {
            tracing::debug!(step_run_id = %step_run_id, status = %sr.status, "Step run already final, update dropped");
            let step_run = sr.clone();
            let job_run = state.job_run(tenant_id, step_run.job_run_id)?.clone();
            return Ok(StepRunUpdateResult {
                step_run,
                job_run,
                workflow_run_final_state: false,
            });
        }

        if update.clear_result {
            sr.output = None;
            sr.error = None;
            sr.assigned_at = None;
            sr.started_at = None;
            sr.finished_at = None;
            sr.failed_at = None;
            sr.cancelled_at = None;
            sr.cancelled_reason = None;
            sr.timeout_at = None;
        }
        if update.clear_schedule_timeout {
            sr.schedule_timeout_at = None;
        }
        if let Some(status) = update.status {
            sr.status = status;
        }
        if let Some(input) = update.input {
            sr.input = Some(input);
        }
        if let Some(output) = update.output {
            sr.output = Some(output);
        }
        if let Some(error) = update.error {
            sr.error = Some(error);
        }
        if let Some(retry_count) = update.retry_count {
            sr.retry_count = retry_count;
        }
        if let Some(at) = update.started_at {
            sr.started_at = Some(at);
        }
        if let Some(at) = update.finished_at {
            sr.finished_at = Some(at);
        }
        if let Some(at) = update.failed_at {
            sr.failed_at = Some(at);
        }
        if let Some(at) = update.cancelled_at {
            sr.cancelled_at = Some(at);
        }
        if let Some(reason) = update.cancelled_reason {
            sr.cancelled_reason = Some(reason);
        }

        let job_run_id = sr.job_run_id;
        match update.status {
            Some(StepRunStatus::Failed) => {
                state.cancel_pending_descendants(step_run_id, PREVIOUS_STEP_FAILED)
            }
            Some(StepRunStatus::Cancelled) => {
                state.cancel_pending_descendants(step_run_id, PREVIOUS_STEP_CANCELLED)
            }
            _ => {}
        }
        if let Some(event) = update.event {
            state.push_event(step_run_id, event);
        }

        let (job_run, became_final) = state.resolve_job_run(job_run_id)?;
        let step_run = state.step_run(tenant_id, step_run_id)?.clone();

        Ok(StepRunUpdateResult {
            step_run,
            workflow_run_final_state: became_final && job_run.kind == JobKind::Default,
            job_run,
        })
    }

    async fn queue_step_run(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        opts: QueueStepRunOpts,
    ) -> Result<StepRun> {
        let mut state = lock(&self.state);
        let sr = state.step_run_mut(tenant_id, step_run_id)?;
        if sr.status != StepRunStatus::Pending {
            return Err(ControllerError::StepRunNotPending(step_run_id));
        }

        if sr.input.is_none() {
            sr.input = opts.input;
        }
        if sr.schedule_timeout_at.is_none() {
            sr.schedule_timeout_at = opts.schedule_timeout_at;
        }
        sr.status = StepRunStatus::PendingAssignment;

        let job_run_id = sr.job_run_id;
        state.resolve_job_run(job_run_id)?;
        Ok(state.step_run(tenant_id, step_run_id)?.clone())
    }

    async fn replay_step_run(
        &self,
        tenant_id: Uuid,
        step_run_id: Uuid,
        opts: ReplayStepRunOpts,
    ) -> Result<StepRun> {
        let mut state = lock(&self.state);
        let sr = state.step_run_mut(tenant_id, step_run_id)?;
        if !sr.status.is_final() {
            return Err(ControllerError::InvalidInput(format!(
                "step run {} is {}, only finished step runs can be replayed",
                step_run_id, sr.status
            )));
        }

        reset_attempt(sr);
        sr.retry_count = opts.retry_count;
        if opts.input.is_some() {
            sr.input = opts.input;
        }
        let job_run_id = sr.job_run_id;

        for id in state.descendants(step_run_id) {
            if let Some(child) = state.step_runs.get_mut(&id) {
                reset_attempt(child);
                child.input = None;
                child.retry_count = 0;
                child.worker_id = None;
            }
        }

        state.push_event(step_run_id, opts.event);
        state.resolve_job_run(job_run_id)?;
        Ok(state.step_run(tenant_id, step_run_id)?.clone())
    }

    async fn archive_step_run_result(&self, tenant_id: Uuid, step_run_id: Uuid) -> Result<()> {
        let mut state = lock(&self.state);
        let sr = state.step_run(tenant_id, step_run_id)?;
        let archived = ArchivedStepRunResult {
            step_run_id,
            retry_count: sr.retry_count,
            status: sr.status,
            input: sr.input.clone(),
            output: sr.output.clone(),
            error: sr.error.clone(),
            worker_id: sr.worker_id,
            started_at: sr.started_at,
            finished_at: sr.finished_at,
            failed_at: sr.failed_at,
            cancelled_at: sr.cancelled_at,
            cancelled_reason: sr.cancelled_reason.clone(),
            archived_at: Utc::now(),
        };
        state.archives.entry(step_run_id).or_default().push(archived);
        Ok(())
    }

    async fn unlink_step_run_from_worker(&self, tenant_id: Uuid, step_run_id: Uuid) -> Result<()> {
        let mut state = lock(&self.state);
        state.step_run_mut(tenant_id, step_run_id)?.worker_id = None;
        Ok(())
    }

    async fn queue_step_runs(&self, tenant_id: Uuid) -> Result<QueueStepRunsResult> {
        let mut state = lock(&self.state);
        let now = Utc::now();

        let candidates: Vec<Uuid> = state
            .step_order
            .iter()
            .filter(|id| {
                state.step_runs.get(id).is_some_and(|sr| {
                    sr.tenant_id == tenant_id && sr.status == StepRunStatus::PendingAssignment
                })
            })
            .copied()
            .collect();
        let batch = candidates.len().min(self.config.claim_batch_size);

        let cutoff = now - span(self.config.worker_inactive_after);
        let resend_after = span(self.config.scheduling_timeout_resend_after);
        let workers: Vec<(Uuid, Uuid, Vec<String>, usize)> = state
            .live_workers(tenant_id, cutoff)
            .into_iter()
            .map(|w| (w.id, w.dispatcher_id, w.actions.clone(), w.max_runs))
            .collect();
        let mut loads = state.worker_loads();

        let mut result = QueueStepRunsResult::default();
        for id in &candidates[..batch] {
            let Some(sr) = state.step_runs.get_mut(id) else {
                continue;
            };

            if sr.schedule_timeout_at.is_some_and(|at| at <= now) {
                // Reported once; repeated only if the cancel never landed
                let due = sr
                    .schedule_timeout_reported_at
                    .map_or(true, |at| at <= now - resend_after);
                if due {
                    sr.schedule_timeout_reported_at = Some(now);
                    result.scheduling_timed_out.push(*id);
                }
                continue;
            }

            // Least-loaded live worker that can run the action and has a free slot
            let chosen = workers
                .iter()
                .filter(|(worker_id, _, actions, max_runs)| {
                    actions.iter().any(|a| *a == sr.action)
                        && loads.get(worker_id).copied().unwrap_or(0) < *max_runs
                })
                .min_by_key(|(worker_id, _, _, _)| loads.get(worker_id).copied().unwrap_or(0));
            let Some((worker_id, dispatcher_id, _, _)) = chosen else {
                continue;
            };

            sr.status = StepRunStatus::Assigned;
            sr.worker_id = Some(*worker_id);
            sr.assigned_at = Some(now);
            sr.timeout_at = Some(now + span(sr.timeout));
            *loads.entry(*worker_id).or_insert(0) += 1;

            result.queued.push(QueuedStepRun {
                step_run_id: *id,
                worker_id: *worker_id,
                dispatcher_id: *dispatcher_id,
            });
        }

        for queued in &result.queued {
            state.push_event(
                queued.step_run_id,
                StepRunEvent::info(
                    StepRunEventReason::Assigned,
                    format!("Assigned to worker {}", queued.worker_id),
                ),
            );
        }

        // A full batch with progress means more may be assignable
        result.should_continue = candidates.len() > batch && !result.queued.is_empty();
        Ok(result)
    }

    async fn list_step_runs_to_reassign(&self, tenant_id: Uuid) -> Result<Vec<Uuid>> {
        let mut state = lock(&self.state);
        let now = Utc::now();
        let worker_cutoff = now - span(self.config.worker_inactive_after);
        let ack_cutoff = now - span(self.config.assignment_ack_timeout);

        let live: HashSet<Uuid> = state
            .live_workers(tenant_id, worker_cutoff)
            .into_iter()
            .map(|w| w.id)
            .collect();

        let mut reassigned = Vec::new();
        for sr in state.step_runs.values_mut() {
            if sr.tenant_id != tenant_id
                || !matches!(sr.status, StepRunStatus::Assigned | StepRunStatus::Running)
            {
                continue;
            }
            let worker_gone = sr.worker_id.map_or(true, |w| !live.contains(&w));
            let never_started = sr.status == StepRunStatus::Assigned
                && sr.assigned_at.is_some_and(|at| at < ack_cutoff);
            if !worker_gone && !never_started {
                continue;
            }

            // It was picked up once, so the wait for a worker starts over
            sr.status = StepRunStatus::PendingAssignment;
            sr.worker_id = None;
            sr.assigned_at = None;
            sr.started_at = None;
            sr.timeout_at = None;
            sr.schedule_timeout_at = Some(
                now + span(sr.schedule_timeout.unwrap_or(self.config.default_schedule_timeout)),
            );
            sr.schedule_timeout_reported_at = None;
            reassigned.push(sr.id);
        }

        for id in &reassigned {
            state.push_event(
                *id,
                StepRunEvent::new(
                    StepRunEventReason::Reassigned,
                    EventSeverity::Warning,
                    "Worker stopped responding, step run was requeued",
                ),
            );
        }
        Ok(reassigned)
    }

    async fn list_step_runs_to_timeout(&self, tenant_id: Uuid) -> Result<Vec<StepRun>> {
        let state = lock(&self.state);
        let now = Utc::now();
        Ok(state
            .step_order
            .iter()
            .filter_map(|id| state.step_runs.get(id))
            .filter(|sr| {
                sr.tenant_id == tenant_id
                    && matches!(sr.status, StepRunStatus::Assigned | StepRunStatus::Running)
                    && sr.timeout_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }
}

/// Put a step run back to `pending` with no trace of the previous attempt.
fn reset_attempt(sr: &mut StepRun) {
    sr.status = StepRunStatus::Pending;
    sr.output = None;
    sr.error = None;
    sr.assigned_at = None;
    sr.started_at = None;
    sr.finished_at = None;
    sr.failed_at = None;
    sr.cancelled_at = None;
    sr.cancelled_reason = None;
    sr.timeout_at = None;
    sr.schedule_timeout_at = None;
    sr.schedule_timeout_reported_at = None;
}
