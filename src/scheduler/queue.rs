use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerting::{AlertData, Alerter};
use crate::config::SchedulerConfig;
use crate::error::{with_deadline, ControllerError, Result};
use crate::mq::{handler_fn, AckMode, Message, MessageQueue, QueueName, Subscription, TaskKind};
use crate::periodic::Periodic;
use crate::repository::{PartitionKind, Repository};
use crate::scheduler::assigner::schedule_step_runs;
use crate::scheduler::operation::{schedule_fn, OperationPool};
use crate::supervisor::supervise;

/// Drives the scheduling operations of the tenants owned by this
/// controller partition.
///
/// Two triggers feed the operations: `check-tenant-queue` messages on the
/// partition's own queue, and a periodic sweep over every owned tenant that
/// guarantees progress when a message is lost.
pub struct TenantQueueService {
    repo: Arc<dyn Repository>,
    mq: Arc<dyn MessageQueue>,
    alerter: Arc<dyn Alerter>,
    pool: Arc<OperationPool>,
    partition: watch::Receiver<String>,
    config: SchedulerConfig,
}

impl TenantQueueService {
    pub fn new(
        repo: Arc<dyn Repository>,
        mq: Arc<dyn MessageQueue>,
        alerter: Arc<dyn Alerter>,
        partition: watch::Receiver<String>,
        config: SchedulerConfig,
    ) -> Self {
        let schedule = {
            let repo = repo.clone();
            let mq = mq.clone();
            let alerter = alerter.clone();
            let budget = config.claim_timeout;
            schedule_fn(move |tenant_id| {
                let repo = repo.clone();
                let mq = mq.clone();
                let alerter = alerter.clone();
                async move {
                    let report = schedule_step_runs(repo, mq, tenant_id, budget).await?;
                    if let Some(e) = &report.delivery_error {
                        tracing::error!(tenant_id = %tenant_id, error = %e, "Could not deliver scheduling messages");
                        let mut data = AlertData::new();
                        data.insert("tenant_id".into(), tenant_id.to_string().into());
                        alerter.send_alert(e, data);
                    }
                    Ok(report.should_continue)
                }
            })
        };

        // Claim budget plus time to hand out the assignments
        let pass_deadline = config.claim_timeout * 2;
        let pool = Arc::new(OperationPool::new(schedule, alerter.clone(), pass_deadline));

        Self {
            repo,
            mq,
            alerter,
            pool,
            partition,
            config,
        }
    }

    pub fn pool(&self) -> Arc<OperationPool> {
        self.pool.clone()
    }

    pub async fn start(&self, token: CancellationToken) -> Result<TenantQueueHandle> {
        let mut partition = self.partition.clone();
        let current = partition.borrow_and_update().clone();
        let subscription = self.subscribe(&current).await?;
        tracing::info!(partition_id = %current, "Tenant queue service started");

        let subscriber = {
            let mq = self.mq.clone();
            let pool = self.pool.clone();
            let token = token.clone();
            tokio::spawn(follow_partition(mq, pool, partition, subscription, token))
        };

        let periodic = Periodic::new(token.child_token());
        {
            let repo = self.repo.clone();
            let pool = self.pool.clone();
            let alerter = self.alerter.clone();
            let partition = self.partition.clone();
            let list_timeout = self.config.tenant_list_timeout;
            let interval = self.config.tenant_queue_interval;
            periodic.every("tenant-queue", interval, interval, move || {
                let partition_id = partition.borrow().clone();
                let alerter = alerter.clone();
                let sweep = run_owned_tenants(repo.clone(), pool.clone(), partition_id.clone(), list_timeout);
                async move {
                    let mut data = AlertData::new();
                    data.insert("partition_id".into(), partition_id.into());
                    let _ = supervise("tenant-queue", list_timeout * 2, alerter.as_ref(), data, sweep).await;
                }
            });
        }

        Ok(TenantQueueHandle {
            token,
            periodic,
            subscriber,
            pool: self.pool.clone(),
        })
    }

    async fn subscribe(&self, partition_id: &str) -> Result<Box<dyn Subscription>> {
        subscribe_partition(self.mq.as_ref(), self.pool.clone(), partition_id).await
    }
}

async fn subscribe_partition(
    mq: &dyn MessageQueue,
    pool: Arc<OperationPool>,
    partition_id: &str,
) -> Result<Box<dyn Subscription>> {
    let handler = handler_fn(move |message: Message| {
        let pool = pool.clone();
        async move { handle_check(&pool, message) }
    });
    mq.subscribe(&QueueName::partition(partition_id), handler, AckMode::PreAck)
        .await
}

fn handle_check(pool: &OperationPool, message: Message) -> Result<()> {
    match message.task()? {
        TaskKind::CheckTenantQueue => {
            let tenant_id = message.tenant_id()?;
            if !pool.trigger(tenant_id) {
                tracing::debug!(tenant_id = %tenant_id, "No operation for tenant yet, sweep will pick it up");
            }
            Ok(())
        }
        other => Err(ControllerError::UnknownTask(other.to_string())),
    }
}

/// Keep the subscription on the queue of whatever partition id we own now.
async fn follow_partition(
    mq: Arc<dyn MessageQueue>,
    pool: Arc<OperationPool>,
    mut partition: watch::Receiver<String>,
    subscription: Box<dyn Subscription>,
    token: CancellationToken,
) {
    let mut subscription = Some(subscription);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            changed = partition.changed() => {
                if changed.is_err() {
                    break;
                }
                let partition_id = partition.borrow_and_update().clone();
                if let Some(old) = subscription.take() {
                    old.close().await;
                }
                match subscribe_partition(mq.as_ref(), pool.clone(), &partition_id).await {
                    Ok(sub) => {
                        tracing::info!(partition_id = %partition_id, "Resubscribed to partition queue");
                        subscription = Some(sub);
                    }
                    Err(e) => {
                        tracing::error!(partition_id = %partition_id, error = %e, "Could not subscribe to partition queue");
                    }
                }
            }
        }
    }

    if let Some(sub) = subscription {
        sub.close().await;
    }
}

async fn run_owned_tenants(
    repo: Arc<dyn Repository>,
    pool: Arc<OperationPool>,
    partition_id: String,
    list_timeout: std::time::Duration,
) -> Result<()> {
    let tenants = with_deadline(
        "list tenants",
        list_timeout,
        repo.list_tenants_by_partition(PartitionKind::Controller, &partition_id),
    )
    .await?;

    for tenant in tenants {
        pool.run(tenant.id);
    }
    Ok(())
}

pub struct TenantQueueHandle {
    token: CancellationToken,
    periodic: Periodic,
    subscriber: JoinHandle<()>,
    pool: Arc<OperationPool>,
}

impl TenantQueueHandle {
    /// Stop the sweep and the subscription, then wait for running passes.
    pub async fn stop(self) {
        self.periodic.stop().await;
        self.token.cancel();
        if let Err(e) = self.subscriber.await {
            tracing::error!(error = %e, "Partition subscriber task failed");
        }
        self.pool.close().await;
    }
}
