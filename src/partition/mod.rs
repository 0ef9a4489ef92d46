//! Partition Registry.
//!
//! A process claims a controller partition (and optionally a worker
//! partition) on startup, keeps it alive with heartbeats and takes part in
//! rebalancing tenants across the fleet. The repository may hand back a new
//! partition id on heartbeat when the old one was reclaimed; the new id is
//! published through a watch channel so queue subscriptions and sweeps
//! follow it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::alerting::{AlertData, Alerter};
use crate::config::PartitionConfig;
use crate::error::{with_deadline, Result};
use crate::periodic::{jittered, Periodic};
use crate::repository::{PartitionKind, Repository};
use crate::supervisor::supervise;

pub struct PartitionRegistry {
    repo: Arc<dyn Repository>,
    name: String,
    config: PartitionConfig,
    alerter: Arc<dyn Alerter>,
}

impl PartitionRegistry {
    pub fn new(
        repo: Arc<dyn Repository>,
        name: impl Into<String>,
        config: PartitionConfig,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            repo,
            name: name.into(),
            config,
            alerter,
        }
    }

    pub async fn start_controller_partition(&self, token: CancellationToken) -> Result<PartitionHandle> {
        self.start(PartitionKind::Controller, self.config.controller_rebalance_delay, token)
            .await
    }

    pub async fn start_worker_partition(&self, token: CancellationToken) -> Result<PartitionHandle> {
        self.start(PartitionKind::Worker, self.config.worker_rebalance_delay, token)
            .await
    }

    async fn start(
        &self,
        kind: PartitionKind,
        rebalance_delay: Duration,
        token: CancellationToken,
    ) -> Result<PartitionHandle> {
        let id = self.repo.create_partition(kind, &self.name).await?;
        tracing::info!(partition_id = %id, %kind, name = %self.name, "Partition created");

        let (tx, rx) = watch::channel(id);
        let tx = Arc::new(tx);
        let periodic = Periodic::new(token);
        // Repository calls of the partition jobs share the heartbeat deadline
        let deadline = self.config.heartbeat_timeout;

        let in_flight = Arc::new(Mutex::new(()));
        {
            let repo = self.repo.clone();
            let alerter = self.alerter.clone();
            let tx = tx.clone();
            let interval = self.config.heartbeat_interval;
            periodic.every("partition-heartbeat", interval, interval, move || {
                supervised(
                    alerter.clone(),
                    "partition-heartbeat",
                    kind,
                    deadline,
                    heartbeat(repo.clone(), kind, tx.clone(), in_flight.clone(), deadline),
                )
            });
        }

        {
            let repo = self.repo.clone();
            let rebalance = async move {
                with_deadline("rebalance partitions", deadline, repo.rebalance_all_partitions(kind)).await?;
                tracing::info!(%kind, "Rebalanced all partitions");
                Ok(())
            };
            periodic.once_after(
                "partition-rebalance-all",
                rebalance_delay,
                supervised(self.alerter.clone(), "partition-rebalance-all", kind, deadline, rebalance),
            );
        }

        {
            let repo = self.repo.clone();
            let alerter = self.alerter.clone();
            let interval = self.config.inactive_rebalance_interval;
            periodic.every(
                "partition-rebalance-inactive",
                interval,
                jittered(interval, 0.1),
                move || {
                    let repo = repo.clone();
                    let rebalance = async move {
                        with_deadline(
                            "rebalance inactive partitions",
                            deadline,
                            repo.rebalance_inactive_partitions(kind),
                        )
                        .await
                    };
                    supervised(alerter.clone(), "partition-rebalance-inactive", kind, deadline, rebalance)
                },
            );
        }

        Ok(PartitionHandle {
            kind,
            repo: self.repo.clone(),
            periodic,
            tx,
            rx,
        })
    }
}

/// Run one partition job behind the handler boundary.
fn supervised<F>(
    alerter: Arc<dyn Alerter>,
    context: &'static str,
    kind: PartitionKind,
    deadline: Duration,
    job: F,
) -> impl Future<Output = ()> + Send + 'static
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    async move {
        let mut data = AlertData::new();
        data.insert("partition_kind".into(), kind.to_string().into());
        // Failures are logged and alerted by the boundary; the next tick retries
        let _ = supervise(context, deadline * 2, alerter.as_ref(), data, job).await;
    }
}

async fn heartbeat(
    repo: Arc<dyn Repository>,
    kind: PartitionKind,
    tx: Arc<watch::Sender<String>>,
    in_flight: Arc<Mutex<()>>,
    timeout: Duration,
) -> Result<()> {
    let Ok(_guard) = in_flight.try_lock() else {
        tracing::warn!(%kind, "Previous partition heartbeat still running, skipping");
        return Ok(());
    };

    let current = tx.borrow().clone();
    let id = with_deadline("partition heartbeat", timeout, repo.heartbeat_partition(kind, &current)).await?;
    if id != current {
        tracing::info!(%kind, old = %current, new = %id, "Adopted new partition id");
        tx.send_replace(id);
    } else {
        tracing::debug!(%kind, partition_id = %current, "Partition heartbeat");
    }
    Ok(())
}

/// A partition owned by this process.
pub struct PartitionHandle {
    kind: PartitionKind,
    repo: Arc<dyn Repository>,
    periodic: Periodic,
    tx: Arc<watch::Sender<String>>,
    rx: watch::Receiver<String>,
}

impl PartitionHandle {
    /// The id currently owned.
    pub fn id(&self) -> String {
        self.rx.borrow().clone()
    }

    /// Follow id changes.
    pub fn subscribe(&self) -> watch::Receiver<String> {
        self.tx.subscribe()
    }

    /// Stop the background jobs, delete the partition and redistribute its
    /// tenants.
    pub async fn cleanup(self) -> Result<()> {
        self.periodic.stop().await;

        let id = self.id();
        self.repo.delete_partition(self.kind, &id).await?;
        self.repo.rebalance_all_partitions(self.kind).await?;
        tracing::info!(partition_id = %id, kind = %self.kind, "Partition released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::MemoryAlerter;
    use crate::config::StoreConfig;
    use crate::repository::InMemoryRepository;

    fn fast() -> PartitionConfig {
        PartitionConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(100),
            controller_rebalance_delay: Duration::from_millis(20),
            worker_rebalance_delay: Duration::from_millis(20),
            inactive_rebalance_interval: Duration::from_millis(30),
        }
    }

    #[tokio::test]
    async fn cleanup_removes_partition_and_frees_tenants() {
        let repo = Arc::new(InMemoryRepository::default());
        let tenant = repo.create_tenant("acme");
        let registry = PartitionRegistry::new(repo.clone(), "node-a", fast(), Arc::new(MemoryAlerter::new()));

        let handle = registry
            .start_controller_partition(CancellationToken::new())
            .await
            .unwrap();
        let id = handle.id();
        assert_eq!(
            repo.get_tenant(tenant.id).await.unwrap().controller_partition_id,
            Some(id)
        );

        handle.cleanup().await.unwrap();
        assert!(repo.partitions(PartitionKind::Controller).is_empty());
        assert!(repo
            .get_tenant(tenant.id)
            .await
            .unwrap()
            .controller_partition_id
            .is_none());
    }

    #[tokio::test]
    async fn heartbeat_adopts_new_id_after_reclaim() {
        let store = StoreConfig {
            partition_inactive_after: Duration::from_millis(10),
            ..Default::default()
        };
        let repo = Arc::new(InMemoryRepository::new(store));
        let registry = PartitionRegistry::new(
            repo.clone(),
            "node-a",
            PartitionConfig {
                heartbeat_interval: Duration::from_millis(200),
                ..fast()
            },
            Arc::new(MemoryAlerter::new()),
        );
        let handle = registry
            .start_worker_partition(CancellationToken::new())
            .await
            .unwrap();
        let original = handle.id();
        let mut changes = handle.subscribe();

        // Reclaim the partition behind the registry's back
        tokio::time::sleep(Duration::from_millis(30)).await;
        repo.rebalance_inactive_partitions(PartitionKind::Worker)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(handle.id(), original);
        handle.cleanup().await.unwrap();
    }
}
