//! Tenant ownership across several controller processes.


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use steward::alerting::{Alerter, MemoryAlerter};
use steward::config::{PartitionConfig, StoreConfig};
use steward::partition::PartitionRegistry;
use steward::repository::{InMemoryRepository, PartitionKind, Repository};
use test_harness::{wait_for, PanickingRepository};

fn fast_partitions() -> PartitionConfig {
    PartitionConfig {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(100),
        controller_rebalance_delay: Duration::from_millis(10),
        worker_rebalance_delay: Duration::from_millis(10),
        inactive_rebalance_interval: Duration::from_millis(50),
    }
}

fn alerter() -> Arc<dyn Alerter> {
    Arc::new(MemoryAlerter::new())
}

fn store() -> StoreConfig {
    StoreConfig {
        partition_inactive_after: Duration::from_millis(150),
        ..Default::default()
    }
}

async fn owners(repo: &InMemoryRepository) -> Vec<Option<String>> {
    repo.tenants()
        .into_iter()
        .map(|t| t.controller_partition_id)
        .collect()
}

#[tokio::test]
async fn tenants_spread_across_controller_partitions() {
    let repo = Arc::new(InMemoryRepository::new(store()));
    for i in 0..6 {
        repo.create_tenant(format!("tenant-{}", i));
    }

    let a = PartitionRegistry::new(repo.clone(), "node-a", fast_partitions(), alerter())
        .start_controller_partition(CancellationToken::new())
        .await
        .unwrap();
    let b = PartitionRegistry::new(repo.clone(), "node-b", fast_partitions(), alerter())
        .start_controller_partition(CancellationToken::new())
        .await
        .unwrap();

    let (a_id, b_id) = (a.id(), b.id());
    let spread = wait_for(
        || {
            let repo = repo.clone();
            let (a_id, b_id) = (a_id.clone(), b_id.clone());
            async move {
                let owners = owners(&repo).await;
                let on_a = owners.iter().filter(|o| o.as_deref() == Some(&a_id)).count();
                let on_b = owners.iter().filter(|o| o.as_deref() == Some(&b_id)).count();
                on_a == 3 && on_b == 3
            }
        },
        Duration::from_secs(2),
        Duration::from_millis(10),
    )
    .await;
    assert!(spread, "tenants were not rebalanced evenly");

    a.cleanup().await.unwrap();
    b.cleanup().await.unwrap();
}

#[tokio::test]
async fn released_partition_hands_tenants_to_survivor() {
    let repo = Arc::new(InMemoryRepository::new(store()));
    let a = PartitionRegistry::new(repo.clone(), "node-a", fast_partitions(), alerter())
        .start_controller_partition(CancellationToken::new())
        .await
        .unwrap();
    let b = PartitionRegistry::new(repo.clone(), "node-b", fast_partitions(), alerter())
        .start_controller_partition(CancellationToken::new())
        .await
        .unwrap();
    for i in 0..4 {
        repo.create_tenant(format!("tenant-{}", i));
    }
    repo.rebalance_all_partitions(PartitionKind::Controller)
        .await
        .unwrap();

    let survivor = b.id();
    a.cleanup().await.unwrap();

    let owners = owners(&repo).await;
    assert!(owners.iter().all(|o| o.as_deref() == Some(survivor.as_str())));
    b.cleanup().await.unwrap();
}

#[tokio::test]
async fn crashed_partition_is_reclaimed_without_orphaning_tenants() {
    let repo = Arc::new(InMemoryRepository::new(store()));
    let crash = CancellationToken::new();
    let a = PartitionRegistry::new(repo.clone(), "node-a", fast_partitions(), alerter())
        .start_controller_partition(crash.clone())
        .await
        .unwrap();
    let b = PartitionRegistry::new(repo.clone(), "node-b", fast_partitions(), alerter())
        .start_controller_partition(CancellationToken::new())
        .await
        .unwrap();
    for i in 0..4 {
        repo.create_tenant(format!("tenant-{}", i));
    }
    repo.rebalance_all_partitions(PartitionKind::Controller)
        .await
        .unwrap();
    let dead = a.id();
    let survivor = b.id();

    // node-a stops heartbeating without releasing anything
    crash.cancel();

    let recovered = wait_for(
        || {
            let repo = repo.clone();
            let survivor = survivor.clone();
            async move {
                owners(&repo)
                    .await
                    .iter()
                    .all(|o| o.as_deref() == Some(survivor.as_str()))
            }
        },
        Duration::from_secs(3),
        Duration::from_millis(20),
    )
    .await;
    assert!(recovered, "tenants of the dead partition were not reassigned");

    let live: HashSet<String> = repo
        .partitions(PartitionKind::Controller)
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert!(!live.contains(&dead));
    assert!(live.contains(&survivor));

    drop(a);
    b.cleanup().await.unwrap();
}

#[tokio::test]
async fn failing_partition_jobs_are_alerted_and_keep_ticking() {
    let repo = Arc::new(InMemoryRepository::new(store()));
    let faulty: Arc<dyn Repository> = Arc::new(PanickingRepository::new(
        repo.clone(),
        &["heartbeat_partition", "rebalance_inactive_partitions"],
    ));
    let alerter = Arc::new(MemoryAlerter::new());
    let handle = PartitionRegistry::new(faulty, "node-a", fast_partitions(), alerter.clone())
        .start_controller_partition(CancellationToken::new())
        .await
        .unwrap();

    let alerted = wait_for(
        || {
            let alerter = alerter.clone();
            async move {
                let alerts = alerter.alerts();
                let heartbeats = alerts
                    .iter()
                    .filter(|a| a.message.contains("heartbeat_partition"))
                    .count();
                heartbeats >= 2
                    && alerts
                        .iter()
                        .any(|a| a.message.contains("rebalance_inactive_partitions"))
            }
        },
        Duration::from_secs(2),
        Duration::from_millis(10),
    )
    .await;
    assert!(alerted, "partition job failures were not alerted");
    assert!(alerter
        .alerts()
        .iter()
        .all(|a| a.data["partition_kind"] == "controller"));

    handle.cleanup().await.unwrap();
}
