use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::Repository;

/// Keeps a worker marked as alive in the repository.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Heartbeat until `token` is cancelled
    pub async fn run(
        &self,
        repo: Arc<dyn Repository>,
        tenant_id: Uuid,
        worker_id: Uuid,
        token: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = repo.heartbeat_worker(tenant_id, worker_id).await {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Worker heartbeat failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::repository::InMemoryRepository;

    #[tokio::test]
    async fn heartbeats_keep_worker_alive() {
        let repo = Arc::new(InMemoryRepository::new(StoreConfig::default()));
        let tenant = repo.create_tenant("acme");
        let worker = repo
            .register_worker(tenant.id, Uuid::new_v4(), vec!["echo".into()], 1)
            .unwrap();
        let before = worker.last_heartbeat;
        let (tenant_id, worker_id) = (tenant.id, worker.id);

        let token = CancellationToken::new();
        let sender = HeartbeatSender::new(Duration::from_millis(10));
        let task = {
            let repo = repo.clone();
            let token = token.clone();
            tokio::spawn(async move { sender.run(repo, tenant_id, worker_id, token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        task.await.unwrap();

        let after = repo.get_worker(tenant_id, worker_id).await.unwrap();
        assert!(after.last_heartbeat > before);
    }
}
