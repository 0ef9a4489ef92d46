use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alerting::Alerter;
use crate::config::NodeConfig;
use crate::controller::{ControllerHandle, JobsController};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::{ControllerError, Result};
use crate::mq::tasks::WorkflowRunFinishedTaskPayload;
use crate::mq::{handler_fn, AckMode, Message, MessageQueue, QueueName, Subscription};
use crate::partition::{PartitionHandle, PartitionRegistry};
use crate::repository::Repository;
use crate::scheduler::{OperationPool, TenantQueueHandle, TenantQueueService};

/// Main node that orchestrates all components
pub struct Node {
    pub config: NodeConfig,
    repo: Arc<dyn Repository>,
    mq: Arc<dyn MessageQueue>,
    alerter: Arc<dyn Alerter>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        repo: Arc<dyn Repository>,
        mq: Arc<dyn MessageQueue>,
        alerter: Arc<dyn Alerter>,
    ) -> Self {
        Self {
            config,
            repo,
            mq,
            alerter,
        }
    }

    /// Start all node subsystems.
    ///
    /// 1. Claims a controller partition (and a worker partition when configured)
    /// 2. Starts the tenant queue service on the controller partition
    /// 3. Starts the jobs controller and its sweeps
    /// 4. Logs finished workflow runs unless an external consumer owns them
    /// 5. Optionally spawns the dashboard server
    ///
    /// Each subsystem runs on its own child of `token`.
    pub async fn start(&self, token: CancellationToken) -> Result<NodeHandle> {
        let registry = PartitionRegistry::new(
            self.repo.clone(),
            self.config.name.clone(),
            self.config.partition.clone(),
            self.alerter.clone(),
        );

        let controller_partition = registry
            .start_controller_partition(token.child_token())
            .await?;
        let worker_partition = if self.config.worker_partition {
            Some(registry.start_worker_partition(token.child_token()).await?)
        } else {
            None
        };

        let tenant_queue = TenantQueueService::new(
            self.repo.clone(),
            self.mq.clone(),
            self.alerter.clone(),
            controller_partition.subscribe(),
            self.config.scheduler.clone(),
        );
        let pool = tenant_queue.pool();
        let tenant_queue = tenant_queue.start(token.child_token()).await?;

        let controller = JobsController::new(
            self.repo.clone(),
            self.mq.clone(),
            self.alerter.clone(),
            controller_partition.subscribe(),
            self.config.controller.clone(),
        );
        let controller = controller.start(token.child_token()).await?;

        let workflow_events = if self.config.log_workflow_events {
            Some(self.subscribe_workflow_events().await?)
        } else {
            None
        };

        let dashboard_token = token.child_token();
        let dashboard = self.config.dashboard_addr.map(|addr| {
            let state = DashboardState {
                repo: self.repo.clone(),
                controller_partition: controller_partition.subscribe(),
                worker_partition: worker_partition.as_ref().map(|p| p.subscribe()),
                operations: pool.clone(),
            };
            tokio::spawn(run_dashboard(addr, state, dashboard_token.clone()))
        });

        tracing::info!(
            name = %self.config.name,
            controller_partition_id = %controller_partition.id(),
            worker_partition_id = ?worker_partition.as_ref().map(|p| p.id()),
            "Node started"
        );

        Ok(NodeHandle {
            controller_partition,
            worker_partition,
            tenant_queue,
            controller,
            workflow_events,
            pool,
            dashboard,
            dashboard_token,
        })
    }

    /// Log workflow-run-finished notifications so the queue never backs up
    /// without an external consumer.
    async fn subscribe_workflow_events(&self) -> Result<Box<dyn Subscription>> {
        let handler = handler_fn(|message: Message| async move {
            let payload: WorkflowRunFinishedTaskPayload = message.decode()?;
            tracing::info!(
                tenant_id = %message.tenant_id()?,
                workflow_run_id = %payload.workflow_run_id,
                "Workflow run finished"
            );
            Ok(())
        });
        self.mq
            .subscribe(&QueueName::WorkflowProcessing, handler, AckMode::PreAck)
            .await
    }

    /// Run until `token` is cancelled, then shut down gracefully.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let handle = self.start(token.clone()).await?;
        token.cancelled().await;
        handle.shutdown().await
    }
}

pub struct NodeHandle {
    controller_partition: PartitionHandle,
    worker_partition: Option<PartitionHandle>,
    tenant_queue: TenantQueueHandle,
    controller: ControllerHandle,
    workflow_events: Option<Box<dyn Subscription>>,
    pool: Arc<OperationPool>,
    dashboard: Option<JoinHandle<()>>,
    dashboard_token: CancellationToken,
}

impl NodeHandle {
    pub fn controller_partition_id(&self) -> String {
        self.controller_partition.id()
    }

    pub fn worker_partition_id(&self) -> Option<String> {
        self.worker_partition.as_ref().map(|p| p.id())
    }

    pub fn operations(&self) -> Arc<OperationPool> {
        self.pool.clone()
    }

    /// Stop consuming and scheduling first, then release the partitions so
    /// their tenants move to the remaining nodes.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down node");

        self.controller.stop().await;
        self.tenant_queue.stop().await;
        if let Some(workflow_events) = self.workflow_events {
            workflow_events.close().await;
        }

        self.dashboard_token.cancel();
        if let Some(dashboard) = self.dashboard {
            if let Err(e) = dashboard.await {
                tracing::error!(error = %e, "Dashboard task failed");
            }
        }

        let mut errors: Vec<ControllerError> = Vec::new();
        if let Some(worker_partition) = self.worker_partition {
            if let Err(e) = worker_partition.cleanup().await {
                tracing::error!(error = %e, "Failed to release worker partition");
                errors.push(e);
            }
        }
        if let Err(e) = self.controller_partition.cleanup().await {
            tracing::error!(error = %e, "Failed to release controller partition");
            errors.push(e);
        }

        tracing::info!("Node stopped");
        ControllerError::from_many(errors)
    }
}
