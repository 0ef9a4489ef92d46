use std::net::SocketAddr;
use std::time::Duration;

/// Timing for partition ownership: heartbeats and rebalancing.
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// How often the owned partition is heartbeated
    pub heartbeat_interval: Duration,
    /// Soft deadline for a single heartbeat call
    pub heartbeat_timeout: Duration,
    /// Delay before the one-time rebalance of controller partitions
    pub controller_rebalance_delay: Duration,
    /// Delay before the one-time rebalance of worker partitions
    pub worker_rebalance_delay: Duration,
    /// How often partitions with missed heartbeats are reclaimed
    pub inactive_rebalance_interval: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            controller_rebalance_delay: Duration::from_secs(10),
            worker_rebalance_delay: Duration::from_secs(30),
            inactive_rebalance_interval: Duration::from_secs(60),
        }
    }
}

/// Timing for the tenant queue driver.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Period of the sweep that runs every owned tenant's operation
    pub tenant_queue_interval: Duration,
    /// Time budget for a single claim of ready step runs
    pub claim_timeout: Duration,
    /// Deadline for listing the tenants owned by this partition
    pub tenant_list_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tenant_queue_interval: Duration::from_secs(1),
            claim_timeout: Duration::from_secs(30),
            tenant_list_timeout: Duration::from_secs(5),
        }
    }
}

/// Timing and limits for the job/step-run lifecycle controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub reassign_interval: Duration,
    pub timeout_interval: Duration,
    /// Deadline for the reassignment sweep's tenant listing
    pub reassign_list_timeout: Duration,
    /// Deadline for the timeout sweep's tenant listing
    pub timeout_list_timeout: Duration,
    /// The timeout sweep stays idle this long after the controller starts
    pub timeout_grace_period: Duration,
    /// Timed-out step runs failed concurrently per batch
    pub timeout_batch_size: usize,
    /// Deadline applied to each inbound message handler
    pub handler_timeout: Duration,
    /// Schedule timeout applied when a queued step run has none of its own
    pub default_schedule_timeout: Duration,
    /// Redeliveries allowed for a message whose handler failed
    pub max_message_retries: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reassign_interval: Duration::from_secs(1),
            timeout_interval: Duration::from_secs(1),
            reassign_list_timeout: Duration::from_secs(4),
            timeout_list_timeout: Duration::from_secs(5),
            timeout_grace_period: Duration::from_secs(15),
            timeout_batch_size: 10,
            handler_timeout: Duration::from_secs(30),
            default_schedule_timeout: Duration::from_secs(5 * 60),
            max_message_retries: 5,
        }
    }
}

/// Behaviour of the in-memory store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// A partition without a heartbeat for this long is reclaimed
    pub partition_inactive_after: Duration,
    /// A worker without a heartbeat for this long receives no work
    pub worker_inactive_after: Duration,
    /// An assigned step run not started within this window is reassigned
    pub assignment_ack_timeout: Duration,
    /// Maximum step runs considered by one claim
    pub claim_batch_size: usize,
    /// Schedule timeout given to a reassigned step run without one of its own
    pub default_schedule_timeout: Duration,
    /// A scheduling timeout is reported again if still unresolved after this
    pub scheduling_timeout_resend_after: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            partition_inactive_after: Duration::from_secs(60),
            worker_inactive_after: Duration::from_secs(30),
            assignment_ack_timeout: Duration::from_secs(30),
            claim_batch_size: 100,
            default_schedule_timeout: Duration::from_secs(5 * 60),
            scheduling_timeout_resend_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Human-readable identity recorded on the partitions this node owns
    pub name: String,
    /// Also claim a worker partition on startup
    pub worker_partition: bool,
    pub dashboard_addr: Option<SocketAddr>,
    /// Consume and log workflow-run-finished notifications locally. Turn off
    /// when an external consumer subscribes to the workflow queue.
    pub log_workflow_events: bool,
    pub partition: PartitionConfig,
    pub scheduler: SchedulerConfig,
    pub controller: ControllerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "steward".to_string(),
            worker_partition: true,
            dashboard_addr: None,
            log_workflow_events: true,
            partition: PartitionConfig::default(),
            scheduler: SchedulerConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_partition(mut self, partition: PartitionConfig) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controller = controller;
        self
    }

    pub fn without_worker_partition(mut self) -> Self {
        self.worker_partition = false;
        self
    }

    pub fn with_external_workflow_consumer(mut self) -> Self {
        self.log_workflow_events = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_config_default() {
        let cfg = PartitionConfig::default();
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(20));
        assert_eq!(cfg.controller_rebalance_delay, Duration::from_secs(10));
        assert_eq!(cfg.worker_rebalance_delay, Duration::from_secs(30));
        assert_eq!(cfg.inactive_rebalance_interval, Duration::from_secs(60));
    }

    #[test]
    fn scheduler_config_default() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.tenant_queue_interval, Duration::from_secs(1));
        assert_eq!(cfg.claim_timeout, Duration::from_secs(30));
    }

    #[test]
    fn controller_config_default() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.reassign_interval, Duration::from_secs(1));
        assert_eq!(cfg.timeout_interval, Duration::from_secs(1));
        assert_eq!(cfg.reassign_list_timeout, Duration::from_secs(4));
        assert_eq!(cfg.timeout_list_timeout, Duration::from_secs(5));
        assert_eq!(cfg.timeout_grace_period, Duration::from_secs(15));
        assert_eq!(cfg.timeout_batch_size, 10);
        assert_eq!(cfg.max_message_retries, 5);
    }

    #[test]
    fn store_config_default() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.partition_inactive_after, Duration::from_secs(60));
        assert_eq!(cfg.worker_inactive_after, Duration::from_secs(30));
        assert_eq!(cfg.claim_batch_size, 100);
        assert_eq!(
            cfg.default_schedule_timeout,
            ControllerConfig::default().default_schedule_timeout
        );
    }

    #[test]
    fn node_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = NodeConfig::new("node-a")
            .with_dashboard(addr)
            .with_controller(ControllerConfig {
                timeout_grace_period: Duration::ZERO,
                ..Default::default()
            })
            .without_worker_partition()
            .with_external_workflow_consumer();
        assert_eq!(cfg.name, "node-a");
        assert!(!cfg.log_workflow_events);
        assert_eq!(cfg.dashboard_addr, Some(addr));
        assert_eq!(cfg.controller.timeout_grace_period, Duration::ZERO);
        assert!(!cfg.worker_partition);
    }
}
