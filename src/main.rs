use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use steward::alerting::TracingAlerter;
use steward::config::{ControllerConfig, NodeConfig, PartitionConfig, SchedulerConfig, StoreConfig};
use steward::mq::tasks::JobRunTaskPayload;
use steward::mq::{InMemoryQueue, Message, MessageQueue, QueueName, TaskKind};
use steward::node::Node;
use steward::repository::{InMemoryRepository, JobRunSpec, JobRunStatus, Repository, StepSpec};
use steward::shutdown::install_shutdown_handler;
use steward::worker::{Dispatcher, HeartbeatSender, StepExecutor};

#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(version)]
#[command(about = "Step-run lifecycle controller and tenant scheduler for a workflow engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a controller node on the in-memory stack until SIGINT/SIGTERM
    Server(ServerArgs),

    /// Run a node with a local worker and drive one linear workflow to completion
    Demo(DemoArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Name recorded on the partitions this node owns
    #[arg(long, default_value = "steward")]
    name: String,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Partition heartbeat interval in milliseconds
    #[arg(long, default_value = "20000")]
    heartbeat_interval_ms: u64,

    /// Tenant queue sweep interval in milliseconds
    #[arg(long, default_value = "1000")]
    tenant_queue_interval_ms: u64,

    /// Reassignment and timeout sweep interval in milliseconds
    #[arg(long, default_value = "1000")]
    sweep_interval_ms: u64,

    /// Delay before the timeout sweep becomes active, in milliseconds
    #[arg(long, default_value = "15000")]
    timeout_grace_ms: u64,

    /// Do not claim a worker partition
    #[arg(long)]
    no_worker_partition: bool,
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of steps in the linear workflow
    #[arg(long, default_value = "3")]
    steps: usize,

    /// Give up after this many seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,
}

// =============================================================================
// Output
// =============================================================================

#[derive(Serialize)]
struct DemoStepOutput {
    step: String,
    status: String,
    retries: u32,
    output: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct DemoOutput {
    job_run_id: String,
    status: String,
    steps: Vec<DemoStepOutput>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn dashboard_addr(port: Option<u16>) -> Result<Option<SocketAddr>, Box<dyn std::error::Error>> {
    match port {
        Some(p) => Ok(Some(format!("0.0.0.0:{}", p).parse()?)),
        None => Ok(None),
    }
}

fn server_config(args: &ServerArgs) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
    let sweep_interval = Duration::from_millis(args.sweep_interval_ms);

    let mut config = NodeConfig::new(args.name.clone())
        .with_partition(PartitionConfig {
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval,
            ..Default::default()
        })
        .with_scheduler(SchedulerConfig {
            tenant_queue_interval: Duration::from_millis(args.tenant_queue_interval_ms),
            ..Default::default()
        })
        .with_controller(ControllerConfig {
            reassign_interval: sweep_interval,
            timeout_interval: sweep_interval,
            timeout_grace_period: Duration::from_millis(args.timeout_grace_ms),
            ..Default::default()
        });
    if let Some(addr) = dashboard_addr(args.dashboard_port)? {
        config = config.with_dashboard(addr);
    }
    if args.no_worker_partition {
        config = config.without_worker_partition();
    }
    Ok(config)
}

fn demo_config(args: &DemoArgs) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new("steward-demo")
        .with_partition(PartitionConfig {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(1),
            controller_rebalance_delay: Duration::from_millis(200),
            worker_rebalance_delay: Duration::from_millis(200),
            inactive_rebalance_interval: Duration::from_secs(5),
        })
        .with_scheduler(SchedulerConfig {
            tenant_queue_interval: Duration::from_millis(200),
            ..Default::default()
        })
        .with_controller(ControllerConfig {
            reassign_interval: Duration::from_millis(500),
            timeout_interval: Duration::from_millis(500),
            timeout_grace_period: Duration::from_secs(1),
            ..Default::default()
        });
    if let Some(addr) = dashboard_addr(args.dashboard_port)? {
        config = config.with_dashboard(addr);
    }
    Ok(config)
}

// =============================================================================
// Commands
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = server_config(&args)?;
    let repo = Arc::new(InMemoryRepository::new(StoreConfig::default()));
    // Nothing reads the delivery history in server mode
    let mq = Arc::new(
        InMemoryQueue::with_max_retries(config.controller.max_message_retries)
            .with_history_limit(0),
    );

    tracing::info!(
        name = %config.name,
        dashboard = ?config.dashboard_addr,
        "Starting steward server"
    );

    let shutdown_token = install_shutdown_handler();
    let node = Node::new(config, repo, mq, Arc::new(TracingAlerter));
    node.run(shutdown_token).await?;
    Ok(())
}

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.steps == 0 {
        return Err("--steps must be at least 1".into());
    }

    let config = demo_config(&args)?;
    let repo = Arc::new(InMemoryRepository::new(StoreConfig::default()));
    let mq = Arc::new(InMemoryQueue::with_max_retries(
        config.controller.max_message_retries,
    ));

    let shutdown_token = install_shutdown_handler();
    let node = Node::new(config, repo.clone(), mq.clone(), Arc::new(TracingAlerter));
    let handle = node.start(shutdown_token.child_token()).await?;

    let tenant = repo.create_tenant("demo");
    let dispatcher = Dispatcher::new(repo.clone(), mq.clone(), StepExecutor::with_builtin_actions());
    let worker = repo.register_worker(tenant.id, dispatcher.id(), dispatcher.actions(), 4)?;
    let dispatcher_handle = dispatcher.start().await?;

    let heartbeat_token = shutdown_token.child_token();
    let heartbeat = {
        let repo: Arc<dyn Repository> = repo.clone();
        let token = heartbeat_token.clone();
        let (tenant_id, worker_id) = (tenant.id, worker.id);
        tokio::spawn(async move {
            HeartbeatSender::new(Duration::from_secs(1))
                .run(repo, tenant_id, worker_id, token)
                .await
        })
    };

    let steps: Vec<StepSpec> = (0..args.steps)
        .map(|i| {
            let step = StepSpec::new(format!("step-{}", i + 1), "echo");
            if i == 0 {
                step
            } else {
                step.after(format!("step-{}", i))
            }
        })
        .collect();
    let job_run = repo.create_job_run(
        tenant.id,
        JobRunSpec::new(steps).with_trigger_data(serde_json::json!({ "message": "hello" })),
    )?;
    mq.add_message(
        &QueueName::JobProcessing,
        Message::new(
            TaskKind::JobRunQueued,
            tenant.id,
            &JobRunTaskPayload {
                job_run_id: job_run.id,
            },
        )?,
    )
    .await?;
    tracing::info!(job_run_id = %job_run.id, steps = args.steps, "Demo job run queued");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let final_status = loop {
        let current = repo.get_job_run(tenant.id, job_run.id).await?;
        if current.status.is_final() {
            break current.status;
        }
        if tokio::time::Instant::now() >= deadline || shutdown_token.is_cancelled() {
            break current.status;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let mut steps = Vec::new();
    for sr in repo.list_step_runs_by_job_run(tenant.id, job_run.id).await? {
        steps.push(DemoStepOutput {
            step: sr.readable_id,
            status: sr.status.to_string(),
            retries: sr.retry_count,
            output: sr.output,
        });
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&DemoOutput {
            job_run_id: job_run.id.to_string(),
            status: final_status.to_string(),
            steps,
        })?
    );

    heartbeat_token.cancel();
    if let Err(e) = heartbeat.await {
        tracing::error!(error = %e, "Heartbeat task failed");
    }
    dispatcher_handle.stop().await;
    handle.shutdown().await?;

    if final_status != JobRunStatus::Succeeded {
        return Err(format!("demo job run ended as {}", final_status).into());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Demo(demo_args) => run_demo(demo_args).await?,
    }

    Ok(())
}
