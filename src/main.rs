use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use synapse_dispatch::aggregator::{Reward, RewardLedger};
use synapse_dispatch::collaborators::JsonLinesAuditLog;
use synapse_dispatch::config::GridConfig;
use synapse_dispatch::context::GridContext;
use synapse_dispatch::registry::{NodeCapabilities, NodeRegistration, NodeRegistry};
use synapse_dispatch::scheduler::{Job, JobSubmission};
use synapse_dispatch::service::{GridService, LocalNode};
use synapse_dispatch::shutdown::{install_shutdown_handler, sleep_or_cancel};
use synapse_dispatch::store::{CoordinationStore, MemoryStore};
use synapse_dispatch::worker::EchoRunner;

#[derive(Parser, Debug)]
#[command(name = "synapse-dispatch")]
#[command(version)]
#[command(about = "Job dispatch and node lifecycle core for a distributed compute grid")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run dispatchers, aggregator, distributor and reclaimer until interrupted
    Run(RunArgs),

    /// Run a self-contained grid, push sample jobs through it and print the outcome
    Demo(DemoArgs),
}

#[derive(Parser, Debug)]
struct GridArgs {
    /// Region to dispatch from startup (repeatable). Others are discovered.
    #[arg(long = "region")]
    regions: Vec<String>,

    /// Assignment lock TTL in seconds
    #[arg(long, default_value = "30")]
    lock_ttl_secs: u64,

    /// Node lease TTL in seconds
    #[arg(long, default_value = "30")]
    lease_ttl_secs: u64,

    /// Heartbeat interval of local nodes in seconds
    #[arg(long, default_value = "10")]
    heartbeat_secs: u64,

    /// Ranking refresh interval in seconds
    #[arg(long, default_value = "30")]
    ranking_secs: u64,

    /// Maximum execution time per job in seconds
    #[arg(long, default_value = "300")]
    execution_timeout_secs: u64,

    /// Reward per unit of job priority
    #[arg(long, default_value = "0.01")]
    reward_base_rate: f64,

    /// Seconds after which a stuck reward claim is taken over
    #[arg(long, default_value = "60")]
    reward_claim_timeout_secs: u64,

    /// Append job audit records as JSON lines to this file
    #[arg(long)]
    audit_log: Option<PathBuf>,
}

impl GridArgs {
    fn config(&self) -> GridConfig {
        let mut config = GridConfig::default()
            .with_lock_ttl(Duration::from_secs(self.lock_ttl_secs))
            .with_lease_ttl(Duration::from_secs(self.lease_ttl_secs));
        for region in &self.regions {
            config = config.with_region(region.clone());
        }
        config.registry.heartbeat_interval = Duration::from_secs(self.heartbeat_secs);
        config.registry.ranking_interval = Duration::from_secs(self.ranking_secs);
        config.execution_timeout = Duration::from_secs(self.execution_timeout_secs);
        config.rewards.base_rate = self.reward_base_rate;
        config.rewards.claim_timeout = Duration::from_secs(self.reward_claim_timeout_secs);
        config
    }

    async fn context(
        &self,
        store: Arc<dyn CoordinationStore>,
        config: GridConfig,
    ) -> Result<GridContext, Box<dyn std::error::Error>> {
        let mut ctx = GridContext::new(store, config);
        if let Some(path) = &self.audit_log {
            ctx = ctx.with_audit(Arc::new(JsonLinesAuditLog::open(path).await?));
        }
        Ok(ctx)
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    grid: GridArgs,

    /// Redis URL of the shared coordination store (in-process store if omitted)
    #[cfg(feature = "redis")]
    #[arg(long)]
    redis_url: Option<String>,

    /// Number of simulated nodes to host in this process
    #[arg(long, default_value = "0")]
    local_nodes: u32,

    /// Region of the simulated nodes
    #[arg(long, default_value = "local")]
    node_region: String,

    /// Concurrency of each simulated node
    #[arg(long, default_value = "1")]
    node_concurrency: u32,

    /// Simulated execution latency in milliseconds
    #[arg(long, default_value = "200")]
    echo_latency_ms: u64,
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of jobs to submit
    #[arg(long, default_value = "6")]
    jobs: u32,

    /// Number of simulated nodes
    #[arg(long, default_value = "2")]
    nodes: u32,

    /// Region used for nodes and jobs
    #[arg(long, default_value = "demo")]
    region: String,

    /// Give up waiting for jobs after this many seconds
    #[arg(long, default_value = "15")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct DemoOutput {
    jobs: Vec<Job>,
    rewards: Vec<Reward>,
}

#[cfg(feature = "redis")]
async fn open_store(args: &RunArgs) -> Result<Arc<dyn CoordinationStore>, Box<dyn std::error::Error>> {
    use synapse_dispatch::store::redis::{RedisConfig, RedisStore};

    match &args.redis_url {
        Some(url) => {
            let config = RedisConfig {
                url: url.clone(),
                ..RedisConfig::default()
            };
            Ok(Arc::new(RedisStore::connect(&config).await?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn open_store(_args: &RunArgs) -> Result<Arc<dyn CoordinationStore>, Box<dyn std::error::Error>> {
    Ok(Arc::new(MemoryStore::new()))
}

fn local_nodes(count: u32, region: &str, concurrency: u32, latency: Duration) -> Vec<LocalNode> {
    (1..=count)
        .map(|i| {
            let registration = NodeRegistration::new(format!("{region}-node-{i}"), region)
                .with_capabilities(NodeCapabilities::default().with_max_concurrency(concurrency));
            LocalNode::new(registration, Arc::new(EchoRunner::new(latency)))
        })
        .collect()
}

async fn run_grid(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&args).await?;
    let ctx = args.grid.context(store, args.grid.config()).await?;

    let mut service = GridService::new(ctx);
    for node in local_nodes(
        args.local_nodes,
        &args.node_region,
        args.node_concurrency,
        Duration::from_millis(args.echo_latency_ms),
    ) {
        service = service.with_local_node(node);
    }

    let cancel = install_shutdown_handler()?;
    service.run(cancel).await?;
    Ok(())
}

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GridConfig::default().with_region(args.region.clone());
    config.dispatch.poll_wait = Duration::from_millis(100);
    config.dispatch.retry_backoff = Duration::from_millis(100);
    config.registry.heartbeat_interval = Duration::from_millis(500);
    config.registry.ranking_interval = Duration::from_millis(500);
    config.reclaim.interval = Duration::from_secs(1);
    config.rewards.distribution_interval = Duration::from_millis(500);

    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let ctx = GridContext::new(store.clone(), config);

    let mut service = GridService::new(ctx.clone());
    for node in local_nodes(args.nodes, &args.region, 1, Duration::from_millis(50)) {
        service = service.with_local_node(node);
    }
    let queue = service.queue();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(cancel.clone()));

    let registry = NodeRegistry::new(&ctx);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    while registry.nodes_in_region(&args.region).await?.len() < args.nodes as usize {
        if tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut job_ids = Vec::new();
    for i in 0..args.jobs {
        // Every fourth job asks the runner to fail.
        let input = if i % 4 == 3 {
            json!({ "prompt": format!("sample {i}"), "fail": "simulated model error" })
        } else {
            json!({ "prompt": format!("sample {i}") })
        };
        let submission = JobSubmission::new("demo-client", "echo", args.region.clone())
            .with_priority((i % 3) as i32 + 1)
            .with_input(input);
        job_ids.push(queue.submit(submission).await?.job_id);
    }

    let mut jobs = Vec::new();
    loop {
        jobs.clear();
        for job_id in &job_ids {
            jobs.push(queue.get_status(job_id).await?);
        }
        if jobs.iter().all(|j| j.status.is_terminal()) || tokio::time::Instant::now() > deadline {
            break;
        }
        if !sleep_or_cancel(Duration::from_millis(50), &cancel).await {
            break;
        }
    }

    let ledger = RewardLedger::new(store);
    let mut rewards = Vec::new();
    for job_id in &job_ids {
        if let Some(reward) = ledger.get(job_id).await? {
            rewards.push(reward);
        }
    }

    cancel.cancel();
    handle.await??;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&DemoOutput { jobs, rewards })?);
        }
        OutputFormat::Table => {
            println!(
                "{:<38} {:<10} {:<4} {:<16} ERROR",
                "JOB ID", "STATUS", "PRI", "NODE"
            );
            println!("{}", "-".repeat(86));
            for job in &jobs {
                println!(
                    "{:<38} {:<10} {:<4} {:<16} {}",
                    job.job_id,
                    job.status,
                    job.priority,
                    job.assigned_node.as_deref().unwrap_or("-"),
                    job.error.as_deref().unwrap_or("")
                );
            }
            println!();
            let total: f64 = rewards.iter().map(|r| r.amount).sum();
            println!("{} rewards created, {:.4} total", rewards.len(), total);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Run(run_args) => run_grid(run_args).await?,
        Commands::Demo(demo_args) => run_demo(demo_args).await?,
    }

    Ok(())
}
