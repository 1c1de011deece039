use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use fusion_jobs::config::{
    CleanupConfig, NodeConfig, PollConfig, RetryConfig, RunnerConfig,
};
use fusion_jobs::node::Node;
use fusion_jobs::scheduler::{InMemoryJobStore, JobKind, JobPayload, RetryDecision, RetryPolicy};
use fusion_jobs::shutdown::cancel_on_signal;
use fusion_jobs::worker::{
    BackendRegistry, MemorySource, PendingJob, PollAdapter, SimulatedBackend,
};

#[derive(Parser, Debug)]
#[command(name = "fusion-jobs")]
#[command(version)]
#[command(about = "Asynchronous job runner with bounded retry and exponential backoff")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the job runner with its cleanup loop and optional dashboard
    Serve(ServeArgs),

    /// Print the retry schedule produced by a backoff configuration
    Backoff(BackoffArgs),
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port for the HTTP dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Delay before the first retry, in milliseconds
    #[arg(long, default_value = "5000")]
    retry_base_ms: u64,

    /// Attempt ceiling for jobs submitted without one
    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Per-attempt timeout in seconds (0 disables)
    #[arg(long, default_value = "300")]
    attempt_timeout_secs: u64,

    /// Maximum attempts running at once
    #[arg(long, default_value = "64")]
    max_concurrency: usize,

    /// Keep terminal jobs this long before sweeping them, in seconds
    #[arg(long, default_value = "86400")]
    retention_secs: u64,

    /// Seconds between cleanup sweeps
    #[arg(long, default_value = "3600")]
    cleanup_interval_secs: u64,

    /// Processing time multiplier for the simulated generation backend
    #[arg(long, default_value = "1.0", value_parser = parse_speed)]
    speed: f64,

    /// Seed an in-memory pending source with this many render tasks and poll it
    #[arg(long)]
    demo_poll: Option<usize>,

    /// Poll interval in milliseconds for the demo poll worker
    #[arg(long, default_value = "5000")]
    poll_interval_ms: u64,
}

fn parse_speed(raw: &str) -> Result<f64, String> {
    let speed: f64 = raw
        .parse()
        .map_err(|_| format!("'{}' is not a number", raw))?;
    if !speed.is_finite() || !(0.0..=SimulatedBackend::MAX_SPEED).contains(&speed) {
        return Err(format!(
            "speed must be between 0 and {}",
            SimulatedBackend::MAX_SPEED
        ));
    }
    Ok(speed)
}

// =============================================================================
// Backoff Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BackoffArgs {
    /// Delay before the first retry, in milliseconds
    #[arg(long, default_value = "5000")]
    base_ms: u64,

    /// Attempt ceiling
    #[arg(long, default_value = "3")]
    max_attempts: u32,

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
struct BackoffStep {
    failed_attempt: u32,
    decision: String,
    delay_ms: Option<u64>,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let retry = RetryConfig::default()
        .with_base_delay(Duration::from_millis(args.retry_base_ms))
        .with_default_max_attempts(args.max_attempts);
    let attempt_timeout = match args.attempt_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let runner = RunnerConfig::default()
        .with_retry(retry.clone())
        .with_max_concurrency(args.max_concurrency)
        .with_attempt_timeout(attempt_timeout);
    let cleanup = CleanupConfig {
        interval: Duration::from_secs(args.cleanup_interval_secs.max(1)),
        retention: Duration::from_secs(args.retention_secs),
    };

    let mut config = NodeConfig {
        runner,
        cleanup,
        dashboard_addr: None,
    };
    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config = config.with_dashboard(addr);
    }

    let simulated = Arc::new(SimulatedBackend::new(args.speed));
    let backends = BackendRegistry::new()
        .register(JobKind::Text, simulated.clone())
        .register(JobKind::Image, simulated.clone())
        .register(JobKind::Video, simulated.clone())
        .register(JobKind::Music, simulated.clone())
        .register(JobKind::task("render"), simulated.clone())
        .register(JobKind::task("schedule"), simulated);

    let shutdown = tokio_util::sync::CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let store = Arc::new(InMemoryJobStore::new());
    let mut node = Node::new(config, store, backends.clone(), shutdown);

    if let Some(count) = args.demo_poll {
        let source = Arc::new(MemorySource::new());
        let now = chrono::Utc::now();
        for i in 0..count {
            let row = PendingJob::new(
                format!("render-{}", i + 1),
                JobKind::task("render"),
                JobPayload::default().with_parameter("frame", serde_json::json!(i)),
            )
            .scheduled_at(now + chrono::Duration::seconds(i as i64));
            source.insert(row).await;
        }
        tracing::info!(count, "Seeded demo pending source");

        let poll = PollConfig::new("render")
            .with_interval(Duration::from_millis(args.poll_interval_ms.max(1)));
        let adapter = PollAdapter::new(source, backends, RetryPolicy::from_config(&retry), poll);
        node = node.with_poll_adapter(adapter);
    }

    node.run().await?;
    Ok(())
}

fn run_backoff(args: BackoffArgs) -> Result<(), Box<dyn std::error::Error>> {
    let policy = RetryPolicy::new(Duration::from_millis(args.base_ms));
    let steps: Vec<BackoffStep> = (1..=args.max_attempts.max(1))
        .map(|attempt| match policy.decide(attempt, args.max_attempts) {
            RetryDecision::Retry(delay) => BackoffStep {
                failed_attempt: attempt,
                decision: "retry".to_string(),
                delay_ms: Some(delay.as_millis() as u64),
            },
            RetryDecision::GiveUp => BackoffStep {
                failed_attempt: attempt,
                decision: "give up".to_string(),
                delay_ms: None,
            },
        })
        .collect();

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&steps)?);
        }
        OutputFormat::Table => {
            println!("{:<16} {:<10} {:>12}", "FAILED ATTEMPT", "DECISION", "DELAY (ms)");
            for step in steps {
                let delay = step
                    .delay_ms
                    .map(|ms| ms.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<16} {:<10} {:>12}", step.failed_attempt, step.decision, delay);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::Backoff(backoff_args) => run_backoff(backoff_args)?,
    }

    Ok(())
}
