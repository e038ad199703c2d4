use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use airlimit::config::LimiterConfig;
#[cfg(feature = "redis")]
use airlimit::ratelimit::distributed::RedisExecutor;
use airlimit::ratelimit::distributed::{MemoryStore, ScriptExecutor};
use airlimit::ratelimit::PolicySet;

/// Drive a configured rate limit policy with a stream of requests.
#[derive(Debug, Parser)]
#[command(name = "airlimit", version, about)]
struct Args {
    /// Policy file (YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Policy to exercise
    #[arg(short, long)]
    policy: String,

    /// Number of requests to send
    #[arg(short = 'n', long, default_value_t = 10)]
    requests: u64,

    /// Delay between requests in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval_ms: u64,

    /// Weight of each request
    #[arg(long, default_value_t = 1)]
    count: u64,

    /// Redis URL, overriding the one in the policy file
    #[arg(long)]
    redis_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Default)]
struct Summary {
    accepted: u64,
    rejected: u64,
    failed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting airlimit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = LimiterConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if config.policy(&args.policy).is_none() {
        anyhow::bail!("policy {} is not defined in {}", args.policy, args.config.display());
    }

    let store = connect_store(&config, args.redis_url.as_deref()).await?;
    let policies = PolicySet::new(&config, store)?;
    info!(policy = %args.policy, requests = args.requests, "Policies loaded");

    let summary = tokio::select! {
        summary = drive(&policies, &args) => summary,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping");
            return Ok(());
        }
    };

    info!(
        policy = %args.policy,
        accepted = summary.accepted,
        rejected = summary.rejected,
        failed = summary.failed,
        "Run finished"
    );
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Pick the store for distributed policies, if any policy needs one.
async fn connect_store(
    config: &LimiterConfig,
    redis_url: Option<&str>,
) -> anyhow::Result<Option<Arc<dyn ScriptExecutor>>> {
    if !config.needs_store() {
        return Ok(None);
    }

    match redis_url.or(config.store.redis_url.as_deref()) {
        #[cfg(feature = "redis")]
        Some(url) => {
            let executor = RedisExecutor::connect(url)
                .await
                .with_context(|| format!("connecting to {}", url))?;
            Ok(Some(Arc::new(executor)))
        }
        #[cfg(not(feature = "redis"))]
        Some(url) => anyhow::bail!("built without redis support, cannot connect to {}", url),
        None => {
            info!("No Redis URL configured, distributed policies use an in-process store");
            Ok(Some(Arc::new(MemoryStore::new())))
        }
    }
}

async fn drive(policies: &PolicySet, args: &Args) -> Summary {
    let mut summary = Summary::default();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));

    for request in 1..=args.requests {
        ticker.tick().await;

        let entry = policies.check(&args.policy, args.count).await;
        if let Some(err) = entry.error() {
            warn!(request = request, error = %err, "Check failed");
            summary.failed += 1;
        } else if entry.allow() {
            info!(request = request, "Accepted");
            summary.accepted += 1;
        } else {
            info!(request = request, "Rejected");
            summary.rejected += 1;
        }
        entry.finish();
    }

    summary
}
