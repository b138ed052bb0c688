use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratecache::config::{LogFormat, Settings};
use ratecache::ratelimit::{
    Descriptor, DescriptorConfig, DistributedRateLimiter, Entry, RateLimitConfig,
    RateLimitRequest, RateLimitRule, RequestContext, SystemClock, ThreadRandom, TimeUnit,
};
use ratecache::service::RateLimitService;
use ratecache::store::{CounterPools, MemoryStore};

/// Shared-quota rate limit cache.
#[derive(Parser, Debug)]
#[command(name = "ratecache", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate descriptors against a single ad-hoc rule and print the verdicts
    Check(CheckArgs),
    /// Print the effective settings loaded from the environment
    Settings,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Rate limit domain
    #[arg(long)]
    domain: String,

    /// Descriptor as `key=value[,key=value...]`; may be repeated
    #[arg(long = "descriptor", required = true, value_parser = parse_descriptor)]
    descriptors: Vec<Descriptor>,

    /// Quota as `N/unit`, e.g. `10/second`
    #[arg(long, value_parser = parse_limit)]
    limit: LimitArg,

    /// Count but never reject
    #[arg(long)]
    shadow: bool,

    /// Source IP consulted by the IP override lists
    #[arg(long)]
    ip: Option<IpAddr>,

    /// Source UID consulted by the UID override lists
    #[arg(long)]
    uid: Option<String>,

    /// Hits added to each counter per request
    #[arg(long, default_value_t = 1)]
    hits: u32,

    /// Number of requests to send
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Use an in-process store instead of Redis
    #[arg(long)]
    memory: bool,
}

#[derive(Debug, Clone, Copy)]
struct LimitArg {
    requests_per_unit: u64,
    unit: TimeUnit,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("failed to load settings")?;
    init_tracing(&settings);

    match cli.command {
        Command::Settings => {
            print!("{}", serde_yaml::to_string(&settings)?);
            Ok(())
        }
        Command::Check(args) => run_check(args, settings).await,
    }
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(settings.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match settings.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run_check(args: CheckArgs, settings: Settings) -> anyhow::Result<()> {
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limiter = if args.memory {
        let store = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
        let pools = CounterPools::single(store, settings.standard_store().pipeline);
        DistributedRateLimiter::new(pools, Arc::new(SystemClock), Arc::new(ThreadRandom), &settings)
    } else {
        DistributedRateLimiter::connect(&settings)
            .await
            .context("failed to connect to the counter store")?
    };
    let limiter = Arc::new(limiter);

    let mut rule = RateLimitRule::new(args.limit.requests_per_unit, args.limit.unit).named("cli");
    if args.shadow {
        rule = rule.shadow();
    }
    let rules = RateLimitConfig::new().with_domain(
        args.domain.clone(),
        args.descriptors
            .iter()
            .filter_map(|d| rule_chain(d, &rule))
            .collect(),
    );
    let service = RateLimitService::new(limiter.clone(), Arc::new(rules), &settings)?;

    let mut ctx = RequestContext::default();
    if let Some(ip) = args.ip {
        ctx = ctx.with_ip(ip);
    }
    if let Some(uid) = args.uid {
        ctx = ctx.with_uid(uid);
    }
    let mut request = RateLimitRequest::new(args.domain, args.descriptors);
    request.hits_addend = args.hits;

    let checks = async {
        for _ in 0..args.repeat {
            let response = service.should_rate_limit(&ctx, &request).await?;
            println!("{}", serde_json::to_string(&response)?);
        }
        anyhow::Ok(())
    };

    tokio::select! {
        result = checks => result?,
        _ = shutdown_signal() => warn!("Interrupted before all checks completed"),
    }

    info!(stats = ?limiter.stats(), "Check finished");
    Ok(())
}

/// A chain of wildcard nodes following the descriptor's keys, with the rule
/// on the deepest node.
fn rule_chain(descriptor: &Descriptor, rule: &RateLimitRule) -> Option<DescriptorConfig> {
    let mut entries = descriptor.entries.iter().rev();
    let last = entries.next()?;
    let leaf = DescriptorConfig::new(last.key.clone()).limit(rule.clone());
    Some(entries.fold(leaf, |child, entry| {
        DescriptorConfig::new(entry.key.clone()).child(child)
    }))
}

fn parse_descriptor(input: &str) -> Result<Descriptor, String> {
    let entries = input
        .split(',')
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Entry::new(key.trim(), value.trim()))
            }
            _ => Err(format!("expected key=value, got '{}'", pair)),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Descriptor { entries })
}

fn parse_limit(input: &str) -> Result<LimitArg, String> {
    let (requests, unit) = input
        .split_once('/')
        .ok_or_else(|| format!("expected N/unit, got '{}'", input))?;
    Ok(LimitArg {
        requests_per_unit: requests
            .trim()
            .parse()
            .map_err(|e| format!("invalid request count '{}': {}", requests, e))?,
        unit: unit.trim().parse()?,
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
