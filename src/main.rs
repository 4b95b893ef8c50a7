use anyhow::{bail, Context, Result};
use oddsmash::cache::store::ValkeyStore;
use oddsmash::cache::CacheResolver;
use oddsmash::config::Config;
use oddsmash::engine::{EngineEvent, OddsEngine, Selection};
use oddsmash::feed::fetcher::OddsFetcher;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DEFAULT_CONFIG: &str = "oddsmash.toml";

const USAGE: &str = "usage: oddsmash [--config <path>] (--selections <file.json> | --list-cache <sport>)";

enum Command {
    Pass(PathBuf),
    ListCache(String),
}

struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut config = None;
    let mut command = None;
    let mut it = args.iter().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => config = it.next().map(PathBuf::from),
            "--selections" => command = it.next().map(|p| Command::Pass(PathBuf::from(p))),
            "--list-cache" => command = it.next().map(|s| Command::ListCache(s.clone())),
            "-h" | "--help" => bail!(USAGE),
            other => bail!("unknown argument {:?}\n{}", other, USAGE),
        }
    }
    match command {
        Some(command) => Ok(Args { config, command }),
        None => bail!(USAGE),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let raw_args: Vec<String> = std::env::args().collect();
    let args = parse_args(&raw_args)?;

    // Load config
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    // Logs go to stderr; stdout carries the JSON report.
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    info!("oddsmash v{} starting", env!("CARGO_PKG_VERSION"));
    if !config_path.exists() {
        info!(path = %config_path.display(), "no config file found, using env-only config");
    }

    // --- Valkey cache ---
    let cache = if config.cache.enabled {
        match ValkeyStore::connect(&config.cache.url, &config.cache.prefix).await {
            Ok(store) => {
                if let Err(e) = store.ping().await {
                    error!(error = %e, "Valkey ping failed, continuing without cache");
                    None
                } else {
                    Some(CacheResolver::new(Arc::new(store), config.cache.ttl()))
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    url = %config.cache.url,
                    "failed to connect to Valkey, computing fresh every pass"
                );
                None
            }
        }
    } else {
        None
    };

    match args.command {
        Command::ListCache(sport) => {
            let Some(cache) = cache else {
                bail!("--list-cache needs a reachable cache (cache.enabled / VALKEY_URL)");
            };
            let keys = cache.list_keys(&sport).await;
            info!(sport = %sport, keys = keys.len(), "listed cache keys");
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        Command::Pass(path) => run_pass(&config, cache, &path).await?,
    }

    Ok(())
}

async fn run_pass(config: &Config, cache: Option<CacheResolver>, path: &Path) -> Result<()> {
    config.require_api_key()?;

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read selections from {}", path.display()))?;
    let selections: Vec<Selection> =
        serde_json::from_str(&raw).context("failed to parse selections")?;
    info!(selections = selections.len(), "loaded selections");

    let fetcher = Arc::new(OddsFetcher::new(&config.odds_api)?);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let engine = OddsEngine::new(fetcher.clone(), cache, config).with_events(event_tx);

    // Event log
    let logger = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                EngineEvent::FetchComplete {
                    event_id,
                    books,
                    from_cache,
                } => debug!(event = %event_id, books, from_cache, "fetch complete"),
                EngineEvent::FetchFailed { event_id, error } => {
                    warn!(event = %event_id, error = %error, "fetch failed")
                }
                EngineEvent::OpportunityDetected(opp) => debug!(
                    event = %opp.key.event_id,
                    market = %opp.key.market_key,
                    arb_pct = format!("{:.2}%", opp.arb_percentage),
                    suspect = opp.suspect,
                    "opportunity"
                ),
                EngineEvent::PassComplete {
                    expected_events,
                    resolved_events,
                    ev_plays,
                    opportunities,
                } => debug!(
                    expected_events,
                    resolved_events, ev_plays, opportunities, "pass event"
                ),
            }
        }
    });

    let result = engine.run_pass(&selections, config.fetch.pass_timeout()).await;
    drop(engine);
    let _ = logger.await;

    let quota = fetcher.quota();
    info!(
        quota_remaining = ?quota.remaining,
        quota_used = ?quota.used,
        session_requests = fetcher.requests_made(),
        "odds API quota"
    );

    let report = result?;
    info!(
        completeness = format!("{:.0}%", report.completeness() * 100.0),
        ev_plays = report.ev_plays.len(),
        opportunities = report.opportunities.len(),
        "report ready"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
