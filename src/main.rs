// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:    Configuration structs loaded from JSON (+ env overrides)
// - api:       Rate limiter, request executor and typed game-data client
// - schema:    Stored record shapes
// - store:     Persistence boundary (Redis, in-memory for demo)
// - collector: Per-clan orchestration and the periodic scheduler
// - metrics:   Lock-free runtime counters
// - util:      Shared helpers (tags, time)
//
mod api;
mod collector;
mod config;
mod metrics;
mod schema;
mod store;
mod util;

// ------------------------------------------------------------
// External dependencies
// ------------------------------------------------------------

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use env_logger::Env;
use log::{error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use api::client::GameDataClient;
use api::executor::{RequestExecutor, RetryPolicy, Transport};
use api::rate_limiter::RateLimiter;
use api::transport::HttpTransport;
use collector::orchestrator::{Bootstrap, CollectionOrchestrator, CollectorSettings};
use collector::scheduler::Scheduler;
use config::Config;
use metrics::METRICS;
use store::memory::MemoryStore;
use store::redis_store::RedisStore;
use store::{Collection, Store};

const METRICS_EVERY: Duration = Duration::from_secs(60);

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Load configuration (path from argv, default `config.json`)
// - Wire limiter → executor → client → orchestrator → scheduler
// - Start the periodic metrics reporter
// - Translate Ctrl-C into cancellation
// - Release the HTTP pool and the store on every exit path
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| "config.json".to_string());

    // --------------------------------------------------------
    // Load configuration from disk
    //
    // NOTE:
    // - The config file contains the API key.
    // - It must not be committed to version control.
    // --------------------------------------------------------
    let config = Config::load(&path).with_context(|| format!("loading {path}"))?;

    let level = if config.debug_log() { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    info!("starting clan data collector (config: {})", path);

    let cancel = CancellationToken::new();

    // --------------------------------------------------------
    // API stack
    //
    // One limiter and one pool for the whole process: every
    // request of every clan shares the same token bucket.
    // --------------------------------------------------------
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.api));
    let executor = RequestExecutor::new(
        transport.clone(),
        limiter.clone(),
        RetryPolicy::from_config(&config.api),
        cancel.clone(),
    );
    let client = Arc::new(GameDataClient::new(executor, transport));

    // --------------------------------------------------------
    // Store
    //
    // Demo mode keeps everything in memory and logs each write.
    // --------------------------------------------------------
    let demo = config.store.demo.then(|| Arc::new(MemoryStore::new(true)));
    let store: Arc<dyn Store> = match &demo {
        Some(memory) => memory.clone(),
        None => Arc::new(RedisStore::new(&config.store.url, &config.store.database)?),
    };

    // --------------------------------------------------------
    // Start metrics reporter (periodic, low-noise)
    // --------------------------------------------------------
    {
        let limiter = limiter.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(METRICS_EVERY) => {}
                }
                info!("{} tokens={:.1}", METRICS.summary_line(), limiter.available().await);
            }
        });
    }

    // --------------------------------------------------------
    // Ctrl-C → cooperative shutdown
    // --------------------------------------------------------
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => warn!("shutdown requested, finishing current work"),
                Err(e) => error!("cannot listen for Ctrl-C: {}", e),
            }
            cancel.cancel();
        });
    }

    let orchestrator = Arc::new(CollectionOrchestrator::new(
        client.clone(),
        store.clone(),
        CollectorSettings::from(&config.collection),
        cancel.clone(),
    ));
    let scheduler = Scheduler::new(orchestrator, config.collection.interval(), cancel.clone());

    let boot = Bootstrap {
        seeds: config.collection.tracked_clans.clone(),
        discovery: config.collection.discovery.clone(),
    };
    let stats = scheduler.run(&boot).await;

    // --------------------------------------------------------
    // Shutdown
    // --------------------------------------------------------
    client.close().await;
    store.close().await;

    if let Some(memory) = demo {
        for collection in [
            Collection::ClansHistory,
            Collection::PlayersHistory,
            Collection::WarsHistory,
            Collection::WarAttacks,
            Collection::CapitalRaidsHistory,
            Collection::CwlRounds,
        ] {
            info!("DEMO {}: {} rows", collection, memory.count(collection).await);
        }
    }

    info!(
        "collector stopped: {} cycles, {} failed. {}",
        stats.cycles,
        stats.failed_cycles,
        METRICS.summary_line()
    );
    Ok(())
}
