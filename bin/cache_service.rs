//! # Cache Service
//!
//! Standalone demo binary wiring a [`dbcache_core::Cache`] to a stub engine
//! (handles are just counters) and a [`dbcache_core::dispatch::DispatchWorker`]
//! publishing through an in-memory broker. Useful for exercising the crate's
//! behavior under load without a real SQL engine or broker.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin cache_service -- --topic demo
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tokio::signal;

use dbcache_core::cache::Handle;
use dbcache_core::dispatch::broker::test_support::StubBroker;
use dbcache_core::dispatch::DispatchWorker;
use dbcache_core::settings::Settings;
use dbcache_core::Cache;

#[derive(Parser, Debug)]
#[command(name = "cache_service", about = "Demo runner for dbcache-core")]
struct Args {
    /// Broker endpoint (the stub broker ignores this).
    #[arg(long, default_value = "mem://localhost")]
    endpoint: String,

    /// Topic name used for both the cache's only database and the dispatcher.
    #[arg(long, default_value = "demo")]
    topic: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber_init();

    let args = Args::parse();
    let settings = Settings::load()?;

    println!("{}", "dbcache-core demo service starting".bold().green());
    println!(
        "  bases_max_hard={} timeout_open={:?}",
        settings.cache.bases_max_hard,
        settings.cache.timeout_open()
    );

    let cache = Arc::new(Cache::init(settings.cache.clone()));

    // Stub engine: "opening" a handle just allocates the next counter value.
    let next_handle = Arc::new(AtomicU64::new(1));
    cache.set_unlock_hook(Arc::new(|h: Handle| {
        tracing::debug!(handle = h.as_u64(), "unlock hook: releasing engine-level locks");
    }));
    cache.set_close_hook(Arc::new(|h: Handle| {
        tracing::info!(handle = h.as_u64(), "close hook: database closed");
    }));

    let broker = Arc::new(StubBroker::always_ok());
    let dispatcher = DispatchWorker::new(args.endpoint.clone(), args.topic.clone(), broker.clone(), settings.dispatch.clone());
    let dispatch_handle = dispatcher.start();

    let slot = cache.open_and_lock(&args.topic, false, None)?;
    if cache.get_handle(slot).is_none() {
        cache.set_handle(slot, Handle(next_handle.fetch_add(1, Ordering::SeqCst)));
    }
    dispatcher.send(format!("opened slot {slot} for {}", args.topic)).await;
    cache.unlock_and_close(slot, Default::default())?;

    let counts = cache.count();
    println!(
        "  counts: max={} soft_max={} cold={} hot={} used={}",
        counts.max, counts.soft_max, counts.cold, counts.hot, counts.used
    );

    let started_at = Instant::now();
    println!("{}", "ready, press Ctrl+C to stop".dimmed());
    signal::ctrl_c().await?;
    println!("{}", "shutting down...".yellow());

    cache.set_running(false);
    dispatcher.stop();
    let _ = dispatch_handle.await;

    println!(
        "  uptime={:?} events_sent={}",
        started_at.elapsed(),
        dispatcher.total_sent_events()
    );

    Ok(())
}

fn tracing_subscriber_init() {
    #[cfg(feature = "observability")]
    {
        tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
        dbcache_core::metrics::describe();
    }
    #[cfg(not(feature = "observability"))]
    {
        let _ = env_logger::try_init();
    }
}
