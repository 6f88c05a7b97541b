//! Payment settlement engine.
//!
//! # Architecture Overview
//!
//! ```text
//!                    ┌────────────────────────────────────────────────────────┐
//!                    │                  SETTLEMENT ENGINE                      │
//!                    │                                                         │
//!   Ledger indexer   │  ┌───────────┐    ┌──────────────┐    ┌─────────────┐  │
//!   ◀───────────────▶┼─▶│ indexer   │───▶│ ChainWatcher │───▶│ Reconciler  │  │
//!   (WebSocket)      │  │ (trait)   │    │ + WatchTable │    │             │  │
//!                    │  └─────▲─────┘    └──────────────┘    └──────┬──────┘  │
//!                    │        │                                     │         │
//!                    │  ┌─────┴─────┐                        ┌──────▼──────┐  │
//!                    │  │  Payout   │                        │ Settlement  │  │
//!                    │  │ sign+send │                        │   store     │  │
//!                    │  └─────▲─────┘                        └──────┬──────┘  │
//!                    │        │                                     │         │
//!                    │  ┌─────┴─────┐                        ┌──────▼──────┐  │   Merchant
//!                    │  │ HdWallet  │                        │ Notifier    │──┼──▶ webhooks
//!                    │  └───────────┘                        │ queue+retry │  │
//!                    │                                       └─────────────┘  │
//!                    │  config · observability · resilience · lifecycle · admin│
//!                    └────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;

use settlement_engine::admin::{self, AdminState};
use settlement_engine::blockchain::allocator::IndexAllocator;
use settlement_engine::blockchain::indexer::build_indexer;
use settlement_engine::blockchain::transaction::Payout;
use settlement_engine::blockchain::wallet::HdWallet;
use settlement_engine::config::load_config;
use settlement_engine::lifecycle::signals::spawn_signal_handler;
use settlement_engine::lifecycle::Shutdown;
use settlement_engine::notifications::{
    notification_queue, HttpTransport, Notifier, NotificationWorker, StaticMerchantDirectory,
};
use settlement_engine::observability::{logging, metrics};
use settlement_engine::payments::{
    ChainWatcher, MemoryStore, ReconcilePolicy, Reconciler, SettlementStore, WatchTable,
};
use settlement_engine::resilience::Backoff;

#[derive(Parser, Debug)]
#[command(name = "settlement-engine", version, about = "BCH payment settlement engine")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "settlement.toml")]
    config: PathBuf,
}

/// Window for in-flight webhooks to finish after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        network = ?config.wallet.network,
        "settlement-engine starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let store: Arc<dyn SettlementStore> = match &config.store.persistence_path {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => {
            tracing::warn!("No store.persistence_path set, settlement state is in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let network = config.wallet.network;
    let wallet = HdWallet::from_env(&config.wallet.seed_env, network, config.wallet.account)?;
    let indexer = build_indexer(&config.indexer, network);
    let allocator = Arc::new(IndexAllocator::new(
        store.clone(),
        config.wallet.allow_degraded_allocation,
    ));
    let payout = Arc::new(Payout::new(
        indexer.clone(),
        wallet.clone(),
        config.signing.fee_rate,
    ));

    let shutdown = Shutdown::new();
    let signal_task = spawn_signal_handler(shutdown.clone());

    let merchants = Arc::new(StaticMerchantDirectory::from_config(&config.merchants));
    tracing::info!(merchants = merchants.len(), "Merchant directory loaded");
    let notifier = Arc::new(Notifier::new(
        store.clone(),
        merchants,
        Arc::new(HttpTransport::new()),
        &config.notifications,
    ));
    let (queue, requests) = notification_queue();
    let worker_task = if config.notifications.enabled {
        let worker = NotificationWorker::new(
            notifier.clone(),
            requests,
            config.notifications.max_concurrent,
            DRAIN_TIMEOUT,
        );
        Some(tokio::spawn(worker.run(shutdown.subscribe())))
    } else {
        tracing::warn!("Webhook notifications disabled");
        drop(requests);
        None
    };

    let table = WatchTable::new();
    let reconciler = Reconciler::new(
        table.clone(),
        store.clone(),
        queue,
        ReconcilePolicy::from(&config.watch),
    );
    let watcher = Arc::new(ChainWatcher::new(
        indexer.clone(),
        store.clone(),
        table,
        reconciler,
        network,
    ));

    let backoff = Backoff::new(
        config.indexer.reconnect_base_delay_ms,
        config.indexer.reconnect_max_delay_ms,
    );
    let supervisor_task = tokio::spawn(watcher.clone().supervise(backoff, shutdown.subscribe()));
    watcher.start_polling(Duration::from_millis(config.watch.poll_interval_ms));

    let admin_task = if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let state = AdminState {
            watcher: watcher.clone(),
            store: store.clone(),
            notifier,
            allocator,
            wallet,
            payout,
            api_key: Arc::from(config.admin.api_key.as_str()),
            started_at: Instant::now(),
        };
        Some(tokio::spawn(admin::serve(listener, state, shutdown.subscribe())))
    } else {
        None
    };

    // Park until a signal fires the shutdown broadcast.
    let mut done = shutdown.subscribe();
    let _ = done.recv().await;
    tracing::info!("Shutting down");

    watcher.stop_polling();
    if let Err(e) = supervisor_task.await {
        tracing::error!(error = %e, "Watcher supervisor panicked");
    }
    if let Some(task) = admin_task {
        match task.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Admin API failed"),
            Err(e) => tracing::error!(error = %e, "Admin API task panicked"),
            Ok(Ok(())) => {}
        }
    }
    drop(watcher);
    if let Some(task) = worker_task {
        let _ = task.await;
    }
    signal_task.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
