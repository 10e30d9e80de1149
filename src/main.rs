// =============================================================================
// Aethelgard Engine — composition root
// =============================================================================
//
// Builds Storage, the Data Provider Manager, the Scanner, the Signal Factory,
// the Risk Manager, the Position Manager, the Order Executor, the Trade
// Closure Listener, the EDGE Tuner, and the Main Orchestrator exactly once,
// wires them together by reference, and spawns each long-running loop (the
// Scanner coordinator, the Orchestrator cycle, and the periodic backup task)
// as its own supervised task. Shutdown is cooperative: Ctrl-C flips a shared
// stop flag observed by each loop's own chunked sleep, and the process exits
// only once every loop has acknowledged.
//
// The HTTP/WebSocket API surface, auth gateway, and notification providers
// named in the engine's non-goals are not composed here — they are external
// collaborators the engine exposes Storage and metrics to, not something
// this binary serves itself.

mod binance;
mod broker;
mod config;
mod data_provider;
mod error;
mod executor;
mod indicators;
mod listener;
mod market_data;
mod orchestrator;
mod position_engine;
mod regime;
mod risk;
mod scanner;
mod signal_factory;
mod signals;
mod storage;
mod tuner;
mod types;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use broker::{BinanceBrokerConnector, BrokerConnector};
use config::EngineConfig;
use data_provider::DataProviderManager;
use executor::OrderExecutor;
use listener::TradeClosureListener;
use orchestrator::MainOrchestrator;
use position_engine::PositionManager;
use risk::RiskEngine;
use scanner::Scanner;
use signal_factory::SignalFactory;
use storage::{DataProviderRow, Storage};
use tuner::EdgeTuner;

const CONFIG_PATH: &str = "engine_config.json";
const DB_PATH: &str = "aethelgard.db";

/// Periodic backup task: creates a fresh backup once per `interval_days` and
/// prunes anything past `retention_days`, sleeping in one-hour increments so
/// a shutdown signal is noticed promptly rather than after a multi-day sleep.
async fn run_backup_loop(storage: Arc<Storage>, backup_cfg: config::BackupConfig, stop: Arc<std::sync::atomic::AtomicBool>) {
    use std::sync::atomic::Ordering;

    if !backup_cfg.enabled {
        info!("backup loop disabled via config");
        return;
    }

    let interval_secs = (backup_cfg.interval_days.max(1) as u64) * 24 * 3600;
    loop {
        let mut slept = 0u64;
        while slept < interval_secs {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            slept += 3600;
        }

        match storage.create_db_backup(&backup_cfg.backup_dir) {
            Ok(Some(path)) => info!(path = %path.display(), "database backup created"),
            Ok(None) => info!("database backup skipped, nothing to back up"),
            Err(e) => warn!(error = %e, "database backup failed"),
        }

        match storage.prune_old_backups(&backup_cfg.backup_dir, 30, backup_cfg.retention_days as i64) {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "pruned old database backups");
                }
            }
            Err(e) => warn!(error = %e, "failed to prune old database backups"),
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Loads the bootstrap config from disk, falling back to coded defaults with
/// a warning when the file is absent or unparseable — the engine never
/// panics on a missing or partial config.
fn load_config() -> EngineConfig {
    match EngineConfig::load(CONFIG_PATH) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, "engine config not found or invalid, starting from defaults");
            EngineConfig::default()
        }
    }
}

/// Seeds a single system "binance" data provider row if the table is empty,
/// so the Scanner's `only_system` fetch has something to select on first
/// boot rather than relying on the manager's transient fallback provider.
fn seed_default_data_provider(storage: &Storage) {
    match storage.get_data_providers() {
        Ok(rows) if !rows.is_empty() => return,
        Err(e) => {
            warn!(error = %e, "failed to check existing data providers, skipping seed");
            return;
        }
        _ => {}
    }

    let row = DataProviderRow {
        name: "binance".to_string(),
        provider_type: "binance".to_string(),
        enabled: true,
        priority: 100,
        requires_auth: false,
        api_key: None,
        api_secret: None,
        additional_config: serde_json::json!({}),
        is_system: true,
    };
    storage.save_data_provider(&row);
    info!("seeded default binance data provider");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging();
    info!("aethelgard engine starting");

    let config = load_config();
    if config.trading_mode == types::TradingMode::Killed {
        warn!("trading mode is Killed, engine will not place orders this session");
    }

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY / BINANCE_API_SECRET not set, running with empty credentials");
    }

    let storage = Arc::new(Storage::open(DB_PATH)?);
    seed_default_data_provider(&storage);

    let binance_client = Arc::new(binance::client::BinanceClient::new(api_key, api_secret));
    let providers = Arc::new(DataProviderManager::new(storage.clone(), binance_client.clone()));

    let scanner = Arc::new(Scanner::new(
        storage.clone(),
        providers,
        config.symbols.clone(),
        config.scanner.clone(),
    ));

    let signal_factory = SignalFactory::new(0.15);

    let risk = Arc::new(RiskEngine::new(
        10_000.0,
        config.max_daily_loss_pct / 100.0,
        config.max_consecutive_losses,
        0.10,
        config.max_trades_per_day,
    ));

    let position_manager = Arc::new(PositionManager::new(storage.clone(), config.position_manager.clone()));

    let broker: Arc<dyn BrokerConnector> = Arc::new(BinanceBrokerConnector::new(binance_client));
    if !broker.connect().await {
        warn!("broker connect() reported failure, continuing — subsequent calls will surface errors");
    }

    let executor = Arc::new(OrderExecutor::new(storage.clone(), broker.clone()));
    let tuner = Arc::new(EdgeTuner::new(storage.clone(), config.tuner.clone()));
    let listener = Arc::new(TradeClosureListener::new(
        storage.clone(),
        risk.clone(),
        tuner,
        config.listener.clone(),
    ));

    let orchestrator = Arc::new(MainOrchestrator::new(
        storage.clone(),
        scanner.clone(),
        signal_factory,
        risk,
        position_manager,
        executor,
        listener,
        broker,
        config.strategy_params.clone(),
        config.orchestrator.clone(),
    ));

    let backup_stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let backup_task = tokio::spawn({
        let storage = storage.clone();
        let backup_cfg = config.backup.clone();
        let backup_stop = backup_stop.clone();
        async move {
            run_backup_loop(storage, backup_cfg, backup_stop).await;
        }
    });

    let scanner_task = tokio::spawn({
        let scanner = scanner.clone();
        let params = config.classifier.clone();
        let bars_count = config.scanner.bars_count;
        async move {
            scanner.run(params, bars_count).await;
        }
    });

    let orchestrator_task = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            orchestrator.run().await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping loops");

    scanner.stop();
    orchestrator.stop();
    backup_stop.store(true, std::sync::atomic::Ordering::SeqCst);

    let _ = tokio::join!(scanner_task, orchestrator_task, backup_task);

    if let Err(e) = config.save(CONFIG_PATH) {
        warn!(error = %e, "failed to persist engine config on shutdown");
    }

    info!("aethelgard engine stopped");
    Ok(())
}
