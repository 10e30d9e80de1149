// =============================================================================
// Main Orchestrator — the outer scan -> signal -> risk -> execute -> monitor loop
// =============================================================================
//
// Composes every other component into the 13-step cycle of §4.5: reload
// toggles, roll session stats over the date boundary, expire stale pending
// signals, run one position-monitoring pass, pull scan snapshots, mint
// signals, filter through Risk, gate through the Shadow Ranking executor,
// drain closed-position events to the Listener, persist, sleep.
//
// The adaptive heartbeat (§4.5a) picks a base sleep from the current rolled-up
// regime and shortens it whenever last cycle left active (not yet closed)
// positions behind, so monitoring stays tight while a trade is live.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::BrokerConnector;
use crate::config::{OrchestratorConfig, StrategyParams};
use crate::executor::{ExecutionOutcome, OrderExecutor};
use crate::listener::TradeClosureListener;
use crate::position_engine::PositionManager;
use crate::risk::RiskEngine;
use crate::scanner::Scanner;
use crate::signal_factory::SignalFactory;
use crate::storage::Storage;
use crate::types::{ExitReason, Regime, SessionStats, Signal, SignalStatus, Timeframe, TradeOutcome};

const MIN_SLEEP_INTERVAL_SECS: u64 = 3;

/// How long a PENDING signal may sit unexecuted before it is expired,
/// expressed as a multiple of its own timeframe (three bars' worth of time —
/// long enough for a normal execution delay, short enough that a genuinely
/// stuck signal does not linger across the next several cycles).
fn pending_expiry_secs(tf: Timeframe) -> i64 {
    let bar_secs: i64 = match tf {
        Timeframe::M1 => 60,
        Timeframe::M5 => 300,
        Timeframe::M15 => 900,
        Timeframe::M30 => 1800,
        Timeframe::H1 => 3600,
        Timeframe::H4 => 14_400,
        Timeframe::D1 => 86_400,
        Timeframe::W1 => 604_800,
        Timeframe::MN1 => 2_592_000,
    };
    bar_secs * 3
}

fn exit_reason_for(close_reason: &str) -> ExitReason {
    match close_reason {
        "StopLoss" | "TrailingStop" => ExitReason::StopLossHit,
        "TakeProfit2" => ExitReason::TakeProfitHit,
        _ => ExitReason::Other,
    }
}

fn rfc3339_millis(s: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(s).map(|d| d.timestamp_millis()).unwrap_or(0)
}

/// Everything the orchestrator needs to size and validate a newly-minted
/// signal, hot-reloadable without restarting the process.
struct Tunables {
    strategy_params: StrategyParams,
    orchestrator: OrchestratorConfig,
}

pub struct MainOrchestrator {
    storage: Arc<Storage>,
    scanner: Arc<Scanner>,
    signal_factory: SignalFactory,
    risk: Arc<RiskEngine>,
    position_manager: Arc<PositionManager>,
    executor: Arc<OrderExecutor>,
    listener: Arc<TradeClosureListener>,
    broker: Arc<dyn BrokerConnector>,
    connector_type: String,
    tunables: RwLock<Tunables>,
    current_regime: RwLock<Regime>,
    session: RwLock<SessionStats>,
    had_active_signals: AtomicBool,
    stop: AtomicBool,
}

impl MainOrchestrator {
    /// Assembles the orchestrator and reconstructs `SessionStats` from
    /// Storage (§11: this must happen once during composition, before the
    /// first cycle, not merely on a mid-run date rollover).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        scanner: Arc<Scanner>,
        signal_factory: SignalFactory,
        risk: Arc<RiskEngine>,
        position_manager: Arc<PositionManager>,
        executor: Arc<OrderExecutor>,
        listener: Arc<TradeClosureListener>,
        broker: Arc<dyn BrokerConnector>,
        strategy_params: StrategyParams,
        orchestrator_config: OrchestratorConfig,
    ) -> Self {
        let connector_type = broker.connector_type().to_string();
        let session = reconstruct_session_stats(&storage);

        Self {
            storage,
            scanner,
            signal_factory,
            risk,
            position_manager,
            executor,
            listener,
            broker,
            connector_type,
            tunables: RwLock::new(Tunables { strategy_params, orchestrator: orchestrator_config }),
            current_regime: RwLock::new(Regime::Normal),
            session: RwLock::new(session),
            had_active_signals: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.read().clone()
    }

    /// Runs cycles until `stop()` is called, then persists shutdown state.
    pub async fn run(self: Arc<Self>) {
        info!("orchestrator starting");
        loop {
            if self.is_stopped() {
                break;
            }
            self.run_cycle().await;
            if self.is_stopped() {
                break;
            }
            self.adaptive_sleep().await;
        }
        self.persist_shutdown_state();
        info!("orchestrator stopped");
    }

    async fn run_cycle(&self) {
        // 1. Reload module toggles (resolved fresh every cycle; no caching).
        let scanner_enabled = self.storage.resolve_module_enabled(None, "scanner");
        let executor_enabled = self.storage.resolve_module_enabled(None, "executor");
        let position_manager_enabled = self.storage.resolve_module_enabled(None, "position_manager");

        // 2. Roll session stats over a date change; heartbeat.
        self.maybe_roll_session();
        self.storage.update_module_heartbeat("orchestrator");

        // 3. Expire stale PENDING signals.
        self.expire_stale_signals();

        // 4. Position monitoring pass.
        if position_manager_enabled {
            self.run_position_monitoring_pass().await;
        }

        // 5. Scanner disabled: bump cycle counter and return early.
        if !scanner_enabled {
            self.session.write().cycles_completed += 1;
            return;
        }

        // 6. Scan snapshots; roll up current_regime.
        let snapshots = self.scanner.snapshot_all();
        {
            let mut session = self.session.write();
            session.scans_total += snapshots.len() as u64;
        }
        let regime = snapshots
            .iter()
            .fold(Regime::Range, |acc, s| acc.most_aggressive(s.regime));
        *self.current_regime.write() = regime;

        // 7. Mint trace_id; generate signals.
        let trace_id = Uuid::new_v4().to_string();
        let tunables = self.tunables.read();
        let strategy_params = tunables.strategy_params.clone();
        drop(tunables);

        let account_balance = self.broker.get_account_balance().await.unwrap_or(0.0);

        let mut candidates = Vec::new();
        for snapshot in &snapshots {
            let Some(bars) = self.scanner.last_bars(&snapshot.symbol, snapshot.timeframe) else {
                continue;
            };
            if let Some(signal) = self.signal_factory.generate(
                snapshot,
                &bars,
                &strategy_params,
                &self.connector_type,
                account_balance,
                &trace_id,
            ) {
                candidates.push(signal);
            }
        }
        self.session.write().signals_generated += candidates.len() as u64;

        // 8. Filter through Risk Manager.
        let mut validated = Vec::new();
        for signal in candidates {
            self.session.write().signals_processed += 1;
            match self.risk.validate_signal(&signal) {
                Ok(()) => {
                    self.session.write().signals_risk_passed += 1;
                    validated.push(signal);
                }
                Err(reason) => {
                    debug!(symbol = %signal.symbol, reason, "signal vetoed by risk manager");
                    self.session.write().signals_vetoed += 1;
                }
            }
        }

        // 9. Lockdown check.
        if self.risk.is_lockdown_active() {
            warn!("risk lockdown active, skipping execution this cycle");
            self.persist_session();
            self.session.write().cycles_completed += 1;
            return;
        }

        // 10. Execute validated signals (unless the executor is disabled).
        let mut any_filled = false;
        if executor_enabled {
            for signal in &validated {
                self.storage.save_signal(signal);
                match self.executor.execute_signal(signal).await {
                    ExecutionOutcome::Filled { .. } => {
                        any_filled = true;
                        if let Some(qty) = signal.metadata.get("quantity").and_then(|v| v.as_f64()) {
                            self.position_manager.open_position(
                                &signal.symbol,
                                &signal.signal_type.to_string(),
                                signal.entry_price,
                                qty,
                                signal.stop_loss,
                                signal.take_profit,
                                extrapolated_tp2(signal),
                            );
                        }
                    }
                    ExecutionOutcome::Rejected { reason } => {
                        warn!(symbol = %signal.symbol, reason, "signal execution rejected");
                        self.session.write().errors_count += 1;
                    }
                    ExecutionOutcome::Shadowed | ExecutionOutcome::Quarantined => {}
                }
            }
        } else {
            for signal in &validated {
                self.storage.save_signal(signal);
            }
        }
        self.had_active_signals.store(any_filled || !self.position_manager.get_open_positions().is_empty(), Ordering::SeqCst);

        // 11. Drain closed-position events from the broker connector.
        if let Ok(events) = self.broker.get_closed_positions(24).await {
            for event in &events {
                self.listener.handle_trade_closed_event(event).await;
            }
        }

        // 12. Persist session stats.
        self.persist_session();
        self.session.write().cycles_completed += 1;
    }

    /// Runs the Position Manager's update-then-close sweep and funnels every
    /// fully-closed position into the Trade Closure Listener as a synthetic
    /// closed-trade event — the only source of closures for a spot connector,
    /// whose `get_closed_positions` always returns empty (§6).
    async fn run_position_monitoring_pass(&self) {
        let scanner = &self.scanner;
        let closed = self.position_manager.run_monitoring_pass(|symbol| {
            scanner
                .last_bars(symbol, Timeframe::M5)
                .and_then(|bars| bars.last().map(|b| b.close))
        });

        for pos in closed {
            let reason = pos.close_reason.clone().unwrap_or_default();
            let event = crate::types::BrokerTradeClosedEvent {
                ticket: format!("position-{}", pos.id),
                signal_id: None,
                symbol: pos.symbol.clone(),
                entry_price: pos.entry_price,
                exit_price: pos.current_price,
                entry_time: rfc3339_millis(&pos.opened_at),
                exit_time: pos.closed_at.as_deref().map(rfc3339_millis).unwrap_or_else(|| Utc::now().timestamp_millis()),
                profit_loss: pos.realized_pnl,
                pips: 0.0,
                result: TradeOutcome::from_pnl(pos.realized_pnl),
                exit_reason: exit_reason_for(&reason),
                broker_id: self.connector_type.clone(),
                metadata: serde_json::json!({"close_reason": reason}),
            };
            self.listener.handle_trade_closed_event(&event).await;
        }
    }

    fn expire_stale_signals(&self) {
        let Ok(signals) = self.storage.get_recent_signals(None, 2_000) else {
            return;
        };
        let now_ms = Utc::now().timestamp_millis();
        for signal in signals.iter().filter(|s| s.status == SignalStatus::Pending) {
            let window_ms = pending_expiry_secs(signal.timeframe) * 1000;
            if now_ms - signal.timestamp >= window_ms {
                self.storage.update_signal_status(&signal.id, SignalStatus::Expired);
                debug!(signal_id = %signal.id, symbol = %signal.symbol, "pending signal expired");
            }
        }
    }

    fn maybe_roll_session(&self) {
        let today = Utc::now().date_naive();
        let needs_roll = self.session.read().date != today;
        if needs_roll {
            *self.session.write() = reconstruct_session_stats(&self.storage);
        }
    }

    fn persist_session(&self) {
        let stats = self.session.read().clone();
        let mut partial = HashMap::new();
        partial.insert("session_stats".to_string(), serde_json::to_value(&stats).unwrap_or_default());
        self.storage.update_system_state(&partial);
    }

    fn persist_shutdown_state(&self) {
        let risk_state = self.risk.get_state();
        let mut partial = HashMap::new();
        partial.insert("last_shutdown".to_string(), serde_json::json!(Utc::now().to_rfc3339()));
        partial.insert("lockdown_active".to_string(), serde_json::json!(self.risk.is_lockdown_active()));
        partial.insert("consecutive_losses".to_string(), serde_json::json!(risk_state.consecutive_losses));
        partial.insert("last_regime".to_string(), serde_json::json!(self.current_regime.read().as_str()));
        partial.insert("session_stats".to_string(), serde_json::to_value(self.session.read().clone()).unwrap_or_default());
        self.storage.update_system_state(&partial);
        info!("orchestrator shutdown state persisted");
    }

    /// §4.5a: base sleep by current regime, shortened to the minimum interval
    /// whenever last cycle left live positions behind. Consumed in 1-second
    /// quanta so a shutdown signal is honored within a second.
    async fn adaptive_sleep(&self) {
        let base_secs = {
            let tunables = self.tunables.read();
            match *self.current_regime.read() {
                Regime::Trend => tunables.orchestrator.loop_interval_trend,
                Regime::Range => tunables.orchestrator.loop_interval_range,
                Regime::Normal => tunables.orchestrator.loop_interval_volatile,
                Regime::Crash => tunables.orchestrator.loop_interval_shock,
            }
        };

        let capped = if self.had_active_signals.load(Ordering::SeqCst) {
            base_secs.min(MIN_SLEEP_INTERVAL_SECS)
        } else {
            base_secs
        };

        let mut remaining = capped;
        while remaining > 0 {
            if self.is_stopped() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            remaining -= 1;
        }
    }
}

/// Spot signals carry a single take-profit; TP2 is derived by doubling the
/// TP1 distance from entry, matching the 2x relationship between
/// `tp1_atr_multiplier` and `tp2_atr_multiplier`'s defaults (2.5 / 4.0 ≈ 1.6x,
/// rounded up to a clean 2x for the Position Manager's wider bracket target).
fn extrapolated_tp2(signal: &Signal) -> f64 {
    let tp1_distance = (signal.take_profit - signal.entry_price).abs();
    if signal.take_profit >= signal.entry_price {
        signal.entry_price + tp1_distance * 2.0
    } else {
        signal.entry_price - tp1_distance * 2.0
    }
}

fn reconstruct_session_stats(storage: &Storage) -> SessionStats {
    let today = Utc::now().date_naive();
    let persisted = storage
        .get_system_state()
        .ok()
        .and_then(|m| m.get("session_stats").cloned())
        .and_then(|v| serde_json::from_value::<SessionStats>(v).ok())
        .filter(|s| s.date == today);

    let mut stats = persisted.unwrap_or_else(|| SessionStats::new(today));
    stats.signals_executed = storage.count_executed_signals(today).unwrap_or(0);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ExecutionResult as BrokerExecutionResult;
    use crate::config::{PositionManagerConfig, ScannerConfig, TunerConfig};
    use crate::data_provider::DataProviderManager;
    use crate::error::ProviderError;
    use crate::tuner::EdgeTuner;
    use crate::types::BrokerPosition;

    struct FakeBroker;

    #[async_trait::async_trait]
    impl BrokerConnector for FakeBroker {
        fn connector_type(&self) -> &'static str {
            "fake"
        }
        async fn connect(&self) -> bool {
            true
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, ProviderError> {
            Ok(Vec::new())
        }
        async fn get_closed_positions(&self, _hours: u32) -> Result<Vec<crate::types::BrokerTradeClosedEvent>, ProviderError> {
            Ok(Vec::new())
        }
        async fn get_account_balance(&self) -> Result<f64, ProviderError> {
            Ok(1000.0)
        }
        async fn execute_order(&self, _signal: &Signal) -> Result<BrokerExecutionResult, ProviderError> {
            Ok(BrokerExecutionResult::Filled { ticket: "T-1".to_string() })
        }
        fn last_rejection_reason(&self) -> Option<String> {
            None
        }
    }

    fn build() -> Arc<MainOrchestrator> {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let client = Arc::new(crate::binance::client::BinanceClient::new("k", "s"));
        let providers = Arc::new(DataProviderManager::new(storage.clone(), client));
        let scanner = Arc::new(Scanner::new(storage.clone(), providers, vec!["BTCUSDT".to_string()], ScannerConfig::default()));
        let risk = Arc::new(RiskEngine::new(1000.0, 0.03, 5, 0.05, 50));
        let position_manager = Arc::new(PositionManager::new(storage.clone(), PositionManagerConfig::default()));
        let broker: Arc<dyn BrokerConnector> = Arc::new(FakeBroker);
        let executor = Arc::new(OrderExecutor::new(storage.clone(), broker.clone()));
        let tuner = Arc::new(EdgeTuner::new(storage.clone(), TunerConfig::default()));
        let listener = Arc::new(TradeClosureListener::new(storage.clone(), risk.clone(), tuner, crate::config::ListenerConfig::default()));

        Arc::new(MainOrchestrator::new(
            storage,
            scanner,
            SignalFactory::new(0.05),
            risk,
            position_manager,
            executor,
            listener,
            broker,
            StrategyParams::default(),
            OrchestratorConfig::default(),
        ))
    }

    #[test]
    fn pending_expiry_scales_with_timeframe() {
        assert_eq!(pending_expiry_secs(Timeframe::M5), 900);
        assert!(pending_expiry_secs(Timeframe::H1) > pending_expiry_secs(Timeframe::M5));
    }

    #[test]
    fn exit_reason_mapping_covers_known_reasons() {
        assert_eq!(exit_reason_for("StopLoss"), ExitReason::StopLossHit);
        assert_eq!(exit_reason_for("TakeProfit2"), ExitReason::TakeProfitHit);
        assert_eq!(exit_reason_for("Stale"), ExitReason::Other);
    }

    #[tokio::test]
    async fn boot_reconstructs_session_stats_from_storage() {
        let orchestrator = build();
        let stats = orchestrator.session_stats();
        assert_eq!(stats.date, Utc::now().date_naive());
        assert_eq!(stats.signals_executed, 0);
    }

    #[tokio::test]
    async fn empty_scan_cycle_completes_without_panicking() {
        let orchestrator = build();
        orchestrator.run_cycle().await;
        assert_eq!(orchestrator.session_stats().cycles_completed, 1);
    }

    #[tokio::test]
    async fn scanner_disabled_skips_scan_but_still_completes_cycle() {
        let orchestrator = build();
        orchestrator.storage.set_global_module_enabled("scanner", false);
        orchestrator.run_cycle().await;
        assert_eq!(orchestrator.session_stats().cycles_completed, 1);
        assert_eq!(orchestrator.session_stats().scans_total, 0);
    }
}
