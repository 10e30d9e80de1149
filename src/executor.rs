// =============================================================================
// Order Executor — translates validated signals into broker orders
// =============================================================================
//
// Sits between the Main Orchestrator (which has already run a signal through
// the Risk Manager) and a concrete `BrokerConnector`. Its only additional
// gate is the Shadow Ranking execution mode: a strategy id missing from the
// ranking table is allowed to trade (legacy default), `SHADOW` strategies are
// recorded as if executed but never reach the broker, and `QUARANTINE`
// strategies are blocked outright.

use std::sync::Arc;

use tracing::{info, warn};

use crate::broker::{BrokerConnector, ExecutionResult as BrokerExecutionResult};
use crate::storage::Storage;
use crate::types::{ExecutionMode, Signal, SignalStatus};

/// Outcome of routing one signal through the executor.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Order accepted by the broker.
    Filled { ticket: String },
    /// Shadow-mode strategy: recorded but never sent to the broker.
    Shadowed,
    /// Quarantined strategy: blocked before reaching the broker.
    Quarantined,
    /// Rejected by the broker or by a pre-flight check.
    Rejected { reason: String },
}

impl ExecutionOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, Self::Filled { .. })
    }
}

/// Wraps a `BrokerConnector` with the Shadow Ranking gate and signal status
/// bookkeeping (§4.5 step 10).
pub struct OrderExecutor {
    storage: Arc<Storage>,
    broker: Arc<dyn BrokerConnector>,
}

impl OrderExecutor {
    pub fn new(storage: Arc<Storage>, broker: Arc<dyn BrokerConnector>) -> Self {
        Self { storage, broker }
    }

    /// Executes one signal, self-persisting its resulting status so callers
    /// never need a separate `update_signal_status` round-trip.
    pub async fn execute_signal(&self, signal: &Signal) -> ExecutionOutcome {
        let mode = self
            .storage
            .get_execution_mode(&signal.strategy_id)
            .unwrap_or(ExecutionMode::Live);

        match mode {
            ExecutionMode::Quarantine => {
                info!(strategy_id = %signal.strategy_id, signal_id = %signal.id, "signal quarantined, not executed");
                self.storage.update_signal_status(&signal.id, SignalStatus::Expired);
                ExecutionOutcome::Quarantined
            }
            ExecutionMode::Shadow => {
                info!(strategy_id = %signal.strategy_id, signal_id = %signal.id, "signal shadowed, recorded without execution");
                self.storage.update_signal_status(&signal.id, SignalStatus::Executed);
                ExecutionOutcome::Shadowed
            }
            ExecutionMode::Live => self.execute_live(signal).await,
        }
    }

    async fn execute_live(&self, signal: &Signal) -> ExecutionOutcome {
        match self.broker.execute_order(signal).await {
            Ok(BrokerExecutionResult::Filled { ticket }) => {
                info!(symbol = %signal.symbol, ticket, "signal executed");
                self.storage.update_signal_status(&signal.id, SignalStatus::Executed);
                ExecutionOutcome::Filled { ticket }
            }
            Ok(BrokerExecutionResult::Rejected { reason }) => {
                warn!(symbol = %signal.symbol, reason = %reason, "signal rejected by broker");
                self.storage.update_signal_status(&signal.id, SignalStatus::Expired);
                ExecutionOutcome::Rejected { reason }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(symbol = %signal.symbol, error = %reason, "signal execution errored");
                self.storage.update_signal_status(&signal.id, SignalStatus::Expired);
                ExecutionOutcome::Rejected { reason }
            }
        }
    }

    /// Most recent rejection reason surfaced by the underlying connector, for
    /// operator diagnostics (§4 Design Notes: "rejected signals carry a
    /// `last_rejection_reason`").
    pub fn last_rejection_reason(&self) -> Option<String> {
        self.broker.last_rejection_reason()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::types::{BrokerPosition, BrokerTradeClosedEvent, Regime, SignalType, Timeframe};
    use parking_lot::RwLock;

    struct FakeBroker {
        result: RwLock<Option<BrokerExecutionResult>>,
        rejection: RwLock<Option<String>>,
    }

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
        async fn get_closed_positions(&self, _hours: u32) -> Result<Vec<BrokerTradeClosedEvent>, ProviderError> {
            Ok(Vec::new())
        }
        async fn get_account_balance(&self) -> Result<f64, ProviderError> {
            Ok(1000.0)
        }
        async fn execute_order(&self, _signal: &Signal) -> Result<BrokerExecutionResult, ProviderError> {
            match self.result.read().clone() {
                Some(r) => Ok(r),
                None => Ok(BrokerExecutionResult::Rejected { reason: "no result configured".to_string() }),
            }
        }
        fn last_rejection_reason(&self) -> Option<String> {
            self.rejection.read().clone()
        }
    }

    fn sample_signal(strategy_id: &str) -> Signal {
        Signal {
            id: "sig-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            signal_type: SignalType::Buy,
            timeframe: Timeframe::M5,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            confidence: 0.8,
            strategy_id: strategy_id.to_string(),
            connector_type: "binance".to_string(),
            regime: Regime::Trend,
            metadata: serde_json::json!({"quantity": 1.0}),
            timestamp: 1_700_000_000_000,
            trace_id: "trace-1".to_string(),
            status: SignalStatus::Pending,
        }
    }

    #[tokio::test]
    async fn live_mode_executes_and_persists_status() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let signal = sample_signal("strat-a");
        storage.save_signal(&signal);

        let broker = Arc::new(FakeBroker {
            result: RwLock::new(Some(BrokerExecutionResult::Filled { ticket: "T-1".to_string() })),
            rejection: RwLock::new(None),
        });
        let executor = OrderExecutor::new(storage.clone(), broker);

        let outcome = executor.execute_signal(&signal).await;
        assert!(outcome.is_filled());
        let stored = storage.get_signal_by_id("sig-1").unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Executed);
    }

    #[tokio::test]
    async fn shadow_mode_records_without_calling_broker() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let signal = sample_signal("strat-shadow");
        storage.save_signal(&signal);
        storage.set_execution_mode("strat-shadow", ExecutionMode::Shadow);

        let broker = Arc::new(FakeBroker {
            result: RwLock::new(Some(BrokerExecutionResult::Filled { ticket: "T-2".to_string() })),
            rejection: RwLock::new(None),
        });
        let executor = OrderExecutor::new(storage.clone(), broker);

        let outcome = executor.execute_signal(&signal).await;
        assert!(matches!(outcome, ExecutionOutcome::Shadowed));
        let stored = storage.get_signal_by_id("sig-1").unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Executed);
    }

    #[tokio::test]
    async fn quarantine_mode_blocks_execution() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let signal = sample_signal("strat-bad");
        storage.save_signal(&signal);
        storage.set_execution_mode("strat-bad", ExecutionMode::Quarantine);

        let broker = Arc::new(FakeBroker {
            result: RwLock::new(Some(BrokerExecutionResult::Filled { ticket: "T-3".to_string() })),
            rejection: RwLock::new(None),
        });
        let executor = OrderExecutor::new(storage.clone(), broker);

        let outcome = executor.execute_signal(&signal).await;
        assert!(matches!(outcome, ExecutionOutcome::Quarantined));
        let stored = storage.get_signal_by_id("sig-1").unwrap().unwrap();
        assert_eq!(stored.status, SignalStatus::Expired);
    }

    #[tokio::test]
    async fn missing_ranking_entry_defaults_to_live() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let signal = sample_signal("unranked-strat");
        storage.save_signal(&signal);

        let broker = Arc::new(FakeBroker {
            result: RwLock::new(Some(BrokerExecutionResult::Filled { ticket: "T-4".to_string() })),
            rejection: RwLock::new(None),
        });
        let executor = OrderExecutor::new(storage, broker);

        let outcome = executor.execute_signal(&signal).await;
        assert!(outcome.is_filled());
    }
}
