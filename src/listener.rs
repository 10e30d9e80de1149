// =============================================================================
// Trade Closure Listener — idempotent ingestion of broker closed-trade events
// =============================================================================
//
// Contract (§4.6): validate event kind, dedupe on ticket, persist with bounded
// retry, update the Risk Manager only on a successful persist (to avoid
// double-counting a result that never actually landed), and invoke the EDGE
// Tuner every few saved trades or on a deepening loss streak.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ListenerConfig;
use crate::error::WriteOutcome;
use crate::risk::RiskEngine;
use crate::storage::Storage;
use crate::tuner::EdgeTuner;
use crate::types::{BrokerTradeClosedEvent, TradeResult};

/// Saved trades between automatic Tuner invocations.
const TUNER_TRADE_INTERVAL: u64 = 5;

#[derive(Debug, Default)]
pub struct ListenerMetrics {
    pub processed: u64,
    pub saved: u64,
    pub failed: u64,
    pub tuner_adjustments: u64,
}

impl ListenerMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.saved as f64 / self.processed as f64
        }
    }
}

struct Counters {
    processed: AtomicU64,
    saved: AtomicU64,
    failed: AtomicU64,
    tuner_adjustments: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            processed: AtomicU64::new(0),
            saved: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            tuner_adjustments: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> ListenerMetrics {
        ListenerMetrics {
            processed: self.processed.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            tuner_adjustments: self.tuner_adjustments.load(Ordering::Relaxed),
        }
    }
}

pub struct TradeClosureListener {
    storage: Arc<Storage>,
    risk: Arc<RiskEngine>,
    tuner: Arc<EdgeTuner>,
    config: ListenerConfig,
    counters: Counters,
}

impl TradeClosureListener {
    pub fn new(storage: Arc<Storage>, risk: Arc<RiskEngine>, tuner: Arc<EdgeTuner>, config: ListenerConfig) -> Self {
        Self {
            storage,
            risk,
            tuner,
            config,
            counters: Counters::new(),
        }
    }

    pub fn metrics(&self) -> ListenerMetrics {
        self.counters.snapshot()
    }

    /// Handles one closed-trade event. Returns `true` on success (including
    /// the idempotent no-op case of a duplicate delivery).
    pub async fn handle_trade_closed_event(&self, event: &BrokerTradeClosedEvent) -> bool {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        match self.storage.trade_exists(&event.ticket) {
            Ok(true) => {
                info!(ticket = %event.ticket, "duplicate trade closure event, already recorded");
                return true;
            }
            Err(e) => {
                warn!(ticket = %event.ticket, error = %e, "failed to check trade idempotence, proceeding cautiously");
            }
            Ok(false) => {}
        }

        let trade = TradeResult {
            ticket: event.ticket.clone(),
            signal_id: event.signal_id.clone(),
            symbol: event.symbol.clone(),
            entry_price: event.entry_price,
            exit_price: event.exit_price,
            entry_time: event.entry_time,
            exit_time: event.exit_time,
            profit_loss: event.profit_loss,
            pips: event.pips,
            exit_reason: event.exit_reason,
            result: event.result,
            broker_id: event.broker_id.clone(),
            metadata: event.metadata.clone(),
        };

        if !self.persist_with_retry(&trade).await {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.counters.saved.fetch_add(1, Ordering::Relaxed);
        self.risk.record_outcome(trade.result.is_win(), trade.profit_loss);
        let lockdown = self.risk.is_lockdown_active();

        info!(
            ticket = %trade.ticket,
            symbol = %trade.symbol,
            pnl = trade.profit_loss,
            lockdown_active = lockdown,
            "trade closure recorded"
        );

        let consecutive_losses = self.risk.get_state().consecutive_losses;
        let saved = self.counters.saved.load(Ordering::Relaxed);
        if saved % TUNER_TRADE_INTERVAL == 0 || consecutive_losses >= 3 {
            let outcome = self.tuner.tune();
            if matches!(outcome, crate::tuner::TuningOutcome::Adjusted { .. }) {
                self.counters.tuner_adjustments.fetch_add(1, Ordering::Relaxed);
            }
            info!(?outcome, "edge tuner invoked after trade closure");
        }

        true
    }

    async fn persist_with_retry(&self, trade: &TradeResult) -> bool {
        for attempt in 0..=self.config.max_retries {
            match self.storage.save_trade_result(trade) {
                WriteOutcome::Ok => return true,
                WriteOutcome::Retryable(reason) => {
                    if attempt == self.config.max_retries {
                        warn!(ticket = %trade.ticket, reason, attempt, "trade persistence exhausted retries");
                        return false;
                    }
                    warn!(ticket = %trade.ticket, reason, attempt, "trade persistence contended, retrying");
                    let backoff = Duration::from_secs_f64(self.config.retry_backoff_secs * (attempt as f64 + 1.0));
                    tokio::time::sleep(backoff).await;
                }
                WriteOutcome::Fatal(reason) => {
                    warn!(ticket = %trade.ticket, reason, "trade persistence failed fatally");
                    return false;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, TradeOutcome};

    fn event(ticket: &str, win: bool) -> BrokerTradeClosedEvent {
        BrokerTradeClosedEvent {
            ticket: ticket.to_string(),
            signal_id: Some("sig-1".to_string()),
            symbol: "BTCUSDT".to_string(),
            entry_price: 100.0,
            exit_price: if win { 105.0 } else { 95.0 },
            entry_time: 0,
            exit_time: 1,
            profit_loss: if win { 5.0 } else { -5.0 },
            pips: 0.0,
            result: if win { TradeOutcome::Win } else { TradeOutcome::Loss },
            exit_reason: if win { ExitReason::TakeProfitHit } else { ExitReason::StopLossHit },
            broker_id: "binance".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    fn build() -> TradeClosureListener {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let risk = Arc::new(RiskEngine::new(1000.0, 0.03, 5, 0.05, 50));
        let tuner = Arc::new(EdgeTuner::new(storage.clone(), crate::config::TunerConfig::default()));
        TradeClosureListener::new(storage, risk, tuner, ListenerConfig::default())
    }

    #[tokio::test]
    async fn first_delivery_persists_and_updates_risk() {
        let listener = build();
        let ok = listener.handle_trade_closed_event(&event("T-1", true)).await;
        assert!(ok);
        assert_eq!(listener.metrics().saved, 1);
        assert_eq!(listener.risk.get_state().daily_wins, 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let listener = build();
        assert!(listener.handle_trade_closed_event(&event("T-2", false)).await);
        assert!(listener.handle_trade_closed_event(&event("T-2", false)).await);

        assert_eq!(listener.metrics().saved, 1);
        assert_eq!(listener.risk.get_state().daily_losses, 1);
    }

    #[tokio::test]
    async fn success_rate_reflects_saved_over_processed() {
        let listener = build();
        listener.handle_trade_closed_event(&event("T-3", true)).await;
        listener.handle_trade_closed_event(&event("T-3", true)).await;
        let metrics = listener.metrics();
        assert_eq!(metrics.processed, 2);
        assert_eq!(metrics.saved, 1);
        assert!((metrics.success_rate() - 0.5).abs() < 1e-9);
    }
}
