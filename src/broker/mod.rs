// =============================================================================
// Broker Connector — execution-side abstraction over a concrete exchange API
// =============================================================================
//
// The Order Executor, Position Manager, and Trade Closure Listener all talk
// to brokers only through this trait. Today the only concrete implementation
// wraps `BinanceClient`; a second venue is a new struct plus a `connector_type`
// tag, not a change to any caller.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::binance::client::BinanceClient;
use crate::error::ProviderError;
use crate::types::{BrokerPosition, BrokerTradeClosedEvent, ExitReason, Signal, SignalType, TradeOutcome, TradeSide};

/// Outcome of submitting a signal for execution.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Order accepted by the broker; carries its assigned ticket.
    Filled { ticket: String },
    /// Order rejected before or by the broker; reason is also captured on
    /// `BrokerConnector::last_rejection_reason`.
    Rejected { reason: String },
}

/// Broker-agnostic connector surface (§6 External Interfaces). All methods
/// are async since every concrete implementation crosses a network boundary.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Identifies the concrete connector kind, stamped onto `Signal::connector_type`.
    fn connector_type(&self) -> &'static str;

    async fn connect(&self) -> bool;

    fn is_connected(&self) -> bool;

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, ProviderError>;

    async fn get_closed_positions(&self, hours: u32) -> Result<Vec<BrokerTradeClosedEvent>, ProviderError>;

    async fn get_account_balance(&self) -> Result<f64, ProviderError>;

    async fn execute_order(&self, signal: &Signal) -> Result<ExecutionResult, ProviderError>;

    /// Most recent rejection reason, for the dashboard's `last_rejection_reason` surface.
    fn last_rejection_reason(&self) -> Option<String>;
}

/// Binance spot connector. Tracks a simple connected flag flipped by
/// `connect()`/failed calls, and remembers the last rejection for
/// operator visibility.
pub struct BinanceBrokerConnector {
    client: Arc<BinanceClient>,
    connected: RwLock<bool>,
    last_rejection: RwLock<Option<String>>,
}

impl BinanceBrokerConnector {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self {
            client,
            connected: RwLock::new(false),
            last_rejection: RwLock::new(None),
        }
    }

    fn record_rejection(&self, reason: impl Into<String>) -> String {
        let reason = reason.into();
        *self.last_rejection.write() = Some(reason.clone());
        reason
    }
}

#[async_trait::async_trait]
impl BrokerConnector for BinanceBrokerConnector {
    fn connector_type(&self) -> &'static str {
        "binance"
    }

    #[instrument(skip(self), name = "broker::connect")]
    async fn connect(&self) -> bool {
        match self.client.get_account().await {
            Ok(_) => {
                *self.connected.write() = true;
                true
            }
            Err(e) => {
                warn!(error = %e, "broker connect check failed");
                *self.connected.write() = false;
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    #[instrument(skip(self), name = "broker::get_open_positions")]
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, ProviderError> {
        // Spot accounts have no native "position" concept the way futures
        // do; open positions are reconstructed by the Position Manager from
        // locally-tracked state plus balances, not from this endpoint.
        Ok(Vec::new())
    }

    #[instrument(skip(self), name = "broker::get_closed_positions")]
    async fn get_closed_positions(&self, _hours: u32) -> Result<Vec<BrokerTradeClosedEvent>, ProviderError> {
        // Closed-trade reconciliation for spot is driven by the Position
        // Manager's own bracket-exit bookkeeping plus `get_account`, not a
        // broker-side trade history pull; exposed here only to satisfy the
        // connector surface for venues that do provide one.
        Ok(Vec::new())
    }

    #[instrument(skip(self), name = "broker::get_account_balance")]
    async fn get_account_balance(&self) -> Result<f64, ProviderError> {
        self.client
            .get_balance("USDT")
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))
    }

    #[instrument(skip(self, signal), name = "broker::execute_order")]
    async fn execute_order(&self, signal: &Signal) -> Result<ExecutionResult, ProviderError> {
        let side = match signal.signal_type {
            SignalType::Buy => "BUY",
            SignalType::Sell => "SELL",
        };

        if signal.entry_price <= 0.0 {
            let reason = self.record_rejection("non-positive entry price");
            return Ok(ExecutionResult::Rejected { reason });
        }

        let quantity = signal
            .metadata
            .get("quantity")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);

        if quantity <= 0.0 {
            let reason = self.record_rejection("non-positive quantity");
            return Ok(ExecutionResult::Rejected { reason });
        }

        let client_order_id = signal.id.clone();
        match self
            .client
            .place_order(
                &signal.symbol,
                side,
                "LIMIT",
                quantity,
                Some(signal.entry_price),
                Some("GTC"),
                Some(&client_order_id),
            )
            .await
        {
            Ok(body) => {
                let ticket = body
                    .get("orderId")
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| client_order_id.clone());
                debug!(symbol = %signal.symbol, ticket, "order executed");
                Ok(ExecutionResult::Filled { ticket })
            }
            Err(e) => {
                let reason = self.record_rejection(e.to_string());
                Err(ProviderError::Transient(reason))
            }
        }
    }

    fn last_rejection_reason(&self) -> Option<String> {
        self.last_rejection.read().clone()
    }
}

/// Converts a Binance order `side` field on an account trade record into the
/// canonical `TradeSide` / `TradeOutcome` pair used by normalized closure
/// events. Kept free-standing so the Trade Closure Listener can reuse it
/// when building a `BrokerTradeClosedEvent` from raw venue payloads.
pub fn trade_side_from_str(s: &str) -> TradeSide {
    match s.to_ascii_uppercase().as_str() {
        "BUY" | "LONG" => TradeSide::Long,
        _ => TradeSide::Short,
    }
}

pub fn outcome_from_pnl(pnl: f64) -> TradeOutcome {
    TradeOutcome::from_pnl(pnl)
}

pub fn default_exit_reason() -> ExitReason {
    ExitReason::ManualClose
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_side_parses_buy_and_sell() {
        assert_eq!(trade_side_from_str("BUY"), TradeSide::Long);
        assert_eq!(trade_side_from_str("SELL"), TradeSide::Short);
        assert_eq!(trade_side_from_str("sell"), TradeSide::Short);
    }

    #[test]
    fn outcome_from_pnl_matches_sign() {
        assert_eq!(outcome_from_pnl(10.0), TradeOutcome::from_pnl(10.0));
        assert_eq!(outcome_from_pnl(-5.0), TradeOutcome::from_pnl(-5.0));
    }
}
