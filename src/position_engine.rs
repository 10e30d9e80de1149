// =============================================================================
// Position Manager — trailing-stop, partial-TP, and stale-position policy
// =============================================================================
//
// State machine: Open -> PartialTP1 -> Closed, or Open -> Closed directly via
// stop-loss / TP2 / trailing stop / staleness / manual close.
//
// Exit priority in `check_exits`:
//   1. Stop-loss hit            -> full close
//   2. Take-profit-2 hit        -> full close
//   3. Take-profit-1 hit        -> partial close (configured fraction)
//   4. Trailing stop triggered  -> full close of remaining quantity
//   5. Stale (no favorable excursion within the configured window) -> full close
//
// Tunables (trailing-stop distance, TP1 close fraction, stale window) follow
// a three-tier precedence: an explicit `PositionManagerConfig` value wins;
// otherwise a same-named key in Storage's `dynamic_params` blob; otherwise a
// hardcoded default. This mirrors the rest of the engine's
// configuration-precedence convention and lets the EDGE Tuner or an operator
// adjust position behavior without a restart.
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PositionManagerConfig;
use crate::storage::Storage;

/// Default trailing-stop distance as a fraction of highest price (0.5 %).
const DEFAULT_TRAILING_STOP_PCT: f64 = 0.005;
/// Default fraction of quantity closed when TP1 is hit.
const DEFAULT_TP1_CLOSE_FRACTION: f64 = 0.60;
/// Default no-progress window before a position is considered stale.
const DEFAULT_STALE_AFTER_SECS: i64 = 4 * 3600;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    PartialTP1,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::PartialTP1 => write!(f, "PartialTP1"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// A single tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    /// "BUY" (long) or "SELL" (short).
    pub side: String,
    pub entry_price: f64,
    /// Remaining open quantity (reduced on partial close).
    pub quantity: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    /// Trailing stop price — set dynamically as price moves in our favour.
    #[serde(default)]
    pub trailing_stop: Option<f64>,
    /// Highest (for longs) or lowest (for shorts) price seen since open.
    #[serde(default)]
    pub highest_price: f64,
    /// Best unrealized PnL percentage seen since open — the staleness clock
    /// resets whenever this improves.
    #[serde(default)]
    pub best_pnl_pct: f64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub last_progress_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: f64,
}

// ---------------------------------------------------------------------------
// Position Manager
// ---------------------------------------------------------------------------

/// Thread-safe manager that owns the lists of open and closed positions.
pub struct PositionManager {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
    storage: Arc<Storage>,
    config: PositionManagerConfig,
}

impl PositionManager {
    /// Create an empty manager.
    pub fn new(storage: Arc<Storage>, config: PositionManagerConfig) -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            storage,
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Configuration resolution (explicit config -> dynamic_params -> default)
    // -------------------------------------------------------------------------

    fn dynamic_param(&self, key: &str) -> Option<f64> {
        self.storage.get_dynamic_params().ok()?.get(key)?.as_f64()
    }

    fn trailing_stop_pct(&self) -> f64 {
        self.config
            .trailing_stop_pct
            .or_else(|| self.dynamic_param("trailing_stop_pct"))
            .unwrap_or(DEFAULT_TRAILING_STOP_PCT)
    }

    fn tp1_close_fraction(&self) -> f64 {
        self.config
            .tp1_close_fraction
            .or_else(|| self.dynamic_param("tp1_close_fraction"))
            .unwrap_or(DEFAULT_TP1_CLOSE_FRACTION)
    }

    fn stale_after_secs(&self) -> i64 {
        self.config
            .stale_after_secs
            .or_else(|| self.dynamic_param("stale_after_secs").map(|v| v as i64))
            .unwrap_or(DEFAULT_STALE_AFTER_SECS)
    }

    // -------------------------------------------------------------------------
    // Open a new position
    // -------------------------------------------------------------------------

    /// Open a new position and return its UUID.
    pub fn open_position(
        &self,
        symbol: &str,
        side: &str,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: f64,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let pos = Position {
            id: id.clone(),
            symbol: symbol.to_string(),
            side: side.to_uppercase(),
            entry_price,
            quantity,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            stop_loss,
            take_profit_1,
            take_profit_2,
            trailing_stop: None,
            highest_price: entry_price,
            best_pnl_pct: 0.0,
            last_progress_at: now,
            status: PositionStatus::Open,
            opened_at: now.to_rfc3339(),
            closed_at: None,
            close_reason: None,
            realized_pnl: 0.0,
        };

        info!(
            id = %id,
            symbol,
            side,
            entry_price,
            quantity,
            stop_loss,
            take_profit_1,
            take_profit_2,
            "position opened"
        );

        self.open.write().push(pos);
        id
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Update the `current_price` for every open position matching `symbol`,
    /// recomputing unrealised PnL, highest-price tracking, trailing stop, and
    /// the staleness clock.
    pub fn update_price(&self, symbol: &str, current_price: f64) {
        let trailing_stop_pct = self.trailing_stop_pct();
        let now = Utc::now();
        let mut positions = self.open.write();
        for pos in positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = current_price;

            let direction = if pos.side == "BUY" { 1.0 } else { -1.0 };
            pos.unrealized_pnl = direction * (current_price - pos.entry_price) * pos.quantity;
            pos.unrealized_pnl_pct = if pos.entry_price > 0.0 {
                direction * ((current_price - pos.entry_price) / pos.entry_price) * 100.0
            } else {
                0.0
            };

            if pos.unrealized_pnl_pct > pos.best_pnl_pct {
                pos.best_pnl_pct = pos.unrealized_pnl_pct;
                pos.last_progress_at = now;
            }

            let is_long = pos.side == "BUY";
            if is_long {
                if current_price > pos.highest_price {
                    pos.highest_price = current_price;
                    let trail = pos.highest_price * (1.0 - trailing_stop_pct);
                    pos.trailing_stop = Some(trail);
                    debug!(
                        id = %pos.id,
                        highest_price = pos.highest_price,
                        trailing_stop = trail,
                        "trailing stop updated (long)"
                    );
                }
            } else if pos.highest_price == pos.entry_price || current_price < pos.highest_price {
                pos.highest_price = current_price;
                let trail = pos.highest_price * (1.0 + trailing_stop_pct);
                pos.trailing_stop = Some(trail);
                debug!(
                    id = %pos.id,
                    lowest_price = pos.highest_price,
                    trailing_stop = trail,
                    "trailing stop updated (short)"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exit checks
    // -------------------------------------------------------------------------

    /// Scan all open positions and return a list of `(position_id, reason)`
    /// pairs for positions that should be exited.
    ///
    /// **Side-effects**: positions hitting TP1 are partially closed in-place
    /// (quantity reduced by the configured fraction, status changed to
    /// `PartialTP1`, and realised PnL accumulated).
    pub fn check_exits(&self) -> Vec<(String, String)> {
        let tp1_close_fraction = self.tp1_close_fraction();
        let stale_after_secs = self.stale_after_secs();
        let now = Utc::now();

        let mut exits: Vec<(String, String)> = Vec::new();
        let mut positions = self.open.write();

        for pos in positions.iter_mut() {
            let is_long = pos.side == "BUY";
            let price = pos.current_price;

            // --- 1. Stop-loss ------------------------------------------------
            let sl_hit = if is_long { price <= pos.stop_loss } else { price >= pos.stop_loss };
            if sl_hit {
                exits.push((pos.id.clone(), "StopLoss".to_string()));
                continue;
            }

            // --- 2. Take-profit 2 (full close) ------------------------------
            let tp2_hit = if is_long { price >= pos.take_profit_2 } else { price <= pos.take_profit_2 };
            if tp2_hit {
                exits.push((pos.id.clone(), "TakeProfit2".to_string()));
                continue;
            }

            // --- 3. Take-profit 1 (partial close) ---------------------------
            if pos.status == PositionStatus::Open {
                let tp1_hit = if is_long { price >= pos.take_profit_1 } else { price <= pos.take_profit_1 };
                if tp1_hit {
                    let close_qty = pos.quantity * tp1_close_fraction;
                    let direction = if is_long { 1.0 } else { -1.0 };
                    let partial_pnl = direction * (price - pos.entry_price) * close_qty;

                    pos.quantity -= close_qty;
                    pos.realized_pnl += partial_pnl;
                    pos.status = PositionStatus::PartialTP1;
                    pos.last_progress_at = now;

                    info!(
                        id = %pos.id,
                        close_qty,
                        remaining_qty = pos.quantity,
                        partial_pnl,
                        "TP1 partial close executed"
                    );
                    continue;
                }
            }

            // --- 4. Trailing stop --------------------------------------------
            if let Some(trail) = pos.trailing_stop {
                let trail_hit = if is_long { price <= trail } else { price >= trail };
                if trail_hit {
                    exits.push((pos.id.clone(), "TrailingStop".to_string()));
                    continue;
                }
            }

            // --- 5. Staleness: no favorable excursion within the window -----
            let age_secs = (now - pos.last_progress_at).num_seconds();
            if age_secs >= stale_after_secs {
                exits.push((pos.id.clone(), "Stale".to_string()));
            }
        }

        exits
    }

    // -------------------------------------------------------------------------
    // Close a position
    // -------------------------------------------------------------------------

    /// Close a position by `id` and move it to the closed list.
    ///
    /// Returns the total realised PnL (partial + final) if the position was
    /// found, or `None` if no matching open position exists.
    pub fn close_position(&self, id: &str, reason: &str, close_price: f64) -> Option<f64> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.id == id)?;
        let mut pos = open.remove(idx);

        let direction = if pos.side == "BUY" { 1.0 } else { -1.0 };
        let final_pnl = direction * (close_price - pos.entry_price) * pos.quantity;
        pos.realized_pnl += final_pnl;
        pos.current_price = close_price;
        pos.unrealized_pnl = 0.0;
        pos.unrealized_pnl_pct = 0.0;
        pos.status = PositionStatus::Closed;
        pos.closed_at = Some(Utc::now().to_rfc3339());
        pos.close_reason = Some(reason.to_string());
        pos.quantity = 0.0;

        let total_pnl = pos.realized_pnl;

        info!(id, reason, close_price, realized_pnl = total_pnl, "position closed");

        self.closed.write().push(pos);
        Some(total_pnl)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Return a snapshot of all currently open positions.
    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    /// Return the most recent `count` closed positions (newest first).
    pub fn get_closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    /// One monitoring pass: advances prices, then closes everything
    /// `check_exits` flags. Returns the fully-closed `Position` records so the
    /// caller can turn each into a trade-closure event — this is what
    /// Orchestrator step 4 means by "run one position monitoring pass," and
    /// for a spot connector (whose `get_closed_positions` never returns
    /// anything, since spot has no broker-side position concept) it is the
    /// only source of closed-trade events.
    pub fn run_monitoring_pass(&self, price_lookup: impl Fn(&str) -> Option<f64>) -> Vec<Position> {
        let symbols: Vec<String> = {
            let open = self.open.read();
            open.iter().map(|p| p.symbol.clone()).collect::<std::collections::HashSet<_>>().into_iter().collect()
        };

        for symbol in symbols {
            if let Some(price) = price_lookup(&symbol) {
                self.update_price(&symbol, price);
            }
        }

        let mut closed = Vec::new();
        for (id, reason) in self.check_exits() {
            let close_price = self
                .open
                .read()
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.current_price)
                .unwrap_or(0.0);
            self.close_position(&id, &reason, close_price);
            if let Some(pos) = self.closed.read().iter().rev().find(|p| p.id == id) {
                closed.push(pos.clone());
            }
        }
        closed
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open_count = self.open.read().len();
        let closed_count = self.closed.read().len();
        f.debug_struct("PositionManager")
            .field("open_positions", &open_count)
            .field("closed_positions", &closed_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PositionManager {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        PositionManager::new(storage, PositionManagerConfig::default())
    }

    #[test]
    fn stop_loss_exit_takes_priority() {
        let pm = manager();
        let id = pm.open_position("BTCUSDT", "BUY", 100.0, 1.0, 98.0, 105.0, 110.0);
        pm.update_price("BTCUSDT", 97.0);
        let exits = pm.check_exits();
        assert_eq!(exits, vec![(id, "StopLoss".to_string())]);
    }

    #[test]
    fn tp1_partial_close_reduces_quantity_and_keeps_position_open() {
        let pm = manager();
        let id = pm.open_position("BTCUSDT", "BUY", 100.0, 10.0, 95.0, 105.0, 120.0);
        pm.update_price("BTCUSDT", 106.0);
        let exits = pm.check_exits();
        assert!(exits.is_empty());

        let open = pm.get_open_positions();
        let pos = open.iter().find(|p| p.id == id).unwrap();
        assert_eq!(pos.status, PositionStatus::PartialTP1);
        assert!((pos.quantity - 4.0).abs() < 1e-9);
        assert!(pos.realized_pnl > 0.0);
    }

    #[test]
    fn trailing_stop_triggers_after_pullback() {
        let pm = manager();
        pm.open_position("BTCUSDT", "BUY", 100.0, 1.0, 90.0, 200.0, 300.0);
        pm.update_price("BTCUSDT", 150.0);
        // 0.5% below 150 = 149.25
        pm.update_price("BTCUSDT", 148.0);
        let exits = pm.check_exits();
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].1, "TrailingStop");
    }

    #[test]
    fn explicit_config_overrides_defaults() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let cfg = PositionManagerConfig {
            trailing_stop_pct: Some(0.10),
            tp1_close_fraction: None,
            stale_after_secs: None,
        };
        let pm = PositionManager::new(storage, cfg);
        assert!((pm.trailing_stop_pct() - 0.10).abs() < 1e-12);
        assert!((pm.tp1_close_fraction() - DEFAULT_TP1_CLOSE_FRACTION).abs() < 1e-12);
    }

    #[test]
    fn dynamic_params_used_when_config_absent() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        storage.update_dynamic_params(serde_json::json!({"tp1_close_fraction": 0.25}));
        let pm = PositionManager::new(storage, PositionManagerConfig::default());
        assert!((pm.tp1_close_fraction() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn stale_position_is_flagged_when_window_elapses() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let cfg = PositionManagerConfig {
            trailing_stop_pct: None,
            tp1_close_fraction: None,
            stale_after_secs: Some(0),
        };
        let pm = PositionManager::new(storage, cfg);
        let id = pm.open_position("BTCUSDT", "BUY", 100.0, 1.0, 50.0, 200.0, 300.0);
        pm.update_price("BTCUSDT", 100.0);
        let exits = pm.check_exits();
        assert_eq!(exits, vec![(id, "Stale".to_string())]);
    }
}
