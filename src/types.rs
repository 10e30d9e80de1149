// =============================================================================
// Shared data model for the Aethelgard engine
// =============================================================================
//
// These are the plain-data types that flow between components: bars in from
// the Data Provider, signals out of the Signal Factory, trade results back in
// from the Trade Closure Listener. Nothing in this module does I/O.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Canonical timeframe vocabulary used throughout the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    MN1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
            Self::W1 => "W1",
            Self::MN1 => "MN1",
        }
    }

    /// Parses the canonical vocabulary, falling back to M5 for anything
    /// unrecognised (§7: "unknown timeframe" substitutes a safe default).
    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "M1" => Self::M1,
            "M5" => Self::M5,
            "M15" => Self::M15,
            "M30" => Self::M30,
            "H1" => Self::H1,
            "H4" => Self::H4,
            "D1" => Self::D1,
            "W1" => Self::W1,
            "MN1" => Self::MN1,
            _ => Self::M5,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market regime. Ordered by aggressiveness for cross-stream aggregation:
/// CRASH > TREND > NORMAL > RANGE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    Range,
    Normal,
    Trend,
    Crash,
}

impl Regime {
    fn rank(self) -> u8 {
        match self {
            Self::Range => 0,
            Self::Normal => 1,
            Self::Trend => 2,
            Self::Crash => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trend => "TREND",
            Self::Range => "RANGE",
            Self::Normal => "NORMAL",
            Self::Crash => "CRASH",
        }
    }

    /// Picks the most aggressive of two regimes (used to roll up a single
    /// `current_regime` across every scanned stream).
    pub fn most_aggressive(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl PartialOrd for Regime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Regime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directional bias derived from price vs. a long-period SMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "BULLISH"),
            Self::Bearish => write!(f, "BEARISH"),
        }
    }
}

/// Regime classifier metrics, as returned by `get_metrics()`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub adx: f64,
    pub atr_pct: f64,
    pub volatility_shock: bool,
    pub sma_distance: f64,
    pub bias: Option<Bias>,
}

impl Default for RegimeMetrics {
    fn default() -> Self {
        Self {
            adx: 0.0,
            atr_pct: 0.0,
            volatility_shock: false,
            sma_distance: 0.0,
            bias: None,
        }
    }
}

/// One OHLC bar. Immutable once produced by a Data Provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time, milliseconds since epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// A scan outcome for one (symbol, timeframe) stream, the unit the Scanner
/// writes into its snapshot maps and persists to Storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub regime: Regime,
    pub metrics: RegimeMetrics,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalType {
    Buy,
    Sell,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Pending,
    Executed,
    Expired,
    Closed,
}

/// A trade proposal produced by the Signal Factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub timeframe: Timeframe,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub confidence: f64,
    pub strategy_id: String,
    pub connector_type: String,
    pub regime: Regime,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: i64,
    pub trace_id: String,
    pub status: SignalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLossHit,
    TakeProfitHit,
    ManualClose,
    Other,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLossHit => write!(f, "stop_loss_hit"),
            Self::TakeProfitHit => write!(f, "take_profit_hit"),
            Self::ManualClose => write!(f, "manual_close"),
            Self::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    Win,
    Loss,
    Breakeven,
}

impl TradeOutcome {
    pub fn from_pnl(pnl: f64) -> Self {
        if pnl > 0.0 {
            Self::Win
        } else if pnl < 0.0 {
            Self::Loss
        } else {
            Self::Breakeven
        }
    }

    pub fn is_win(self) -> bool {
        matches!(self, Self::Win)
    }
}

/// A closed trade, uniquely keyed by `ticket` (the idempotence key for the
/// Trade Closure Listener).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeResult {
    pub ticket: String,
    #[serde(default)]
    pub signal_id: Option<String>,
    pub symbol: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub profit_loss: f64,
    #[serde(default)]
    pub pips: f64,
    pub exit_reason: ExitReason,
    pub result: TradeOutcome,
    pub broker_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Per-day pipeline counters, reconstructed from Storage on boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub date: chrono::NaiveDate,
    pub signals_processed: u64,
    pub signals_executed: u64,
    pub cycles_completed: u64,
    pub errors_count: u64,
    pub scans_total: u64,
    pub signals_generated: u64,
    pub signals_risk_passed: u64,
    pub signals_vetoed: u64,
}

impl SessionStats {
    pub fn new(date: chrono::NaiveDate) -> Self {
        Self {
            date,
            signals_processed: 0,
            signals_executed: 0,
            cycles_completed: 0,
            errors_count: 0,
            scans_total: 0,
            signals_generated: 0,
            signals_risk_passed: 0,
            signals_vetoed: 0,
        }
    }
}

/// Strategy execution gate (Shadow Ranking). Missing entry in the ranking
/// table is treated as `Live` ("allow, legacy").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Live,
    Shadow,
    Quarantine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Long,
    Short,
}

/// A currently-open broker position, as returned by `get_open_positions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub opened_at: i64,
}

/// A normalized closed-position event a Broker Connector produces, which the
/// Trade Closure Listener consumes as `BrokerTradeClosedEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerTradeClosedEvent {
    pub ticket: String,
    #[serde(default)]
    pub signal_id: Option<String>,
    pub symbol: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: i64,
    pub exit_time: i64,
    pub profit_loss: f64,
    #[serde(default)]
    pub pips: f64,
    pub result: TradeOutcome,
    pub exit_reason: ExitReason,
    pub broker_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
