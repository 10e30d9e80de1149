// =============================================================================
// Market Data — wire-level OHLCV representation shared by the Binance client
// and the Data Provider Manager
// =============================================================================
//
// The engine's bar contract is pull-based (`DataProvider::fetch_ohlc`); this
// module holds only the plain candle record the REST client parses klines
// into before the Data Provider Manager converts it to a `types::Bar`.

use serde::{Deserialize, Serialize};

/// A single OHLCV candle as returned by a venue's REST klines endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}
