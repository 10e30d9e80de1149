// =============================================================================
// Data Provider Manager — cached, prioritized, fallback-capable OHLC fetcher
// =============================================================================
//
// Providers are enumerated from Storage's `data_providers` table: id,
// enabled flag, priority (higher wins), auth requirement, is_system flag,
// credentials, extra config. Each row is turned into a concrete provider
// instance by `build_provider`, a small match over `provider_type` — a
// compile-time enum addition per provider kind rather than a schema-free
// `**kwargs` payload.
//
// Single-load contract: the instance cache is populated once at
// construction; `fetch_ohlc` never refetches the provider list. Call
// `reload()` explicitly to clear the cache and re-read Storage.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::binance::client::BinanceClient;
use crate::error::ProviderError;
use crate::market_data::Candle;
use crate::storage::{DataProviderRow, Storage};
use crate::types::Bar;

/// Converts a market-data `Candle` (kline-stream representation) into the
/// plain `Bar` the classifier and indicators consume.
fn candle_to_bar(c: &Candle) -> Bar {
    Bar {
        timestamp: c.open_time,
        open: c.open,
        high: c.high,
        low: c.low,
        close: c.close,
        volume: c.volume,
    }
}

/// Static metadata about a registered provider, independent of its runtime
/// instance.
#[derive(Debug, Clone)]
pub struct ProviderMeta {
    pub id: String,
    pub enabled: bool,
    pub priority: i64,
    pub requires_auth: bool,
    pub is_system: bool,
    pub has_credentials: bool,
}

/// Fetches OHLC bars for a symbol/timeframe from one concrete source.
///
/// Implementors own their own rate limiting (§4.3: "Rate limits are
/// enforced within provider implementations, not by the manager").
#[async_trait::async_trait]
pub trait DataProvider: Send + Sync {
    async fn fetch_ohlc(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
    ) -> Result<Vec<Bar>, ProviderError>;
}

/// A provider backed by the Binance REST klines endpoint. Public market data
/// needs no signature, so this provider works with or without credentials;
/// `requires_auth` on its `ProviderMeta` reflects whether a *private*
/// account-scoped fallback is also wanted, not this endpoint itself.
pub struct BinanceDataProvider {
    client: Arc<BinanceClient>,
}

impl BinanceDataProvider {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl DataProvider for BinanceDataProvider {
    async fn fetch_ohlc(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
    ) -> Result<Vec<Bar>, ProviderError> {
        let interval = binance_interval(timeframe);
        match self.client.get_klines(symbol, interval, count).await {
            Ok(candles) => Ok(candles.iter().map(candle_to_bar).collect()),
            Err(e) => Err(ProviderError::Transient(e.to_string())),
        }
    }
}

/// Maps the canonical timeframe vocabulary onto Binance's kline interval
/// strings. Falls back to "5m" for anything unrecognised (§7: bad input
/// substitutes a safe default and logs once).
fn binance_interval(timeframe: &str) -> &'static str {
    match timeframe {
        "M1" => "1m",
        "M5" => "5m",
        "M15" => "15m",
        "M30" => "30m",
        "H1" => "1h",
        "H4" => "4h",
        "D1" => "1d",
        "W1" => "1w",
        "MN1" => "1M",
        other => {
            warn!(timeframe = other, "unknown timeframe, defaulting to M5");
            "5m"
        }
    }
}

struct ProviderEntry {
    meta: ProviderMeta,
    provider: Arc<dyn DataProvider>,
}

/// Builds a concrete provider instance from a persisted `DataProviderRow`.
/// Unrecognised `provider_type` values are logged and skipped rather than
/// treated as a fatal error — a malformed row must not take down the
/// manager.
fn build_provider(row: &DataProviderRow, binance_client: &Arc<BinanceClient>) -> Option<Arc<dyn DataProvider>> {
    match row.provider_type.as_str() {
        "binance" => Some(Arc::new(BinanceDataProvider::new(binance_client.clone()))),
        other => {
            warn!(provider_type = other, name = %row.name, "unrecognised provider type, skipping");
            None
        }
    }
}

/// Cached, prioritized, fallback-capable fetcher of OHLC bars.
pub struct DataProviderManager {
    storage: Arc<Storage>,
    binance_client: Arc<BinanceClient>,
    providers: RwLock<Vec<ProviderEntry>>,
    /// A transiently-enabled free provider, tried once if every active
    /// provider fails and nothing else is configured.
    default_fallback: Arc<dyn DataProvider>,
}

impl DataProviderManager {
    /// Construct the manager and perform the one-time initial load from
    /// Storage. Per the single-load contract, this is the *only* load that
    /// happens implicitly; afterwards only an explicit `reload()` re-reads
    /// Storage.
    pub fn new(storage: Arc<Storage>, binance_client: Arc<BinanceClient>) -> Self {
        let default_fallback: Arc<dyn DataProvider> =
            Arc::new(BinanceDataProvider::new(binance_client.clone()));

        let manager = Self {
            storage,
            binance_client,
            providers: RwLock::new(Vec::new()),
            default_fallback,
        };
        manager.load_from_storage();
        manager
    }

    /// Clears the instance cache and re-reads Storage. The only way the
    /// manager's provider list changes after construction.
    pub fn reload(&self) {
        info!("data provider manager reload requested");
        self.load_from_storage();
    }

    fn load_from_storage(&self) {
        let rows = match self.storage.get_data_providers() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to load data providers from storage");
                Vec::new()
            }
        };

        let mut entries: Vec<ProviderEntry> = rows
            .iter()
            .filter_map(|row| {
                let provider = build_provider(row, &self.binance_client)?;
                Some(ProviderEntry {
                    meta: ProviderMeta {
                        id: row.name.clone(),
                        enabled: row.enabled,
                        priority: row.priority,
                        requires_auth: row.requires_auth,
                        is_system: row.is_system,
                        has_credentials: row.api_key.is_some() && row.api_secret.is_some(),
                    },
                    provider,
                })
            })
            .collect();

        entries.sort_by(|a, b| b.meta.priority.cmp(&a.meta.priority));

        info!(count = entries.len(), "data provider manager loaded providers");
        *self.providers.write() = entries;
    }

    /// Fetches OHLC bars, trying eligible providers in priority order until
    /// one returns a non-empty result.
    ///
    /// `only_system` restricts selection to providers flagged `is_system`
    /// (used by the Scanner, which must not accidentally read from a
    /// user-attached secondary provider).
    pub async fn fetch_ohlc(
        &self,
        symbol: &str,
        timeframe: &str,
        count: u32,
        preferred_provider: Option<&str>,
        only_system: bool,
    ) -> Option<Vec<Bar>> {
        let entries: Vec<(String, bool, Arc<dyn DataProvider>)> = {
            let providers = self.providers.read();
            let mut candidates: Vec<&ProviderEntry> = providers
                .iter()
                .filter(|e| e.meta.enabled)
                .filter(|e| !only_system || e.meta.is_system)
                .filter(|e| !e.meta.requires_auth || e.meta.has_credentials)
                .collect();

            if let Some(preferred) = preferred_provider {
                candidates.sort_by_key(|e| if e.meta.id == preferred { 0 } else { 1 });
            }

            candidates
                .into_iter()
                .map(|e| (e.meta.id.clone(), e.meta.is_system, e.provider.clone()))
                .collect()
        };

        for (id, _is_system, provider) in &entries {
            let mapped_symbol = self.map_symbol(symbol, id);
            match provider.fetch_ohlc(&mapped_symbol, timeframe, count).await {
                Ok(bars) if !bars.is_empty() => {
                    debug!(provider = %id, symbol, timeframe, count = bars.len(), "fetch_ohlc succeeded");
                    return Some(bars);
                }
                Ok(_) => {
                    debug!(provider = %id, symbol, timeframe, "provider returned empty bars, trying next");
                }
                Err(e) => {
                    warn!(provider = %id, symbol, timeframe, error = %e, "provider fetch failed, trying next");
                }
            }
        }

        // Reaching here means either no provider was eligible at all, or
        // every eligible provider was tried and returned an error/empty
        // result (§4.3, §6: fall back when "all active providers fail",
        // not only when none are configured).
        if entries.is_empty() {
            warn!(symbol, timeframe, "no active providers configured, using transient default fallback");
        } else {
            warn!(symbol, timeframe, "all active providers failed, using transient default fallback");
        }
        let mapped_symbol = self.map_symbol(symbol, "default");
        if let Ok(bars) = self.default_fallback.fetch_ohlc(&mapped_symbol, timeframe, count).await {
            if !bars.is_empty() {
                return Some(bars);
            }
        }

        None
    }

    /// Rewrites an internal symbol to its per-provider representation using
    /// the persisted symbol map, falling back to the internal symbol
    /// unchanged when no mapping exists.
    fn map_symbol(&self, symbol: &str, provider_id: &str) -> String {
        match self.storage.get_symbol_map(Some(provider_id)) {
            Ok(map) => map
                .get(symbol)
                .and_then(|m| m.get(provider_id))
                .cloned()
                .unwrap_or_else(|| symbol.to_string()),
            Err(_) => symbol.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeProvider {
        bars: Vec<Bar>,
    }

    #[async_trait::async_trait]
    impl DataProvider for FakeProvider {
        async fn fetch_ohlc(&self, _symbol: &str, _timeframe: &str, _count: u32) -> Result<Vec<Bar>, ProviderError> {
            Ok(self.bars.clone())
        }
    }

    fn bar(close: f64) -> Bar {
        Bar { timestamp: 0, open: close, high: close, low: close, close, volume: 1.0 }
    }

    #[test]
    fn binance_interval_unknown_defaults_to_m5() {
        assert_eq!(binance_interval("M5"), "5m");
        assert_eq!(binance_interval("BOGUS"), "5m");
    }

    #[tokio::test]
    async fn fake_provider_returns_bars() {
        let provider = FakeProvider { bars: vec![bar(1.0), bar(2.0)] };
        let result = provider.fetch_ohlc("BTCUSDT", "M5", 10).await.unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn candle_conversion_preserves_ohlcv() {
        let c = Candle {
            open_time: 1000,
            close_time: 1299,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        let bar = candle_to_bar(&c);
        assert_eq!(bar.timestamp, 1000);
        assert_eq!(bar.open, 1.0);
        assert_eq!(bar.high, 2.0);
        assert_eq!(bar.low, 0.5);
        assert_eq!(bar.close, 1.5);
        assert_eq!(bar.volume, 10.0);
    }
}
