// =============================================================================
// Scanner Engine — prioritized, regime-aware bar polling and classification
// =============================================================================
//
// Owns one `RegimeClassifier` per (symbol, timeframe) stream plus three maps
// (`last_regime`, `last_scan_time`, `last_dataframes`) behind a single mutex.
// A coordinator loop sweeps all configured streams every tick, dispatching
// any stream whose per-regime interval has elapsed to a bounded worker pool.
// Classifier state is touched only by the worker currently processing that
// stream's key — the mutex guards the snapshot maps, never classifier
// internals, and is never held across the provider I/O await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::{ScanMode, ScannerConfig};
use crate::data_provider::DataProviderManager;
use crate::regime::{ClassifierParams, RegimeClassifier};
use crate::storage::Storage;
use crate::types::{Bar, Regime, RegimeMetrics, ScanSnapshot, Timeframe};

type StreamKey = (String, Timeframe);

fn interval_for_regime(cfg: &ScannerConfig, regime: Regime) -> f64 {
    match regime {
        Regime::Trend => cfg.sleep_trend_seconds,
        Regime::Crash => cfg.sleep_crash_seconds,
        Regime::Range => cfg.sleep_range_seconds,
        Regime::Normal => cfg.sleep_neutral_seconds,
    }
}

/// One fully-resolved scan result, ready to be merged into the shared maps.
struct WorkerResult {
    key: StreamKey,
    regime: Regime,
    metrics: RegimeMetrics,
    bars: Vec<Bar>,
}

/// Bounded worker pool + coordinator loop implementing §4.4.
pub struct Scanner {
    storage: Arc<Storage>,
    providers: Arc<DataProviderManager>,
    symbols: Vec<String>,
    config: parking_lot::RwLock<ScannerConfig>,
    classifiers: Mutex<HashMap<StreamKey, RegimeClassifier>>,
    last_regime: Mutex<HashMap<StreamKey, Regime>>,
    last_metrics: Mutex<HashMap<StreamKey, RegimeMetrics>>,
    last_scan_time: Mutex<HashMap<StreamKey, Instant>>,
    last_dataframes: Mutex<HashMap<StreamKey, Vec<Bar>>>,
    stop: AtomicBool,
    sys: Mutex<System>,
}

impl Scanner {
    pub fn new(
        storage: Arc<Storage>,
        providers: Arc<DataProviderManager>,
        symbols: Vec<String>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            storage,
            providers,
            symbols,
            config: parking_lot::RwLock::new(config),
            classifiers: Mutex::new(HashMap::new()),
            last_regime: Mutex::new(HashMap::new()),
            last_metrics: Mutex::new(HashMap::new()),
            last_scan_time: Mutex::new(HashMap::new()),
            last_dataframes: Mutex::new(HashMap::new()),
            stop: AtomicBool::new(false),
            sys: Mutex::new(System::new_with_specifics(
                RefreshKind::new().with_cpu(CpuRefreshKind::everything()),
            )),
        }
    }

    /// Signals the coordinator loop to terminate within one sleep quantum.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn active_timeframes(&self) -> Vec<Timeframe> {
        self.config
            .read()
            .timeframes
            .iter()
            .filter(|t| t.enabled)
            .map(|t| Timeframe::parse_or_default(&t.timeframe))
            .collect()
    }

    fn max_workers(&self) -> usize {
        let cfg = self.config.read();
        let base = (self.symbols.len().max(1) * self.active_timeframes_count()) as f64;
        let n = (base * cfg.scan_mode.worker_multiplier()).ceil() as usize;
        n.max(1)
    }

    fn active_timeframes_count(&self) -> usize {
        self.config.read().timeframes.iter().filter(|t| t.enabled).count().max(1)
    }

    /// Consistent, mutex-guarded snapshot of the current heatmap for the API
    /// layer: take the lock, copy, release — never held during I/O.
    pub fn snapshot_all(&self) -> Vec<ScanSnapshot> {
        let regimes = self.last_regime.lock();
        let metrics_map = self.last_metrics.lock();
        regimes
            .iter()
            .map(|(key, regime)| ScanSnapshot {
                symbol: key.0.clone(),
                timeframe: key.1,
                regime: *regime,
                metrics: metrics_map.get(key).cloned().unwrap_or_default(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            })
            .collect()
    }

    /// The full bar frame last fetched for one stream, if any — used by the
    /// Signal Factory to generate signals without a second provider round-trip.
    pub fn last_bars(&self, symbol: &str, timeframe: Timeframe) -> Option<Vec<Bar>> {
        self.last_dataframes.lock().get(&(symbol.to_string(), timeframe)).cloned()
    }

    /// Coordinator loop: sweeps eligible streams, dispatches to a bounded
    /// worker pool, persists snapshots, and sleeps CPU-adaptively. Runs until
    /// `stop()` is called.
    pub async fn run(self: Arc<Self>, params: ClassifierParams, bars_count: u32) {
        info!("scanner coordinator starting");
        loop {
            if self.is_stopped() {
                info!("scanner coordinator stopping");
                return;
            }

            if !self.storage.resolve_module_enabled(None, "scanner") {
                debug!("scanner module disabled, idling");
                self.chunked_sleep(Duration::from_secs(10)).await;
                continue;
            }

            let timeframes = self.active_timeframes();
            let candidates = self.collect_candidates(&timeframes);

            let semaphore = Arc::new(Semaphore::new(self.max_workers()));
            let mut handles = Vec::with_capacity(candidates.len());

            for key in candidates {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let this = self.clone();
                let params = params.clone();
                let providers = self.providers.clone();
                handles.push(tokio::spawn(async move {
                    let result = this.run_one(key.clone(), &params, bars_count, &providers).await;
                    drop(permit);
                    result
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(Some(result)) => self.commit_result(result),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "scanner worker task panicked"),
                }
            }

            self.cpu_adaptive_sleep().await;
        }
    }

    fn collect_candidates(&self, timeframes: &[Timeframe]) -> Vec<StreamKey> {
        let cfg = self.config.read().clone();
        let now = Instant::now();
        let last_scan = self.last_scan_time.lock();
        let last_regime = self.last_regime.lock();

        let mut candidates = Vec::new();
        for symbol in &self.symbols {
            for &tf in timeframes {
                let key = (symbol.clone(), tf);
                let regime = last_regime.get(&key).copied().unwrap_or(Regime::Normal);
                let interval = interval_for_regime(&cfg, regime);
                let due = match last_scan.get(&key) {
                    Some(last) => now.duration_since(*last).as_secs_f64() >= interval,
                    None => true,
                };
                if due {
                    candidates.push(key);
                }
            }
        }
        candidates
    }

    /// Fetches bars and classifies one stream. Any failure is logged and
    /// skipped — the next sweep will retry; a single bad stream never takes
    /// down the coordinator.
    async fn run_one(
        &self,
        key: StreamKey,
        params: &ClassifierParams,
        bars_count: u32,
        providers: &DataProviderManager,
    ) -> Option<WorkerResult> {
        let (symbol, timeframe) = &key;
        let bars = providers
            .fetch_ohlc(symbol, timeframe.as_str(), bars_count, None, true)
            .await;

        let Some(bars) = bars else {
            warn!(symbol, timeframe = timeframe.as_str(), "scanner fetch_ohlc returned no bars, skipping");
            return None;
        };

        let mut classifiers = self.classifiers.lock();
        let classifier = classifiers
            .entry(key.clone())
            .or_insert_with(|| RegimeClassifier::new(params.clone()));
        classifier.load_ohlc(&bars);
        let current_price = bars.last().map(|b| b.close);
        let regime = classifier.classify(current_price);
        let metrics = classifier.get_metrics();
        drop(classifiers);

        Some(WorkerResult { key, regime, metrics, bars })
    }

    fn commit_result(&self, result: WorkerResult) {
        let WorkerResult { key, regime, metrics, bars } = result;
        {
            let mut last_regime = self.last_regime.lock();
            let mut last_metrics = self.last_metrics.lock();
            let mut last_scan_time = self.last_scan_time.lock();
            let mut last_dataframes = self.last_dataframes.lock();
            last_regime.insert(key.clone(), regime);
            last_metrics.insert(key.clone(), metrics.clone());
            last_scan_time.insert(key.clone(), Instant::now());
            last_dataframes.insert(key.clone(), bars);
        }

        let snapshot = ScanSnapshot {
            symbol: key.0.clone(),
            timeframe: key.1,
            regime,
            metrics,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.storage.log_market_state(&snapshot);
    }

    /// Samples real CPU usage and sleeps `base_sleep_seconds * scan_mode`,
    /// inflated when CPU usage exceeds `cpu_limit_pct`. Consumed in 0.2s
    /// quanta so `stop()` takes effect promptly.
    async fn cpu_adaptive_sleep(&self) {
        let cfg = self.config.read().clone();
        let cpu_pct = {
            let mut sys = self.sys.lock();
            sys.refresh_cpu();
            sys.global_cpu_info().cpu_usage() as f64
        };

        let base = cfg.base_sleep_seconds * cfg.scan_mode.worker_multiplier();
        let sleep_secs = if cpu_pct > cfg.cpu_limit_pct {
            let factor = 1.0 + ((cpu_pct - cfg.cpu_limit_pct) / 20.0).min(cfg.max_sleep_multiplier - 1.0);
            base * factor
        } else {
            base
        };

        self.chunked_sleep(Duration::from_secs_f64(sleep_secs.max(0.0))).await;
    }

    async fn chunked_sleep(&self, total: Duration) {
        const QUANTUM: Duration = Duration::from_millis(200);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.is_stopped() {
                return;
            }
            let step = remaining.min(QUANTUM);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_for_regime_matches_spec_defaults() {
        let cfg = ScannerConfig::default();
        assert_eq!(interval_for_regime(&cfg, Regime::Trend), 1.0);
        assert_eq!(interval_for_regime(&cfg, Regime::Crash), 1.0);
        assert_eq!(interval_for_regime(&cfg, Regime::Range), 10.0);
        assert_eq!(interval_for_regime(&cfg, Regime::Normal), 5.0);
    }

    #[tokio::test]
    async fn scanner_reports_no_candidates_as_empty_heatmap() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let client = Arc::new(crate::binance::client::BinanceClient::new("k", "s"));
        let providers = Arc::new(DataProviderManager::new(storage.clone(), client));
        let scanner = Scanner::new(storage, providers, vec!["BTCUSDT".to_string()], ScannerConfig::default());
        assert!(scanner.snapshot_all().is_empty());
    }

    #[test]
    fn max_workers_scales_with_scan_mode() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let client = Arc::new(crate::binance::client::BinanceClient::new("k", "s"));
        let providers = Arc::new(DataProviderManager::new(storage.clone(), client));
        let mut cfg = ScannerConfig::default();
        cfg.scan_mode = ScanMode::Eco;
        let scanner = Scanner::new(storage, providers, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()], cfg);
        assert!(scanner.max_workers() >= 1);
    }
}
