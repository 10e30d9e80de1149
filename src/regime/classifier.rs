// =============================================================================
// Regime Classifier
// =============================================================================
//
// Produces one confirmed regime per (symbol, timeframe) stream, stable
// against flicker: ADX thresholds with hysteresis on the TREND/RANGE
// boundary, a volatility-shock override for CRASH, and a persistence
// debounce so a single noisy bar cannot flip the confirmed regime.
//
// Each Scanner worker owns exactly one classifier instance per stream and
// calls `classify` only from within its own scan — no cross-thread mutation
// of classifier state is expected or guarded against here.

use crate::indicators::{adx::calculate_adx, atr::calculate_atr, sma::calculate_sma};
use crate::types::{Bar, Bias, Regime, RegimeMetrics};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierParams {
    pub adx_period: usize,
    pub sma_period: usize,
    pub adx_trend_threshold: f64,
    pub adx_range_threshold: f64,
    pub adx_range_exit_threshold: f64,
    pub volatility_shock_multiplier: f64,
    pub shock_lookback: usize,
    pub min_volatility_atr_period: usize,
    pub persistence_candles: u32,
    pub max_history: usize,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            adx_period: 14,
            sma_period: 200,
            adx_trend_threshold: 25.0,
            adx_range_threshold: 20.0,
            adx_range_exit_threshold: 18.0,
            volatility_shock_multiplier: 5.0,
            shock_lookback: 5,
            min_volatility_atr_period: 50,
            persistence_candles: 2,
            max_history: 300,
        }
    }
}

/// Per-stream stateful classifier. Not `Sync`-shared across workers: the
/// Scanner owns one instance per (symbol, timeframe) key behind its worker.
pub struct RegimeClassifier {
    params: ClassifierParams,
    buffer: VecDeque<Bar>,
    confirmed: Option<Regime>,
    pending: Option<Regime>,
    pending_count: u32,
    last_classify_len: usize,
    last_metrics: RegimeMetrics,
}

impl RegimeClassifier {
    pub fn new(params: ClassifierParams) -> Self {
        Self {
            params,
            buffer: VecDeque::with_capacity(params.max_history),
            confirmed: None,
            pending: None,
            pending_count: 0,
            last_classify_len: 0,
            last_metrics: RegimeMetrics::default(),
        }
    }

    fn min_bars_for_classification(&self) -> usize {
        (self.params.adx_period * 2).max(20)
    }

    /// Replaces the buffer wholesale. Resets confirmed and pending state and
    /// the classify cache, per §4.2's explicit contract for `load_ohlc`.
    pub fn load_ohlc(&mut self, bars: &[Bar]) {
        self.buffer.clear();
        let start = bars.len().saturating_sub(self.params.max_history);
        self.buffer.extend(bars[start..].iter().copied());
        self.confirmed = None;
        self.pending = None;
        self.pending_count = 0;
        self.last_classify_len = 0;
    }

    fn add_bar(&mut self, bar: Bar) {
        self.buffer.push_back(bar);
        while self.buffer.len() > self.params.max_history {
            self.buffer.pop_front();
        }
    }

    /// Reloads only `adx_period` and `sma_period` from a fresh set of
    /// parameters — the narrower reload the source actually performs.
    /// Remaining thresholds are refreshed by constructing a new
    /// `ClassifierParams` and calling this, which is what the owning
    /// Scanner does once per config-reload cycle.
    pub fn reload_params(&mut self, adx_period: usize, sma_period: usize) {
        self.params.adx_period = adx_period;
        self.params.sma_period = sma_period;
    }

    pub fn set_params(&mut self, params: ClassifierParams) {
        self.params = params;
    }

    fn contiguous_slice(&self) -> Vec<Bar> {
        self.buffer.iter().copied().collect()
    }

    /// Runs one classification pass. `current_price`, if given, is appended
    /// as a synthetic bar (cloning the last bar's OHLC and overriding close)
    /// before classifying — this lets a caller get an intra-bar read without
    /// waiting for the next closed bar.
    pub fn classify(&mut self, current_price: Option<f64>) -> Regime {
        if let Some(price) = current_price {
            if let Some(&last) = self.buffer.back() {
                let synthetic = Bar {
                    timestamp: last.timestamp,
                    open: last.open,
                    high: last.high.max(price),
                    low: last.low.min(price),
                    close: price,
                    volume: last.volume,
                };
                self.add_bar(synthetic);
            }
        }

        let min_bars = self.min_bars_for_classification();
        if self.buffer.len() < min_bars {
            self.last_metrics = RegimeMetrics::default();
            return Regime::Normal;
        }

        if self.buffer.len() == self.last_classify_len {
            return self.confirmed.unwrap_or(Regime::Normal);
        }

        let bars = self.contiguous_slice();
        let metrics = self.compute_metrics(&bars);
        self.last_metrics = metrics;

        let raw = self.classify_raw(&bars, &metrics);
        self.last_classify_len = self.buffer.len();

        match self.confirmed {
            None => {
                self.confirmed = Some(raw);
                self.pending = None;
                self.pending_count = 0;
            }
            Some(confirmed) if confirmed == raw => {
                self.pending = None;
                self.pending_count = 0;
            }
            Some(_) => match self.pending {
                Some(pending) if pending == raw => {
                    self.pending_count += 1;
                    if self.pending_count >= self.params.persistence_candles {
                        self.confirmed = Some(raw);
                        self.pending = None;
                        self.pending_count = 0;
                    }
                }
                _ => {
                    self.pending = Some(raw);
                    self.pending_count = 1;
                }
            },
        }

        self.confirmed.unwrap_or(Regime::Normal)
    }

    fn classify_raw(&self, bars: &[Bar], metrics: &RegimeMetrics) -> Regime {
        if metrics.volatility_shock {
            return Regime::Crash;
        }
        let adx = metrics.adx;
        if self.confirmed == Some(Regime::Trend) && adx < self.params.adx_range_exit_threshold {
            return Regime::Range;
        }
        if adx > self.params.adx_trend_threshold {
            return Regime::Trend;
        }
        if adx < self.params.adx_range_threshold {
            return Regime::Range;
        }
        let _ = bars;
        Regime::Normal
    }

    fn compute_metrics(&self, bars: &[Bar]) -> RegimeMetrics {
        let adx = calculate_adx(bars, self.params.adx_period).unwrap_or(0.0);
        let atr_period = self.params.min_volatility_atr_period;
        let last_close = bars.last().map(|b| b.close).unwrap_or(0.0);

        let atr_pct = calculate_atr(bars, atr_period)
            .filter(|_| last_close != 0.0)
            .map(|atr| atr / last_close * 100.0)
            .unwrap_or(0.0);

        let shock = self.detect_shock(bars, atr_pct);

        let (sma_distance, bias) = match calculate_sma(bars, self.params.sma_period) {
            Some(sma) if sma != 0.0 => {
                let dist = (last_close - sma) / sma * 100.0;
                let bias = if dist > 0.0 {
                    Bias::Bullish
                } else {
                    Bias::Bearish
                };
                (dist, Some(bias))
            }
            _ => (0.0, None),
        };

        RegimeMetrics {
            adx,
            atr_pct,
            volatility_shock: shock,
            sma_distance,
            bias,
        }
    }

    /// §4.2a shock detection: requires bars >= 2*shock_lookback +
    /// max(20, min_volatility_atr_period). Compares the stdev of the last
    /// `shock_lookback` bar-to-bar returns against the stdev of the
    /// `shock_lookback` returns immediately prior, guarded against sub-ATR
    /// noise by requiring the short stdev to be at least as large as
    /// `atr_pct` (expressed as a fraction, to match return units).
    fn detect_shock(&self, bars: &[Bar], atr_pct: f64) -> bool {
        let lookback = self.params.shock_lookback;
        if lookback == 0 {
            return false;
        }
        let required = 2 * lookback + 20.max(self.params.min_volatility_atr_period);
        if bars.len() < required {
            return false;
        }

        let returns: Vec<f64> = bars
            .windows(2)
            .filter_map(|w| {
                if w[0].close == 0.0 {
                    None
                } else {
                    Some((w[1].close - w[0].close) / w[0].close)
                }
            })
            .collect();
        if returns.len() < 2 * lookback {
            return false;
        }

        let n = returns.len();
        let current_window = &returns[n - lookback..];
        let base_window = &returns[n - 2 * lookback..n - lookback];

        let current_vol = stdev(current_window);
        let base_vol = stdev(base_window);

        if base_vol <= 0.0 {
            return false;
        }
        let atr_fraction = atr_pct / 100.0;
        if current_vol < atr_fraction {
            return false;
        }
        current_vol / base_vol >= self.params.volatility_shock_multiplier
    }

    pub fn get_metrics(&self) -> RegimeMetrics {
        self.last_metrics
    }

    pub fn current_regime(&self) -> Option<Regime> {
        self.confirmed
    }

    pub fn bar_count(&self) -> usize {
        self.buffer.len()
    }
}

fn stdev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64) -> Bar {
        Bar {
            timestamp: 0,
            open: close,
            high: close + 0.1,
            low: close - 0.1,
            close,
            volume: 1.0,
        }
    }

    fn trending_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                Bar {
                    timestamp: 0,
                    open: base,
                    high: base + 1.5,
                    low: base - 0.5,
                    close: base + 1.0,
                    volume: 1.0,
                }
            })
            .collect()
    }

    #[test]
    fn insufficient_bars_returns_normal() {
        let mut c = RegimeClassifier::new(ClassifierParams::default());
        c.load_ohlc(&vec![bar(100.0); 10]);
        assert_eq!(c.classify(None), Regime::Normal);
    }

    #[test]
    fn exact_minimum_boundary_is_normal() {
        let mut c = RegimeClassifier::new(ClassifierParams::default());
        let bars = vec![bar(100.0); 28]; // adx_period*2 = 28
        c.load_ohlc(&bars);
        assert_eq!(c.classify(None), Regime::Normal);
    }

    #[test]
    fn strong_trend_confirms_after_persistence() {
        let mut params = ClassifierParams::default();
        params.persistence_candles = 2;
        let mut c = RegimeClassifier::new(params);
        let bars = trending_bars(60);
        c.load_ohlc(&bars);
        let r1 = c.classify(None);
        // First call confirms immediately since confirmed starts unset.
        assert_eq!(r1, Regime::Trend);
    }

    #[test]
    fn hysteresis_requires_exit_threshold_not_entry_threshold() {
        let mut params = ClassifierParams::default();
        params.persistence_candles = 1;
        let mut c = RegimeClassifier::new(params);
        c.load_ohlc(&trending_bars(60));
        assert_eq!(c.classify(None), Regime::Trend);

        // ADX between range_exit_threshold (18) and trend_threshold (25)
        // should NOT flip a confirmed TREND back to RANGE.
        let flat_bars = vec![bar(160.0); 60];
        c.load_ohlc(&flat_bars);
        // Flat series drives ADX toward 0, below range_exit_threshold, so it
        // should eventually exit to RANGE once persistence is satisfied.
        let regime = c.classify(None);
        assert_eq!(regime, Regime::Range);
    }

    #[test]
    fn cached_result_when_buffer_length_unchanged() {
        let mut c = RegimeClassifier::new(ClassifierParams::default());
        c.load_ohlc(&trending_bars(60));
        let r1 = c.classify(None);
        let r2 = c.classify(None);
        assert_eq!(r1, r2);
    }

    #[test]
    fn shock_with_zero_baseline_stdev_is_no_shock() {
        let c = RegimeClassifier::new(ClassifierParams::default());
        let mut bars = vec![bar(100.0); 100];
        for i in 0..10 {
            bars.push(bar(100.0 + i as f64));
        }
        assert!(!c.detect_shock(&bars, 0.1));
    }

    #[test]
    fn shock_override_on_volatility_burst() {
        let params = ClassifierParams::default();
        let mut c = RegimeClassifier::new(params);
        let mut bars: Vec<Bar> = Vec::new();
        for i in 0..150 {
            let v = 100.0 + ((i * 37) % 5) as f64 * 0.01;
            bars.push(bar(v));
        }
        for i in 0..20 {
            let swing = if i % 2 == 0 { 8.0 } else { -8.0 };
            bars.push(bar(100.0 + swing));
        }
        c.load_ohlc(&bars);
        let regime = c.classify(None);
        assert_eq!(regime, Regime::Crash);
        assert!(c.get_metrics().volatility_shock);
    }

    #[test]
    fn persistence_candles_one_confirms_immediately() {
        let mut params = ClassifierParams::default();
        params.persistence_candles = 1;
        let mut c = RegimeClassifier::new(params);
        c.load_ohlc(&trending_bars(60));
        assert_eq!(c.classify(None), Regime::Trend);
    }
}
