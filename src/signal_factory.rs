// =============================================================================
// Signal Factory — turns scan snapshots into scored, priced trade signals
// =============================================================================
//
// Consumes one (symbol, timeframe) scan result plus its underlying bar frame
// (the Scanner keeps the frame around precisely so the factory never has to
// refetch), derives a set of independent technical inputs, aggregates them
// through the regime-aware `WeightedScorer`, and — on a non-HOLD decision —
// prices the resulting entry/stop/target using ATR multiples with percentage
// floors. Confluence/trifecta context (how many independent inputs agree on
// direction) is stamped onto the signal's metadata for downstream inspection
// and for the Risk Manager's position sizing.

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::config::StrategyParams;
use crate::indicators::adx::calculate_adx;
use crate::indicators::atr::calculate_atr;
use crate::indicators::bollinger::calculate_bollinger;
use crate::indicators::ema::calculate_ema;
use crate::indicators::roc::current_roc;
use crate::indicators::rsi::current_rsi;
use crate::signals::{SignalDecayManager, SignalInput, WeightedScorer};
use crate::types::{Bar, Regime, ScanSnapshot, Signal, SignalStatus, SignalType};

/// Minimum bar count needed to compute every indicator the factory scores
/// (EMA55 is the longest lookback in the ensemble).
const MIN_BARS: usize = 60;

pub struct SignalFactory {
    scorer: WeightedScorer,
    decay: SignalDecayManager,
}

impl SignalFactory {
    pub fn new(entry_threshold: f64) -> Self {
        Self {
            scorer: WeightedScorer::new(entry_threshold),
            decay: SignalDecayManager::default(),
        }
    }

    /// Produces a single priced `Signal` for one scan result, or `None` when
    /// there isn't enough history, the ensemble holds, or the priced
    /// levels would violate the configured floors.
    pub fn generate(
        &self,
        snapshot: &ScanSnapshot,
        bars: &[Bar],
        params: &StrategyParams,
        connector_type: &str,
        account_balance: f64,
        trace_id: &str,
    ) -> Option<Signal> {
        if bars.len() < MIN_BARS {
            debug!(symbol = %snapshot.symbol, bars = bars.len(), "signal factory: insufficient bars, skipping");
            return None;
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let ema9 = calculate_ema(&closes, 9);
        let ema21 = calculate_ema(&closes, 21);
        let ema55 = calculate_ema(&closes, 55);
        let (rsi, _zone) = current_rsi(&closes, 14)?;
        let adx = calculate_adx(bars, 14).unwrap_or(0.0);
        let atr = calculate_atr(bars, 14)?;
        let bollinger = calculate_bollinger(&closes, 20, 2.0)?;
        let roc = current_roc(&closes, 14).unwrap_or(0.0);

        let last_close = *closes.last()?;
        let ema9_last = *ema9.last()?;
        let ema21_last = *ema21.last()?;
        let ema55_last = *ema55.last()?;

        let ema_direction = if ema9_last > ema21_last && ema21_last > ema55_last {
            1.0
        } else if ema9_last < ema21_last && ema21_last < ema55_last {
            -1.0
        } else {
            0.0
        };

        let rsi_direction = if rsi > 55.0 {
            1.0
        } else if rsi < 45.0 {
            -1.0
        } else {
            0.0
        };

        let adx_direction = if adx > 25.0 { ema_direction.signum() } else { 0.0 };

        let bbw_pct = if bollinger.middle != 0.0 {
            (bollinger.width / bollinger.middle) * 100.0
        } else {
            0.0
        };
        let bbw_direction = if last_close > bollinger.upper {
            -1.0
        } else if last_close < bollinger.lower {
            1.0
        } else {
            0.0
        };

        let roc_direction = roc.signum();

        let inputs = vec![
            SignalInput { name: "ema_trend".to_string(), weight: 0.20, confidence: ema_direction.abs(), direction: ema_direction },
            SignalInput { name: "rsi".to_string(), weight: 0.15, confidence: ((rsi - 50.0).abs() / 50.0).min(1.0), direction: rsi_direction },
            SignalInput { name: "adx".to_string(), weight: 0.15, confidence: (adx / 50.0).min(1.0), direction: adx_direction },
            SignalInput { name: "bbw".to_string(), weight: 0.10, confidence: (bbw_pct / 10.0).min(1.0), direction: bbw_direction },
            SignalInput { name: "roc".to_string(), weight: 0.10, confidence: roc.abs().min(1.0), direction: roc_direction },
        ];

        let confluence_count = inputs.iter().filter(|i| i.direction != 0.0).count();
        let trifecta = ema_direction != 0.0 && adx_direction == ema_direction && rsi_direction == ema_direction;

        let regime_label = match snapshot.regime {
            Regime::Trend => "trend",
            Regime::Range => "range",
            Regime::Normal => "normal",
            Regime::Crash => "crash",
        };
        let scoring = self.scorer.score(&inputs, regime_label);
        self.decay.record(format!("{}|{}", snapshot.symbol, snapshot.timeframe.as_str()), scoring.total_score);

        let signal_type = match scoring.decision.as_str() {
            "BUY" => SignalType::Buy,
            "SELL" => SignalType::Sell,
            _ => return None,
        };

        let (stop_loss, take_profit) = price_levels(signal_type, last_close, atr, params)?;

        let quantity = position_size(account_balance, last_close, params.base_position_pct);
        if quantity <= 0.0 {
            return None;
        }

        let confidence = scoring.total_score.abs().min(1.0);

        Some(Signal {
            id: Uuid::new_v4().to_string(),
            symbol: snapshot.symbol.clone(),
            signal_type,
            timeframe: snapshot.timeframe,
            entry_price: last_close,
            stop_loss,
            take_profit,
            confidence,
            strategy_id: "weighted_ensemble".to_string(),
            connector_type: connector_type.to_string(),
            regime: snapshot.regime,
            metadata: json!({
                "quantity": quantity,
                "confluence_count": confluence_count,
                "trifecta": trifecta,
                "score": scoring.total_score,
                "contributions": scoring.signal_contributions,
            }),
            timestamp: snapshot.timestamp,
            trace_id: trace_id.to_string(),
            status: SignalStatus::Pending,
        })
    }
}

/// Prices SL/TP from an ATR multiple, then widens toward the configured
/// percentage floor whenever the ATR-derived distance is tighter than it.
fn price_levels(side: SignalType, entry: f64, atr: f64, params: &StrategyParams) -> Option<(f64, f64)> {
    if entry <= 0.0 || atr <= 0.0 {
        return None;
    }

    let sl_distance = (atr * params.sl_atr_multiplier).max(entry * params.min_sl_pct / 100.0);
    let tp_distance = (atr * params.tp1_atr_multiplier).max(entry * params.min_tp1_pct / 100.0);

    let (stop_loss, take_profit) = match side {
        SignalType::Buy => (entry - sl_distance, entry + tp_distance),
        SignalType::Sell => (entry + sl_distance, entry - tp_distance),
    };

    if stop_loss <= 0.0 || take_profit <= 0.0 {
        return None;
    }

    Some((stop_loss, take_profit))
}

/// Sizes the position as a percentage of available balance divided by entry
/// price, giving a quantity denominated in the base asset.
fn position_size(account_balance: f64, entry_price: f64, base_position_pct: f64) -> f64 {
    if entry_price <= 0.0 || account_balance <= 0.0 {
        return 0.0;
    }
    let notional = account_balance * (base_position_pct / 100.0);
    notional / entry_price
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RegimeMetrics, Timeframe};

    fn trending_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + i as f64 * 1.5;
                Bar { timestamp: i as i64, open: base, high: base + 1.0, low: base - 0.5, close: base + 0.5, volume: 10.0 }
            })
            .collect()
    }

    fn snapshot(regime: Regime) -> ScanSnapshot {
        ScanSnapshot {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M5,
            regime,
            metrics: RegimeMetrics::default(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn insufficient_bars_yields_no_signal() {
        let factory = SignalFactory::new(0.05);
        let bars = trending_bars(10);
        let params = StrategyParams::default();
        let result = factory.generate(&snapshot(Regime::Trend), &bars, &params, "binance", 1000.0, "trace-1");
        assert!(result.is_none());
    }

    #[test]
    fn strong_uptrend_generates_buy_signal() {
        let factory = SignalFactory::new(0.02);
        let bars = trending_bars(120);
        let params = StrategyParams::default();
        let result = factory.generate(&snapshot(Regime::Trend), &bars, &params, "binance", 1000.0, "trace-1");
        let signal = result.expect("strong uptrend should produce a signal");
        assert_eq!(signal.signal_type, SignalType::Buy);
        assert!(signal.stop_loss < signal.entry_price);
        assert!(signal.take_profit > signal.entry_price);
    }

    #[test]
    fn price_levels_respect_percentage_floors() {
        let params = StrategyParams::default();
        let (sl, tp) = price_levels(SignalType::Buy, 100.0, 0.01, &params).unwrap();
        assert!((100.0 - sl) >= 100.0 * params.min_sl_pct / 100.0 - 1e-9);
        assert!((tp - 100.0) >= 100.0 * params.min_tp1_pct / 100.0 - 1e-9);
    }

    #[test]
    fn position_size_scales_with_balance() {
        let qty = position_size(1000.0, 100.0, 2.0);
        assert!((qty - 0.2).abs() < 1e-9);
        assert_eq!(position_size(0.0, 100.0, 2.0), 0.0);
    }
}
