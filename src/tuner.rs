// =============================================================================
// EDGE Tuner — trade-outcome-driven adjustment of dynamic strategy parameters
// =============================================================================
//
// Reads recent trade history from Storage, computes win rate and the current
// consecutive-loss streak, and nudges three generic dynamic-parameter knobs
// (`adx_threshold`, `atr_multiplier`, `sma20_proximity_pct`) more conservative
// or more permissive depending on how the strategy has been performing. The
// knobs live in Storage's opaque `dynamic_params` JSON blob rather than a
// typed struct — concurrent strategies reload them from Storage before their
// next signal-generation pass, so no in-process broadcast is needed.
//
// A second, offline grid-search calibration utility also lives in this
// module (`calibrate_classifier_thresholds`): it optimizes the classifier's
// own ADX/volatility thresholds against historical market-state snapshots by
// minimizing a false-positive-rate proxy. It is not part of the live control
// loop above — callable from tests/tooling only.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::TunerConfig;
use crate::storage::Storage;
use crate::types::{Regime, TradeResult};

const MAX_DRIFT_PCT: f64 = 0.20;

const ADX_THRESHOLD_MIN: f64 = 15.0;
const ADX_THRESHOLD_MAX: f64 = 35.0;
const ATR_MULTIPLIER_MIN: f64 = 1.0;
const ATR_MULTIPLIER_MAX: f64 = 3.0;
const SMA20_PROXIMITY_MIN_PCT: f64 = 0.1;
const SMA20_PROXIMITY_MAX_PCT: f64 = 5.0;

const DEFAULT_ADX_THRESHOLD: f64 = 25.0;
const DEFAULT_ATR_MULTIPLIER: f64 = 1.5;
const DEFAULT_SMA20_PROXIMITY_PCT: f64 = 1.0;

/// Why a tuning pass made no adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    InsufficientData,
    WithinTarget,
}

/// Result of one tuning pass.
#[derive(Clone)]
pub enum TuningOutcome {
    Skipped(SkipReason),
    Adjusted {
        trigger: String,
        old_params: Value,
        new_params: Value,
    },
}

pub struct EdgeTuner {
    storage: Arc<Storage>,
    config: TunerConfig,
}

impl EdgeTuner {
    pub fn new(storage: Arc<Storage>, config: TunerConfig) -> Self {
        Self { storage, config }
    }

    /// Runs one tuning pass: loads recent trades, decides a direction, and
    /// persists the adjustment (old params, new params, stats, trigger,
    /// timestamp) to Storage's tuning history.
    pub fn tune(&self) -> TuningOutcome {
        let trades = match self.storage.get_trade_results(self.config.limit_trades) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "tuner failed to load trade history");
                Vec::new()
            }
        };

        if trades.len() < self.config.min_trades_for_tuning as usize {
            return TuningOutcome::Skipped(SkipReason::InsufficientData);
        }

        let win_rate = win_rate(&trades);
        let consecutive_losses = trailing_consecutive_losses(&trades);

        let old_params = self.current_params();
        let (new_params, trigger) = self.decide(&old_params, win_rate, consecutive_losses);

        if new_params == old_params {
            return TuningOutcome::Skipped(SkipReason::WithinTarget);
        }

        self.storage.update_dynamic_params(new_params.clone());

        let record = json!({
            "old_params": old_params,
            "new_params": new_params,
            "stats": {
                "win_rate": win_rate,
                "consecutive_losses": consecutive_losses,
                "sample_size": trades.len(),
            },
            "trigger": trigger,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        self.storage.save_tuning_adjustment(&record);

        info!(win_rate, consecutive_losses, trigger = %trigger, "edge tuner adjusted dynamic params");
        TuningOutcome::Adjusted { trigger, old_params, new_params }
    }

    fn current_params(&self) -> Value {
        let stored = self.storage.get_dynamic_params().unwrap_or_else(|_| json!({}));
        let adx_threshold = stored.get("adx_threshold").and_then(Value::as_f64).unwrap_or(DEFAULT_ADX_THRESHOLD);
        let atr_multiplier = stored.get("atr_multiplier").and_then(Value::as_f64).unwrap_or(DEFAULT_ATR_MULTIPLIER);
        let sma20_proximity_pct = stored
            .get("sma20_proximity_pct")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_SMA20_PROXIMITY_PCT);
        json!({
            "adx_threshold": adx_threshold,
            "atr_multiplier": atr_multiplier,
            "sma20_proximity_pct": sma20_proximity_pct,
        })
    }

    fn decide(&self, current: &Value, win_rate: f64, consecutive_losses: u32) -> (Value, String) {
        let adx_threshold = current["adx_threshold"].as_f64().unwrap_or(DEFAULT_ADX_THRESHOLD);
        let atr_multiplier = current["atr_multiplier"].as_f64().unwrap_or(DEFAULT_ATR_MULTIPLIER);
        let sma20_proximity_pct = current["sma20_proximity_pct"].as_f64().unwrap_or(DEFAULT_SMA20_PROXIMITY_PCT);

        let conservative = consecutive_losses >= self.config.consecutive_loss_threshold
            || win_rate < self.config.conservative_win_rate_threshold;
        let permissive = !conservative && win_rate > self.config.aggressive_win_rate_threshold;

        if conservative {
            let trigger = if consecutive_losses >= self.config.consecutive_loss_threshold {
                "consecutive_losses"
            } else {
                "low_win_rate"
            };
            let new = json!({
                "adx_threshold": drift_toward(adx_threshold, ADX_THRESHOLD_MAX, MAX_DRIFT_PCT).clamp(ADX_THRESHOLD_MIN, ADX_THRESHOLD_MAX),
                "atr_multiplier": drift_toward(atr_multiplier, ATR_MULTIPLIER_MAX, MAX_DRIFT_PCT).clamp(ATR_MULTIPLIER_MIN, ATR_MULTIPLIER_MAX),
                "sma20_proximity_pct": drift_toward(sma20_proximity_pct, SMA20_PROXIMITY_MIN_PCT, MAX_DRIFT_PCT).clamp(SMA20_PROXIMITY_MIN_PCT, SMA20_PROXIMITY_MAX_PCT),
            });
            (new, trigger.to_string())
        } else if permissive {
            let new = json!({
                "adx_threshold": drift_toward(adx_threshold, ADX_THRESHOLD_MIN, MAX_DRIFT_PCT).clamp(ADX_THRESHOLD_MIN, ADX_THRESHOLD_MAX),
                "atr_multiplier": drift_toward(atr_multiplier, ATR_MULTIPLIER_MIN, MAX_DRIFT_PCT).clamp(ATR_MULTIPLIER_MIN, ATR_MULTIPLIER_MAX),
                "sma20_proximity_pct": drift_toward(sma20_proximity_pct, SMA20_PROXIMITY_MAX_PCT, MAX_DRIFT_PCT).clamp(SMA20_PROXIMITY_MIN_PCT, SMA20_PROXIMITY_MAX_PCT),
            });
            (new, "high_win_rate".to_string())
        } else {
            (current.clone(), "within_target".to_string())
        }
    }
}

/// Moves `value` a bounded fraction of the distance toward `target`, capped
/// at `max_drift_pct` of `value` itself so cumulative drift cannot runaway.
fn drift_toward(value: f64, target: f64, max_drift_pct: f64) -> f64 {
    let max_step = (value.abs() * max_drift_pct).max(f64::EPSILON);
    let desired = target - value;
    value + desired.clamp(-max_step, max_step)
}

fn win_rate(trades: &[TradeResult]) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let wins = trades.iter().filter(|t| t.result.is_win()).count();
    wins as f64 / trades.len() as f64
}

/// Counts consecutive losses at the head of the trade list (most recent
/// first, per `get_trade_results`'s `ORDER BY exit_time DESC`).
fn trailing_consecutive_losses(trades: &[TradeResult]) -> u32 {
    trades.iter().take_while(|t| !t.result.is_win()).count() as u32
}

// -----------------------------------------------------------------------
// Offline calibration utility (grid search, not part of the live loop)
// -----------------------------------------------------------------------

/// One candidate ADX/volatility threshold pair evaluated by the grid search.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdCandidate {
    pub adx_trend_threshold: f64,
    pub volatility_shock_multiplier: f64,
}

/// A labeled historical observation: the regime a candidate would classify,
/// versus what actually followed.
#[derive(Debug, Clone, Copy)]
pub struct LabeledObservation {
    pub adx: f64,
    pub volatility_ratio: f64,
    pub actual_regime: Regime,
}

/// Evaluates every candidate in `grid` against `observations`, returning the
/// one minimizing the false-positive rate for CRASH/TREND calls (a call that
/// disagrees with the labeled regime). Ties keep the first candidate in
/// iteration order. Returns `None` for an empty grid or observation set.
///
/// This is a calibration tool for the classifier's own thresholds, run
/// offline against historical market-state snapshots — it never touches
/// Storage's live `dynamic_params` and is not wired into the Trade Closure
/// Listener.
pub fn calibrate_classifier_thresholds(
    grid: &[ThresholdCandidate],
    observations: &[LabeledObservation],
) -> Option<ThresholdCandidate> {
    if grid.is_empty() || observations.is_empty() {
        return None;
    }

    grid.iter()
        .copied()
        .min_by(|a, b| {
            false_positive_rate(a, observations)
                .partial_cmp(&false_positive_rate(b, observations))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

fn false_positive_rate(candidate: &ThresholdCandidate, observations: &[LabeledObservation]) -> f64 {
    let mut calls = 0usize;
    let mut false_positives = 0usize;

    for obs in observations {
        let predicted_crash = obs.volatility_ratio >= candidate.volatility_shock_multiplier;
        let predicted_trend = !predicted_crash && obs.adx >= candidate.adx_trend_threshold;

        if predicted_crash {
            calls += 1;
            if obs.actual_regime != Regime::Crash {
                false_positives += 1;
            }
        } else if predicted_trend {
            calls += 1;
            if obs.actual_regime != Regime::Trend {
                false_positives += 1;
            }
        }
    }

    if calls == 0 {
        return 1.0;
    }
    false_positives as f64 / calls as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitReason;

    fn trade(result_is_win: bool) -> TradeResult {
        TradeResult {
            ticket: uuid::Uuid::new_v4().to_string(),
            signal_id: None,
            symbol: "BTCUSDT".to_string(),
            entry_price: 100.0,
            exit_price: if result_is_win { 105.0 } else { 95.0 },
            entry_time: 0,
            exit_time: 0,
            profit_loss: if result_is_win { 5.0 } else { -5.0 },
            pips: 0.0,
            exit_reason: ExitReason::TakeProfitHit,
            result: if result_is_win {
                crate::types::TradeOutcome::Win
            } else {
                crate::types::TradeOutcome::Loss
            },
            broker_id: "binance".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn insufficient_trades_skips() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        let mut cfg = TunerConfig::default();
        cfg.min_trades_for_tuning = 20;
        let tuner = EdgeTuner::new(storage, cfg);
        assert!(matches!(tuner.tune(), TuningOutcome::Skipped(SkipReason::InsufficientData)));
    }

    #[test]
    fn heavy_losses_trigger_conservative_adjustment() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        for _ in 0..10 {
            storage.save_trade_result(&trade(false));
        }
        let mut cfg = TunerConfig::default();
        cfg.min_trades_for_tuning = 5;
        cfg.consecutive_loss_threshold = 3;
        let tuner = EdgeTuner::new(storage, cfg);

        match tuner.tune() {
            TuningOutcome::Adjusted { trigger, old_params, new_params } => {
                assert_eq!(trigger, "consecutive_losses");
                assert!(new_params["adx_threshold"].as_f64().unwrap() >= old_params["adx_threshold"].as_f64().unwrap());
            }
            other => panic!("expected adjustment, got {other:?}"),
        }
    }

    #[test]
    fn within_target_performance_skips_instead_of_adjusting() {
        let storage = Arc::new(Storage::open(":memory:").unwrap());
        for i in 0..10 {
            storage.save_trade_result(&trade(i % 2 == 0));
        }
        let mut cfg = TunerConfig::default();
        cfg.min_trades_for_tuning = 5;
        cfg.consecutive_loss_threshold = 100;
        cfg.conservative_win_rate_threshold = 0.0;
        cfg.aggressive_win_rate_threshold = 1.0;
        let tuner = EdgeTuner::new(storage, cfg);

        assert!(matches!(tuner.tune(), TuningOutcome::Skipped(SkipReason::WithinTarget)));
    }

    #[test]
    fn drift_is_bounded_by_max_drift_pct() {
        let stepped = drift_toward(25.0, 35.0, MAX_DRIFT_PCT);
        assert!(stepped <= 25.0 * (1.0 + MAX_DRIFT_PCT) + 1e-9);
    }

    #[test]
    fn calibration_grid_search_prefers_lower_false_positive_rate() {
        let observations = vec![
            LabeledObservation { adx: 30.0, volatility_ratio: 1.0, actual_regime: Regime::Trend },
            LabeledObservation { adx: 10.0, volatility_ratio: 1.0, actual_regime: Regime::Range },
            LabeledObservation { adx: 40.0, volatility_ratio: 6.0, actual_regime: Regime::Crash },
        ];
        let grid = vec![
            ThresholdCandidate { adx_trend_threshold: 25.0, volatility_shock_multiplier: 5.0 },
            ThresholdCandidate { adx_trend_threshold: 5.0, volatility_shock_multiplier: 0.5 },
        ];
        let best = calibrate_classifier_thresholds(&grid, &observations).unwrap();
        assert_eq!(best.adx_trend_threshold, 25.0);
    }
}

impl std::fmt::Debug for TuningOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "Skipped({reason:?})"),
            Self::Adjusted { trigger, .. } => write!(f, "Adjusted(trigger={trigger})"),
        }
    }
}
