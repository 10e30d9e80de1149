// =============================================================================
// Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable lives in `EngineConfig` so the engine can be reconfigured at
// runtime without a restart. Persistence uses an atomic tmp + rename pattern
// to prevent corruption on crash. Every field carries a serde default so an
// older config file with missing fields still loads cleanly — the engine
// never panics on a missing key, per §10's ambient configuration contract.
//
// `EngineConfig` is the file-backed bootstrap snapshot (what composition
// reads at process start and what a graceful shutdown persists back). Once
// running, the authoritative copy of most of these values lives in Storage's
// system_state map (§4.8) and is re-read by each component on its own
// hot-reload cadence; `EngineConfig` only ever changes in response to that
// same Storage state being written back out at shutdown.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::regime::ClassifierParams;
use crate::types::{AccountMode, TradingMode};

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_max_concurrent_positions() -> u32 {
    3
}
fn default_max_daily_loss_pct() -> f64 {
    3.0
}
fn default_max_consecutive_losses() -> u32 {
    5
}
fn default_max_trades_per_day() -> u32 {
    50
}

fn default_sl_atr_multiplier() -> f64 {
    1.5
}
fn default_tp1_atr_multiplier() -> f64 {
    2.5
}
fn default_tp2_atr_multiplier() -> f64 {
    4.0
}
fn default_min_sl_pct() -> f64 {
    0.4
}
fn default_min_tp1_pct() -> f64 {
    0.6
}
fn default_min_tp2_pct() -> f64 {
    1.0
}
fn default_base_position_pct() -> f64 {
    2.0
}

/// Tunable parameters for signal sizing (SL/TP distance, position size).
/// Re-read from Storage's `dynamic_params` before each signal-generation
/// pass so an EDGE Tuner adjustment takes effect without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    #[serde(default = "default_sl_atr_multiplier")]
    pub sl_atr_multiplier: f64,
    #[serde(default = "default_tp1_atr_multiplier")]
    pub tp1_atr_multiplier: f64,
    #[serde(default = "default_tp2_atr_multiplier")]
    pub tp2_atr_multiplier: f64,
    /// CRITICAL FLOOR: must be >= 0.4%.
    #[serde(default = "default_min_sl_pct")]
    pub min_sl_pct: f64,
    /// CRITICAL FLOOR: must be >= 0.6%.
    #[serde(default = "default_min_tp1_pct")]
    pub min_tp1_pct: f64,
    /// CRITICAL FLOOR: must be >= 1.0%.
    #[serde(default = "default_min_tp2_pct")]
    pub min_tp2_pct: f64,
    #[serde(default = "default_base_position_pct")]
    pub base_position_pct: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            sl_atr_multiplier: default_sl_atr_multiplier(),
            tp1_atr_multiplier: default_tp1_atr_multiplier(),
            tp2_atr_multiplier: default_tp2_atr_multiplier(),
            min_sl_pct: default_min_sl_pct(),
            min_tp1_pct: default_min_tp1_pct(),
            min_tp2_pct: default_min_tp2_pct(),
            base_position_pct: default_base_position_pct(),
        }
    }
}

fn default_cpu_limit_pct() -> f64 {
    80.0
}
fn default_sleep_trend() -> f64 {
    1.0
}
fn default_sleep_range() -> f64 {
    10.0
}
fn default_sleep_neutral() -> f64 {
    5.0
}
fn default_sleep_crash() -> f64 {
    1.0
}
fn default_base_sleep() -> f64 {
    1.0
}
fn default_max_sleep_multiplier() -> f64 {
    5.0
}
fn default_bars_count() -> u32 {
    500
}
fn default_timeframes() -> Vec<TimeframeToggle> {
    vec![
        TimeframeToggle {
            timeframe: "M5".to_string(),
            enabled: true,
        },
        TimeframeToggle {
            timeframe: "M15".to_string(),
            enabled: true,
        },
        TimeframeToggle {
            timeframe: "H1".to_string(),
            enabled: false,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeframeToggle {
    pub timeframe: String,
    pub enabled: bool,
}

/// Scan-mode multiplier applied to `max_workers` and `base_sleep_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    Eco,
    Standard,
    Aggressive,
}

impl ScanMode {
    pub fn worker_multiplier(self) -> f64 {
        match self {
            Self::Eco => 0.5,
            Self::Standard => 1.0,
            Self::Aggressive => 2.0,
        }
    }
}

impl Default for ScanMode {
    fn default() -> Self {
        Self::Standard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub cpu_limit_pct: f64,
    pub sleep_trend_seconds: f64,
    pub sleep_range_seconds: f64,
    pub sleep_neutral_seconds: f64,
    pub sleep_crash_seconds: f64,
    pub base_sleep_seconds: f64,
    pub max_sleep_multiplier: f64,
    pub bars_count: u32,
    pub timeframes: Vec<TimeframeToggle>,
    pub scan_mode: ScanMode,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            cpu_limit_pct: default_cpu_limit_pct(),
            sleep_trend_seconds: default_sleep_trend(),
            sleep_range_seconds: default_sleep_range(),
            sleep_neutral_seconds: default_sleep_neutral(),
            sleep_crash_seconds: default_sleep_crash(),
            base_sleep_seconds: default_base_sleep(),
            max_sleep_multiplier: default_max_sleep_multiplier(),
            bars_count: default_bars_count(),
            timeframes: default_timeframes(),
            scan_mode: ScanMode::default(),
        }
    }
}

fn default_loop_trend() -> u64 {
    5
}
fn default_loop_range() -> u64 {
    30
}
fn default_loop_volatile() -> u64 {
    15
}
fn default_loop_shock() -> u64 {
    60
}
fn default_min_sleep_interval() -> u64 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub loop_interval_trend: u64,
    pub loop_interval_range: u64,
    pub loop_interval_volatile: u64,
    pub loop_interval_shock: u64,
    pub min_sleep_interval: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            loop_interval_trend: default_loop_trend(),
            loop_interval_range: default_loop_range(),
            loop_interval_volatile: default_loop_volatile(),
            loop_interval_shock: default_loop_shock(),
            min_sleep_interval: default_min_sleep_interval(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub max_retries: u32,
    pub retry_backoff_secs: f64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

fn default_backup_dir() -> String {
    "backups".to_string()
}
fn default_interval_days() -> u32 {
    1
}
fn default_retention_days() -> u32 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    pub backup_dir: String,
    pub interval_days: u32,
    pub retention_days: u32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_dir: default_backup_dir(),
            interval_days: default_interval_days(),
            retention_days: default_retention_days(),
        }
    }
}

/// Position Manager tunables. Each is optional so the Position Manager can
/// fall back to Storage's `dynamic_params` blob, then to a hardcoded
/// default, mirroring the rest of the engine's configuration-precedence
/// style (explicit config wins, else dynamic_params, else a built-in
/// constant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionManagerConfig {
    pub trailing_stop_pct: Option<f64>,
    pub tp1_close_fraction: Option<f64>,
    /// Close a position with no favorable excursion for this long (seconds).
    pub stale_after_secs: Option<i64>,
}

impl Default for PositionManagerConfig {
    fn default() -> Self {
        Self {
            trailing_stop_pct: None,
            tp1_close_fraction: None,
            stale_after_secs: None,
        }
    }
}

fn default_limit_trades() -> u32 {
    100
}
fn default_min_trades_for_tuning() -> u32 {
    20
}
fn default_conservative_threshold() -> f64 {
    0.40
}
fn default_aggressive_threshold() -> f64 {
    0.60
}
fn default_consecutive_loss_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub limit_trades: u32,
    pub min_trades_for_tuning: u32,
    pub conservative_win_rate_threshold: f64,
    pub aggressive_win_rate_threshold: f64,
    pub consecutive_loss_threshold: u32,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            limit_trades: default_limit_trades(),
            min_trades_for_tuning: default_min_trades_for_tuning(),
            conservative_win_rate_threshold: default_conservative_threshold(),
            aggressive_win_rate_threshold: default_aggressive_threshold(),
            consecutive_loss_threshold: default_consecutive_loss_threshold(),
        }
    }
}

/// Top-level engine configuration. Every field has a serde default so older
/// JSON files missing new fields still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: f64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    #[serde(default = "default_true")]
    pub modules_enabled_scanner: bool,
    #[serde(default = "default_true")]
    pub modules_enabled_executor: bool,
    #[serde(default = "default_true")]
    pub modules_enabled_position_manager: bool,

    #[serde(default)]
    pub strategy_params: StrategyParams,
    #[serde(default)]
    pub classifier: ClassifierParams,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub tuner: TunerConfig,
    #[serde(default)]
    pub position_manager: PositionManagerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            max_consecutive_losses: default_max_consecutive_losses(),
            max_trades_per_day: default_max_trades_per_day(),
            modules_enabled_scanner: true,
            modules_enabled_executor: true,
            modules_enabled_position_manager: true,
            strategy_params: StrategyParams::default(),
            classifier: ClassifierParams::default(),
            scanner: ScannerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            listener: ListenerConfig::default(),
            backup: BackupConfig::default(),
            tuner: TunerConfig::default(),
            position_manager: PositionManagerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            trading_mode = %config.trading_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) so a crash mid-write never corrupts
    /// the on-disk copy.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert_eq!(cfg.symbols.len(), 5);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.max_concurrent_positions, 3);
        assert!((cfg.strategy_params.min_sl_pct - 0.4).abs() < f64::EPSILON);
        assert!((cfg.strategy_params.min_tp1_pct - 0.6).abs() < f64::EPSILON);
        assert!((cfg.strategy_params.min_tp2_pct - 1.0).abs() < f64::EPSILON);
        assert_eq!(cfg.classifier.adx_period, 14);
        assert_eq!(cfg.scanner.bars_count, 500);
        assert_eq!(cfg.orchestrator.loop_interval_shock, 60);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.max_consecutive_losses, 5);
        assert_eq!(cfg.classifier.persistence_candles, 2);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "symbols": ["ETHUSDT"] }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.max_concurrent_positions, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.max_concurrent_positions, cfg2.max_concurrent_positions);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn scan_mode_multipliers() {
        assert_eq!(ScanMode::Eco.worker_multiplier(), 0.5);
        assert_eq!(ScanMode::Standard.worker_multiplier(), 1.0);
        assert_eq!(ScanMode::Aggressive.worker_multiplier(), 2.0);
    }
}
