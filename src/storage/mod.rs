// =============================================================================
// Storage — the Single Source of Truth
// =============================================================================
//
// Every other component treats this module as authoritative: system state,
// module toggles, signals, trade results, market-state snapshots, tuning
// history and EDGE learning events all live here. Backed by SQLite in WAL
// mode so readers never block behind a writer holding the connection for an
// I/O-bound operation.
//
// Concurrency discipline: every access takes the one `conn` mutex — rusqlite's
// `Connection` is `Send` but not `Sync` (it wraps interior `RefCell`s), so a
// single `Mutex<Connection>` is the only lock shape that keeps `Storage: Sync`
// and therefore usable from `Arc<Storage>` across `tokio::spawn`ed tasks.
// Readers and writers both serialize behind it; a writer that hits
// `SQLITE_BUSY` retries a few times with a short backoff before surfacing
// `WriteOutcome::Retryable`; callers decide whether to retry again or drop
// the write.

pub mod backup;
mod schema;

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::error::WriteOutcome;
use crate::types::{ExecutionMode, ScanSnapshot, Signal, SignalStatus, TradeResult};

const BUSY_RETRY_ATTEMPTS: u32 = 3;
const BUSY_RETRY_BACKOFF_MS: u64 = 25;

pub struct Storage {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Storage {
    /// Opens (or creates) the SQLite database at `path` and applies the
    /// schema. `path` of `:memory:` opens a private in-memory database,
    /// useful for tests.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 2_000)?;
        schema::init(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// Runs `f` against the write connection, retrying a bounded number of
    /// times on `SQLITE_BUSY` before giving up.
    fn with_write<T>(
        &self,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> WriteOutcome2<T> {
        for attempt in 0..=BUSY_RETRY_ATTEMPTS {
            let guard = self.conn.lock();
            match f(&guard) {
                Ok(v) => return WriteOutcome2::Ok(v),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy && attempt < BUSY_RETRY_ATTEMPTS =>
                {
                    drop(guard);
                    warn!(attempt, "storage write contended, retrying");
                    thread::sleep(Duration::from_millis(BUSY_RETRY_BACKOFF_MS * (attempt as u64 + 1)));
                }
                Err(rusqlite::Error::SqliteFailure(e, msg))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy =>
                {
                    return WriteOutcome2::Retryable(msg.unwrap_or_else(|| "database busy".into()));
                }
                Err(e) => return WriteOutcome2::Fatal(e.to_string()),
            }
        }
        WriteOutcome2::Retryable("exhausted busy retries".into())
    }

    // ── System state (opaque key -> JSON map) ───────────────────────────

    pub fn get_system_state(&self) -> anyhow::Result<std::collections::HashMap<String, Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM system_state")?;
        let rows = stmt.query_map([], |row| {
            let key: String = row.get(0)?;
            let raw: String = row.get(1)?;
            Ok((key, raw))
        })?;

        let mut state = std::collections::HashMap::new();
        for row in rows {
            let (key, raw) = row?;
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            state.insert(key, value);
        }
        Ok(state)
    }

    /// Last-write-wins per key. Durable before return (single transaction).
    pub fn update_system_state(&self, partial: &std::collections::HashMap<String, Value>) -> WriteOutcome {
        let now = Utc::now().to_rfc3339();
        let outcome = self.with_write(|conn| {
            let tx = conn.unchecked_transaction()?;
            for (key, value) in partial {
                let raw = serde_json::to_string(value).unwrap_or_default();
                tx.execute(
                    "INSERT INTO system_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, raw, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        });
        outcome.into()
    }

    fn get_state_value(&self, key: &str) -> anyhow::Result<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT value FROM system_state WHERE key = ?1", [key], |r| r.get(0))
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r).unwrap_or(Value::String(r))))
    }

    // ── Module toggles (global + per-account override) ─────────────────

    pub fn get_global_modules_enabled(&self) -> anyhow::Result<std::collections::HashMap<String, bool>> {
        default_modules_merge(self.get_state_value("modules_enabled")?)
    }

    pub fn set_global_module_enabled(&self, module: &str, enabled: bool) -> WriteOutcome {
        let mut modules = match self.get_global_modules_enabled() {
            Ok(m) => m,
            Err(e) => return WriteOutcome::Fatal(e.to_string()),
        };
        modules.insert(module.to_string(), enabled);
        let value = serde_json::to_value(&modules).unwrap_or_default();
        let mut partial = std::collections::HashMap::new();
        partial.insert("modules_enabled".to_string(), value);
        self.update_system_state(&partial)
    }

    fn get_individual_modules_enabled(&self, account_id: &str) -> anyhow::Result<std::collections::HashMap<String, bool>> {
        let key = format!("modules_enabled_{account_id}");
        match self.get_state_value(&key)? {
            Some(v) => Ok(serde_json::from_value(v).unwrap_or_default()),
            None => Ok(std::collections::HashMap::new()),
        }
    }

    pub fn set_individual_module_enabled(&self, account_id: &str, module: &str, enabled: bool) -> WriteOutcome {
        let mut modules = match self.get_individual_modules_enabled(account_id) {
            Ok(m) => m,
            Err(e) => return WriteOutcome::Fatal(e.to_string()),
        };
        modules.insert(module.to_string(), enabled);
        let value = serde_json::to_value(&modules).unwrap_or_default();
        let mut partial = std::collections::HashMap::new();
        partial.insert(format!("modules_enabled_{account_id}"), value);
        self.update_system_state(&partial)
    }

    /// Priority: global disabled always wins; otherwise a per-account
    /// override wins; otherwise fall back to the global value.
    /// Risk Manager is never user-disableable.
    pub fn resolve_module_enabled(&self, account_id: Option<&str>, module: &str) -> bool {
        if module == "risk_manager" {
            return true;
        }

        let global_enabled = self
            .get_global_modules_enabled()
            .ok()
            .and_then(|m| m.get(module).copied())
            .unwrap_or(true);

        if !global_enabled {
            return false;
        }

        let Some(account_id) = account_id else {
            return global_enabled;
        };

        match self.get_individual_modules_enabled(account_id) {
            Ok(overrides) => overrides.get(module).copied().unwrap_or(global_enabled),
            Err(_) => global_enabled,
        }
    }

    // ── Shadow ranking (per-strategy execution mode) ────────────────────

    /// Looks up a strategy's execution mode in the shadow-ranking table.
    /// A missing entry allows execution (§4.5: "Missing entry → allow
    /// (legacy)").
    pub fn get_execution_mode(&self, strategy_id: &str) -> anyhow::Result<ExecutionMode> {
        let modes: std::collections::HashMap<String, ExecutionMode> = match self.get_state_value("execution_modes")? {
            Some(v) => serde_json::from_value(v).unwrap_or_default(),
            None => Default::default(),
        };
        Ok(modes.get(strategy_id).copied().unwrap_or(ExecutionMode::Live))
    }

    pub fn set_execution_mode(&self, strategy_id: &str, mode: ExecutionMode) -> WriteOutcome {
        let mut modes: std::collections::HashMap<String, ExecutionMode> = match self.get_state_value("execution_modes") {
            Ok(Some(v)) => serde_json::from_value(v).unwrap_or_default(),
            _ => Default::default(),
        };
        modes.insert(strategy_id.to_string(), mode);
        let value = serde_json::to_value(&modes).unwrap_or_default();
        let mut partial = std::collections::HashMap::new();
        partial.insert("execution_modes".to_string(), value);
        self.update_system_state(&partial)
    }

    // ── Dynamic params / risk settings (opaque JSON under system_state) ─

    pub fn get_dynamic_params(&self) -> anyhow::Result<Value> {
        Ok(self.get_state_value("dynamic_params")?.unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub fn update_dynamic_params(&self, params: Value) -> WriteOutcome {
        let mut partial = std::collections::HashMap::new();
        partial.insert("dynamic_params".to_string(), params);
        self.update_system_state(&partial)
    }

    pub fn get_risk_settings(&self) -> anyhow::Result<Value> {
        Ok(self.get_state_value("risk_settings")?.unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub fn update_risk_settings(&self, settings: Value) -> WriteOutcome {
        let mut partial = std::collections::HashMap::new();
        partial.insert("risk_settings".to_string(), settings);
        self.update_system_state(&partial)
    }

    // ── Heartbeats ───────────────────────────────────────────────────────

    pub fn update_module_heartbeat(&self, module: &str) -> WriteOutcome {
        let mut partial = std::collections::HashMap::new();
        partial.insert(format!("heartbeat_{module}"), Value::String(Utc::now().to_rfc3339()));
        self.update_system_state(&partial)
    }

    pub fn get_module_heartbeats(&self) -> anyhow::Result<std::collections::HashMap<String, String>> {
        let state = self.get_system_state()?;
        Ok(state
            .into_iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("heartbeat_")
                    .map(|name| (name.to_string(), v.as_str().unwrap_or_default().to_string()))
            })
            .collect())
    }

    // ── Signals ──────────────────────────────────────────────────────────

    pub fn save_signal(&self, signal: &Signal) -> WriteOutcome {
        let data = serde_json::to_string(signal).unwrap_or_default();
        let status = format!("{:?}", signal.status).to_lowercase();
        let outcome = self.with_write(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO signals (id, symbol, status, timestamp, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![signal.id, signal.symbol, status, signal.timestamp, data],
            )
        });
        outcome.into()
    }

    pub fn update_signal_status(&self, id: &str, status: SignalStatus) -> WriteOutcome {
        let status_str = format!("{status:?}").to_lowercase();
        let outcome = self.with_write(|conn| {
            let mut stmt = conn.prepare("SELECT data FROM signals WHERE id = ?1")?;
            let raw: Option<String> = stmt.query_row([id], |r| r.get(0)).optional()?;
            let Some(raw) = raw else {
                return Ok(0);
            };
            let mut signal: Signal = serde_json::from_str(&raw).map_err(|_| {
                rusqlite::Error::InvalidColumnType(0, "data".into(), rusqlite::types::Type::Text)
            })?;
            signal.status = status;
            let data = serde_json::to_string(&signal).unwrap_or_default();
            conn.execute(
                "UPDATE signals SET status = ?1, data = ?2 WHERE id = ?3",
                params![status_str, data, id],
            )
        });
        outcome.into()
    }

    pub fn get_signal_by_id(&self, id: &str) -> anyhow::Result<Option<Signal>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row("SELECT data FROM signals WHERE id = ?1", [id], |r| r.get(0))
            .optional()?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    /// Most recent signals, optionally filtered by symbol, newest first.
    pub fn get_recent_signals(&self, symbol: Option<&str>, limit: u32) -> anyhow::Result<Vec<Signal>> {
        let conn = self.conn.lock();
        let mut stmt = if symbol.is_some() {
            conn.prepare("SELECT data FROM signals WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT ?2")?
        } else {
            conn.prepare("SELECT data FROM signals ORDER BY timestamp DESC LIMIT ?1")?
        };

        let rows: Vec<String> = if let Some(symbol) = symbol {
            stmt.query_map(params![symbol, limit], |r| r.get(0))?
                .filter_map(Result::ok)
                .collect()
        } else {
            stmt.query_map(params![limit], |r| r.get(0))?
                .filter_map(Result::ok)
                .collect()
        };

        Ok(rows.into_iter().filter_map(|r| serde_json::from_str(&r).ok()).collect())
    }

    // ── Trade results (idempotent on ticket) ────────────────────────────

    pub fn trade_exists(&self, ticket: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trade_results WHERE ticket = ?1",
            [ticket],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert-or-ignore on `ticket` so a duplicate delivery of the same
    /// closed-trade event never produces a second row.
    pub fn save_trade_result(&self, trade: &TradeResult) -> WriteOutcome {
        let data = serde_json::to_string(trade).unwrap_or_default();
        let result = format!("{:?}", trade.result).to_lowercase();
        let outcome = self.with_write(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO trade_results (ticket, symbol, result, exit_time, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![trade.ticket, trade.symbol, result, trade.exit_time, data],
            )
        });
        outcome.into()
    }

    pub fn get_trade_results(&self, limit: u32) -> anyhow::Result<Vec<TradeResult>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT data FROM trade_results ORDER BY exit_time DESC LIMIT ?1")?;
        let rows = stmt.query_map([limit], |r| r.get::<_, String>(0))?;
        Ok(rows.filter_map(Result::ok).filter_map(|r| serde_json::from_str(&r).ok()).collect())
    }

    pub fn get_trade_result_by_signal_id(&self, signal_id: &str) -> anyhow::Result<Option<TradeResult>> {
        let results = self.get_trade_results(10_000)?;
        Ok(results.into_iter().find(|t| t.signal_id.as_deref() == Some(signal_id)))
    }

    pub fn count_executed_signals(&self, date: NaiveDate) -> anyhow::Result<u64> {
        let conn = self.conn.lock();
        let day_start = date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis();
        let day_end = date.and_hms_opt(23, 59, 59).unwrap().and_utc().timestamp_millis();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE status = 'executed' AND timestamp BETWEEN ?1 AND ?2",
            params![day_start, day_end],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Market state snapshots (rolling insert, newest-first read) ──────

    pub fn log_market_state(&self, snapshot: &ScanSnapshot) -> WriteOutcome {
        let data = serde_json::to_string(snapshot).unwrap_or_default();
        let key = format!("{}|{}", snapshot.symbol, snapshot.timeframe.as_str());
        let outcome = self.with_write(|conn| {
            conn.execute(
                "INSERT INTO market_state (symbol_tf, regime, timestamp, data) VALUES (?1, ?2, ?3, ?4)",
                params![key, snapshot.regime.as_str(), snapshot.timestamp, data],
            )
        });
        outcome.into()
    }

    pub fn get_latest_heatmap_state(&self) -> anyhow::Result<Vec<ScanSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM market_state ms
             WHERE ms.id = (SELECT MAX(id) FROM market_state WHERE symbol_tf = ms.symbol_tf)",
        )?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.filter_map(Result::ok).filter_map(|r| serde_json::from_str(&r).ok()).collect())
    }

    pub fn get_market_state_history(&self, symbol_tf: &str, limit: u32) -> anyhow::Result<Vec<ScanSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT data FROM market_state WHERE symbol_tf = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol_tf, limit], |r| r.get::<_, String>(0))?;
        Ok(rows.filter_map(Result::ok).filter_map(|r| serde_json::from_str(&r).ok()).collect())
    }

    // ── Tuning adjustments ───────────────────────────────────────────────

    pub fn save_tuning_adjustment(&self, adjustment: &Value) -> WriteOutcome {
        let data = serde_json::to_string(adjustment).unwrap_or_default();
        let outcome = self.with_write(|conn| {
            conn.execute("INSERT INTO tuning_adjustments (adjustment_data) VALUES (?1)", params![data])
        });
        outcome.into()
    }

    pub fn get_tuning_history(&self, limit: u32) -> anyhow::Result<Vec<Value>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT adjustment_data FROM tuning_adjustments ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |r| r.get::<_, String>(0))?;
        Ok(rows.filter_map(Result::ok).filter_map(|r| serde_json::from_str(&r).ok()).collect())
    }

    // ── EDGE learning ────────────────────────────────────────────────────

    pub fn save_edge_learning(&self, detection: &str, action_taken: &str, learning: &str, details: Option<&str>) -> WriteOutcome {
        let outcome = self.with_write(|conn| {
            conn.execute(
                "INSERT INTO edge_learning (detection, action_taken, learning, details) VALUES (?1, ?2, ?3, ?4)",
                params![detection, action_taken, learning, details],
            )
        });
        outcome.into()
    }

    pub fn get_edge_learning_history(&self, limit: u32) -> anyhow::Result<Vec<EdgeLearningRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT detection, action_taken, learning, details, timestamp FROM edge_learning ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit], |r| {
            Ok(EdgeLearningRow {
                detection: r.get(0)?,
                action_taken: r.get(1)?,
                learning: r.get(2)?,
                details: r.get(3)?,
                timestamp: r.get(4)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    // ── Data providers ───────────────────────────────────────────────────

    pub fn save_data_provider(&self, row: &DataProviderRow) -> WriteOutcome {
        let additional = serde_json::to_string(&row.additional_config).unwrap_or_default();
        let outcome = self.with_write(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO data_providers
                 (name, provider_type, enabled, priority, requires_auth, api_key, api_secret, additional_config, is_system)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    row.name, row.provider_type, row.enabled, row.priority, row.requires_auth,
                    row.api_key, row.api_secret, additional, row.is_system
                ],
            )
        });
        outcome.into()
    }

    pub fn get_data_providers(&self) -> anyhow::Result<Vec<DataProviderRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, provider_type, enabled, priority, requires_auth, api_key, api_secret, additional_config, is_system FROM data_providers",
        )?;
        let rows = stmt.query_map([], |r| {
            let additional: String = r.get(7)?;
            Ok(DataProviderRow {
                name: r.get(0)?,
                provider_type: r.get(1)?,
                enabled: r.get(2)?,
                priority: r.get(3)?,
                requires_auth: r.get(4)?,
                api_key: r.get(5)?,
                api_secret: r.get(6)?,
                additional_config: serde_json::from_str(&additional).unwrap_or_default(),
                is_system: r.get(8)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    // ── Symbol mappings ──────────────────────────────────────────────────

    pub fn save_symbol_mapping(&self, internal_symbol: &str, provider_id: &str, provider_symbol: &str, is_default: bool) -> WriteOutcome {
        let outcome = self.with_write(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO symbol_mappings (internal_symbol, provider_id, provider_symbol, is_default)
                 VALUES (?1, ?2, ?3, ?4)",
                params![internal_symbol, provider_id, provider_symbol, is_default],
            )
        });
        outcome.into()
    }

    /// Nested map: internal_symbol -> { provider_id -> provider_symbol }.
    pub fn get_symbol_map(&self, provider_id: Option<&str>) -> anyhow::Result<std::collections::HashMap<String, std::collections::HashMap<String, String>>> {
        let conn = self.conn.lock();
        let mut map: std::collections::HashMap<String, std::collections::HashMap<String, String>> = Default::default();

        let mut push = |internal: String, pid: String, psym: String| {
            map.entry(internal).or_default().insert(pid, psym);
        };

        if let Some(provider_id) = provider_id {
            let mut stmt = conn.prepare(
                "SELECT internal_symbol, provider_id, provider_symbol FROM symbol_mappings WHERE provider_id = ?1",
            )?;
            let rows = stmt.query_map([provider_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?;
            for row in rows.filter_map(Result::ok) {
                push(row.0, row.1, row.2);
            }
        } else {
            let mut stmt = conn.prepare("SELECT internal_symbol, provider_id, provider_symbol FROM symbol_mappings")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?;
            for row in rows.filter_map(Result::ok) {
                push(row.0, row.1, row.2);
            }
        }

        Ok(map)
    }

    // ── Maintenance / backup (delegated) ─────────────────────────────────

    pub fn create_db_backup(&self, backup_dir: impl AsRef<Path>) -> anyhow::Result<Option<PathBuf>> {
        backup::create(self, backup_dir)
    }

    pub fn list_db_backups(&self, backup_dir: impl AsRef<Path>) -> anyhow::Result<Vec<backup::BackupInfo>> {
        backup::list(backup_dir)
    }

    pub fn restore_db_backup(&self, backup_path: impl AsRef<Path>) -> anyhow::Result<()> {
        backup::restore(self, backup_path)
    }

    pub fn check_integrity(&self) -> anyhow::Result<backup::IntegrityReport> {
        backup::check_integrity(self)
    }

    pub fn prune_old_backups(&self, backup_dir: impl AsRef<Path>, max_backups: usize, max_age_days: i64) -> anyhow::Result<usize> {
        backup::prune(backup_dir, max_backups, max_age_days)
    }

    pub(crate) fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Backup/restore/integrity-check all need direct access to the one
    /// underlying connection; both names are kept (rather than a single
    /// `conn()`) to mirror the read/write call-site intent even though both
    /// now take the same mutex.
    pub(crate) fn read_conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    pub(crate) fn write_conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn default_modules_merge(raw: Option<Value>) -> anyhow::Result<std::collections::HashMap<String, bool>> {
    let mut modules: std::collections::HashMap<String, bool> = [
        ("scanner", true),
        ("executor", true),
        ("position_manager", true),
        ("risk_manager", true),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    if let Some(raw) = raw {
        if let Ok(overrides) = serde_json::from_value::<std::collections::HashMap<String, bool>>(raw) {
            modules.extend(overrides);
        } else {
            error!("failed to decode modules_enabled from system_state");
        }
    }
    Ok(modules)
}

#[derive(Debug, Clone)]
pub struct EdgeLearningRow {
    pub detection: String,
    pub action_taken: String,
    pub learning: String,
    pub details: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default)]
pub struct DataProviderRow {
    pub name: String,
    pub provider_type: String,
    pub enabled: bool,
    pub priority: i64,
    pub requires_auth: bool,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub additional_config: Value,
    pub is_system: bool,
}

/// Internal helper: bridges a rusqlite result into the public `WriteOutcome`
/// taxonomy without exposing rusqlite types at the call site.
enum WriteOutcome2<T> {
    Ok(T),
    Retryable(String),
    Fatal(String),
}

impl<T> From<WriteOutcome2<T>> for WriteOutcome {
    fn from(v: WriteOutcome2<T>) -> Self {
        match v {
            WriteOutcome2::Ok(_) => WriteOutcome::Ok,
            WriteOutcome2::Retryable(msg) => WriteOutcome::Retryable(msg),
            WriteOutcome2::Fatal(msg) => {
                error!(error = %msg, "storage write failed fatally");
                WriteOutcome::Fatal(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bias, Regime, RegimeMetrics, SignalType, Timeframe};

    fn mem_storage() -> Storage {
        Storage::open(":memory:").unwrap()
    }

    fn sample_signal(id: &str) -> Signal {
        Signal {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            signal_type: SignalType::Buy,
            timeframe: Timeframe::M5,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            confidence: 0.8,
            strategy_id: "trend_follow".to_string(),
            connector_type: "binance".to_string(),
            regime: Regime::Trend,
            metadata: serde_json::json!({}),
            timestamp: 1_700_000_000_000,
            trace_id: "trace-1".to_string(),
            status: SignalStatus::Pending,
        }
    }

    fn sample_trade(ticket: &str) -> TradeResult {
        TradeResult {
            ticket: ticket.to_string(),
            signal_id: Some("sig-1".to_string()),
            symbol: "BTCUSDT".to_string(),
            entry_price: 100.0,
            exit_price: 105.0,
            entry_time: 1_700_000_000_000,
            exit_time: 1_700_000_100_000,
            profit_loss: 5.0,
            pips: 50.0,
            exit_reason: crate::types::ExitReason::TakeProfitHit,
            result: crate::types::TradeOutcome::Win,
            broker_id: "binance".to_string(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn update_then_get_system_state_roundtrips() {
        let storage = mem_storage();
        let mut partial = std::collections::HashMap::new();
        partial.insert("foo".to_string(), serde_json::json!({"bar": 1}));
        assert!(matches!(storage.update_system_state(&partial), WriteOutcome::Ok));

        let state = storage.get_system_state().unwrap();
        assert_eq!(state.get("foo").unwrap()["bar"], 1);
    }

    #[test]
    fn duplicate_trade_result_is_idempotent() {
        let storage = mem_storage();
        let trade = sample_trade("T-1");
        assert!(matches!(storage.save_trade_result(&trade), WriteOutcome::Ok));
        assert!(matches!(storage.save_trade_result(&trade), WriteOutcome::Ok));

        let results = storage.get_trade_results(100).unwrap();
        assert_eq!(results.len(), 1);
        assert!(storage.trade_exists("T-1").unwrap());
        assert!(!storage.trade_exists("T-2").unwrap());
    }

    #[test]
    fn signal_save_and_status_update() {
        let storage = mem_storage();
        let signal = sample_signal("sig-1");
        storage.save_signal(&signal);

        let fetched = storage.get_signal_by_id("sig-1").unwrap().unwrap();
        assert_eq!(fetched.status, SignalStatus::Pending);

        storage.update_signal_status("sig-1", SignalStatus::Executed);
        let fetched = storage.get_signal_by_id("sig-1").unwrap().unwrap();
        assert_eq!(fetched.status, SignalStatus::Executed);
    }

    #[test]
    fn resolve_module_enabled_respects_priority() {
        let storage = mem_storage();
        assert!(storage.resolve_module_enabled(None, "scanner"));

        storage.set_global_module_enabled("scanner", false);
        assert!(!storage.resolve_module_enabled(Some("acct-1"), "scanner"));

        storage.set_individual_module_enabled("acct-1", "scanner", true);
        // Global disabled always wins, regardless of an account override.
        assert!(!storage.resolve_module_enabled(Some("acct-1"), "scanner"));

        storage.set_global_module_enabled("scanner", true);
        assert!(storage.resolve_module_enabled(Some("acct-1"), "scanner"));
    }

    #[test]
    fn risk_manager_is_never_disableable() {
        let storage = mem_storage();
        storage.set_global_module_enabled("risk_manager", false);
        assert!(storage.resolve_module_enabled(None, "risk_manager"));
    }

    #[test]
    fn count_executed_signals_filters_by_day_and_status() {
        let storage = mem_storage();
        let mut executed = sample_signal("sig-executed");
        executed.status = SignalStatus::Executed;
        executed.timestamp = chrono::Utc::now().timestamp_millis();
        storage.save_signal(&executed);

        let mut pending = sample_signal("sig-pending");
        pending.timestamp = chrono::Utc::now().timestamp_millis();
        storage.save_signal(&pending);

        let today = chrono::Utc::now().date_naive();
        let count = storage.count_executed_signals(today).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn market_state_heatmap_keeps_latest_per_stream() {
        let storage = mem_storage();
        let snapshot = |ts: i64| ScanSnapshot {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M5,
            regime: Regime::Trend,
            metrics: RegimeMetrics {
                adx: 30.0,
                atr_pct: 1.0,
                volatility_shock: false,
                sma_distance: 2.0,
                bias: Some(Bias::Bullish),
            },
            timestamp: ts,
        };
        storage.log_market_state(&snapshot(1));
        storage.log_market_state(&snapshot(2));

        let heatmap = storage.get_latest_heatmap_state().unwrap();
        assert_eq!(heatmap.len(), 1);
        assert_eq!(heatmap[0].timestamp, 2);

        let history = storage.get_market_state_history("BTCUSDT|M5", 10).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn symbol_map_round_trips() {
        let storage = mem_storage();
        storage.save_symbol_mapping("BTCUSDT", "binance", "BTCUSDT", true);
        storage.save_symbol_mapping("BTCUSDT", "coinbase", "BTC-USD", false);

        let map = storage.get_symbol_map(None).unwrap();
        assert_eq!(map["BTCUSDT"]["binance"], "BTCUSDT");
        assert_eq!(map["BTCUSDT"]["coinbase"], "BTC-USD");

        let filtered = storage.get_symbol_map(Some("binance")).unwrap();
        assert_eq!(filtered["BTCUSDT"].len(), 1);
    }
}
