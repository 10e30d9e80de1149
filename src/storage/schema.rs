// =============================================================================
// Storage schema — table definitions applied once on `Storage::open`
// =============================================================================

use rusqlite::Connection;

/// Creates every table the SSOT contract needs if it doesn't already exist.
/// Safe to call on every open: `CREATE TABLE IF NOT EXISTS` throughout.
pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS system_state (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS signals (
            id        TEXT PRIMARY KEY,
            symbol    TEXT NOT NULL,
            status    TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            data      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_signals_symbol_ts ON signals(symbol, timestamp);
        CREATE INDEX IF NOT EXISTS idx_signals_status_ts ON signals(status, timestamp);

        CREATE TABLE IF NOT EXISTS trade_results (
            ticket    TEXT PRIMARY KEY,
            symbol    TEXT NOT NULL,
            result    TEXT NOT NULL,
            exit_time INTEGER NOT NULL,
            data      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trade_results_exit_time ON trade_results(exit_time);

        CREATE TABLE IF NOT EXISTS market_state (
            id        INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol_tf TEXT NOT NULL,
            regime    TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            data      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_market_state_symbol_tf ON market_state(symbol_tf, id);

        CREATE TABLE IF NOT EXISTS tuning_adjustments (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp       TEXT NOT NULL DEFAULT (datetime('now')),
            adjustment_data TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS edge_learning (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp     TEXT NOT NULL DEFAULT (datetime('now')),
            detection     TEXT NOT NULL,
            action_taken  TEXT NOT NULL,
            learning      TEXT NOT NULL,
            details       TEXT
        );

        CREATE TABLE IF NOT EXISTS data_providers (
            name               TEXT PRIMARY KEY,
            provider_type      TEXT NOT NULL,
            enabled            INTEGER NOT NULL,
            priority           INTEGER NOT NULL,
            requires_auth      INTEGER NOT NULL,
            api_key            TEXT,
            api_secret         TEXT,
            additional_config  TEXT NOT NULL,
            is_system          INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS symbol_mappings (
            internal_symbol  TEXT NOT NULL,
            provider_id      TEXT NOT NULL,
            provider_symbol  TEXT NOT NULL,
            is_default       INTEGER NOT NULL,
            PRIMARY KEY (internal_symbol, provider_id)
        );
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'signals'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
