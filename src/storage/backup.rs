// =============================================================================
// Storage maintenance — online backup, restore, integrity check, pruning
// =============================================================================
//
// Backups are taken with SQLite's online backup API (`rusqlite::backup`) so a
// concurrent writer never sees a torn snapshot. Filenames are timestamped
// (`aethelgard-YYYYmmdd-HHMMSS.sqlite`) so `list`/`prune` can sort and age
// them without a side index.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use tracing::{info, warn};

use super::Storage;

const BACKUP_PREFIX: &str = "aethelgard-";
const BACKUP_EXT: &str = "sqlite";
const STEP_PAGES: i32 = 100;
const STEP_PAUSE: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub ok: bool,
    pub messages: Vec<String>,
}

fn backup_filename(now: DateTime<Utc>) -> String {
    format!("{BACKUP_PREFIX}{}.{BACKUP_EXT}", now.format("%Y%m%d-%H%M%S"))
}

/// Takes an online backup of `storage`'s database into `backup_dir`, creating
/// the directory if needed. Returns `None` only when the source is an
/// in-memory database (nothing durable to snapshot).
pub fn create(storage: &Storage, backup_dir: impl AsRef<Path>) -> anyhow::Result<Option<PathBuf>> {
    if storage.db_path() == Path::new(":memory:") {
        return Ok(None);
    }

    let backup_dir = backup_dir.as_ref();
    fs::create_dir_all(backup_dir)?;

    let now = Utc::now();
    let dest_path = backup_dir.join(backup_filename(now));

    let mut dest = Connection::open(&dest_path)?;
    {
        let src = storage.read_conn();
        let backup = Backup::new(&src, &mut dest)?;
        backup.run_to_completion(STEP_PAGES, STEP_PAUSE, None)?;
    }

    info!(path = %dest_path.display(), "database backup created");
    Ok(Some(dest_path))
}

/// Lists backups in `backup_dir`, newest first.
pub fn list(backup_dir: impl AsRef<Path>) -> anyhow::Result<Vec<BackupInfo>> {
    let backup_dir = backup_dir.as_ref();
    if !backup_dir.exists() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for entry in fs::read_dir(backup_dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
        if !name.starts_with(BACKUP_PREFIX) || !name.ends_with(BACKUP_EXT) {
            continue;
        }
        let metadata = entry.metadata()?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        backups.push(BackupInfo {
            path,
            created_at,
            size_bytes: metadata.len(),
        });
    }

    backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(backups)
}

/// Restores `storage`'s database from `backup_path` via the online backup
/// API run in reverse (backup source is the snapshot, destination is the
/// live connection).
pub fn restore(storage: &Storage, backup_path: impl AsRef<Path>) -> anyhow::Result<()> {
    let backup_path = backup_path.as_ref();
    let src = Connection::open(backup_path)?;
    let mut dest = storage.write_conn();
    let backup = Backup::new(&src, &mut dest)?;
    backup.run_to_completion(STEP_PAGES, STEP_PAUSE, None)?;
    info!(path = %backup_path.display(), "database restored from backup");
    Ok(())
}

/// Runs SQLite's `PRAGMA integrity_check` against the live database.
pub fn check_integrity(storage: &Storage) -> anyhow::Result<IntegrityReport> {
    let conn = storage.read_conn();
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let messages: Vec<String> = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .filter_map(Result::ok)
        .collect();

    let ok = messages.len() == 1 && messages[0] == "ok";
    if !ok {
        warn!(?messages, "database integrity check reported problems");
    }
    Ok(IntegrityReport { ok, messages })
}

/// Deletes backups older than `max_age_days` and, among the survivors, keeps
/// only the newest `max_backups`. Returns the number of files removed.
pub fn prune(backup_dir: impl AsRef<Path>, max_backups: usize, max_age_days: i64) -> anyhow::Result<usize> {
    let backups = list(backup_dir)?;
    let cutoff = Utc::now() - chrono::Duration::days(max_age_days);

    let mut removed = 0;
    for (idx, backup) in backups.iter().enumerate() {
        let too_old = backup.created_at < cutoff;
        let beyond_count = idx >= max_backups;
        if too_old || beyond_count {
            if fs::remove_file(&backup.path).is_ok() {
                removed += 1;
            }
        }
    }
    if removed > 0 {
        info!(removed, "pruned old database backups");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_storage(path: &Path) -> Storage {
        Storage::open(path).unwrap()
    }

    #[test]
    fn create_then_list_finds_backup() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("engine.sqlite");
        let storage = file_storage(&db_path);

        let backup_dir = dir.path().join("backups");
        let created = create(&storage, &backup_dir).unwrap();
        assert!(created.is_some());

        let backups = list(&backup_dir).unwrap();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn in_memory_database_skips_backup() {
        let storage = Storage::open(":memory:").unwrap();
        let dir = tempdir().unwrap();
        let result = create(&storage, dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn integrity_check_passes_on_fresh_database() {
        let storage = Storage::open(":memory:").unwrap();
        let report = check_integrity(&storage).unwrap();
        assert!(report.ok);
    }

    #[test]
    fn prune_respects_max_count() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("engine.sqlite");
        let storage = file_storage(&db_path);
        let backup_dir = dir.path().join("backups");

        for _ in 0..3 {
            create(&storage, &backup_dir).unwrap();
            std::thread::sleep(Duration::from_millis(1100));
        }

        let removed = prune(&backup_dir, 1, 365).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(list(&backup_dir).unwrap().len(), 1);
    }
}
