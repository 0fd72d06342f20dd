//! Append-only log of check results.
//!
//! Rows are keyed by `(system, timestamp)` and never updated; the only
//! mutation besides inserting is the retention cleanup.

use crate::state::CheckResult;
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ошибка SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("некорректное значение в хранилище: {0}")]
    Value(#[from] serde_json::Error),
    #[error("значение {0} вне допустимого диапазона")]
    OutOfRange(&'static str),
    #[error("соединение с хранилищем недоступно")]
    Poisoned,
}

pub trait ResultStore: Send + Sync {
    fn insert(&self, result: &CheckResult) -> Result<(), StoreError>;

    /// Most recent record of a system.
    fn latest(&self, system: u32) -> Result<Option<CheckResult>, StoreError> {
        Ok(self.history(system, 1)?.into_iter().next())
    }

    /// Records of a system, newest first.
    fn history(&self, system: u32, limit: usize) -> Result<Vec<CheckResult>, StoreError>;

    /// All records with `timestamp > since`.
    fn since(&self, since: i64) -> Result<Vec<CheckResult>, StoreError>;

    /// Removes records with `timestamp < before`, returning how many.
    fn delete_older_than(&self, before: i64) -> Result<usize, StoreError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS check_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    icmp_request INTEGER NOT NULL,
    ssh_login TEXT NOT NULL,
    ssh_outcome TEXT NOT NULL,
    http_request TEXT NOT NULL,
    application_state TEXT NOT NULL,
    application_version TEXT,
    smart_check TEXT NOT NULL,
    baytrail_freeze TEXT NOT NULL,
    fsck_repair TEXT,
    efi_mount_ok TEXT NOT NULL,
    root_not_ro TEXT NOT NULL,
    sensors TEXT NOT NULL,
    ram_total INTEGER,
    ram_free INTEGER,
    ram_available INTEGER,
    download INTEGER,
    upload INTEGER,
    in_sync INTEGER,
    recent_touch_events INTEGER,
    offline_since INTEGER,
    blackscreen_since INTEGER
);

CREATE INDEX IF NOT EXISTS idx_check_results_system_time ON check_results(system, timestamp);
CREATE INDEX IF NOT EXISTS idx_check_results_time ON check_results(timestamp);
"#;

const COLUMNS: &str = "system, timestamp, icmp_request, ssh_login, ssh_outcome, http_request, \
    application_state, application_version, smart_check, baytrail_freeze, fsck_repair, \
    efi_mount_ok, root_not_ro, sensors, ram_total, ram_free, ram_available, download, upload, \
    in_sync, recent_touch_events, offline_since, blackscreen_since";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<CheckResult>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, StoredRow::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.into_result()?);
        }
        Ok(results)
    }
}

impl ResultStore for SqliteStore {
    fn insert(&self, r: &CheckResult) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            &format!(
                "INSERT INTO check_results ({COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
            ),
            params![
                r.system,
                r.timestamp,
                r.icmp_request,
                to_wire(&r.ssh_login)?,
                to_wire(&r.ssh_outcome)?,
                to_wire(&r.http_request)?,
                to_wire(&r.application_state)?,
                r.application_version,
                to_wire(&r.smart_check)?,
                to_wire(&r.baytrail_freeze)?,
                r.fsck_repair,
                to_wire(&r.efi_mount_ok)?,
                to_wire(&r.root_not_ro)?,
                to_wire(&r.sensors)?,
                opt_i64(r.ram_total, "ram_total")?,
                opt_i64(r.ram_free, "ram_free")?,
                opt_i64(r.ram_available, "ram_available")?,
                r.download,
                r.upload,
                r.in_sync,
                opt_i64(r.recent_touch_events, "recent_touch_events")?,
                r.offline_since,
                r.blackscreen_since,
            ],
        )?;
        Ok(())
    }

    fn history(&self, system: u32, limit: usize) -> Result<Vec<CheckResult>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM check_results WHERE system = ?1 \
                 ORDER BY timestamp DESC, id DESC LIMIT ?2"
            ),
            params![system, limit],
        )
    }

    fn since(&self, since: i64) -> Result<Vec<CheckResult>, StoreError> {
        self.query(
            &format!("SELECT {COLUMNS} FROM check_results WHERE timestamp > ?1 ORDER BY system, timestamp"),
            params![since],
        )
    }

    fn delete_older_than(&self, before: i64) -> Result<usize, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(conn.execute("DELETE FROM check_results WHERE timestamp < ?1", params![before])?)
    }
}

/// Enum columns are stored as their serde names.
fn to_wire<T: Serialize>(value: &T) -> Result<String, StoreError> {
    match serde_json::to_value(value)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn from_wire<T: DeserializeOwned>(text: String) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::String(text))?)
}

fn opt_i64(value: Option<u64>, column: &'static str) -> Result<Option<i64>, StoreError> {
    value
        .map(|v| i64::try_from(v).map_err(|_| StoreError::OutOfRange(column)))
        .transpose()
}

fn opt_u64(value: Option<i64>, column: &'static str) -> Result<Option<u64>, StoreError> {
    value
        .map(|v| u64::try_from(v).map_err(|_| StoreError::OutOfRange(column)))
        .transpose()
}

/// Column values as SQLite hands them back, before enum decoding.
struct StoredRow {
    system: u32,
    timestamp: i64,
    icmp_request: bool,
    ssh_login: String,
    ssh_outcome: String,
    http_request: String,
    application_state: String,
    application_version: Option<String>,
    smart_check: String,
    baytrail_freeze: String,
    fsck_repair: Option<String>,
    efi_mount_ok: String,
    root_not_ro: String,
    sensors: String,
    ram_total: Option<i64>,
    ram_free: Option<i64>,
    ram_available: Option<i64>,
    download: Option<u32>,
    upload: Option<u32>,
    in_sync: Option<bool>,
    recent_touch_events: Option<i64>,
    offline_since: Option<i64>,
    blackscreen_since: Option<i64>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            system: row.get(0)?,
            timestamp: row.get(1)?,
            icmp_request: row.get(2)?,
            ssh_login: row.get(3)?,
            ssh_outcome: row.get(4)?,
            http_request: row.get(5)?,
            application_state: row.get(6)?,
            application_version: row.get(7)?,
            smart_check: row.get(8)?,
            baytrail_freeze: row.get(9)?,
            fsck_repair: row.get(10)?,
            efi_mount_ok: row.get(11)?,
            root_not_ro: row.get(12)?,
            sensors: row.get(13)?,
            ram_total: row.get(14)?,
            ram_free: row.get(15)?,
            ram_available: row.get(16)?,
            download: row.get(17)?,
            upload: row.get(18)?,
            in_sync: row.get(19)?,
            recent_touch_events: row.get(20)?,
            offline_since: row.get(21)?,
            blackscreen_since: row.get(22)?,
        })
    }

    fn into_result(self) -> Result<CheckResult, StoreError> {
        Ok(CheckResult {
            system: self.system,
            timestamp: self.timestamp,
            icmp_request: self.icmp_request,
            ssh_login: from_wire(self.ssh_login)?,
            ssh_outcome: from_wire(self.ssh_outcome)?,
            http_request: from_wire(self.http_request)?,
            application_state: from_wire(self.application_state)?,
            application_version: self.application_version,
            smart_check: from_wire(self.smart_check)?,
            baytrail_freeze: from_wire(self.baytrail_freeze)?,
            fsck_repair: self.fsck_repair,
            efi_mount_ok: from_wire(self.efi_mount_ok)?,
            root_not_ro: from_wire(self.root_not_ro)?,
            sensors: from_wire(self.sensors)?,
            ram_total: opt_u64(self.ram_total, "ram_total")?,
            ram_free: opt_u64(self.ram_free, "ram_free")?,
            ram_available: opt_u64(self.ram_available, "ram_available")?,
            download: self.download,
            upload: self.upload,
            in_sync: self.in_sync,
            recent_touch_events: opt_u64(self.recent_touch_events, "recent_touch_events")?,
            offline_since: self.offline_since,
            blackscreen_since: self.blackscreen_since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{sample_result, ApplicationState, BaytrailFreezeState, LoginOutcome, Trinary};

    #[test]
    fn stored_record_reads_back_unchanged() {
        let store = SqliteStore::open_in_memory().unwrap();
        let result = CheckResult {
            ssh_login: Trinary::Unsupported,
            ssh_outcome: LoginOutcome::NotApplicable,
            application_state: ApplicationState::InstallationInstructions,
            application_version: Some("3.0.1".to_string()),
            baytrail_freeze: BaytrailFreezeState::Mitigated,
            fsck_repair: Some("yes".to_string()),
            ram_total: Some(4_000_000),
            download: None,
            in_sync: Some(false),
            recent_touch_events: Some(12),
            offline_since: Some(90),
            ..sample_result(4, 100)
        };
        store.insert(&result).unwrap();

        assert_eq!(store.latest(4).unwrap(), Some(result));
        assert_eq!(store.latest(5).unwrap(), None);
    }

    #[test]
    fn history_is_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        for ts in [300, 100, 200] {
            store.insert(&sample_result(1, ts)).unwrap();
        }
        store.insert(&sample_result(2, 400)).unwrap();

        let history: Vec<i64> = store
            .history(1, 10)
            .unwrap()
            .iter()
            .map(|r| r.timestamp)
            .collect();
        assert_eq!(history, [300, 200, 100]);
        assert_eq!(store.history(1, 2).unwrap().len(), 2);
        assert_eq!(store.latest(1).unwrap().map(|r| r.timestamp), Some(300));
    }

    #[test]
    fn since_is_exclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        for ts in [100, 200, 300] {
            store.insert(&sample_result(1, ts)).unwrap();
        }
        let timestamps: Vec<i64> = store.since(200).unwrap().iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, [300]);
    }

    #[test]
    fn delete_older_than_removes_old_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        for ts in [100, 200, 300] {
            store.insert(&sample_result(1, ts)).unwrap();
        }
        assert_eq!(store.delete_older_than(250).unwrap(), 2);
        assert_eq!(store.history(1, 10).unwrap().len(), 1);
        assert_eq!(store.delete_older_than(250).unwrap(), 0);
    }

    #[test]
    fn enum_columns_use_wire_names() {
        assert_eq!(to_wire(&ApplicationState::NotRunning).unwrap(), "not running");
        assert_eq!(to_wire(&Trinary::Unsupported).unwrap(), "unsupported");
        let state: ApplicationState = from_wire("installation instructions".to_string()).unwrap();
        assert_eq!(state, ApplicationState::InstallationInstructions);
        assert!(from_wire::<Trinary>("maybe".to_string()).is_err());
    }

    #[test]
    fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checks.sqlite");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert(&sample_result(8, 10)).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.latest(8).unwrap().map(|r| r.system), Some(8));
    }
}
