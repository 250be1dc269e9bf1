//! History store trait and its SQLite implementation.

use chrono::{DateTime, SecondsFormat, Utc};
use pcr_common::{HistoryPage, HistoryQuery, HistoryRecord, StatusFilter};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{HistoryError, Result};
use crate::schema::{self, COLUMNS, FILTER_SQL, LOWER_FN};

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Append-only store of finished replay sessions.
///
/// Implementations must tolerate concurrent `record` and `query` calls.
pub trait HistoryStore: Send + Sync {
    /// Append one record; returns its assigned id.
    fn record(&self, record: &HistoryRecord) -> Result<i64>;

    /// One page of records, newest first, plus the total matching count.
    fn query(&self, query: &HistoryQuery) -> Result<HistoryPage>;

    fn get(&self, id: i64) -> Result<Option<HistoryRecord>>;

    fn find_by_session(&self, session_id: &str) -> Result<Option<HistoryRecord>>;

    /// Delete every record; returns how many were removed.
    fn clear(&self) -> Result<u64>;

    /// Keep only the newest `keep` records; returns how many were removed.
    fn prune(&self, keep: u32) -> Result<u64>;
}

/// SQLite-backed history store.
///
/// A single connection behind a mutex serializes writers; WAL mode lets
/// other processes read the file while a replay is being recorded.
#[derive(Debug)]
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteHistoryStore {
    /// Open (creating if needed) a history database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| HistoryError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "opened history database");
        register_functions(&conn)?;
        schema::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        register_functions(&conn)?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file path (`None` for in-memory stores).
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| HistoryError::LockPoisoned)
    }
}

fn register_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        LOWER_FN,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: Option<String> = ctx.get(0)?;
            Ok(text.map(|t| t.to_lowercase()))
        },
    )?;
    Ok(())
}

impl HistoryStore for SqliteHistoryStore {
    fn record(&self, record: &HistoryRecord) -> Result<i64> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO replay_history (session_id, file_id, capture_filename, file_size, \
             interface, speed, speed_unit, continuous, loop_count_hint, preload, \
             loops_completed, status, started_at, completed_at, duration_secs, \
             packets_sent, bytes_sent, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                record.session_id,
                record.file_id,
                record.capture_filename,
                to_sql_int(record.file_size),
                record.interface,
                record.speed,
                record.speed_unit.as_str(),
                record.continuous,
                record.loop_count_hint,
                record.preload,
                record.loops_completed,
                record.status.as_str(),
                format_ts(&record.started_at),
                format_ts(&record.completed_at),
                record.duration_secs,
                to_sql_int(record.packets_sent),
                to_sql_int(record.bytes_sent),
                record.error_message,
            ],
        );

        match inserted {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                info!(
                    id,
                    session_id = %record.session_id,
                    status = %record.status,
                    "recorded replay history"
                );
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(HistoryError::Duplicate(record.session_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn query(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let search = query.search_term();
        let status = match query.status {
            StatusFilter::All => None,
            StatusFilter::Only(status) => Some(status.as_str()),
        };
        let limit = query.effective_limit();

        let conn = self.lock()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM replay_history WHERE {FILTER_SQL}"),
            params![search, status],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM replay_history WHERE {FILTER_SQL} \
             ORDER BY id DESC LIMIT ?3 OFFSET ?4"
        ))?;
        let entries = stmt
            .query_map(
                params![search, status, i64::from(limit), i64::from(query.offset)],
                row_to_record,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(HistoryPage::new(
            entries,
            from_sql_int(total),
            limit,
            query.offset,
        ))
    }

    fn get(&self, id: i64) -> Result<Option<HistoryRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM replay_history WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?)
    }

    fn find_by_session(&self, session_id: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM replay_history WHERE session_id = ?1"),
                params![session_id],
                row_to_record,
            )
            .optional()?)
    }

    fn clear(&self) -> Result<u64> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM replay_history", [])?;
        info!(removed, "cleared replay history");
        Ok(removed as u64)
    }

    fn prune(&self, keep: u32) -> Result<u64> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM replay_history WHERE id NOT IN \
             (SELECT id FROM replay_history ORDER BY id DESC LIMIT ?1)",
            params![i64::from(keep)],
        )?;
        info!(keep, removed, "pruned replay history");
        Ok(removed as u64)
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        file_id: row.get(2)?,
        capture_filename: row.get(3)?,
        file_size: from_sql_int(row.get(4)?),
        interface: row.get(5)?,
        speed: row.get(6)?,
        speed_unit: parse_column(row, 7)?,
        continuous: row.get(8)?,
        loop_count_hint: row.get(9)?,
        preload: row.get(10)?,
        loops_completed: row.get(11)?,
        status: parse_column(row, 12)?,
        started_at: parse_ts(row, 13)?,
        completed_at: parse_ts(row, 14)?,
        duration_secs: row.get(15)?,
        packets_sent: from_sql_int(row.get(16)?),
        bytes_sent: from_sql_int(row.get(17)?),
        error_message: row.get(18)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// SQLite integers are signed 64-bit; counters saturate rather than wrap.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
