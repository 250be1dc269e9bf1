//! SQLite schema and migrations for the history database.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{HistoryError, Result};
use crate::SCHEMA_VERSION;

pub(crate) const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS replay_history (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id       TEXT    NOT NULL UNIQUE,
    file_id          TEXT    NOT NULL,
    capture_filename TEXT    NOT NULL,
    file_size        INTEGER NOT NULL,
    interface        TEXT    NOT NULL,
    speed            REAL    NOT NULL,
    speed_unit       TEXT    NOT NULL,
    continuous       INTEGER NOT NULL,
    loop_count_hint  INTEGER,
    preload          INTEGER NOT NULL,
    loops_completed  INTEGER NOT NULL,
    status           TEXT    NOT NULL,
    started_at       TEXT    NOT NULL,
    completed_at     TEXT    NOT NULL,
    duration_secs    REAL    NOT NULL,
    packets_sent     INTEGER NOT NULL,
    bytes_sent       INTEGER NOT NULL,
    error_message    TEXT
);

CREATE INDEX IF NOT EXISTS idx_replay_history_status ON replay_history(status);
";

pub(crate) const COLUMNS: &str = "id, session_id, file_id, capture_filename, file_size, \
     interface, speed, speed_unit, continuous, loop_count_hint, preload, loops_completed, \
     status, started_at, completed_at, duration_secs, packets_sent, bytes_sent, error_message";

/// Unicode-aware lowercasing registered on every connection. SQLite's
/// built-in `lower()` only folds ASCII.
pub(crate) const LOWER_FN: &str = "pcr_lower";

/// Filter shared by page and count queries. `?1` is the lowercased search
/// term (or NULL), `?2` the status (or NULL).
pub(crate) const FILTER_SQL: &str = "(?1 IS NULL \
        OR instr(pcr_lower(capture_filename), ?1) > 0 \
        OR instr(pcr_lower(interface), ?1) > 0) \
     AND (?2 IS NULL OR status = ?2)";

pub(crate) fn user_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Create or upgrade the schema.
pub(crate) fn migrate(conn: &Connection) -> Result<()> {
    let found = user_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(HistoryError::UnsupportedSchema {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found == SCHEMA_VERSION {
        debug!(version = found, "history schema up to date");
        return Ok(());
    }

    conn.execute_batch(SCHEMA_SQL)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    info!(from = found, to = SCHEMA_VERSION, "history schema migrated");
    Ok(())
}
