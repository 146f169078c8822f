//! Helpers shared by the SQLite-backed stores.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};

/// How long a connection waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Classified SQLite failure.
#[derive(Debug)]
pub(crate) enum DbFailure {
    /// The database could not be reached (busy, locked, I/O, cannot open).
    Unavailable(String),
    /// Any other SQL error.
    Query(String),
}

/// Splits rusqlite errors into "store unreachable" and "query failed".
pub(crate) fn classify(err: rusqlite::Error) -> DbFailure {
    match &err {
        rusqlite::Error::SqliteFailure(ffi, _)
            if matches!(
                ffi.code,
                ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
            ) =>
        {
            DbFailure::Unavailable(err.to_string())
        }
        _ => DbFailure::Query(err.to_string()),
    }
}

/// Opens a file-backed connection configured for sharing between processes.
pub(crate) fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    Ok(conn)
}

/// Opens an in-memory connection (useful for testing).
pub(crate) fn open_in_memory() -> rusqlite::Result<Connection> {
    Connection::open_in_memory()
}

/// Formats a timestamp as fixed-width RFC 3339 so that text comparison orders it.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp, falling back to now for corrupt values.
pub(crate) fn parse_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.as_deref().map(parse_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width_and_ordered() {
        let a = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1500);
        let fa = format_ts(a);
        let fb = format_ts(b);
        assert_eq!(fa.len(), fb.len());
        assert!(fa < fb);
        assert_eq!(parse_ts(&fa), a);
    }

    #[test]
    fn test_classify_query_error() {
        let conn = open_in_memory().unwrap();
        let err = conn.execute("SELECT * FROM missing_table", []).unwrap_err();
        assert!(matches!(classify(err), DbFailure::Query(_)));
    }
}
