use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, Row};
use std::path::Path;

use crate::constants::EXPECTED_DB_VERSION;
use crate::queries::{ddl, metadata};

/// One catalog row for an archived segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub id: i64,
    pub filename: String,
    pub archived_path: String,
    pub start_ts: DateTime<Utc>,
    /// None until the segment is confirmed closed
    pub end_ts: Option<DateTime<Utc>>,
    pub is_published: bool,
    pub sha256_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SegmentRecord {
    /// Map a row selected with the column order of
    /// `queries::segments::SELECT_COLUMNS`.
    pub fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            filename: row.get(1)?,
            archived_path: row.get(2)?,
            start_ts: datetime_from_ms(row.get(3)?, 3)?,
            end_ts: match row.get::<_, Option<i64>>(4)? {
                Some(ms) => Some(datetime_from_ms(ms, 4)?),
                None => None,
            },
            is_published: row.get::<_, i64>(5)? != 0,
            sha256_hash: row.get(6)?,
            created_at: datetime_from_ms(row.get(7)?, 7)?,
            updated_at: datetime_from_ms(row.get(8)?, 8)?,
        })
    }

    /// Closed end, or the assumed end for a still-open segment.
    pub fn effective_end(&self, segment_duration: chrono::Duration) -> DateTime<Utc> {
        self.end_ts.unwrap_or(self.start_ts + segment_duration)
    }
}

fn datetime_from_ms(ms: i64, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("timestamp {} ms out of range", ms).into(),
        )
    })
}

/// Open the catalog database for read-write use.
/// Enables WAL mode and foreign keys.
pub fn open_database_connection(db_path: &Path) -> Result<Connection, Box<dyn std::error::Error>> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Open a read-only catalog connection (for web server handlers)
/// Foreign keys are not enabled as no modifications are allowed
pub fn open_readonly_connection(
    db_path: impl AsRef<Path>,
) -> Result<Connection, Box<dyn std::error::Error>> {
    let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    Ok(conn)
}

/// Create the schema if missing and stamp the version row.
pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(&ddl::create_metadata_table(), [])?;
    conn.execute(&ddl::create_segments_table(), [])?;
    conn.execute(&ddl::create_segments_start_ts_index(), [])?;
    conn.execute(&ddl::create_segments_published_index(), [])?;
    conn.execute(&ddl::create_download_logs_table(), [])?;
    conn.execute(&ddl::create_download_logs_segment_index(), [])?;
    conn.execute(&metadata::upsert("version", EXPECTED_DB_VERSION), [])?;
    Ok(())
}

/// Verify the catalog schema version before serving or indexing.
pub fn check_version(conn: &Connection) -> Result<(), Box<dyn std::error::Error>> {
    let db_version: String = conn
        .query_row(&metadata::select_by_key("version"), [], |row| row.get(0))
        .map_err(|e| format!("Failed to read version from metadata: {}", e))?;

    if db_version != EXPECTED_DB_VERSION {
        return Err(format!(
            "Unsupported catalog version: '{}'. This application only supports version '{}'",
            db_version, EXPECTED_DB_VERSION
        )
        .into());
    }
    Ok(())
}

/// Create an in-memory database with the full schema for testing
pub fn create_test_connection_in_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("Failed to create in-memory database");
    conn.execute("PRAGMA foreign_keys = ON", [])
        .expect("Failed to enable foreign keys");
    init_schema(&conn).expect("Failed to initialize schema");
    conn
}
