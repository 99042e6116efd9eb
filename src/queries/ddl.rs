use sea_query::{ColumnDef, ForeignKey, Index, SqliteQueryBuilder, Table};

use crate::schema::{DownloadLogs, Metadata, Segments};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS segments (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     filename TEXT NOT NULL UNIQUE,
///     archived_path TEXT NOT NULL,
///     start_ts_ms INTEGER NOT NULL,
///     end_ts_ms INTEGER,
///     is_published INTEGER NOT NULL DEFAULT 1,
///     sha256_hash TEXT,
///     created_at_ms INTEGER NOT NULL,
///     updated_at_ms INTEGER NOT NULL
/// )
pub fn create_segments_table() -> String {
    Table::create()
        .table(Segments::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(Segments::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(Segments::Filename)
                .string()
                .not_null()
                .unique_key(),
        )
        .col(ColumnDef::new(Segments::ArchivedPath).text().not_null())
        .col(ColumnDef::new(Segments::StartTsMs).big_integer().not_null())
        .col(ColumnDef::new(Segments::EndTsMs).big_integer())
        .col(
            ColumnDef::new(Segments::IsPublished)
                .integer()
                .not_null()
                .default(1),
        )
        .col(ColumnDef::new(Segments::Sha256Hash).string())
        .col(
            ColumnDef::new(Segments::CreatedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(Segments::UpdatedAtMs)
                .big_integer()
                .not_null(),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_segments_start_ts ON segments(start_ts_ms)
pub fn create_segments_start_ts_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_segments_start_ts")
        .table(Segments::Table)
        .col(Segments::StartTsMs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_segments_published ON segments(is_published, start_ts_ms)
pub fn create_segments_published_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_segments_published")
        .table(Segments::Table)
        .col(Segments::IsPublished)
        .col(Segments::StartTsMs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS download_logs (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     segment_id INTEGER NOT NULL REFERENCES segments(id),
///     downloaded_at_ms INTEGER NOT NULL,
///     ip_address TEXT,
///     user_agent TEXT
/// )
pub fn create_download_logs_table() -> String {
    Table::create()
        .table(DownloadLogs::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(DownloadLogs::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(DownloadLogs::SegmentId)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(DownloadLogs::DownloadedAtMs)
                .big_integer()
                .not_null(),
        )
        .col(ColumnDef::new(DownloadLogs::IpAddress).string())
        .col(ColumnDef::new(DownloadLogs::UserAgent).string())
        .foreign_key(
            ForeignKey::create()
                .from(DownloadLogs::Table, DownloadLogs::SegmentId)
                .to(Segments::Table, Segments::Id),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_download_logs_segment ON download_logs(segment_id)
pub fn create_download_logs_segment_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_download_logs_segment")
        .table(DownloadLogs::Table)
        .col(DownloadLogs::SegmentId)
        .to_string(SqliteQueryBuilder)
}
