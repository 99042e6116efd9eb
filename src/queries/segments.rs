use sea_query::{Expr, Func, Order, Query, SimpleExpr, SqliteQueryBuilder};

use crate::schema::Segments;

/// Column order shared by every full-row SELECT; must match
/// `SegmentRecord::from_row`.
fn select_columns() -> [Segments; 9] {
    [
        Segments::Id,
        Segments::Filename,
        Segments::ArchivedPath,
        Segments::StartTsMs,
        Segments::EndTsMs,
        Segments::IsPublished,
        Segments::Sha256Hash,
        Segments::CreatedAtMs,
        Segments::UpdatedAtMs,
    ]
}

/// The effective end of a segment: end_ts_ms, or start_ts_ms plus the
/// configured segment duration while the segment is still open.
fn effective_end_expr(segment_duration_ms: i64) -> SimpleExpr {
    Func::coalesce([
        Expr::col(Segments::EndTsMs).into(),
        Expr::col(Segments::StartTsMs).add(segment_duration_ms).into(),
    ])
    .into()
}

/// INSERT INTO segments (filename, archived_path, start_ts_ms, end_ts_ms,
/// is_published, sha256_hash, created_at_ms, updated_at_ms)
/// VALUES (?, ?, ?, ?, 1, ?, ?, ?)
pub fn insert(
    filename: &str,
    archived_path: &str,
    start_ts_ms: i64,
    end_ts_ms: Option<i64>,
    sha256_hash: Option<&str>,
    now_ms: i64,
) -> String {
    Query::insert()
        .into_table(Segments::Table)
        .columns([
            Segments::Filename,
            Segments::ArchivedPath,
            Segments::StartTsMs,
            Segments::EndTsMs,
            Segments::IsPublished,
            Segments::Sha256Hash,
            Segments::CreatedAtMs,
            Segments::UpdatedAtMs,
        ])
        .values_panic([
            filename.into(),
            archived_path.into(),
            start_ts_ms.into(),
            end_ts_ms.into(),
            1.into(),
            sha256_hash.map(|s| s.to_string()).into(),
            now_ms.into(),
            now_ms.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT <full row> FROM segments WHERE filename = ?
pub fn select_by_filename(filename: &str) -> String {
    Query::select()
        .columns(select_columns())
        .from(Segments::Table)
        .and_where(Expr::col(Segments::Filename).eq(filename))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE segments SET end_ts_ms = ?, archived_path = ?, updated_at_ms = ?
/// WHERE filename = ?
/// Used on event redelivery; start_ts_ms is never touched.
pub fn update_after_redelivery(
    filename: &str,
    end_ts_ms: Option<i64>,
    archived_path: &str,
    now_ms: i64,
) -> String {
    Query::update()
        .table(Segments::Table)
        .value(Segments::EndTsMs, end_ts_ms)
        .value(Segments::ArchivedPath, archived_path)
        .value(Segments::UpdatedAtMs, now_ms)
        .and_where(Expr::col(Segments::Filename).eq(filename))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE segments SET sha256_hash = ?, updated_at_ms = ? WHERE filename = ?
pub fn update_sha256(filename: &str, sha256_hash: &str, now_ms: i64) -> String {
    Query::update()
        .table(Segments::Table)
        .value(Segments::Sha256Hash, sha256_hash)
        .value(Segments::UpdatedAtMs, now_ms)
        .and_where(Expr::col(Segments::Filename).eq(filename))
        .to_string(SqliteQueryBuilder)
}

/// SELECT <full row> FROM segments
/// WHERE start_ts_ms < ? AND COALESCE(end_ts_ms, start_ts_ms + ?) > ?
///   [AND is_published = 1]
/// ORDER BY start_ts_ms
/// Segments whose range intersects [start, end), oldest first.
pub fn select_intersecting(
    start_ts_ms: i64,
    end_ts_ms: i64,
    segment_duration_ms: i64,
    include_unpublished: bool,
) -> String {
    let mut query = Query::select()
        .columns(select_columns())
        .from(Segments::Table)
        .and_where(Expr::col(Segments::StartTsMs).lt(end_ts_ms))
        .and_where(Expr::expr(effective_end_expr(segment_duration_ms)).gt(start_ts_ms))
        .order_by(Segments::StartTsMs, Order::Asc)
        .to_owned();
    if !include_unpublished {
        query.and_where(Expr::col(Segments::IsPublished).eq(1));
    }
    query.to_string(SqliteQueryBuilder)
}

/// SELECT filename FROM segments
/// WHERE is_published = 1 AND filename <> ?
///   AND start_ts_ms < ? AND COALESCE(end_ts_ms, start_ts_ms + ?) > ?
/// Published segments whose range would collide with a candidate insert.
pub fn select_published_overlapping(
    filename: &str,
    start_ts_ms: i64,
    end_ts_ms: i64,
    segment_duration_ms: i64,
) -> String {
    Query::select()
        .column(Segments::Filename)
        .from(Segments::Table)
        .and_where(Expr::col(Segments::IsPublished).eq(1))
        .and_where(Expr::col(Segments::Filename).ne(filename))
        .and_where(Expr::col(Segments::StartTsMs).lt(end_ts_ms))
        .and_where(Expr::expr(effective_end_expr(segment_duration_ms)).gt(start_ts_ms))
        .order_by(Segments::StartTsMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT <full row> FROM segments
/// [WHERE start_ts_ms >= ?] [AND start_ts_ms < ?] [AND is_published = 1]
/// ORDER BY start_ts_ms
/// Metadata listing with optional date filters.
pub fn list_segments(
    from_ts_ms: Option<i64>,
    to_ts_ms: Option<i64>,
    include_unpublished: bool,
) -> String {
    let mut query = Query::select()
        .columns(select_columns())
        .from(Segments::Table)
        .order_by(Segments::StartTsMs, Order::Asc)
        .to_owned();
    if let Some(from_ms) = from_ts_ms {
        query.and_where(Expr::col(Segments::StartTsMs).gte(from_ms));
    }
    if let Some(to_ms) = to_ts_ms {
        query.and_where(Expr::col(Segments::StartTsMs).lt(to_ms));
    }
    if !include_unpublished {
        query.and_where(Expr::col(Segments::IsPublished).eq(1));
    }
    query.to_string(SqliteQueryBuilder)
}

/// UPDATE segments SET is_published = ?, updated_at_ms = ? WHERE filename = ?
pub fn set_published(filename: &str, published: bool, now_ms: i64) -> String {
    Query::update()
        .table(Segments::Table)
        .value(Segments::IsPublished, published as i32)
        .value(Segments::UpdatedAtMs, now_ms)
        .and_where(Expr::col(Segments::Filename).eq(filename))
        .to_string(SqliteQueryBuilder)
}
