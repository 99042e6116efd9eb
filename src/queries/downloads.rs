use sea_query::{Expr, Func, Query, SqliteQueryBuilder};

use crate::schema::DownloadLogs;

/// INSERT INTO download_logs (segment_id, downloaded_at_ms, ip_address, user_agent)
/// VALUES (?, ?, ?, ?)
pub fn insert(
    segment_id: i64,
    downloaded_at_ms: i64,
    ip_address: Option<&str>,
    user_agent: Option<&str>,
) -> String {
    Query::insert()
        .into_table(DownloadLogs::Table)
        .columns([
            DownloadLogs::SegmentId,
            DownloadLogs::DownloadedAtMs,
            DownloadLogs::IpAddress,
            DownloadLogs::UserAgent,
        ])
        .values_panic([
            segment_id.into(),
            downloaded_at_ms.into(),
            ip_address.map(|s| s.to_string()).into(),
            user_agent.map(|s| s.to_string()).into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(id) FROM download_logs WHERE segment_id = ?
pub fn count_for_segment(segment_id: i64) -> String {
    Query::select()
        .expr(Func::count(Expr::col(DownloadLogs::Id)))
        .from(DownloadLogs::Table)
        .and_where(Expr::col(DownloadLogs::SegmentId).eq(segment_id))
        .to_string(SqliteQueryBuilder)
}
