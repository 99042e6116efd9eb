use axum::{
    body::Body,
    extract::{ConnectInfo, Path as AxumPath, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc as StdArc;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};

use crate::config::ArchiveConfig;
use crate::db::{self, SegmentRecord};
use crate::error::ArchiveError;
use crate::queries::{downloads, segments};
use crate::retrieval::{self, RetrievalMode, RetrievalPlan};
use crate::segment_name::SegmentName;

// State for catalog API handlers
pub struct AppState {
    pub db_path: PathBuf,
    pub archive_dir: PathBuf,
    pub segment_duration_secs: u64,
    pub admin_token: Option<String>,
}

impl AppState {
    fn segment_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.segment_duration_secs as i64)
    }

    /// Administrative visibility is granted by the X-Admin-Token header
    /// matching the configured token. No token configured means no admin
    /// callers at all.
    fn is_admin(&self, headers: &HeaderMap) -> bool {
        match &self.admin_token {
            Some(token) => headers
                .get("x-admin-token")
                .and_then(|v| v.to_str().ok())
                .map(|v| v == token)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Serve the catalog query/retrieval API.
pub fn serve_catalog(config: ArchiveConfig, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = config.db_path();
    if !db_path.exists() {
        return Err(format!(
            "Catalog database not found: {} (run the indexer or init-db first)",
            db_path.display()
        )
        .into());
    }
    let conn = db::open_readonly_connection(&db_path)?;
    db::check_version(&conn)?;
    drop(conn);

    println!("Starting catalog API for: {}", db_path.display());
    println!("Archive root: {}", config.archive_dir.display());
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", port);
    println!("Endpoints:");
    println!("  GET  /api/health  - status check");
    println!("  GET  /api/segments?from=<ts>&to=<ts>  - segment listing");
    println!("  GET  /api/plan?start=<ts>&end=<ts>&mode=strict|best-effort  - retrieval plan");
    println!("  GET  /api/range?start=<ts>&end=<ts>&mode=strict|best-effort  - concatenated audio");
    println!("  GET  /download/<year>/<month>/<day>/<filename>  - single archived segment");
    println!("  POST /api/segments/<filename>/publish  - visibility toggle (admin)");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let app_state = StdArc::new(AppState {
            db_path,
            archive_dir: config.archive_dir.clone(),
            segment_duration_secs: config.segment_duration_secs,
            admin_token: config.admin_token.clone(),
        });

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/segments", get(list_segments_handler))
            .route("/api/plan", get(plan_handler))
            .route("/api/range", get(range_handler))
            .route(
                "/download/{year}/{month}/{day}/{filename}",
                get(download_handler),
            )
            .route("/api/segments/{filename}/publish", get(publish_status_handler).post(publish_toggle_handler))
            .layer(cors)
            .with_state(app_state);

        let listener = tokio::net::TcpListener::bind(format!("[::]:{}", port))
            .await
            .map_err(|e| format!("Failed to bind to port {}: {}", port, e))?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| format!("Server error: {}", e))?;

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "service": "stream_archiver API", "status": "ok" }))
}

/// Accept an RFC 3339 instant or a bare date (midnight UTC).
fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Requester address for the access log: the first X-Forwarded-For hop if
/// the reverse proxy set one, else the peer address.
fn requester_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn requester_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

#[derive(Serialize)]
struct SegmentInfo {
    filename: String,
    start_ts: String,
    end_ts: Option<String>,
    is_published: bool,
    sha256_hash: Option<String>,
}

impl SegmentInfo {
    fn from_record(row: &SegmentRecord) -> Self {
        Self {
            filename: row.filename.clone(),
            start_ts: rfc3339(row.start_ts),
            end_ts: row.end_ts.map(rfc3339),
            is_published: row.is_published,
            sha256_hash: row.sha256_hash.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ListQuery {
    from: Option<String>,
    to: Option<String>,
}

// Segment listing with optional date filter; admin callers also see
// unpublished rows
async fn list_segments_handler(
    State(state): State<StdArc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let from_ms = match query.from.as_deref() {
        Some(s) => match parse_instant(s) {
            Some(ts) => Some(ts.timestamp_millis()),
            None => {
                return (StatusCode::BAD_REQUEST, format!("Invalid 'from' instant: {}", s))
                    .into_response()
            }
        },
        None => None,
    };
    let to_ms = match query.to.as_deref() {
        Some(s) => match parse_instant(s) {
            Some(ts) => Some(ts.timestamp_millis()),
            None => {
                return (StatusCode::BAD_REQUEST, format!("Invalid 'to' instant: {}", s))
                    .into_response()
            }
        },
        None => None,
    };

    let conn = match db::open_readonly_connection(&state.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(
                "Failed to open readonly database connection at '{}': {}",
                state.db_path.display(),
                e
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    let include_unpublished = state.is_admin(&headers);
    let sql = segments::list_segments(from_ms, to_ms, include_unpublished);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to query segments: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Query error").into_response();
        }
    };
    let rows: Vec<SegmentInfo> = match stmt.query_map([], SegmentRecord::from_row) {
        Ok(mapped) => mapped
            .filter_map(|r| r.ok())
            .map(|row| SegmentInfo::from_record(&row))
            .collect(),
        Err(e) => {
            error!("Failed to fetch segments: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Fetch error").into_response();
        }
    };

    Json(serde_json::json!({ "count": rows.len(), "segments": rows })).into_response()
}

#[derive(Deserialize)]
struct RangeQuery {
    start: String,
    end: String,
    mode: Option<String>,
}

struct ParsedRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    mode: RetrievalMode,
}

fn parse_range_query(query: &RangeQuery) -> Result<ParsedRange, String> {
    let start =
        parse_instant(&query.start).ok_or_else(|| format!("Invalid 'start' instant: {}", query.start))?;
    let end =
        parse_instant(&query.end).ok_or_else(|| format!("Invalid 'end' instant: {}", query.end))?;
    if end <= start {
        return Err("'end' must be after 'start'".to_string());
    }
    let mode = match query.mode.as_deref() {
        None => RetrievalMode::Strict,
        Some(s) => RetrievalMode::parse(s)
            .ok_or_else(|| format!("Invalid mode '{}', expected strict or best-effort", s))?,
    };
    Ok(ParsedRange { start, end, mode })
}

#[derive(Serialize)]
struct GapInfo {
    start: String,
    end: String,
}

#[derive(Serialize)]
struct ClipInfo {
    filename: String,
    clip_start: String,
    clip_end: String,
    segment_start: String,
    segment_end: String,
    /// True when the byte stream carries more audio than the clipped
    /// interval (trimming is segment-boundary granular)
    partial: bool,
}

#[derive(Serialize)]
struct PlanResponse {
    start: String,
    end: String,
    covered_seconds: i64,
    clips: Vec<ClipInfo>,
    gaps: Vec<GapInfo>,
}

impl PlanResponse {
    fn from_plan(plan: &RetrievalPlan) -> Self {
        Self {
            start: rfc3339(plan.req_start),
            end: rfc3339(plan.req_end),
            covered_seconds: plan.covered_duration().num_seconds(),
            clips: plan
                .clips
                .iter()
                .map(|clip| ClipInfo {
                    filename: clip.filename.clone(),
                    clip_start: rfc3339(clip.clip_start),
                    clip_end: rfc3339(clip.clip_end),
                    segment_start: rfc3339(clip.segment_start),
                    segment_end: rfc3339(clip.segment_end),
                    partial: clip.is_partial(),
                })
                .collect(),
            gaps: gap_infos(plan),
        }
    }
}

fn gap_infos(plan: &RetrievalPlan) -> Vec<GapInfo> {
    plan.gaps
        .iter()
        .map(|gap| GapInfo {
            start: rfc3339(gap.start),
            end: rfc3339(gap.end),
        })
        .collect()
}

/// Map the expected retrieval outcomes onto status codes: gaps and empty
/// ranges are ordinary results for the caller, never server errors.
fn retrieval_error_response(err: ArchiveError) -> axum::response::Response {
    match err {
        ArchiveError::CoverageGap { gaps } => {
            let gaps: Vec<GapInfo> = gaps
                .iter()
                .map(|gap| GapInfo {
                    start: rfc3339(gap.start),
                    end: rfc3339(gap.end),
                })
                .collect();
            (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": "coverage_gap", "gaps": gaps })),
            )
                .into_response()
        }
        ArchiveError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "not_found" })),
        )
            .into_response(),
        err => {
            error!("Retrieval failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Retrieval error").into_response()
        }
    }
}

// Retrieval plan as JSON, without the audio bytes (UI heatmap support)
async fn plan_handler(
    State(state): State<StdArc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let parsed = match parse_range_query(&query) {
        Ok(p) => p,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };

    let conn = match db::open_readonly_connection(&state.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(
                "Failed to open readonly database connection at '{}': {}",
                state.db_path.display(),
                e
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    match retrieval::resolve_range(
        &conn,
        parsed.start,
        parsed.end,
        state.segment_duration(),
        state.is_admin(&headers),
        parsed.mode,
    ) {
        Ok(plan) => Json(PlanResponse::from_plan(&plan)).into_response(),
        Err(err) => retrieval_error_response(err),
    }
}

// Concatenated audio for a time range
async fn range_handler(
    State(state): State<StdArc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let parsed = match parse_range_query(&query) {
        Ok(p) => p,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };

    let conn = match db::open_readonly_connection(&state.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(
                "Failed to open readonly database connection at '{}': {}",
                state.db_path.display(),
                e
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    let plan = match retrieval::resolve_range(
        &conn,
        parsed.start,
        parsed.end,
        state.segment_duration(),
        state.is_admin(&headers),
        parsed.mode,
    ) {
        Ok(plan) => plan,
        Err(err) => return retrieval_error_response(err),
    };

    let audio = match retrieval::read_concatenated(&plan) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Concatenation failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Concatenation error").into_response();
        }
    };

    log_plan_access(&state, &plan, &headers, &addr);

    let gaps_json = serde_json::to_string(&gap_infos(&plan)).unwrap_or_else(|_| "[]".to_string());
    (
        StatusCode::OK,
        [
            ("content-type", "audio/mpeg".to_string()),
            (
                "x-duration-seconds",
                plan.covered_duration().num_seconds().to_string(),
            ),
            ("x-coverage-gaps", gaps_json),
        ],
        audio,
    )
        .into_response()
}

/// Append one access-log row per clip segment; logging failure never fails
/// the retrieval.
fn log_plan_access(
    state: &AppState,
    plan: &RetrievalPlan,
    headers: &HeaderMap,
    addr: &SocketAddr,
) {
    let conn = match db::open_database_connection(&state.db_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to open database for access logging: {}", e);
            return;
        }
    };
    let ip = requester_ip(headers, addr);
    let user_agent = requester_user_agent(headers);
    let now_ms = Utc::now().timestamp_millis();
    for clip in &plan.clips {
        if let Err(e) = conn.execute(
            &downloads::insert(clip.segment_id, now_ms, Some(&ip), user_agent.as_deref()),
            [],
        ) {
            warn!("Failed to log access for '{}': {}", clip.filename, e);
        }
    }
}

// Single archived segment download, mirroring the archive tree layout
async fn download_handler(
    State(state): State<StdArc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    AxumPath((year, month, day, filename)): AxumPath<(String, String, String, String)>,
) -> impl IntoResponse {
    // The filename must parse; this also rejects any traversal attempt
    if SegmentName::parse(&filename).is_err() {
        return (StatusCode::BAD_REQUEST, "Malformed segment name").into_response();
    }
    if !is_date_component(&year, 4) || !is_date_component(&month, 2) || !is_date_component(&day, 2)
    {
        return (StatusCode::BAD_REQUEST, "Malformed archive path").into_response();
    }

    let conn = match db::open_readonly_connection(&state.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(
                "Failed to open readonly database connection at '{}': {}",
                state.db_path.display(),
                e
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    use rusqlite::OptionalExtension;
    let row: Option<SegmentRecord> = match conn
        .query_row(&segments::select_by_filename(&filename), [], SegmentRecord::from_row)
        .optional()
    {
        Ok(row) => row,
        Err(e) => {
            error!("Failed to query segment '{}': {}", filename, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Query error").into_response();
        }
    };

    let row = match row {
        // Unpublished segments are invisible to public callers
        Some(row) if row.is_published || state.is_admin(&headers) => row,
        _ => return (StatusCode::NOT_FOUND, "Recording not found").into_response(),
    };

    let file_path = state.archive_dir.join(&year).join(&month).join(&day).join(&filename);
    let file = match tokio::fs::File::open(&file_path).await {
        Ok(f) => f,
        Err(_) => {
            warn!(
                "Catalog row '{}' present but file missing at '{}'",
                filename,
                file_path.display()
            );
            return (StatusCode::NOT_FOUND, "Recording not found").into_response();
        }
    };

    let last_modified = file
        .metadata()
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .map(httpdate::fmt_http_date);

    // Append the access-log row before streaming begins
    {
        let ip = requester_ip(&headers, &addr);
        let user_agent = requester_user_agent(&headers);
        match db::open_database_connection(&state.db_path) {
            Ok(rw_conn) => {
                if let Err(e) = rw_conn.execute(
                    &downloads::insert(
                        row.id,
                        Utc::now().timestamp_millis(),
                        Some(&ip),
                        user_agent.as_deref(),
                    ),
                    [],
                ) {
                    warn!("Failed to log download of '{}': {}", filename, e);
                }
            }
            Err(e) => warn!("Failed to open database for download logging: {}", e),
        }
    }

    let stream = ReaderStream::new(file);
    let mut response = (
        StatusCode::OK,
        [
            ("content-type", "audio/mpeg".to_string()),
            (
                "content-disposition",
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response();
    if let Some(modified) = last_modified {
        if let Ok(value) = modified.parse() {
            response
                .headers_mut()
                .insert(header::LAST_MODIFIED, value);
        }
    }
    response
}

fn is_date_component(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_digit())
}

// Current visibility of one segment (admin)
async fn publish_status_handler(
    State(state): State<StdArc<AppState>>,
    headers: HeaderMap,
    AxumPath(filename): AxumPath<String>,
) -> impl IntoResponse {
    if !state.is_admin(&headers) {
        return (StatusCode::UNAUTHORIZED, "Invalid admin token").into_response();
    }

    let conn = match db::open_readonly_connection(&state.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(
                "Failed to open readonly database connection at '{}': {}",
                state.db_path.display(),
                e
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    use rusqlite::OptionalExtension;
    match conn
        .query_row(&segments::select_by_filename(&filename), [], SegmentRecord::from_row)
        .optional()
    {
        Ok(Some(row)) => Json(SegmentInfo::from_record(&row)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Recording not found").into_response(),
        Err(e) => {
            error!("Failed to query segment '{}': {}", filename, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Query error").into_response()
        }
    }
}

#[derive(Deserialize)]
struct PublishBody {
    published: bool,
}

// Visibility toggle: hides or restores a segment without touching its bytes
async fn publish_toggle_handler(
    State(state): State<StdArc<AppState>>,
    headers: HeaderMap,
    AxumPath(filename): AxumPath<String>,
    Json(body): Json<PublishBody>,
) -> impl IntoResponse {
    if !state.is_admin(&headers) {
        return (StatusCode::UNAUTHORIZED, "Invalid admin token").into_response();
    }

    let conn = match db::open_database_connection(&state.db_path) {
        Ok(c) => c,
        Err(e) => {
            error!(
                "Failed to open database connection at '{}': {}",
                state.db_path.display(),
                e
            );
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error").into_response();
        }
    };

    let now_ms = Utc::now().timestamp_millis();
    match conn.execute(&segments::set_published(&filename, body.published, now_ms), []) {
        Ok(0) => (StatusCode::NOT_FOUND, "Recording not found").into_response(),
        Ok(_) => Json(serde_json::json!({
            "filename": filename,
            "is_published": body.published,
        }))
        .into_response(),
        Err(e) => {
            error!("Failed to toggle publish for '{}': {}", filename, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Update error").into_response()
        }
    }
}
