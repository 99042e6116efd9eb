use thiserror::Error;

use crate::retrieval::Gap;

/// Result alias for catalog and pipeline operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Error taxonomy for the capture/index/retrieval pipeline.
///
/// `TransientIo` and `Db` are retryable and never fatal to a loop.
/// `CoverageGap` and `NotFound` are ordinary retrieval outcomes, reported
/// to the caller rather than retried.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Filesystem or channel hiccup; retried with backoff
    #[error("transient I/O failure: {0}")]
    TransientIo(#[from] std::io::Error),

    /// Database failure; retried with backoff unless a constraint no-op
    #[error("database failure: {0}")]
    Db(#[from] rusqlite::Error),

    /// Segment filename does not match `<STATION>-<ISO8601-UTC>Z.mp3`
    #[error("malformed segment name '{name}'")]
    MalformedName { name: String },

    /// Indexing would violate the published non-overlap invariant
    #[error("segment '{filename}' overlaps published segment '{existing}'")]
    OverlapConflict { filename: String, existing: String },

    /// Strict retrieval over an interval with missing data
    #[error("requested range has coverage gaps: {}", format_gaps(.gaps))]
    CoverageGap { gaps: Vec<Gap> },

    /// No segments at all intersect the requested range
    #[error("no segments intersect the requested range")]
    NotFound,

    /// Invalid or inconsistent configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Event channel payload or bookkeeping failure
    #[error("event channel error: {0}")]
    Channel(String),
}

fn format_gaps(gaps: &[Gap]) -> String {
    gaps.iter()
        .map(|g| g.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// True when a rusqlite error is a UNIQUE/constraint violation.
///
/// A duplicate filename inserted under race is a successful no-op for the
/// idempotent upsert, not an error.
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}

impl ArchiveError {
    /// True for failures worth retrying (filesystem, database contention).
    /// Everything else is either a bad item or an ordinary outcome.
    pub fn is_transient(&self) -> bool {
        match self {
            ArchiveError::TransientIo(_) => true,
            ArchiveError::Db(e) => !is_constraint_violation(e),
            _ => false,
        }
    }
}
