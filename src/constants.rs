/// Expected catalog schema version
/// All catalog databases must use this version for compatibility
pub const EXPECTED_DB_VERSION: &str = "1";

/// File extension for archived audio segments
pub const SEGMENT_EXT: &str = "mp3";

/// Default segment duration produced by the capture process (seconds)
pub const DEFAULT_SEGMENT_DURATION_SECS: u64 = 300;

/// Default landing directory poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default grace margin added to the segment duration before a file
/// with no successor is considered finalized (seconds)
pub const DEFAULT_FINALIZE_GRACE_SECS: u64 = 30;
