use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_FINALIZE_GRACE_SECS, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SEGMENT_DURATION_SECS,
};

fn default_segment_duration_secs() -> u64 {
    DEFAULT_SEGMENT_DURATION_SECS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_finalize_grace_secs() -> u64 {
    DEFAULT_FINALIZE_GRACE_SECS
}

fn default_api_port() -> u16 {
    8080
}

/// Archiver configuration file structure (TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Station prefix encoded into segment filenames (e.g. "WBOR")
    pub station_id: String,
    /// Directory the capture process writes raw segments into
    pub landing_dir: PathBuf,
    /// Root of the year/month/day partitioned archive tree
    pub archive_dir: PathBuf,
    /// Directory for the catalog database, event queue, and journals
    pub state_dir: PathBuf,
    /// Segment duration the producer is configured for (default: 300)
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: u64,
    /// Landing directory poll interval (default: 5)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Grace margin before a successor-less file is finalized (default: 30)
    #[serde(default = "default_finalize_grace_secs")]
    pub finalize_grace_secs: u64,
    /// API server port (default: 8080)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Token granting administrative visibility via X-Admin-Token
    pub admin_token: Option<String>,
}

impl ArchiveConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: ArchiveConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent values before any process starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.station_id.trim().is_empty() {
            return Err("station_id must not be empty".to_string());
        }
        if self.segment_duration_secs == 0 {
            return Err("segment_duration_secs must be greater than zero".to_string());
        }
        if self.poll_interval_secs == 0 {
            return Err("poll_interval_secs must be greater than zero".to_string());
        }
        if self.landing_dir == self.archive_dir {
            return Err("landing_dir and archive_dir must be different directories".to_string());
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("catalog.sqlite")
    }

    /// Durable segment-ready event queue directory.
    pub fn queue_dir(&self) -> PathBuf {
        self.state_dir.join("queue")
    }

    /// Pending-publish journal directory (moved but unpublished segments).
    pub fn pending_dir(&self) -> PathBuf {
        self.state_dir.join("pending")
    }

    pub fn segment_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.segment_duration_secs as i64)
    }

    pub fn finalize_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.finalize_grace_secs as i64)
    }

    pub fn segment_duration_ms(&self) -> i64 {
        self.segment_duration_secs as i64 * 1000
    }
}
