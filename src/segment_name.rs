//! Segment filename parsing and formatting.
//!
//! Archived segments are named `<STATION_ID>-%Y-%m-%dT%H:%M:%SZ.mp3`, for
//! example `WBOR-2025-02-14T00:35:01Z.mp3`. The encoded start instant is
//! always UTC, and for a fixed station prefix lexicographic order equals
//! chronological order. A conflict counter may be appended before the
//! extension (`WBOR-2025-02-14T00:40:00Z-1.mp3`) when two differing files
//! claim the same name.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

use crate::constants::SEGMENT_EXT;
use crate::error::ArchiveError;

/// Timestamp portion of a segment name, e.g. `2025-02-14T00:35:01Z`
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const TIMESTAMP_LEN: usize = 20;

/// A parsed segment filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub station_id: String,
    pub start: DateTime<Utc>,
    /// Conflict counter suffix, if any (`-1`, `-2`, ...)
    pub counter: Option<u32>,
}

impl SegmentName {
    pub fn new(station_id: &str, start: DateTime<Utc>) -> Self {
        Self {
            station_id: station_id.to_string(),
            start,
            counter: None,
        }
    }

    /// Parse a segment filename back into its station prefix, UTC start
    /// instant, and optional conflict counter.
    pub fn parse(filename: &str) -> Result<Self, ArchiveError> {
        let malformed = || ArchiveError::MalformedName {
            name: filename.to_string(),
        };

        let stem = filename
            .strip_suffix(&format!(".{}", SEGMENT_EXT))
            .ok_or_else(malformed)?;

        // Split a trailing conflict counter if the remainder still ends
        // with the timestamp's 'Z'.
        let (stem, counter) = match stem.rsplit_once('-') {
            Some((head, tail))
                if head.ends_with('Z') && !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) =>
            {
                let n: u32 = tail.parse().map_err(|_| malformed())?;
                (head, Some(n))
            }
            _ => (stem, None),
        };

        if stem.len() < TIMESTAMP_LEN + 2 || !stem.is_char_boundary(stem.len() - TIMESTAMP_LEN) {
            return Err(malformed());
        }
        let (prefix, ts) = stem.split_at(stem.len() - TIMESTAMP_LEN);
        let station_id = prefix.strip_suffix('-').ok_or_else(malformed)?;
        if station_id.is_empty() {
            return Err(malformed());
        }

        let start = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
            .map_err(|_| malformed())?
            .and_utc();

        Ok(Self {
            station_id: station_id.to_string(),
            start,
            counter,
        })
    }

    /// Format back to the exact filename this was parsed from.
    pub fn format(&self) -> String {
        let ts = self.start.format(TIMESTAMP_FORMAT);
        match self.counter {
            Some(n) => format!("{}-{}-{}.{}", self.station_id, ts, n, SEGMENT_EXT),
            None => format!("{}-{}.{}", self.station_id, ts, SEGMENT_EXT),
        }
    }

    /// Same name with a conflict counter applied.
    pub fn with_counter(&self, counter: u32) -> Self {
        Self {
            counter: Some(counter),
            ..self.clone()
        }
    }

    /// Date-partitioned path for this segment under the archive root:
    /// `archive/YYYY/MM/DD/<filename>`.
    pub fn partition_path(&self, archive_dir: &Path) -> PathBuf {
        archive_dir
            .join(self.start.format("%Y").to_string())
            .join(self.start.format("%m").to_string())
            .join(self.start.format("%d").to_string())
            .join(self.format())
    }
}
