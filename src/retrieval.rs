//! Range retrieval: resolve a requested time interval into the ordered
//! segment set covering it, detect uncovered sub-intervals, and join the
//! covered bytes into one continuous stream.
//!
//! Concatenation is a stream-copy of the archived segment bytes with no
//! decode or re-encode; all segments share one codec configuration by
//! producer contract, and each file gets a defensive header check before
//! its bytes are appended. Trimming precision is segment-boundary
//! granularity: a clip that begins or ends mid-segment contributes the
//! whole segment's bytes, and the plan reports the exact clipped time
//! range so callers can see the difference.

use chrono::{DateTime, Duration, Utc};
use log::debug;
use rusqlite::Connection;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::db::SegmentRecord;
use crate::error::{ArchiveError, Result};
use crate::queries::segments;

/// A sub-interval of the request with no published segment covering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            self.end.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )
    }
}

/// One segment's contribution to a requested range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    pub segment_id: i64,
    pub filename: String,
    pub archived_path: String,
    /// Contributed interval, clipped to the request
    pub clip_start: DateTime<Utc>,
    pub clip_end: DateTime<Utc>,
    /// Full interval of the underlying segment
    pub segment_start: DateTime<Utc>,
    pub segment_end: DateTime<Utc>,
}

impl Clip {
    pub fn duration(&self) -> Duration {
        self.clip_end - self.clip_start
    }

    /// True when the clip covers less than the whole segment, i.e. the
    /// byte stream carries more audio than the clipped interval.
    pub fn is_partial(&self) -> bool {
        self.clip_start > self.segment_start || self.clip_end < self.segment_end
    }
}

/// Whether a gap fails the request or is reported alongside the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalMode {
    Strict,
    BestEffort,
}

impl RetrievalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "strict" => Some(RetrievalMode::Strict),
            "best-effort" | "best_effort" => Some(RetrievalMode::BestEffort),
            _ => None,
        }
    }
}

/// Ordered clips and gap manifest for one requested interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalPlan {
    pub req_start: DateTime<Utc>,
    pub req_end: DateTime<Utc>,
    pub clips: Vec<Clip>,
    pub gaps: Vec<Gap>,
}

impl RetrievalPlan {
    pub fn is_gapless(&self) -> bool {
        self.gaps.is_empty()
    }

    /// Total clipped time actually covered by segments.
    pub fn covered_duration(&self) -> Duration {
        self.clips
            .iter()
            .fold(Duration::zero(), |acc, clip| acc + clip.duration())
    }
}

/// Resolve `[req_start, req_end)` into a plan.
///
/// The catalog read runs inside one read transaction so a publish toggle
/// cannot tear the plan; concatenation I/O happens after it ends.
/// Unpublished segments are invisible unless `include_unpublished` is set,
/// and act as gaps for public callers.
pub fn build_plan(
    conn: &Connection,
    req_start: DateTime<Utc>,
    req_end: DateTime<Utc>,
    segment_duration: Duration,
    include_unpublished: bool,
) -> Result<RetrievalPlan> {
    if req_end <= req_start {
        return Err(ArchiveError::NotFound);
    }

    let rows: Vec<SegmentRecord> = {
        let tx = conn.unchecked_transaction()?;
        let sql = segments::select_intersecting(
            req_start.timestamp_millis(),
            req_end.timestamp_millis(),
            segment_duration.num_milliseconds(),
            include_unpublished,
        );
        let rows = {
            let mut stmt = tx.prepare(&sql)?;
            let mapped = stmt.query_map([], SegmentRecord::from_row)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.commit()?;
        rows
    };

    if rows.is_empty() {
        return Err(ArchiveError::NotFound);
    }

    let mut clips = Vec::new();
    let mut gaps = Vec::new();
    let mut cursor = req_start;

    for row in rows {
        let segment_start = row.start_ts;
        let segment_end = row.effective_end(segment_duration);
        if segment_end <= cursor {
            continue;
        }
        if segment_start > cursor {
            gaps.push(Gap {
                start: cursor,
                end: segment_start,
            });
        }

        let clip_start = cursor.max(segment_start);
        let clip_end = segment_end.min(req_end);
        if clip_start < clip_end {
            clips.push(Clip {
                segment_id: row.id,
                filename: row.filename,
                archived_path: row.archived_path,
                clip_start,
                clip_end,
                segment_start,
                segment_end,
            });
            cursor = clip_end;
        }
        if cursor >= req_end {
            break;
        }
    }

    if cursor < req_end {
        gaps.push(Gap {
            start: cursor,
            end: req_end,
        });
    }

    debug!(
        "Planned [{}, {}): {} clips, {} gaps",
        req_start, req_end, clips.len(), gaps.len()
    );

    Ok(RetrievalPlan {
        req_start,
        req_end,
        clips,
        gaps,
    })
}

/// Build a plan and apply the response mode: strict retrieval fails on any
/// gap with the exact missing intervals.
pub fn resolve_range(
    conn: &Connection,
    req_start: DateTime<Utc>,
    req_end: DateTime<Utc>,
    segment_duration: Duration,
    include_unpublished: bool,
    mode: RetrievalMode,
) -> Result<RetrievalPlan> {
    let plan = build_plan(conn, req_start, req_end, segment_duration, include_unpublished)?;
    if mode == RetrievalMode::Strict && !plan.is_gapless() {
        return Err(ArchiveError::CoverageGap {
            gaps: plan.gaps,
        });
    }
    Ok(plan)
}

/// Stream-copy every clip's segment bytes into `out`, in order. Returns
/// the total byte count written.
pub fn concat_clips<W: Write>(plan: &RetrievalPlan, out: &mut W) -> Result<u64> {
    let mut total = 0u64;
    for clip in &plan.clips {
        total += append_segment(Path::new(&clip.archived_path), out)?;
    }
    Ok(total)
}

/// Concatenate into memory; convenient for HTTP handlers and tests.
pub fn read_concatenated(plan: &RetrievalPlan) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    concat_clips(plan, &mut buf)?;
    Ok(buf)
}

/// Copy one archived segment after checking it actually starts like an
/// MPEG audio stream (frame sync or ID3 tag). The producer contract makes
/// a mismatch a serious fault, not something to paper over.
fn append_segment<W: Write>(path: &Path, out: &mut W) -> Result<u64> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 3];
    file.read_exact(&mut header).map_err(|_| {
        ArchiveError::TransientIo(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("segment '{}' is too short to be audio", path.display()),
        ))
    })?;

    let is_frame_sync = header[0] == 0xFF && header[1] & 0xE0 == 0xE0;
    let is_id3 = &header == b"ID3";
    if !is_frame_sync && !is_id3 {
        return Err(ArchiveError::TransientIo(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "segment '{}' does not start with an MPEG frame sync or ID3 tag",
                path.display()
            ),
        )));
    }

    out.write_all(&header)?;
    let copied = io::copy(&mut file, out)?;
    Ok(copied + header.len() as u64)
}
