//! Catalog indexer: idempotent, order-independent ingestion of "segment
//! ready" events into the segments table.
//!
//! The upsert is keyed by filename, never regresses `start_ts`, and only
//! advances `end_ts` forward, so redelivered or reordered events converge
//! to the same final state. Events are acknowledged only after the database
//! transaction commits; a crash between commit and ack causes a redelivery
//! the upsert absorbs as a no-op.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, error, info, warn};
use rusqlite::{Connection, OptionalExtension};
use rand::Rng;
use std::path::Path;
use std::time::Duration as StdDuration;

use crate::channel::{EventChannel, SegmentReady};
use crate::config::ArchiveConfig;
use crate::db::{self, SegmentRecord};
use crate::error::{is_constraint_violation, Result};
use crate::hash::sha256_file;
use crate::queries::segments;

/// What one event did to the catalog.
#[derive(Debug, PartialEq, Eq)]
pub enum IndexOutcome {
    /// First sighting; a new row was inserted
    Inserted,
    /// Redelivery carrying a later end_ts or a new archived path
    Updated,
    /// Redelivery with nothing new; a no-op
    Unchanged,
    /// Insert would overlap an existing published segment
    RejectedOverlap { existing: String },
}

/// Outcome counts for one consumer pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IndexSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub malformed: usize,
}

/// Apply one event inside a single transaction. Pure catalog logic so
/// tests can drive it directly against an in-memory database.
pub fn apply_event(
    conn: &mut Connection,
    event: &SegmentReady,
    segment_duration_ms: i64,
    now_ms: i64,
    sha256_hash: Option<&str>,
) -> Result<IndexOutcome> {
    let tx = conn.transaction()?;

    let existing: Option<SegmentRecord> = tx
        .query_row(&segments::select_by_filename(&event.filename), [], |row| {
            SegmentRecord::from_row(row)
        })
        .optional()?;

    let outcome = match existing {
        Some(row) => {
            // Never clear or regress end_ts; never touch start_ts
            let current_end_ms = row.end_ts.map(|ts| ts.timestamp_millis());
            let merged_end_ms = match (current_end_ms, event.end_ts_ms) {
                (None, incoming) => incoming,
                (Some(current), Some(incoming)) if incoming > current => Some(incoming),
                (current, _) => current,
            };
            let path_changed = row.archived_path != event.archived_path;

            if merged_end_ms != current_end_ms || path_changed {
                tx.execute(
                    &segments::update_after_redelivery(
                        &event.filename,
                        merged_end_ms,
                        &event.archived_path,
                        now_ms,
                    ),
                    [],
                )?;
                IndexOutcome::Updated
            } else {
                IndexOutcome::Unchanged
            }
        }
        None => {
            let effective_end_ms = event
                .end_ts_ms
                .unwrap_or(event.start_ts_ms + segment_duration_ms);

            let overlapping: Option<String> = tx
                .query_row(
                    &segments::select_published_overlapping(
                        &event.filename,
                        event.start_ts_ms,
                        effective_end_ms,
                        segment_duration_ms,
                    ),
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_name) = overlapping {
                // A producer/watchdog naming bug; surface, never resolve silently
                IndexOutcome::RejectedOverlap {
                    existing: existing_name,
                }
            } else {
                match tx.execute(
                    &segments::insert(
                        &event.filename,
                        &event.archived_path,
                        event.start_ts_ms,
                        event.end_ts_ms,
                        sha256_hash,
                        now_ms,
                    ),
                    [],
                ) {
                    Ok(_) => IndexOutcome::Inserted,
                    // Lost an insert race with another consumer; the row
                    // exists, which is all the contract requires
                    Err(e) if is_constraint_violation(&e) => IndexOutcome::Unchanged,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

pub struct Indexer {
    config: ArchiveConfig,
    channel: EventChannel,
    conn: Connection,
}

impl Indexer {
    pub fn new(config: ArchiveConfig) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        std::fs::create_dir_all(&config.state_dir)?;
        let channel = EventChannel::open(config.queue_dir())?;
        let conn = db::open_database_connection(&config.db_path())?;
        db::init_schema(&conn)?;
        db::check_version(&conn)?;
        Ok(Self {
            config,
            channel,
            conn,
        })
    }

    /// Consume until the shutdown channel fires or disconnects. Transient
    /// failures back off with jitter instead of crashing the loop.
    pub fn run(&mut self, shutdown: Receiver<()>) {
        let interval = StdDuration::from_secs(self.config.poll_interval_secs);
        info!(
            "Indexer consuming '{}' into '{}'",
            self.config.queue_dir().display(),
            self.config.db_path().display()
        );
        loop {
            let wait = match self.run_once() {
                Ok(summary) => {
                    debug!("Indexer pass: {:?}", summary);
                    interval
                }
                Err(e) => {
                    warn!("Indexer pass failed (will retry): {}", e);
                    interval + StdDuration::from_millis(rand::thread_rng().gen_range(0..1000))
                }
            };
            match shutdown.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
        info!("Indexer stopped");
    }

    /// Drain the queue once. Poison events (unparseable payloads, overlap
    /// conflicts) are logged and acknowledged so they never block the
    /// queue; a transient failure stops the pass and leaves the event for
    /// redelivery.
    pub fn run_once(&mut self) -> Result<IndexSummary> {
        let mut summary = IndexSummary::default();
        let segment_duration_ms = self.config.segment_duration_ms();

        for delivery in self.channel.receive()? {
            let event = match delivery.event {
                Ok(event) => event,
                Err(e) => {
                    error!("Discarding unparseable event payload: {}", e);
                    self.channel.ack(delivery.token)?;
                    summary.malformed += 1;
                    continue;
                }
            };

            // Hash only on first sight; redeliveries skip the file read
            let sha256_hash = if self.segment_exists(&event.filename)? {
                None
            } else {
                match sha256_file(Path::new(&event.archived_path)) {
                    Ok(digest) => Some(digest),
                    Err(e) => {
                        warn!("Failed to hash '{}': {}", event.archived_path, e);
                        None
                    }
                }
            };

            let now_ms = chrono::Utc::now().timestamp_millis();
            match apply_event(
                &mut self.conn,
                &event,
                segment_duration_ms,
                now_ms,
                sha256_hash.as_deref(),
            ) {
                Ok(IndexOutcome::Inserted) => {
                    info!("Indexed segment '{}'", event.filename);
                    self.channel.ack(delivery.token)?;
                    summary.inserted += 1;
                }
                Ok(IndexOutcome::Updated) => {
                    debug!("Updated segment '{}'", event.filename);
                    self.channel.ack(delivery.token)?;
                    summary.updated += 1;
                }
                Ok(IndexOutcome::Unchanged) => {
                    debug!("Duplicate event for '{}' was a no-op", event.filename);
                    self.channel.ack(delivery.token)?;
                    summary.unchanged += 1;
                }
                Ok(IndexOutcome::RejectedOverlap { existing }) => {
                    error!(
                        "Rejected segment '{}': range overlaps published segment '{}'",
                        event.filename, existing
                    );
                    self.channel.ack(delivery.token)?;
                    summary.rejected += 1;
                }
                Err(e) if e.is_transient() => {
                    // Leave unacknowledged; stop the pass and back off
                    return Err(e);
                }
                Err(e) => {
                    error!("Dropping event for '{}': {}", event.filename, e);
                    self.channel.ack(delivery.token)?;
                    summary.malformed += 1;
                }
            }
        }

        Ok(summary)
    }

    fn segment_exists(&self, filename: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(&segments::select_by_filename(filename), [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }
}
