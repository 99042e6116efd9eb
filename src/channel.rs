//! Durable "segment ready" event channel.
//!
//! The channel contract is at-least-once delivery with consumer-side
//! acknowledgment: a published event survives process crashes and is
//! redelivered until a consumer acknowledges it. This implementation backs
//! the channel with a spool directory - publish is an atomic write (tempfile
//! then rename) of `<segment filename>.json`, consume is an ordered
//! directory scan, and acknowledgment deletes the file. Because events are
//! keyed by segment filename, publishing the same event twice overwrites
//! the spool entry with an identical payload, which keeps redelivery
//! idempotent end to end.
//!
//! Watchdog and indexer only see this module's interface, so a broker-backed
//! channel can replace the spool without touching either loop.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use crate::error::{ArchiveError, Result};

/// Payload announcing a segment has been durably archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentReady {
    /// Unique segment filename; the idempotency key for replay
    pub filename: String,
    /// Final location under the partitioned archive tree
    pub archived_path: String,
    /// UTC start instant, epoch milliseconds
    pub start_ts_ms: i64,
    /// UTC end instant, epoch milliseconds; None until confirmed closed
    pub end_ts_ms: Option<i64>,
}

/// Handle for acknowledging one delivered event.
#[derive(Debug)]
pub struct AckToken {
    path: PathBuf,
}

/// One delivery from the channel. The payload may fail to parse; such
/// poison entries still carry a token so the consumer can discard them.
#[derive(Debug)]
pub struct Delivery {
    pub token: AckToken,
    pub event: std::result::Result<SegmentReady, serde_json::Error>,
}

pub struct EventChannel {
    queue_dir: PathBuf,
}

impl EventChannel {
    /// Open (creating if needed) the spool directory.
    pub fn open(queue_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&queue_dir)?;
        Ok(Self { queue_dir })
    }

    /// Durably publish an event. Returns only after the spool entry has
    /// been synced and atomically renamed into place.
    pub fn publish(&self, event: &SegmentReady) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| ArchiveError::Channel(format!("failed to encode event: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.queue_dir)?;
        tmp.write_all(&payload)?;
        tmp.as_file().sync_all()?;
        let dest = self.entry_path(&event.filename);
        tmp.persist(&dest)
            .map_err(|e| ArchiveError::TransientIo(e.error))?;
        Ok(())
    }

    /// All undelivered events, oldest segment first.
    ///
    /// Spool entries are named after the segment filename, so sorting the
    /// directory listing recovers chronological order for a fixed station
    /// prefix.
    pub fn receive(&self) -> Result<Vec<Delivery>> {
        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(&self.queue_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            paths.push(path);
        }
        paths.sort();

        let mut deliveries = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = fs::read(&path)?;
            deliveries.push(Delivery {
                token: AckToken { path },
                event: serde_json::from_slice(&bytes),
            });
        }
        Ok(deliveries)
    }

    /// Acknowledge a delivery; the event will not be delivered again.
    pub fn ack(&self, token: AckToken) -> Result<()> {
        match fs::remove_file(&token.path) {
            Ok(()) => Ok(()),
            // Already gone counts as acknowledged
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an event by its key without a delivery in hand. Used by the
    /// watchdog to clear its pending-publish journal after announcing.
    pub fn remove(&self, filename: &str) -> Result<()> {
        match fs::remove_file(self.entry_path(filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of undelivered events (diagnostics only).
    pub fn depth(&self) -> Result<usize> {
        Ok(self.receive()?.len())
    }

    fn entry_path(&self, filename: &str) -> PathBuf {
        self.queue_dir.join(format!("{}.json", filename))
    }
}
