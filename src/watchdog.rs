//! Landing-to-archive promotion loop.
//!
//! The watchdog bridges the unsafe landing directory (where the capture
//! process writes segments in place) to the durable, indexed archive. Each
//! pass it decides which landing files are finalized, moves them into the
//! year/month/day partition tree, and publishes a "segment ready" event for
//! the catalog indexer.
//!
//! Crash safety: before a file is moved, its event payload is journaled to
//! the pending-publish spool. On startup and at the top of every pass the
//! journal is replayed, so a crash between move and publish results in a
//! retried publish (idempotent downstream), never a lost segment.

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use fs2::FileExt;
use log::{debug, error, info, warn};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::channel::{EventChannel, SegmentReady};
use crate::clock::Clock;
use crate::config::ArchiveConfig;
use crate::constants::SEGMENT_EXT;
use crate::error::{ArchiveError, Result};
use crate::hash::{crc32_file, sha256_file};
use crate::segment_name::SegmentName;

/// One landing-directory file with a well-formed name.
struct LandingEntry {
    path: PathBuf,
    name: SegmentName,
}

/// Outcome counts for a single pass, mostly for tests and debug logging.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Files moved into the archive and announced
    pub promoted: usize,
    /// Journaled events replayed from a previous run
    pub republished: usize,
    /// Files left in place because their name failed to parse
    pub skipped_malformed: usize,
    /// Files left in place because they may still be written to
    pub skipped_active: usize,
}

pub struct Watchdog {
    config: ArchiveConfig,
    channel: EventChannel,
    /// Pending-publish journal: same spool primitive as the channel,
    /// holding events for segments moved but not yet announced.
    journal: EventChannel,
    clock: Arc<dyn Clock>,
    _instance_lock: File,
}

impl Watchdog {
    /// Set up directories, acquire the single-instance lock, and open the
    /// event channel and pending journal.
    pub fn new(
        config: ArchiveConfig,
        clock: Arc<dyn Clock>,
    ) -> std::result::Result<Self, Box<dyn std::error::Error>> {
        fs::create_dir_all(&config.landing_dir)?;
        fs::create_dir_all(&config.archive_dir)?;
        fs::create_dir_all(&config.state_dir)?;

        let lock_path = config.state_dir.join("watchdog.lock");
        let lock_file = File::create(&lock_path)
            .map_err(|e| format!("Failed to create lock file '{}': {}", lock_path.display(), e))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            format!(
                "Another watchdog instance is already running. Lock file: {}",
                lock_path.display()
            )
        })?;
        // Lock is held until the Watchdog is dropped

        let channel = EventChannel::open(config.queue_dir())?;
        let journal = EventChannel::open(config.pending_dir())?;

        Ok(Self {
            config,
            channel,
            journal,
            clock,
            _instance_lock: lock_file,
        })
    }

    /// Poll until the shutdown channel fires or disconnects.
    pub fn run(&self, shutdown: Receiver<()>) {
        let interval = StdDuration::from_secs(self.config.poll_interval_secs);
        info!(
            "Watchdog watching '{}' every {}s",
            self.config.landing_dir.display(),
            self.config.poll_interval_secs
        );
        loop {
            match self.run_once() {
                Ok(summary) => debug!("Watchdog pass: {:?}", summary),
                Err(e) => error!("Watchdog pass failed: {}", e),
            }
            match shutdown.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
        info!("Watchdog stopped");
    }

    /// One full pass: replay the pending journal, then scan the landing
    /// directory and promote every finalized segment. Per-file failures are
    /// logged and skipped; only a failure to scan at all is returned.
    pub fn run_once(&self) -> Result<PassSummary> {
        let mut summary = PassSummary::default();
        summary.republished = self.replay_pending()?;

        let mut entries = self.scan_landing(&mut summary)?;
        entries.sort_by(|a, b| {
            (a.name.start, a.name.counter).cmp(&(b.name.start, b.name.counter))
        });

        let now = self.clock.now();
        let finalize_age = self.config.segment_duration() + self.config.finalize_grace();

        for i in 0..entries.len() {
            let is_latest = i + 1 == entries.len();
            let aged_out = now - entries[i].name.start > finalize_age;
            if is_latest && !aged_out {
                // The most-recently-started file may still be written to
                debug!(
                    "Skipping active segment '{}'",
                    entries[i].path.display()
                );
                summary.skipped_active += 1;
                continue;
            }

            let end_ts = match entries.get(i + 1) {
                Some(next) if next.name.start > entries[i].name.start => next.name.start,
                _ => entries[i].name.start + self.config.segment_duration(),
            };

            match self.promote(&entries[i], end_ts) {
                Ok(()) => summary.promoted += 1,
                Err(e) => {
                    // Leave the file for the next pass
                    error!(
                        "Failed to promote '{}': {}",
                        entries[i].path.display(),
                        e
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Re-announce segments that were moved but never published.
    ///
    /// A journal record whose archived file exists means the move completed
    /// and only the publish was lost. A record whose segment is still in
    /// the landing directory will be redone by the normal scan. Anything
    /// else has no bytes on disk and is surfaced for the operator.
    fn replay_pending(&self) -> Result<usize> {
        let mut republished = 0;
        for delivery in self.journal.receive()? {
            let event = match delivery.event {
                Ok(event) => event,
                Err(e) => {
                    error!("Discarding unreadable pending-publish record: {}", e);
                    self.journal.ack(delivery.token)?;
                    continue;
                }
            };

            if Path::new(&event.archived_path).exists() {
                self.channel.publish(&event)?;
                self.journal.ack(delivery.token)?;
                info!("Republished pending event for '{}'", event.filename);
                republished += 1;
            } else if self.landing_has(&event.filename) {
                // Move never happened; the scan below will redo it
                self.journal.ack(delivery.token)?;
            } else {
                error!(
                    "Pending-publish record for '{}' has no file on disk; discarding",
                    event.filename
                );
                self.journal.ack(delivery.token)?;
            }
        }
        Ok(republished)
    }

    /// True when the landing directory still holds the file a journal
    /// record refers to. A conflict-suffixed event name maps back to the
    /// base name the producer wrote.
    fn landing_has(&self, filename: &str) -> bool {
        if self.config.landing_dir.join(filename).exists() {
            return true;
        }
        match SegmentName::parse(filename) {
            Ok(name) if name.counter.is_some() => {
                let base = SegmentName {
                    counter: None,
                    ..name
                };
                self.config.landing_dir.join(base.format()).exists()
            }
            _ => false,
        }
    }

    /// List well-formed segment files in the landing directory. Malformed
    /// names are logged and left in place for manual inspection; they are
    /// reattempted (and re-logged) on the next pass.
    fn scan_landing(&self, summary: &mut PassSummary) -> Result<Vec<LandingEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.config.landing_dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_file() {
                continue;
            }
            let path = dir_entry.path();
            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if !name.starts_with('.') => name.to_string(),
                _ => continue,
            };
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
                continue;
            }
            match SegmentName::parse(&filename) {
                Ok(name) => entries.push(LandingEntry { path, name }),
                Err(_) => {
                    warn!(
                        "Filename '{}' does not match the expected format; leaving for manual inspection",
                        filename
                    );
                    summary.skipped_malformed += 1;
                }
            }
        }
        Ok(entries)
    }

    /// Journal, move, and announce one finalized segment.
    fn promote(&self, entry: &LandingEntry, end_ts: DateTime<Utc>) -> Result<()> {
        let mut name = entry.name.clone();
        let mut dest = name.partition_path(&self.config.archive_dir);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if dest.exists() {
            let incoming = sha256_file(&entry.path)?;
            let existing = sha256_file(&dest)?;
            if incoming == existing {
                // Same bytes already archived; drop the landing copy but
                // still announce so the catalog converges
                warn!(
                    "File '{}' already archived with identical content; removing landing copy",
                    name.format()
                );
                let event = self.ready_event(&name, &dest, end_ts);
                self.journal.publish(&event)?;
                fs::remove_file(&entry.path)?;
                self.channel.publish(&event)?;
                self.journal.remove(&event.filename)?;
                return Ok(());
            }

            error!(
                "File conflict: '{}' exists with different content; applying counter suffix",
                name.format()
            );
            let mut counter = 1;
            loop {
                let candidate = name.with_counter(counter);
                let candidate_path = candidate.partition_path(&self.config.archive_dir);
                if !candidate_path.exists() {
                    name = candidate;
                    dest = candidate_path;
                    break;
                }
                counter += 1;
            }
            info!("Renaming conflicting file to '{}'", name.format());
        }

        let event = self.ready_event(&name, &dest, end_ts);

        // Journal first so a crash between move and publish is recoverable
        self.journal.publish(&event)?;
        self.move_into_archive(&entry.path, &dest)?;
        info!("Moved '{}' to '{}'", entry.path.display(), dest.display());

        self.channel.publish(&event)?;
        self.journal.remove(&event.filename)?;
        Ok(())
    }

    fn ready_event(&self, name: &SegmentName, dest: &Path, end_ts: DateTime<Utc>) -> SegmentReady {
        SegmentReady {
            filename: name.format(),
            archived_path: dest.to_string_lossy().into_owned(),
            start_ts_ms: name.start.timestamp_millis(),
            end_ts_ms: Some(end_ts.timestamp_millis()),
        }
    }

    /// Atomic rename where the filesystem allows it; otherwise a verified
    /// copy so a crash mid-move can never lose the only copy of a segment.
    fn move_into_archive(&self, src: &Path, dest: &Path) -> Result<()> {
        match fs::rename(src, dest) {
            Ok(()) => Ok(()),
            Err(rename_err) => {
                debug!(
                    "rename '{}' -> '{}' failed ({}); falling back to copy",
                    src.display(),
                    dest.display(),
                    rename_err
                );
                copy_verify_remove(src, dest)
            }
        }
    }
}

/// Cross-device move: copy into a tempfile next to the destination, verify
/// the copy's CRC32 against the source bytes, persist, then delete the
/// source. The source is only removed after the verified copy is in place.
fn copy_verify_remove(src: &Path, dest: &Path) -> Result<()> {
    let dest_dir = dest
        .parent()
        .ok_or_else(|| ArchiveError::Config(format!("'{}' has no parent", dest.display())))?;

    let mut reader = File::open(src)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        tmp.write_all(&buf[..n])?;
    }
    let src_crc = hasher.finalize();
    tmp.as_file().sync_all()?;

    let copy_crc = crc32_file(tmp.path())?;
    if copy_crc != src_crc {
        return Err(ArchiveError::TransientIo(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "copy verification failed for '{}': crc {:08x} != {:08x}",
                src.display(),
                copy_crc,
                src_crc
            ),
        )));
    }

    tmp.persist(dest)
        .map_err(|e| ArchiveError::TransientIo(e.error))?;
    fs::remove_file(src)?;
    Ok(())
}
