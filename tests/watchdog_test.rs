use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use stream_archiver::channel::{EventChannel, SegmentReady};
use stream_archiver::clock::ManualClock;
use stream_archiver::config::ArchiveConfig;
use stream_archiver::segment_name::SegmentName;
use stream_archiver::watchdog::Watchdog;

fn test_config(root: &Path) -> ArchiveConfig {
    ArchiveConfig {
        station_id: "WBOR".to_string(),
        landing_dir: root.join("landing"),
        archive_dir: root.join("archive"),
        state_dir: root.join("state"),
        segment_duration_secs: 300,
        poll_interval_secs: 5,
        finalize_grace_secs: 30,
        api_port: 8080,
        admin_token: None,
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 2, 14, 0, 0, 0).unwrap()
}

fn segment_filename(start: DateTime<Utc>) -> String {
    SegmentName::new("WBOR", start).format()
}

fn write_landing(config: &ArchiveConfig, filename: &str, bytes: &[u8]) {
    fs::create_dir_all(&config.landing_dir).unwrap();
    fs::write(config.landing_dir.join(filename), bytes).unwrap();
}

/// Events currently sitting in the segment-ready queue, oldest first.
fn queue_events(config: &ArchiveConfig) -> Vec<SegmentReady> {
    let channel = EventChannel::open(config.queue_dir()).unwrap();
    channel
        .receive()
        .unwrap()
        .into_iter()
        .map(|d| d.event.unwrap())
        .collect()
}

fn pending_depth(config: &ArchiveConfig) -> usize {
    EventChannel::open(config.pending_dir())
        .unwrap()
        .depth()
        .unwrap()
}

#[test]
fn file_with_successor_is_promoted_and_announced() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    let t1 = t0 + Duration::seconds(300);
    write_landing(&config, &segment_filename(t0), b"first segment bytes");
    write_landing(&config, &segment_filename(t1), b"second segment bytes");

    let clock = Arc::new(ManualClock::new(t1 + Duration::seconds(10)));
    let watchdog = Watchdog::new(config.clone(), clock).unwrap();

    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.promoted, 1);
    assert_eq!(summary.skipped_active, 1);

    // The finalized file moved into the date partition; the active file stayed
    let archived = config
        .archive_dir
        .join("2025/02/14")
        .join(segment_filename(t0));
    assert!(archived.exists());
    assert!(!config.landing_dir.join(segment_filename(t0)).exists());
    assert!(config.landing_dir.join(segment_filename(t1)).exists());
    assert_eq!(
        fs::read(&archived).unwrap(),
        b"first segment bytes".to_vec()
    );

    // The event carries the successor's start as end_ts
    let events = queue_events(&config);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].filename, segment_filename(t0));
    assert_eq!(events[0].start_ts_ms, t0.timestamp_millis());
    assert_eq!(events[0].end_ts_ms, Some(t1.timestamp_millis()));
    assert_eq!(events[0].archived_path, archived.to_string_lossy());

    // The pending journal was cleaned after the publish
    assert_eq!(pending_depth(&config), 0);
}

#[test]
fn successorless_file_waits_for_the_grace_timeout() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    write_landing(&config, &segment_filename(t0), b"only segment");

    let clock = Arc::new(ManualClock::new(t0 + Duration::seconds(100)));
    let watchdog = Watchdog::new(config.clone(), clock.clone()).unwrap();

    // Young file with no successor: may still be written to
    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.promoted, 0);
    assert_eq!(summary.skipped_active, 1);
    assert!(config.landing_dir.join(segment_filename(t0)).exists());

    // Past duration + grace the producer has stalled; promote anyway
    clock.set(t0 + Duration::seconds(331));
    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.promoted, 1);

    let events = queue_events(&config);
    assert_eq!(events.len(), 1);
    // Without a successor the end is assumed start + duration
    assert_eq!(
        events[0].end_ts_ms,
        Some((t0 + Duration::seconds(300)).timestamp_millis())
    );
}

#[test]
fn malformed_name_is_skipped_and_reattempted_without_crashing() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    write_landing(&config, "not-a-segment.mp3", b"mystery bytes");
    write_landing(&config, &segment_filename(t0), b"good segment");

    let clock = Arc::new(ManualClock::new(t0 + Duration::seconds(400)));
    let watchdog = Watchdog::new(config.clone(), clock).unwrap();

    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.skipped_malformed, 1);
    // The well-formed sibling is unaffected by the bad item
    assert_eq!(summary.promoted, 1);
    assert!(config.landing_dir.join("not-a-segment.mp3").exists());

    // Next pass sees it again instead of crashing or losing it
    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.skipped_malformed, 1);
    assert!(config.landing_dir.join("not-a-segment.mp3").exists());
}

#[test]
fn pending_journal_is_replayed_after_a_crash() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    let filename = segment_filename(t0);
    let archived = config.archive_dir.join("2025/02/14").join(&filename);

    let clock = Arc::new(ManualClock::new(t0 + Duration::seconds(400)));
    let watchdog = Watchdog::new(config.clone(), clock).unwrap();

    // Simulate a crash after the move but before the publish: the file is
    // in the archive and the journal still holds the event
    fs::create_dir_all(archived.parent().unwrap()).unwrap();
    fs::write(&archived, b"already moved bytes").unwrap();
    let event = SegmentReady {
        filename: filename.clone(),
        archived_path: archived.to_string_lossy().into_owned(),
        start_ts_ms: t0.timestamp_millis(),
        end_ts_ms: Some((t0 + Duration::seconds(300)).timestamp_millis()),
    };
    EventChannel::open(config.pending_dir())
        .unwrap()
        .publish(&event)
        .unwrap();

    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.republished, 1);
    assert_eq!(pending_depth(&config), 0);

    let events = queue_events(&config);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], event);
}

#[test]
fn identical_destination_content_is_a_logged_no_op() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    let filename = segment_filename(t0);
    let archived = config.archive_dir.join("2025/02/14").join(&filename);

    fs::create_dir_all(archived.parent().unwrap()).unwrap();
    fs::write(&archived, b"same bytes").unwrap();
    write_landing(&config, &filename, b"same bytes");

    let clock = Arc::new(ManualClock::new(t0 + Duration::seconds(400)));
    let watchdog = Watchdog::new(config.clone(), clock).unwrap();

    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.promoted, 1);

    // Landing copy dropped, no counter-suffixed sibling created
    assert!(!config.landing_dir.join(&filename).exists());
    assert!(archived.exists());
    let suffixed = SegmentName::parse(&filename)
        .unwrap()
        .with_counter(1)
        .partition_path(&config.archive_dir);
    assert!(!suffixed.exists());

    // The event is still published so the catalog converges
    let events = queue_events(&config);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].filename, filename);
}

#[test]
fn differing_destination_content_gets_a_counter_suffix() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    let filename = segment_filename(t0);
    let archived = config.archive_dir.join("2025/02/14").join(&filename);

    fs::create_dir_all(archived.parent().unwrap()).unwrap();
    fs::write(&archived, b"existing different bytes").unwrap();
    write_landing(&config, &filename, b"incoming bytes");

    let clock = Arc::new(ManualClock::new(t0 + Duration::seconds(400)));
    let watchdog = Watchdog::new(config.clone(), clock).unwrap();

    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.promoted, 1);

    // Both byte streams survive on disk for operator review
    let suffixed_name = SegmentName::parse(&filename).unwrap().with_counter(1);
    let suffixed_path = suffixed_name.partition_path(&config.archive_dir);
    assert_eq!(
        fs::read(&archived).unwrap(),
        b"existing different bytes".to_vec()
    );
    assert_eq!(fs::read(&suffixed_path).unwrap(), b"incoming bytes".to_vec());

    let events = queue_events(&config);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].filename, suffixed_name.format());
}

#[test]
fn second_watchdog_instance_is_locked_out() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let clock = Arc::new(ManualClock::new(base_time()));
    let _first = Watchdog::new(config.clone(), clock.clone()).unwrap();
    assert!(Watchdog::new(config, clock).is_err());
}
