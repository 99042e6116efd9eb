//! End-to-end pass through the pipeline: landing files are promoted by the
//! watchdog, announced on the channel, indexed into the catalog, and served
//! back as one gapless byte stream.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use stream_archiver::channel::EventChannel;
use stream_archiver::clock::ManualClock;
use stream_archiver::config::ArchiveConfig;
use stream_archiver::db;
use stream_archiver::indexer::Indexer;
use stream_archiver::retrieval::{read_concatenated, resolve_range, RetrievalMode};
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

/// Minimal MPEG-looking payload: frame sync plus distinguishable body.
fn fake_mp3(body: &[u8]) -> Vec<u8> {
    [&[0xFFu8, 0xFB, 0x90, 0x00][..], body].concat()
}

#[test]
fn landing_files_become_a_gapless_retrieval() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    let t1 = t0 + Duration::seconds(300);
    let first = SegmentName::new("WBOR", t0).format();
    let second = SegmentName::new("WBOR", t1).format();

    fs::create_dir_all(&config.landing_dir).unwrap();
    let first_bytes = fake_mp3(b"segment-one");
    let second_bytes = fake_mp3(b"segment-two");
    fs::write(config.landing_dir.join(&first), &first_bytes).unwrap();
    fs::write(config.landing_dir.join(&second), &second_bytes).unwrap();

    // Both files are finalized: the first has a successor, the second has
    // aged past duration + grace
    let clock = Arc::new(ManualClock::new(t1 + Duration::seconds(331)));
    let watchdog = Watchdog::new(config.clone(), clock).unwrap();
    let summary = watchdog.run_once().unwrap();
    assert_eq!(summary.promoted, 2);

    let mut indexer = Indexer::new(config.clone()).unwrap();
    let summary = indexer.run_once().unwrap();
    assert_eq!(summary.inserted, 2);

    // The queue is drained only after the catalog rows committed
    let channel = EventChannel::open(config.queue_dir()).unwrap();
    assert_eq!(channel.depth().unwrap(), 0);

    let conn = db::open_database_connection(&config.db_path()).unwrap();
    let plan = resolve_range(
        &conn,
        t0,
        t1 + Duration::seconds(300),
        config.segment_duration(),
        false,
        RetrievalMode::Strict,
    )
    .unwrap();
    assert!(plan.is_gapless());
    assert_eq!(plan.clips.len(), 2);
    assert_eq!(plan.clips[0].filename, first);
    assert_eq!(plan.clips[1].filename, second);

    // Byte-exact concatenation of the archived segments
    let joined = read_concatenated(&plan).unwrap();
    assert_eq!(joined, [first_bytes, second_bytes].concat());

    // The indexer hashed each file on first sight
    assert!(plan.clips.iter().all(|c| Path::new(&c.archived_path).exists()));
    let digest: Option<String> = conn
        .query_row(
            "SELECT sha256_hash FROM segments WHERE filename = ?1",
            [&first],
            |row| row.get(0),
        )
        .unwrap();
    let digest = digest.expect("first sight should have hashed the file");
    assert_eq!(digest.len(), 64);
}

#[test]
fn redelivered_events_leave_the_catalog_unchanged() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let t0 = base_time();
    let filename = SegmentName::new("WBOR", t0).format();
    fs::create_dir_all(&config.landing_dir).unwrap();
    fs::write(config.landing_dir.join(&filename), fake_mp3(b"payload")).unwrap();

    let clock = Arc::new(ManualClock::new(t0 + Duration::seconds(400)));
    let watchdog = Watchdog::new(config.clone(), clock).unwrap();
    watchdog.run_once().unwrap();

    let mut indexer = Indexer::new(config.clone()).unwrap();
    let summary = indexer.run_once().unwrap();
    assert_eq!(summary.inserted, 1);

    // The broker redelivers: replay the same event three more times
    let channel = EventChannel::open(config.queue_dir()).unwrap();
    let archived = config.archive_dir.join("2025/02/14").join(&filename);
    let event = stream_archiver::channel::SegmentReady {
        filename: filename.clone(),
        archived_path: archived.to_string_lossy().into_owned(),
        start_ts_ms: t0.timestamp_millis(),
        end_ts_ms: Some((t0 + Duration::seconds(300)).timestamp_millis()),
    };
    for _ in 0..3 {
        channel.publish(&event).unwrap();
        let summary = indexer.run_once().unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.unchanged, 1);
    }

    let conn = db::open_database_connection(&config.db_path()).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(id) FROM segments", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn poison_events_never_block_the_queue() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    fs::create_dir_all(config.queue_dir()).unwrap();
    fs::write(config.queue_dir().join("broken.json"), b"{ not json").unwrap();

    let mut indexer = Indexer::new(config.clone()).unwrap();
    let summary = indexer.run_once().unwrap();
    assert_eq!(summary.malformed, 1);

    // Acked despite being unparseable; the loop keeps moving
    let channel = EventChannel::open(config.queue_dir()).unwrap();
    assert_eq!(channel.depth().unwrap(), 0);
}
