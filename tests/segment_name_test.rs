use chrono::{TimeZone, Utc};
use std::path::Path;

use stream_archiver::error::ArchiveError;
use stream_archiver::segment_name::SegmentName;

#[test]
fn parse_then_format_round_trips() {
    let names = [
        "WBOR-2025-02-14T00:35:01Z.mp3",
        "WBOR-2025-02-14T00:40:00Z.mp3",
        "WBOR-2025-12-31T23:59:59Z.mp3",
        "KRLX-2024-01-01T00:00:00Z.mp3",
        // Station prefixes may themselves contain dashes
        "WBOR-FM-2025-02-14T00:35:01Z.mp3",
        // Conflict counter suffixes
        "WBOR-2025-02-14T00:40:00Z-1.mp3",
        "WBOR-2025-02-14T00:40:00Z-12.mp3",
    ];
    for name in names {
        let parsed = SegmentName::parse(name).expect(name);
        assert_eq!(parsed.format(), name, "round trip failed for {}", name);
    }
}

#[test]
fn parse_extracts_fields() {
    let parsed = SegmentName::parse("WBOR-2025-02-14T00:35:01Z.mp3").unwrap();
    assert_eq!(parsed.station_id, "WBOR");
    assert_eq!(
        parsed.start,
        Utc.with_ymd_and_hms(2025, 2, 14, 0, 35, 1).unwrap()
    );
    assert_eq!(parsed.counter, None);

    let suffixed = SegmentName::parse("WBOR-2025-02-14T00:40:00Z-2.mp3").unwrap();
    assert_eq!(suffixed.counter, Some(2));
    assert_eq!(
        suffixed.start,
        Utc.with_ymd_and_hms(2025, 2, 14, 0, 40, 0).unwrap()
    );
}

#[test]
fn malformed_names_are_rejected() {
    let bad = [
        "",
        "garbage.mp3",
        "WBOR.mp3",
        "WBOR-2025-02-14T00:35:01Z",      // missing extension
        "WBOR-2025-02-14T00:35:01Z.wav",  // wrong extension
        "WBOR-2025-02-14 00:35:01.mp3",   // not ISO 8601 UTC
        "WBOR-2025-13-14T00:35:01Z.mp3",  // month out of range
        "WBOR-2025-02-14T24:00:01Z.mp3",  // hour out of range
        "-2025-02-14T00:35:01Z.mp3",      // empty station prefix
        "2025-02-14T00:35:01Z.mp3",       // no station prefix at all
    ];
    for name in bad {
        match SegmentName::parse(name) {
            Err(ArchiveError::MalformedName { name: reported }) => {
                assert_eq!(reported, name);
            }
            other => panic!("expected MalformedName for '{}', got {:?}", name, other),
        }
    }
}

#[test]
fn lexicographic_order_equals_chronological_order() {
    let instants = [
        Utc.with_ymd_and_hms(2024, 12, 31, 23, 55, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 2, 14, 0, 35, 1).unwrap(),
        Utc.with_ymd_and_hms(2025, 2, 14, 0, 40, 0).unwrap(),
        Utc.with_ymd_and_hms(2025, 11, 3, 12, 0, 0).unwrap(),
    ];
    let formatted: Vec<String> = instants
        .iter()
        .map(|ts| SegmentName::new("WBOR", *ts).format())
        .collect();

    let mut sorted = formatted.clone();
    sorted.sort();
    assert_eq!(sorted, formatted, "sorted names must stay in time order");
}

#[test]
fn partition_path_uses_utc_date_components() {
    let name = SegmentName::parse("WBOR-2025-02-04T09:05:00Z.mp3").unwrap();
    let path = name.partition_path(Path::new("/archive"));
    assert_eq!(
        path,
        Path::new("/archive/2025/02/04/WBOR-2025-02-04T09:05:00Z.mp3")
    );
}

#[test]
fn with_counter_produces_distinct_sibling_names() {
    let name = SegmentName::parse("WBOR-2025-02-14T00:40:00Z.mp3").unwrap();
    let one = name.with_counter(1);
    assert_eq!(one.format(), "WBOR-2025-02-14T00:40:00Z-1.mp3");
    assert_eq!(one.start, name.start);

    // Counter-suffixed names parse back to the same instant
    let reparsed = SegmentName::parse(&one.format()).unwrap();
    assert_eq!(reparsed, one);
}
