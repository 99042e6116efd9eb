use std::fs;

use stream_archiver::channel::{EventChannel, SegmentReady};

fn sample_event(filename: &str, start_ts_ms: i64) -> SegmentReady {
    SegmentReady {
        filename: filename.to_string(),
        archived_path: format!("/archive/2025/02/14/{}", filename),
        start_ts_ms,
        end_ts_ms: Some(start_ts_ms + 300_000),
    }
}

#[test]
fn publish_then_receive_then_ack() {
    let dir = tempfile::tempdir().unwrap();
    let channel = EventChannel::open(dir.path().to_path_buf()).unwrap();

    let event = sample_event("WBOR-2025-02-14T00:35:01Z.mp3", 1_000);
    channel.publish(&event).unwrap();

    let mut deliveries = channel.receive().unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivery = deliveries.remove(0);
    assert_eq!(delivery.event.unwrap(), event);

    channel.ack(delivery.token).unwrap();
    assert_eq!(channel.depth().unwrap(), 0);
}

#[test]
fn unacknowledged_events_are_redelivered() {
    let dir = tempfile::tempdir().unwrap();
    let channel = EventChannel::open(dir.path().to_path_buf()).unwrap();

    channel
        .publish(&sample_event("WBOR-2025-02-14T00:35:01Z.mp3", 1_000))
        .unwrap();

    // Consume without acknowledging, then consume again
    let first = channel.receive().unwrap();
    assert_eq!(first.len(), 1);
    let second = channel.receive().unwrap();
    assert_eq!(second.len(), 1, "unacked event must be delivered again");
}

#[test]
fn republishing_overwrites_with_identical_payload() {
    let dir = tempfile::tempdir().unwrap();
    let channel = EventChannel::open(dir.path().to_path_buf()).unwrap();

    let event = sample_event("WBOR-2025-02-14T00:35:01Z.mp3", 1_000);
    channel.publish(&event).unwrap();
    channel.publish(&event).unwrap();
    channel.publish(&event).unwrap();

    let deliveries = channel.receive().unwrap();
    assert_eq!(deliveries.len(), 1, "same key must collapse to one entry");
    assert_eq!(deliveries[0].event.as_ref().unwrap(), &event);
}

#[test]
fn delivery_is_oldest_segment_first() {
    let dir = tempfile::tempdir().unwrap();
    let channel = EventChannel::open(dir.path().to_path_buf()).unwrap();

    // Publish out of chronological order
    channel
        .publish(&sample_event("WBOR-2025-02-14T00:45:00Z.mp3", 3_000))
        .unwrap();
    channel
        .publish(&sample_event("WBOR-2025-02-14T00:35:01Z.mp3", 1_000))
        .unwrap();
    channel
        .publish(&sample_event("WBOR-2025-02-14T00:40:00Z.mp3", 2_000))
        .unwrap();

    let order: Vec<String> = channel
        .receive()
        .unwrap()
        .into_iter()
        .map(|d| d.event.unwrap().filename)
        .collect();
    assert_eq!(
        order,
        vec![
            "WBOR-2025-02-14T00:35:01Z.mp3",
            "WBOR-2025-02-14T00:40:00Z.mp3",
            "WBOR-2025-02-14T00:45:00Z.mp3",
        ]
    );
}

#[test]
fn poison_payloads_still_carry_an_ack_token() {
    let dir = tempfile::tempdir().unwrap();
    let channel = EventChannel::open(dir.path().to_path_buf()).unwrap();

    fs::write(dir.path().join("broken.json"), b"not json at all").unwrap();

    let mut deliveries = channel.receive().unwrap();
    assert_eq!(deliveries.len(), 1);
    let delivery = deliveries.remove(0);
    assert!(delivery.event.is_err());

    channel.ack(delivery.token).unwrap();
    assert_eq!(channel.depth().unwrap(), 0);
}

#[test]
fn remove_by_key_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let channel = EventChannel::open(dir.path().to_path_buf()).unwrap();

    let event = sample_event("WBOR-2025-02-14T00:35:01Z.mp3", 1_000);
    channel.publish(&event).unwrap();

    channel.remove(&event.filename).unwrap();
    // Removing an absent entry is still fine
    channel.remove(&event.filename).unwrap();
    assert_eq!(channel.depth().unwrap(), 0);
}
