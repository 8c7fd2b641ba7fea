//! Rotation Scenario Tests
//!
//! End-to-end lifecycles of a recorder driven by manual rotation ticks:
//! the two-tick sealing margin, cancel, finalize and delivery of the
//! resulting bundles.

use flight_recorder::recording::{
    unpack, FlightRecorder, IterationState, RecorderConfig, RecorderStatus, ScriptedReachability,
    SimulatedClock, SimulatedSink, SinkSet, StaticReachability, StreamId, StreamSpec,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Helpers
// =============================================================================

fn streams() -> Vec<StreamSpec> {
    vec![
        StreamSpec::new("acc", &["t", "x", "y", "z"]),
        StreamSpec::new("gps", &["t", "lat", "lon"]),
    ]
}

fn recorder(
    config: RecorderConfig,
    sink: &SimulatedSink,
    reachable: bool,
) -> FlightRecorder<SimulatedClock> {
    let sinks = SinkSet {
        bundles: Arc::new(sink.clone()),
        requests: Arc::new(sink.clone()),
        reachability: Arc::new(StaticReachability::new(reachable)),
    };
    FlightRecorder::with_clock(config, sinks, SimulatedClock::new(0)).unwrap()
}

fn push(rec: &FlightRecorder<SimulatedClock>, stream: &str, n: usize) {
    let id = StreamId::new(stream);
    for i in 0..n {
        rec.on_value(&id, i as f64 * 0.01, None, vec![1.0.into(), 2.0.into()]);
    }
}

fn state_of(rec: &FlightRecorder<SimulatedClock>, index: u64) -> Option<IterationState> {
    rec.iteration_states()
        .into_iter()
        .find(|(i, _)| *i == index)
        .map(|(_, s)| s)
}

/// Poll until `cond` holds, settling the recorder between polls
async fn eventually(rec: &FlightRecorder<SimulatedClock>, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        rec.settle().await;
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached; states {:?}", rec.iteration_states());
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|d| {
            d.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

// =============================================================================
// Two-tick margin
// =============================================================================

#[tokio::test]
async fn test_five_ticks_seal_the_first_three() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RecorderConfig::test(tmp.path());
    config.upload.enabled = false;
    let sink = SimulatedSink::reliable();
    let rec = recorder(config, &sink, true);

    rec.play(streams()).unwrap();
    for _ in 0..4 {
        push(&rec, "acc", 5);
        rec.rotate().unwrap();
    }
    assert_eq!(rec.current_iteration(), Some(5));

    eventually(&rec, || {
        (1..=3).all(|i| state_of(&rec, i) == Some(IterationState::Archived))
    })
    .await;
    assert_eq!(state_of(&rec, 4), Some(IterationState::Sealing));
    assert_eq!(state_of(&rec, 5), Some(IterationState::Open));

    let session = rec.session_id().unwrap();
    for i in 1..=3 {
        assert!(tmp
            .path()
            .join("export")
            .join(format!("{}-{}.bundle", session, i))
            .exists());
    }
}

#[tokio::test]
async fn test_every_tick_seals_exactly_the_iteration_two_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RecorderConfig::test(tmp.path());
    config.upload.enabled = false;
    let sink = SimulatedSink::reliable();
    let rec = recorder(config, &sink, true);

    rec.play(streams()).unwrap();
    for n in 2..=8u64 {
        let opened = rec.rotate().unwrap();
        assert_eq!(opened.index(), n);

        let states = rec.iteration_states();
        assert_eq!(states.len() as u64, n, "one iteration per tick");
        for (index, state) in states {
            match index {
                i if i == n => assert_eq!(state, IterationState::Open),
                i if i == n - 1 => assert_eq!(state, IterationState::Sealing),
                _ => assert!(!state.is_unsealed(), "iteration {} still {:?}", index, state),
            }
        }
    }
}

#[tokio::test]
async fn test_rows_land_in_the_iteration_that_was_open() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RecorderConfig::test(tmp.path());
    config.upload.enabled = false;
    config.bundle.compression_enabled = false;
    let sink = SimulatedSink::reliable();
    let rec = recorder(config, &sink, true);

    rec.play(streams()).unwrap();
    push(&rec, "acc", 3);
    rec.rotate().unwrap();
    push(&rec, "acc", 7);
    rec.rotate().unwrap();
    rec.rotate().unwrap();

    eventually(&rec, || {
        (1..=2).all(|i| state_of(&rec, i) == Some(IterationState::Archived))
    })
    .await;

    let session = rec.session_id().unwrap();
    for (index, rows) in [(1, 3), (2, 7)] {
        let path = tmp
            .path()
            .join("export")
            .join(format!("{}-{}.bundle", session, index));
        let (header, entries) = unpack(&path).unwrap();
        assert_eq!(header.iteration, index);
        let acc = entries.iter().find(|e| e.name == "acc.csv").unwrap();
        let text = String::from_utf8(acc.data.clone()).unwrap();
        assert_eq!(text.lines().count(), rows + 1);
    }
}

// =============================================================================
// Cancel
// =============================================================================

#[tokio::test]
async fn test_cancel_with_third_iteration_open() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = SimulatedSink::reliable();
    // Unreachable: iteration 1's bundle stays queued until the cancel.
    let rec = recorder(RecorderConfig::test(tmp.path()), &sink, false);

    let session = rec.play(streams()).unwrap();
    push(&rec, "acc", 10);
    rec.rotate().unwrap();
    push(&rec, "gps", 10);
    rec.rotate().unwrap();
    assert_eq!(rec.current_iteration(), Some(3));
    eventually(&rec, || state_of(&rec, 1) == Some(IterationState::Queued)).await;

    rec.cancel().await.unwrap();

    assert_eq!(rec.status(), RecorderStatus::Idle);
    assert!(!tmp.path().join("work").join(session.as_str()).exists());
    assert!(
        files_in(&tmp.path().join("export")).is_empty(),
        "no bundle survives a cancel: {:?}",
        files_in(&tmp.path().join("export"))
    );
    assert!(rec.queue().is_empty());
    assert_eq!(sink.stats().upload_attempts, 0);
}

#[tokio::test]
async fn test_cancel_keeps_bundles_of_a_saved_session() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = SimulatedSink::reliable();
    let rec = recorder(RecorderConfig::test(tmp.path()), &sink, false);

    let saved = rec.play(streams()).unwrap();
    for _ in 0..3 {
        push(&rec, "acc", 4);
        rec.rotate().unwrap();
    }
    rec.finalize("A").await.unwrap();
    let queued = rec.queue().pending_files();
    assert_eq!(queued.len(), 4);

    let cancelled = rec.play(streams()).unwrap();
    push(&rec, "acc", 4);
    rec.rotate().unwrap();
    rec.rotate().unwrap();
    eventually(&rec, || state_of(&rec, 1) == Some(IterationState::Queued)).await;
    assert_eq!(rec.queue().pending_files().len(), 5);

    rec.cancel().await.unwrap();

    let pending = rec.queue().pending_files();
    assert_eq!(pending.len(), 4);
    assert!(pending.iter().all(|(key, _)| key.session == saved));
    assert!(queued.iter().all(|(_, bundle)| bundle.path.exists()));
    assert!(!files_in(&tmp.path().join("export"))
        .iter()
        .any(|name| name.starts_with(cancelled.as_str())));
    // Still draining for the saved session.
    assert!(rec.queue().is_running());
    assert_eq!(sink.stats().upload_attempts, 0);
}

#[tokio::test]
async fn test_values_after_cancel_are_ignored() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = SimulatedSink::reliable();
    let rec = recorder(RecorderConfig::test(tmp.path()), &sink, true);

    rec.play(streams()).unwrap();
    rec.cancel().await.unwrap();
    push(&rec, "acc", 5);

    assert!(rec.rotate().is_err());
    assert!(rec.cancel().await.is_err());
    assert_eq!(rec.writer().stats().rows_written, 0);
}

// =============================================================================
// Finalize
// =============================================================================

#[tokio::test]
async fn test_finalize_with_fourth_iteration_open() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = SimulatedSink::reliable();
    let rec = recorder(RecorderConfig::test(tmp.path()), &sink, true);

    let session = rec.play(streams()).unwrap();
    for _ in 0..3 {
        push(&rec, "acc", 4);
        rec.rotate().unwrap();
    }
    push(&rec, "acc", 4);
    assert_eq!(rec.current_iteration(), Some(4));

    // Iterations 1 and 2 were sealed by ticks 3 and 4 and go out first.
    eventually(&rec, || {
        (1..=2).all(|i| state_of(&rec, i) == Some(IterationState::Delivered))
    })
    .await;
    assert_eq!(sink.acked().len(), 2);

    let summary = rec.finalize("Morning ride").await.unwrap();
    assert_eq!(summary.iterations, 4);
    assert_eq!(
        summary.export.path,
        tmp.path().join("export").join("Morning_ride.bundle")
    );

    // The background loop keeps draining; wait for the local copies to go.
    let export = tmp.path().join("export");
    for _ in 0..200 {
        if rec.queue().is_empty() && files_in(&export).len() == 1 {
            break;
        }
        rec.queue().flush().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let acked = sink.acked();
    for i in 1..=4 {
        let key = format!("{}/{}-{}.bundle", session, session, i);
        assert_eq!(acked.get(&key), Some(&1), "{} delivered once", key);
    }
    assert!(sink.duplicate_acks().is_empty());
    assert_eq!(sink.containers(), vec![session.to_string()]);

    // Only the session export stays behind.
    assert_eq!(files_in(&export), vec!["Morning_ride.bundle".to_string()]);
    assert!(!tmp.path().join("work").join(session.as_str()).exists());
}

#[tokio::test]
async fn test_finalize_export_holds_every_row_and_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = SimulatedSink::reliable();
    let rec = recorder(RecorderConfig::test(tmp.path()), &sink, true);

    rec.play(streams()).unwrap();
    push(&rec, "acc", 6);
    rec.rotate().unwrap();
    push(&rec, "gps", 2);
    rec.rotate().unwrap();
    push(&rec, "acc", 4);

    let summary = rec.finalize("").await.unwrap();
    let (header, entries) = unpack(&summary.export.path).unwrap();
    assert_eq!(header.iteration, 0);
    assert_eq!(entries[0].name, "session.json");

    let lines = |name: &str| {
        let entry = entries.iter().find(|e| e.name == name).unwrap();
        String::from_utf8(entry.data.clone()).unwrap().lines().count()
    };
    assert_eq!(lines("acc.csv"), 11);
    assert_eq!(lines("gps.csv"), 3);
    // Untitled sessions are exported under their id.
    assert!(summary
        .export
        .path
        .ends_with(format!("{}.bundle", summary.session)));
}

// =============================================================================
// Archive failures
// =============================================================================

#[tokio::test]
async fn test_archive_failure_keeps_directory_and_recording_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = SimulatedSink::reliable();
    let config = RecorderConfig::test(tmp.path());
    let export = config.export_dir.clone();
    let root = config.root_dir.clone();
    let rec = recorder(config, &sink, true);
    // A regular file where the export directory should be.
    std::fs::write(&export, b"not a directory").unwrap();

    let session = rec.play(streams()).unwrap();
    for _ in 0..3 {
        push(&rec, "acc", 4);
        rec.rotate().unwrap();
    }
    eventually(&rec, || {
        (1..=2).all(|i| state_of(&rec, i) == Some(IterationState::ArchiveFailed))
    })
    .await;
    assert_eq!(state_of(&rec, 3), Some(IterationState::Sealing));
    assert_eq!(state_of(&rec, 4), Some(IterationState::Open));

    let session_dir = root.join(session.as_str());
    for i in 1..=2 {
        let acc = session_dir.join(i.to_string()).join("acc.csv");
        assert_eq!(std::fs::read_to_string(&acc).unwrap().lines().count(), 5);
    }

    // The export directory comes back; later iterations archive normally.
    std::fs::remove_file(&export).unwrap();
    push(&rec, "acc", 4);
    rec.rotate().unwrap();
    eventually(&rec, || {
        matches!(
            state_of(&rec, 3),
            Some(IterationState::Archived | IterationState::Queued | IterationState::Delivered)
        )
    })
    .await;
    assert!(!session_dir.join("3").exists());

    let summary = rec.finalize("kept").await.unwrap();
    assert_eq!(summary.iterations, 5);
    assert!(summary.export.path.exists());

    // Failed iterations stay on disk for recovery; the live mirror is gone.
    assert!(session_dir.join("1").join("acc.csv").exists());
    assert!(session_dir.join("2").join("acc.csv").exists());
    assert!(!session_dir.join("live").exists());
    rec.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_keeps_iteration_and_drops_values() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RecorderConfig::test(tmp.path());
    config.upload.enabled = false;
    let sink = SimulatedSink::reliable();
    let rec = recorder(config, &sink, true);

    rec.play(streams()).unwrap();
    push(&rec, "acc", 2);
    rec.pause().await.unwrap();
    assert_eq!(rec.status(), RecorderStatus::Paused);
    push(&rec, "acc", 50);
    assert_eq!(rec.current_iteration(), Some(1));

    // play on a paused recorder resumes the same session.
    let before = rec.session_id();
    assert_eq!(rec.play(streams()).ok(), before);
    push(&rec, "acc", 3);

    let summary = rec.finalize("paused").await.unwrap();
    let (_, entries) = unpack(&summary.export.path).unwrap();
    let acc = entries.iter().find(|e| e.name == "acc.csv").unwrap();
    assert_eq!(String::from_utf8_lossy(&acc.data).lines().count(), 6);
}

// =============================================================================
// Delivery across outages
// =============================================================================

#[tokio::test]
async fn test_bundles_wait_out_an_outage() {
    let tmp = tempfile::tempdir().unwrap();
    let sink = SimulatedSink::reliable();
    let reach = Arc::new(ScriptedReachability::new([false; 5], true));
    let sinks = SinkSet {
        bundles: Arc::new(sink.clone()),
        requests: Arc::new(sink.clone()),
        reachability: reach.clone(),
    };
    let mut config = RecorderConfig::test(tmp.path());
    // Parked loop; drains are explicit.
    config.upload.drain_interval = Duration::from_secs(3600);
    let rec = FlightRecorder::with_clock(config, sinks, SimulatedClock::new(0)).unwrap();

    rec.play(streams()).unwrap();
    for _ in 0..3 {
        rec.rotate().unwrap();
    }
    eventually(&rec, || rec.queue().len() == 2).await;

    for _ in 0..5 {
        assert!(rec.queue().flush().await.is_empty());
        assert_eq!(rec.queue().len(), 2);
    }
    let outcomes = rec.queue().flush().await;
    assert_eq!(outcomes.len(), 2);
    assert!(rec.queue().is_empty());
    assert_eq!(reach.probes(), 6);

    eventually(&rec, || {
        (1..=2).all(|i| state_of(&rec, i) == Some(IterationState::Delivered))
    })
    .await;
    rec.shutdown().await.unwrap();
}
