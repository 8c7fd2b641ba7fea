//! Flight Recorder DST Tests
//!
//! Deterministic simulation tests (seed-based) for the whole recording
//! pipeline. Each run records a random workload, ends the session with
//! finalize or cancel, drains the queue and checks:
//!
//! 1. **No loss, no duplication**: rows in the session export and across
//!    all iteration bundles match what was pushed
//! 2. **Single ack**: no bundle is acknowledged twice by the sink
//! 3. **Cleanup**: working directories are gone; cancelled sessions leave
//!    no bundles behind
//!
//! ## Test Categories
//!
//! - **Calm tests**: No faults, every bundle delivered
//! - **Moderate tests**: Some faults, delivery may lag
//! - **Chaos tests**: Many faults and outages

use flight_recorder::recording::dst::{
    run_dst_batch, summarize_batch, RecorderDSTConfig, RecorderDSTHarness, SessionEnd,
};

// =============================================================================
// Single Seed Tests
// =============================================================================

#[tokio::test]
async fn test_recorder_dst_single_calm() {
    let tmp = tempfile::tempdir().unwrap();
    let mut harness = RecorderDSTHarness::new(RecorderDSTConfig::calm(12345), tmp.path())
        .await
        .unwrap();

    harness.run(400).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());

    assert!(
        result.is_success(),
        "Calm mode should not violate invariants: {:?}",
        result.invariant_violations
    );
    assert!(result.rotations > 0);
    assert_eq!(result.delivered, result.iterations);
}

#[tokio::test]
async fn test_recorder_dst_single_moderate() {
    let tmp = tempfile::tempdir().unwrap();
    let mut harness =
        RecorderDSTHarness::new(RecorderDSTConfig::moderate(54321), tmp.path())
            .await
            .unwrap();

    harness.run(300).await;
    harness.check_invariants().await;

    let result = harness.result();
    println!("{}", result.summary());
    assert!(
        result.is_success(),
        "Moderate faults must not break invariants: {:?}",
        result.invariant_violations
    );
}

#[tokio::test]
async fn test_recorder_dst_forced_cancel() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RecorderDSTConfig::moderate(777);
    config.cancel_probability = 1.0;
    let mut harness = RecorderDSTHarness::new(config, tmp.path()).await.unwrap();

    harness.run(200).await;
    harness.check_invariants().await;

    let result = harness.result();
    assert_eq!(result.end, Some(SessionEnd::Cancel));
    assert!(
        result.is_success(),
        "Cancel must clean up everything: {:?}",
        result.invariant_violations
    );
}

#[tokio::test]
async fn test_recorder_dst_sink_always_down() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = RecorderDSTConfig::calm(4242);
    config.up_probability = 0.0;
    config.final_drains = 3;
    let mut harness = RecorderDSTHarness::new(config, tmp.path()).await.unwrap();

    harness.run(200).await;
    harness.check_invariants().await;

    // Nothing delivered, nothing lost: every bundle is still queued.
    let result = harness.result();
    assert!(result.is_success(), "{:?}", result.invariant_violations);
    assert_eq!(result.delivered, 0);
    assert_eq!(result.undelivered, result.iterations);
    assert_eq!(result.sink_stats.upload_attempts, 0);
}

// =============================================================================
// Multi-Seed Batches
// =============================================================================

#[tokio::test]
async fn test_recorder_dst_batch_calm() {
    let tmp = tempfile::tempdir().unwrap();
    let results = run_dst_batch(tmp.path(), 10_000, 25, 150, RecorderDSTConfig::calm).await;

    let summary = summarize_batch(&results);
    println!("{}", summary);
    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}

#[tokio::test]
async fn test_recorder_dst_batch_moderate() {
    let tmp = tempfile::tempdir().unwrap();
    let results = run_dst_batch(tmp.path(), 20_000, 25, 150, RecorderDSTConfig::moderate).await;

    let summary = summarize_batch(&results);
    println!("{}", summary);
    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}

#[tokio::test]
async fn test_recorder_dst_batch_chaos() {
    let tmp = tempfile::tempdir().unwrap();
    let results = run_dst_batch(tmp.path(), 30_000, 25, 150, RecorderDSTConfig::chaos).await;

    let summary = summarize_batch(&results);
    println!("{}", summary);
    assert!(results.iter().all(|r| r.is_success()), "{}", summary);
}
