//! Deterministic Simulation Testing for the Flight Recorder
//!
//! Shadow-state harness driving a whole recorder (writer, rotation,
//! archiver, upload queue) against a fault-injecting sink:
//! - Seeded workload of values, rotations, pauses and drains
//! - Fault injection at the sink and reachability seams
//! - Row accounting checked against every bundle that left the recorder
//! - Seed-based reproducibility for debugging
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = RecorderDSTHarness::new(config(seed), dir).await?;
//!     harness.run(200).await;
//!     harness.check_invariants().await;   // finalize or cancel, drain, verify
//! }
//! ```
//!
//! Rotation is manual and the drain loop is parked, so every tick and drain
//! comes from the workload.

use crate::buggify::seeded_rng;
use crate::recording::bundle::{unpack, unpack_bytes, BundleEntry};
use crate::recording::clock::SimulatedClock;
use crate::recording::config::RecorderConfig;
use crate::recording::recorder::{FlightRecorder, RecorderError};
use crate::recording::row::StreamSpec;
use crate::recording::session::SessionId;
use crate::recording::simulated_sink::{
    FlakyReachability, SimulatedSink, SimulatedSinkConfig, SimulatedSinkStats,
};
use crate::recording::upload::SinkSet;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for recorder DST
#[derive(Debug, Clone)]
pub struct RecorderDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Sink fault configuration
    pub sink_config: SimulatedSinkConfig,
    /// Probability a reachability probe succeeds
    pub up_probability: f64,
    /// Number of recorded streams
    pub streams: usize,
    /// Probability of a rotation tick
    pub rotate_probability: f64,
    /// Probability of a drain attempt
    pub drain_probability: f64,
    /// Probability of a pause/resume cycle
    pub pause_probability: f64,
    /// Probability the session ends with cancel instead of finalize
    pub cancel_probability: f64,
    /// Maximum values per `Values` operation
    pub max_values_per_op: u32,
    /// Drain attempts after the session ends
    pub final_drains: usize,
}

impl Default for RecorderDSTConfig {
    fn default() -> Self {
        RecorderDSTConfig {
            seed: 0,
            sink_config: SimulatedSinkConfig::default(),
            up_probability: 0.8,
            streams: 3,
            rotate_probability: 0.1,
            drain_probability: 0.1,
            pause_probability: 0.03,
            cancel_probability: 0.1,
            max_values_per_op: 20,
            final_drains: 64,
        }
    }
}

impl RecorderDSTConfig {
    pub fn new(seed: u64) -> Self {
        RecorderDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - reliable sink, always reachable, always finalized
    pub fn calm(seed: u64) -> Self {
        RecorderDSTConfig {
            seed,
            sink_config: SimulatedSinkConfig::no_faults(),
            up_probability: 1.0,
            cancel_probability: 0.0,
            final_drains: 4,
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        RecorderDSTConfig {
            seed,
            sink_config: SimulatedSinkConfig::default(),
            up_probability: 0.8,
            cancel_probability: 0.1,
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive fault injection and frequent outages
    pub fn chaos(seed: u64) -> Self {
        RecorderDSTConfig {
            seed,
            sink_config: SimulatedSinkConfig::high_chaos(),
            up_probability: 0.5,
            rotate_probability: 0.2,
            drain_probability: 0.2,
            pause_probability: 0.05,
            cancel_probability: 0.2,
            final_drains: 128,
            ..Default::default()
        }
    }
}

/// Recorder operation type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderOperation {
    /// Push `count` values on one stream
    Values { stream: usize, count: u32 },
    /// Manual rotation tick
    Rotate,
    /// One drain attempt of the upload queue
    Drain,
    /// Pause, push `ignored` values, resume
    PauseResume { ignored: u32 },
}

/// How the session ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Finalize,
    Cancel,
}

/// Workload generator
pub struct RecorderWorkload {
    rng: ChaCha8Rng,
    config: RecorderDSTConfig,
    /// Ground truth: rows accepted per stream
    expected_rows: Vec<u64>,
}

impl RecorderWorkload {
    pub fn new(config: RecorderDSTConfig) -> Self {
        RecorderWorkload {
            rng: seeded_rng(config.seed),
            expected_rows: vec![0; config.streams],
            config,
        }
    }

    /// Generate the next operation
    pub fn next_operation(&mut self) -> RecorderOperation {
        let roll: f64 = self.rng.gen();
        let rotate = self.config.rotate_probability;
        let drain = rotate + self.config.drain_probability;
        let pause = drain + self.config.pause_probability;

        if roll < rotate {
            RecorderOperation::Rotate
        } else if roll < drain {
            RecorderOperation::Drain
        } else if roll < pause {
            RecorderOperation::PauseResume {
                ignored: self.rng.gen_range(1..=5),
            }
        } else {
            RecorderOperation::Values {
                stream: self.rng.gen_range(0..self.config.streams.max(1)),
                count: self.rng.gen_range(1..=self.config.max_values_per_op.max(1)),
            }
        }
    }

    /// Decide how the session ends
    pub fn session_end(&mut self) -> SessionEnd {
        if self.rng.gen_bool(self.config.cancel_probability.clamp(0.0, 1.0)) {
            SessionEnd::Cancel
        } else {
            SessionEnd::Finalize
        }
    }

    pub fn record_values(&mut self, stream: usize, count: u32) {
        self.expected_rows[stream] += count as u64;
    }

    pub fn expected_rows(&self) -> &[u64] {
        &self.expected_rows
    }
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct RecorderDSTResult {
    /// Seed used
    pub seed: u64,
    /// Total operations attempted
    pub total_operations: u64,
    /// Operations that returned an error
    pub failed_operations: u64,
    pub values_written: u64,
    pub values_ignored: u64,
    pub rotations: u64,
    pub drains: u64,
    pub pauses: u64,
    /// Iterations of the session (0 when cancelled)
    pub iterations: u64,
    /// Bundles acknowledged by the sink
    pub delivered: u64,
    /// Bundles still queued after the final drains
    pub undelivered: u64,
    pub end: Option<SessionEnd>,
    /// Sink fault statistics
    pub sink_stats: SimulatedSinkStats,
    /// Invariant violations found
    pub invariant_violations: Vec<String>,
}

impl RecorderDSTResult {
    pub fn new(seed: u64) -> Self {
        RecorderDSTResult {
            seed,
            total_operations: 0,
            failed_operations: 0,
            values_written: 0,
            values_ignored: 0,
            rotations: 0,
            drains: 0,
            pauses: 0,
            iterations: 0,
            delivered: 0,
            undelivered: 0,
            end: None,
            sink_stats: SimulatedSinkStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} failed), {} values, {} rotations, {} drains, {} iterations, {}/{} delivered, end {:?}, {} violations",
            self.seed,
            self.total_operations,
            self.failed_operations,
            self.values_written,
            self.rotations,
            self.drains,
            self.iterations,
            self.delivered,
            self.delivered + self.undelivered,
            self.end,
            self.invariant_violations.len()
        )
    }
}

/// Main DST harness for the recorder
pub struct RecorderDSTHarness {
    config: RecorderDSTConfig,
    recorder: FlightRecorder<SimulatedClock>,
    clock: SimulatedClock,
    sink: SimulatedSink,
    workload: RecorderWorkload,
    streams: Vec<StreamSpec>,
    session: Option<SessionId>,
    export_dir: PathBuf,
    elapsed: f64,
    result: RecorderDSTResult,
}

impl RecorderDSTHarness {
    /// Create a harness working below `dir` and start its session. A
    /// session that fails to start is reported as a violation.
    pub async fn new(config: RecorderDSTConfig, dir: &Path) -> Result<Self, RecorderError> {
        let sink = SimulatedSink::new(config.seed.wrapping_add(1), config.sink_config.clone());
        let reachability =
            FlakyReachability::new(config.seed.wrapping_add(2), config.up_probability);
        let sinks = SinkSet {
            bundles: Arc::new(sink.clone()),
            requests: Arc::new(sink.clone()),
            reachability: Arc::new(reachability),
        };

        let mut recorder_config = RecorderConfig::test(dir);
        // Parked: drains only come from the workload.
        recorder_config.upload.drain_interval = Duration::from_secs(3600);
        let export_dir = recorder_config.export_dir.clone();

        let clock = SimulatedClock::new(1_000);
        let mut result = RecorderDSTResult::new(config.seed);
        let streams: Vec<StreamSpec> = (0..config.streams)
            .map(|i| StreamSpec::new(format!("s{}", i), &["a", "b"]))
            .collect();

        let recorder = FlightRecorder::with_clock(recorder_config, sinks, clock.clone())?;
        let session = match recorder.play(streams.clone()) {
            Ok(id) => Some(id),
            Err(e) => {
                result
                    .invariant_violations
                    .push(format!("play failed: {}", e));
                None
            }
        };

        Ok(RecorderDSTHarness {
            workload: RecorderWorkload::new(config.clone()),
            config,
            recorder,
            clock,
            sink,
            streams,
            session,
            export_dir,
            elapsed: 0.0,
            result,
        })
    }

    /// Run the workload for a specified number of operations
    pub async fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let op = self.workload.next_operation();
            self.execute_operation(op).await;
        }
    }

    async fn execute_operation(&mut self, op: RecorderOperation) {
        self.result.total_operations += 1;
        match op {
            RecorderOperation::Values { stream, count } => {
                self.push_values(stream, count);
                self.workload.record_values(stream, count);
                self.result.values_written += count as u64;
            }
            RecorderOperation::Rotate => {
                self.clock.advance(self.recorder.config().rotation.interval);
                match self.recorder.rotate() {
                    Ok(_) => self.result.rotations += 1,
                    Err(_) => self.result.failed_operations += 1,
                }
            }
            RecorderOperation::Drain => {
                self.recorder.settle().await;
                self.recorder.queue().flush().await;
                self.result.drains += 1;
            }
            RecorderOperation::PauseResume { ignored } => {
                if self.recorder.pause().await.is_err() {
                    self.result.failed_operations += 1;
                    return;
                }
                self.push_values(0, ignored);
                self.result.values_ignored += ignored as u64;
                if self.recorder.resume().is_err() {
                    self.result.failed_operations += 1;
                }
                self.result.pauses += 1;
            }
        }
    }

    fn push_values(&mut self, stream: usize, count: u32) {
        let Some(spec) = self.streams.get(stream) else {
            return;
        };
        let id = spec.id.clone();
        for i in 0..count {
            self.elapsed += 0.01;
            self.recorder.on_value(
                &id,
                self.elapsed,
                Some(self.elapsed),
                vec![(i as f64).into(), (stream as f64).into()],
            );
        }
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// End the session, run the final drains and verify.
    pub async fn check_invariants(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let end = self.workload.session_end();
        self.result.end = Some(end);

        match end {
            SessionEnd::Finalize => self.check_finalized(&session).await,
            SessionEnd::Cancel => self.check_cancelled(&session).await,
        }

        self.check_single_ack();
        if let Err(e) = self.recorder.shutdown().await {
            self.violation(format!("shutdown failed: {}", e));
        }
        self.result.sink_stats = self.sink.stats();
    }

    async fn check_finalized(&mut self, session: &SessionId) {
        let summary = match self.recorder.finalize("dst").await {
            Ok(summary) => summary,
            Err(e) => {
                self.violation(format!("finalize failed: {}", e));
                return;
            }
        };
        self.result.iterations = summary.iterations;

        match unpack(&summary.export.path) {
            Ok((_, entries)) => {
                let rows = self.count_rows(&entries);
                self.compare_rows("session export", &rows);
            }
            Err(e) => self.violation(format!("export unreadable: {}", e)),
        }
        if self.session_dir(session).exists() {
            self.violation(format!("working directory of {} left behind", session));
        }

        for _ in 0..self.config.final_drains {
            if self.recorder.queue().is_empty() {
                break;
            }
            self.recorder.queue().flush().await;
        }

        self.check_iteration_rows(session, summary.iterations);
    }

    /// Rows of every iteration bundle, whether acknowledged or still queued,
    /// must add up to what the workload pushed.
    fn check_iteration_rows(&mut self, session: &SessionId, iterations: u64) {
        let acked: BTreeSet<String> = self
            .sink
            .acked()
            .into_keys()
            .filter(|k| k.starts_with(&format!("{}/", session)))
            .collect();
        let pending = self.recorder.queue().pending_files();
        self.result.delivered = acked.len() as u64;
        self.result.undelivered = pending.len() as u64;

        let mut rows = vec![0u64; self.streams.len()];
        let mut bundles = 0u64;
        for key in &acked {
            match self.sink.stored(key).map(|data| unpack_bytes(&data)) {
                Some(Ok((_, entries))) => {
                    add_rows(&mut rows, &self.count_rows(&entries));
                    bundles += 1;
                }
                Some(Err(e)) => self.violation(format!("stored bundle {} corrupt: {}", key, e)),
                None => self.violation(format!("acknowledged bundle {} not stored", key)),
            }
        }
        for (key, bundle) in &pending {
            let remote = bundle
                .path
                .file_name()
                .map(|n| format!("{}/{}", session, n.to_string_lossy()));
            if remote.as_ref().is_some_and(|r| acked.contains(r)) {
                self.violation(format!("{} acknowledged but still queued", key));
                continue;
            }
            match unpack(&bundle.path) {
                Ok((_, entries)) => {
                    add_rows(&mut rows, &self.count_rows(&entries));
                    bundles += 1;
                }
                Err(e) => self.violation(format!("queued bundle {} unreadable: {}", key, e)),
            }
        }

        if bundles != iterations {
            self.violation(format!(
                "{} iterations but {} bundles accounted for",
                iterations, bundles
            ));
        }
        self.compare_rows("iteration bundles", &rows);

        let calm = self.config.up_probability >= 1.0
            && self.config.sink_config.upload_fail_prob == 0.0
            && self.config.sink_config.lost_ack_prob == 0.0
            && self.config.sink_config.prepare_fail_prob == 0.0;
        if calm && !pending.is_empty() {
            self.violation(format!("{} bundles undelivered without faults", pending.len()));
        }
    }

    async fn check_cancelled(&mut self, session: &SessionId) {
        if let Err(e) = self.recorder.cancel().await {
            self.violation(format!("cancel failed: {}", e));
            return;
        }
        if self.session_dir(session).exists() {
            self.violation(format!("working directory of {} left behind", session));
        }
        if !self.recorder.queue().is_empty() {
            self.violation(format!(
                "{} entries still queued after cancel",
                self.recorder.queue().len()
            ));
        }
        let prefix = format!("{}-", session);
        let leftovers = std::fs::read_dir(&self.export_dir)
            .map(|dir| {
                dir.filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
                    .count()
            })
            .unwrap_or(0);
        if leftovers > 0 {
            self.violation(format!("{} bundles of a cancelled session kept", leftovers));
        }
    }

    fn check_single_ack(&mut self) {
        for key in self.sink.duplicate_acks() {
            self.violation(format!("{} acknowledged more than once", key));
        }
    }

    fn count_rows(&self, entries: &[BundleEntry]) -> Vec<u64> {
        self.streams
            .iter()
            .map(|spec| {
                let name = spec.file_name();
                entries
                    .iter()
                    .filter(|e| e.name == name)
                    .map(|e| data_rows(&e.data))
                    .sum()
            })
            .collect()
    }

    fn compare_rows(&mut self, what: &str, rows: &[u64]) {
        let expected = self.workload.expected_rows().to_vec();
        if rows != expected.as_slice() {
            self.violation(format!(
                "{}: rows per stream {:?}, expected {:?}",
                what, rows, expected
            ));
        }
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.recorder.config().root_dir.join(session.as_str())
    }

    fn violation(&mut self, message: String) {
        self.result.invariant_violations.push(message);
    }

    /// Get the result
    pub fn result(&self) -> &RecorderDSTResult {
        &self.result
    }

    /// Consume and return the result
    pub fn into_result(self) -> RecorderDSTResult {
        self.result
    }
}

/// Lines after the header
fn data_rows(data: &[u8]) -> u64 {
    let lines = data.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count() as u64;
    lines.saturating_sub(1)
}

fn add_rows(total: &mut [u64], rows: &[u64]) {
    for (t, r) in total.iter_mut().zip(rows) {
        *t += r;
    }
}

/// Run a batch of DST tests with different seeds, each below its own
/// directory of `dir`
pub async fn run_dst_batch(
    dir: &Path,
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> RecorderDSTConfig,
) -> Vec<RecorderDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let config = config_fn(seed);

        let mut harness =
            match RecorderDSTHarness::new(config, &dir.join(format!("seed-{}", seed))).await {
                Ok(harness) => harness,
                Err(e) => {
                    let mut result = RecorderDSTResult::new(seed);
                    result
                        .invariant_violations
                        .push(format!("recorder setup failed: {}", e));
                    results.push(result);
                    continue;
                }
            };
        harness.run(ops_per_run).await;
        harness.check_invariants().await;

        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[RecorderDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_iterations: u64 = results.iter().map(|r| r.iterations).sum();
    let delivered: u64 = results.iter().map(|r| r.delivered).sum();
    let cancelled = results
        .iter()
        .filter(|r| r.end == Some(SessionEnd::Cancel))
        .count();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} iterations, {} delivered, {} cancelled",
        passed, total, total_ops, total_iterations, delivered, cancelled
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    let mut violations: BTreeMap<&str, usize> = BTreeMap::new();
    for r in results {
        for v in &r.invariant_violations {
            *violations.entry(v.split(':').next().unwrap_or(v)).or_default() += 1;
        }
    }
    for (kind, n) in violations {
        summary.push_str(&format!("\n  {} x{}", kind, n));
    }

    summary
}
