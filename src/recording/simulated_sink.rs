//! Simulated Sink with Fault Injection
//!
//! Seeded, deterministic stand-ins for the network seams. The sink keeps a
//! ledger of what it acknowledged so simulations can check delivery
//! properties afterwards.

use crate::buggify::faults::{network, sink as faults};
use crate::buggify::{seeded_rng, BuggifyStats};
use crate::recording::sink::{BundleSink, DeliveryError, Reachability, RequestSink, SinkFuture};
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Fault probabilities for a [`SimulatedSink`]
#[derive(Debug, Clone)]
pub struct SimulatedSinkConfig {
    /// Upload rejected before anything is stored
    pub upload_fail_prob: f64,
    /// Upload stored but reported as failed
    pub lost_ack_prob: f64,
    pub request_fail_prob: f64,
    pub prepare_fail_prob: f64,
    /// Probability of adding a delay to an operation
    pub delay_prob: f64,
    pub max_delay: Duration,
}

impl Default for SimulatedSinkConfig {
    fn default() -> Self {
        SimulatedSinkConfig {
            upload_fail_prob: 0.1,
            lost_ack_prob: 0.02,
            request_fail_prob: 0.1,
            prepare_fail_prob: 0.05,
            delay_prob: 0.2,
            max_delay: Duration::from_millis(5),
        }
    }
}

impl SimulatedSinkConfig {
    /// Aggressive settings for chaos runs
    pub fn high_chaos() -> Self {
        SimulatedSinkConfig {
            upload_fail_prob: 0.4,
            lost_ack_prob: 0.1,
            request_fail_prob: 0.4,
            prepare_fail_prob: 0.3,
            delay_prob: 0.5,
            max_delay: Duration::from_millis(10),
        }
    }

    pub fn no_faults() -> Self {
        SimulatedSinkConfig {
            upload_fail_prob: 0.0,
            lost_ack_prob: 0.0,
            request_fail_prob: 0.0,
            prepare_fail_prob: 0.0,
            delay_prob: 0.0,
            max_delay: Duration::ZERO,
        }
    }
}

/// Counters of a simulated sink
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedSinkStats {
    pub prepares: u64,
    pub prepare_failures: u64,
    pub upload_attempts: u64,
    pub upload_failures: u64,
    pub lost_acks: u64,
    pub request_attempts: u64,
    pub request_failures: u64,
}

#[derive(Default)]
struct Ledger {
    containers: Vec<String>,
    /// Successful acknowledgments per `<container>/<name>`
    acked: BTreeMap<String, u32>,
    /// Every stored body, acknowledged or not
    stored: BTreeMap<String, Vec<u8>>,
    requests: Vec<String>,
}

struct SimState {
    rng: ChaCha8Rng,
    buggify: BuggifyStats,
    stats: SimulatedSinkStats,
    ledger: Ledger,
}

/// Fault-injecting bundle and request sink; clones share state
#[derive(Clone)]
pub struct SimulatedSink {
    config: SimulatedSinkConfig,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedSink {
    pub fn new(seed: u64, config: SimulatedSinkConfig) -> Self {
        SimulatedSink {
            config,
            state: Arc::new(Mutex::new(SimState {
                rng: seeded_rng(seed),
                buggify: BuggifyStats::new(),
                stats: SimulatedSinkStats::default(),
                ledger: Ledger::default(),
            })),
        }
    }

    pub fn reliable() -> Self {
        Self::new(0, SimulatedSinkConfig::no_faults())
    }

    pub fn stats(&self) -> SimulatedSinkStats {
        self.state.lock().stats.clone()
    }

    pub fn buggify_stats(&self) -> BuggifyStats {
        self.state.lock().buggify.clone()
    }

    /// Keys with at least one acknowledged upload, and their ack counts
    pub fn acked(&self) -> BTreeMap<String, u32> {
        self.state.lock().ledger.acked.clone()
    }

    /// Keys acknowledged more than once
    pub fn duplicate_acks(&self) -> Vec<String> {
        self.state
            .lock()
            .ledger
            .acked
            .iter()
            .filter(|(_, n)| **n > 1)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn stored(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().ledger.stored.get(key).cloned()
    }

    pub fn containers(&self) -> Vec<String> {
        self.state.lock().ledger.containers.clone()
    }

    /// Acknowledged request URLs, in acknowledgment order
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().ledger.requests.clone()
    }

    fn roll(&self, fault_id: &str, probability: f64) -> bool {
        let mut state = self.state.lock();
        let SimState { rng, buggify, .. } = &mut *state;
        crate::buggify!(rng, buggify, fault_id, probability)
    }

    async fn maybe_delay(&self) {
        let delay = {
            let mut state = self.state.lock();
            let SimState { rng, buggify, .. } = &mut *state;
            let max_ms = self.config.max_delay.as_millis() as u64;
            if max_ms > 0 && crate::buggify!(&mut *rng, buggify, faults::DELAY, self.config.delay_prob)
            {
                Some(Duration::from_millis(rng.gen_range(1..=max_ms)))
            } else {
                None
            }
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl BundleSink for SimulatedSink {
    fn prepare<'a>(&'a self, container: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.maybe_delay().await;
            self.state.lock().stats.prepares += 1;
            if self.roll(faults::PREPARE_FAIL, self.config.prepare_fail_prob) {
                self.state.lock().stats.prepare_failures += 1;
                return Err(DeliveryError::Prepare("simulated MKCOL failure".to_string()));
            }
            let mut state = self.state.lock();
            if !state.ledger.containers.iter().any(|c| c == container) {
                state.ledger.containers.push(container.to_string());
            }
            Ok(())
        })
    }

    fn upload<'a>(
        &'a self,
        container: &'a str,
        remote_name: &'a str,
        local_path: &'a Path,
    ) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().stats.upload_attempts += 1;
            let data = tokio::fs::read(local_path)
                .await
                .map_err(|e| DeliveryError::Upload(e.to_string()))?;
            self.maybe_delay().await;

            if self.roll(faults::UPLOAD_FAIL, self.config.upload_fail_prob) {
                self.state.lock().stats.upload_failures += 1;
                return Err(DeliveryError::Upload("simulated upload failure".to_string()));
            }

            let key = format!("{}/{}", container, remote_name);
            let lost_ack = self.roll(faults::UPLOAD_LOST_ACK, self.config.lost_ack_prob);

            let mut state = self.state.lock();
            if !state.ledger.containers.iter().any(|c| c == container) {
                state.stats.upload_failures += 1;
                return Err(DeliveryError::Upload(format!(
                    "container {} does not exist",
                    container
                )));
            }
            state.ledger.stored.insert(key.clone(), data);
            if lost_ack {
                state.stats.lost_acks += 1;
                return Err(DeliveryError::Upload("simulated lost acknowledgment".to_string()));
            }
            *state.ledger.acked.entry(key).or_insert(0) += 1;
            Ok(())
        })
    }
}

impl RequestSink for SimulatedSink {
    fn get<'a>(&'a self, url: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().stats.request_attempts += 1;
            self.maybe_delay().await;
            if self.roll(faults::REQUEST_FAIL, self.config.request_fail_prob) {
                self.state.lock().stats.request_failures += 1;
                return Err(DeliveryError::Request("simulated request failure".to_string()));
            }
            self.state.lock().ledger.requests.push(url.to_string());
            Ok(())
        })
    }
}

// ============================================================================
// Reachability
// ============================================================================

/// Reachability that replays a script, then falls back to a default
#[derive(Debug)]
pub struct ScriptedReachability {
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    probes: Mutex<u64>,
}

impl ScriptedReachability {
    pub fn new(script: impl IntoIterator<Item = bool>, fallback: bool) -> Self {
        ScriptedReachability {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            probes: Mutex::new(0),
        }
    }

    /// Number of probes answered so far
    pub fn probes(&self) -> u64 {
        *self.probes.lock()
    }
}

impl Reachability for ScriptedReachability {
    fn is_reachable(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        *self.probes.lock() += 1;
        let answer = self.script.lock().pop_front().unwrap_or(self.fallback);
        Box::pin(async move { answer })
    }
}

/// Seeded random reachability
pub struct FlakyReachability {
    up_prob: f64,
    state: Mutex<(ChaCha8Rng, BuggifyStats)>,
}

impl FlakyReachability {
    /// Reachable with probability `up_prob` on each probe
    pub fn new(seed: u64, up_prob: f64) -> Self {
        FlakyReachability {
            up_prob,
            state: Mutex::new((seeded_rng(seed), BuggifyStats::new())),
        }
    }
}

impl Reachability for FlakyReachability {
    fn is_reachable(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        let down = {
            let mut state = self.state.lock();
            let (rng, stats) = &mut *state;
            crate::buggify!(rng, stats, network::UNREACHABLE, 1.0 - self.up_prob)
        };
        Box::pin(async move { !down })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_file(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_reliable_sink_records_acks() {
        let tmp = tempfile::tempdir().unwrap();
        let file = bundle_file(tmp.path(), "s-1.bundle");
        let sink = SimulatedSink::reliable();

        sink.prepare("s").await.unwrap();
        sink.upload("s", "s-1.bundle", &file).await.unwrap();
        sink.get("http://ping/1").await.unwrap();

        assert_eq!(sink.acked().get("s/s-1.bundle"), Some(&1));
        assert_eq!(sink.stored("s/s-1.bundle").unwrap(), b"s-1.bundle");
        assert_eq!(sink.requests(), vec!["http://ping/1".to_string()]);
        assert!(sink.duplicate_acks().is_empty());
    }

    #[tokio::test]
    async fn test_upload_requires_prepared_container() {
        let tmp = tempfile::tempdir().unwrap();
        let file = bundle_file(tmp.path(), "s-1.bundle");
        let sink = SimulatedSink::reliable();
        assert!(sink.upload("s", "s-1.bundle", &file).await.is_err());
        assert!(sink.acked().is_empty());
    }

    #[tokio::test]
    async fn test_lost_ack_stores_without_acknowledging() {
        let tmp = tempfile::tempdir().unwrap();
        let file = bundle_file(tmp.path(), "s-1.bundle");
        let config = SimulatedSinkConfig {
            lost_ack_prob: 1.0,
            ..SimulatedSinkConfig::no_faults()
        };
        let sink = SimulatedSink::new(1, config);
        sink.prepare("s").await.unwrap();

        assert!(sink.upload("s", "s-1.bundle", &file).await.is_err());
        assert!(sink.stored("s/s-1.bundle").is_some());
        assert!(sink.acked().is_empty());
        assert_eq!(sink.stats().lost_acks, 1);
    }

    #[tokio::test]
    async fn test_same_seed_same_faults() {
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let sink = SimulatedSink::new(42, SimulatedSinkConfig::high_chaos());
            let mut run = Vec::new();
            for _ in 0..20 {
                run.push(sink.get("http://ping").await.is_ok());
            }
            outcomes.push(run);
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn test_scripted_reachability() {
        let reach = ScriptedReachability::new([false, false, true], true);
        assert!(!reach.is_reachable().await);
        assert!(!reach.is_reachable().await);
        assert!(reach.is_reachable().await);
        assert!(reach.is_reachable().await);
        assert_eq!(reach.probes(), 4);
    }
}
