//! Upload Queue
//!
//! Holds archived bundles and pending lightweight requests and delivers
//! them whenever the sink is reachable. Delivery is at-least-once,
//! unordered and retried on every drain tick until it succeeds or the
//! queue is stopped.
//!
//! ## Drain tick
//!
//! ```text
//! empty? ──yes──► skip
//!   │no
//! reachable? ──no──► skip (nothing attempted)
//!   │yes
//! snapshot: mark idle entries in flight
//!   │
//!   ├──► attempt (own task) ──ok──► commit: remove if generation unchanged,
//!   │                                       delete local bundle
//!   └──► attempt (own task) ──err─► rollback: clear in-flight, keep entry
//! ```
//!
//! Entries are never removed before an attempt succeeds. An entry
//! overwritten while in flight gets a new generation, so the older
//! attempt's commit leaves it in place.

use crate::recording::bundle::PackedBundle;
use crate::recording::config::UploadConfig;
use crate::recording::session::SessionId;
use crate::recording::sink::{BundleSink, DeliveryError, Reachability, RequestSink};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Queue key of a bundle: one per archived iteration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BundleKey {
    pub session: SessionId,
    pub iteration: u64,
}

impl fmt::Display for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.iteration)
    }
}

/// Queue key of a request: creation time in milliseconds, made unique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(pub u64);

/// Either kind of queue key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryKey {
    Bundle(BundleKey),
    Request(RequestKey),
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryKey::Bundle(key) => write!(f, "bundle {}", key),
            DeliveryKey::Request(key) => write!(f, "request {}", key.0),
        }
    }
}

/// Queue events, published on a broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Delivered(DeliveryKey),
    /// Attempt failed; the entry stays queued
    Retrying {
        key: DeliveryKey,
        error: DeliveryError,
    },
    /// Dropped by `stop(true)` or `discard_session`
    Discarded(DeliveryKey),
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub key: DeliveryKey,
    pub result: Result<(), DeliveryError>,
}

/// What a drain tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing queued
    Empty,
    /// Sink unreachable, nothing attempted
    Unreachable,
    /// Attempts were started for this many entries
    Dispatched { files: usize, requests: usize },
}

/// Outcome of a drain tick plus its in-flight attempts
pub struct DrainReport {
    pub outcome: DrainOutcome,
    attempts: Vec<JoinHandle<DeliveryOutcome>>,
}

impl DrainReport {
    fn skipped(outcome: DrainOutcome) -> Self {
        DrainReport {
            outcome,
            attempts: Vec::new(),
        }
    }

    /// Wait for every attempt started by the tick
    pub async fn settle(self) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(self.attempts.len());
        for attempt in self.attempts {
            match attempt.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Delivery attempt panicked: {}", e),
            }
        }
        outcomes
    }
}

/// Counters of one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub ticks: u64,
    pub unreachable_ticks: u64,
    pub attempts: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct UploadCounters {
    ticks: AtomicU64,
    unreachable_ticks: AtomicU64,
    attempts: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    discarded: AtomicU64,
}

// ============================================================================
// PendingMap - in-flight ledger
// ============================================================================

#[derive(Debug)]
struct Slot<V> {
    value: V,
    generation: u64,
    in_flight: bool,
}

/// Keyed entries with mark-in-flight / commit / rollback
#[derive(Debug)]
struct PendingMap<K, V> {
    entries: BTreeMap<K, Slot<V>>,
    next_generation: u64,
}

impl<K: Ord + Clone, V: Clone> PendingMap<K, V> {
    fn new() -> Self {
        PendingMap {
            entries: BTreeMap::new(),
            next_generation: 1,
        }
    }

    /// Insert or overwrite. Returns true when an entry was replaced.
    fn insert(&mut self, key: K, value: V) -> bool {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries
            .insert(
                key,
                Slot {
                    value,
                    generation,
                    in_flight: false,
                },
            )
            .is_some()
    }

    /// Mark every idle entry in flight and return copies of them
    fn snapshot(&mut self) -> Vec<(K, u64, V)> {
        self.entries
            .iter_mut()
            .filter(|(_, slot)| !slot.in_flight)
            .map(|(key, slot)| {
                slot.in_flight = true;
                (key.clone(), slot.generation, slot.value.clone())
            })
            .collect()
    }

    /// Remove the entry if it is still the attempted generation
    fn commit(&mut self, key: &K, generation: u64) -> Option<V> {
        match self.entries.get(key) {
            Some(slot) if slot.generation == generation => {
                self.entries.remove(key).map(|slot| slot.value)
            }
            _ => None,
        }
    }

    /// Return the entry to idle if it is still the attempted generation
    fn rollback(&mut self, key: &K, generation: u64) {
        if let Some(slot) = self.entries.get_mut(key) {
            if slot.generation == generation {
                slot.in_flight = false;
            }
        }
    }

    /// Remove every entry whose key matches, in flight or not
    fn take_where(&mut self, mut matches: impl FnMut(&K) -> bool) -> Vec<(K, V)> {
        let keys: Vec<K> = self.entries.keys().filter(|k| matches(k)).cloned().collect();
        keys.into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|slot| (k, slot.value)))
            .collect()
    }

    fn take_all(&mut self) -> Vec<(K, V)> {
        std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(k, slot)| (k, slot.value))
            .collect()
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .map(|(k, slot)| (k.clone(), slot.value.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }
}

// ============================================================================
// UploadQueue
// ============================================================================

/// Network seams of a queue
#[derive(Clone)]
pub struct SinkSet {
    pub bundles: Arc<dyn BundleSink>,
    pub requests: Arc<dyn RequestSink>,
    pub reachability: Arc<dyn Reachability>,
}

struct DrainLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct QueueInner {
    config: UploadConfig,
    sinks: SinkSet,
    files: Mutex<PendingMap<BundleKey, PackedBundle>>,
    requests: Mutex<PendingMap<RequestKey, String>>,
    /// Sessions whose container exists on the sink
    prepared: Mutex<HashSet<SessionId>>,
    last_request_key: Mutex<u64>,
    drain_loop: Mutex<Option<DrainLoop>>,
    attempts: TaskTracker,
    events: broadcast::Sender<UploadEvent>,
    counters: UploadCounters,
}

/// Concurrency-safe delivery queue; clones share the queue
#[derive(Clone)]
pub struct UploadQueue {
    inner: Arc<QueueInner>,
}

impl UploadQueue {
    pub fn new(config: UploadConfig, sinks: SinkSet) -> Self {
        let (events, _) = broadcast::channel(1024);
        UploadQueue {
            inner: Arc::new(QueueInner {
                config,
                sinks,
                files: Mutex::new(PendingMap::new()),
                requests: Mutex::new(PendingMap::new()),
                prepared: Mutex::new(HashSet::new()),
                last_request_key: Mutex::new(0),
                drain_loop: Mutex::new(None),
                attempts: TaskTracker::new(),
                events,
                counters: UploadCounters::default(),
            }),
        }
    }

    /// Queue a bundle. Overwrites an entry with the same key.
    pub fn enqueue_file(&self, key: BundleKey, bundle: PackedBundle) {
        debug!("Queued {} ({} bytes)", key, bundle.size_bytes);
        if self.inner.files.lock().insert(key.clone(), bundle) {
            warn!("Bundle {} was queued twice, keeping the newer entry", key);
        }
    }

    /// Queue a GET request, keyed by its creation time
    pub fn enqueue_request(&self, url: impl Into<String>) -> RequestKey {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let key = {
            let mut last = self.inner.last_request_key.lock();
            *last = now.max(*last + 1);
            RequestKey(*last)
        };
        self.inner.requests.lock().insert(key, url.into());
        key
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    pub fn pending_files(&self) -> Vec<(BundleKey, PackedBundle)> {
        self.inner.files.lock().entries()
    }

    pub fn pending_requests(&self) -> Vec<(RequestKey, String)> {
        self.inner.requests.lock().entries()
    }

    pub fn contains_file(&self, key: &BundleKey) -> bool {
        self.inner.files.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.files.lock().len() + self.inner.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.drain_loop.lock().is_some()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> UploadStats {
        let c = &self.inner.counters;
        UploadStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            unreachable_ticks: c.unreachable_ticks.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    /// Start the periodic drain loop. No-op when already running.
    pub fn start(&self) {
        let mut slot = self.inner.drain_loop.lock();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let queue = self.clone();
        let loop_token = token.clone();
        let period = self.inner.config.drain_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {
                        let report = queue.drain_once().await;
                        if let DrainOutcome::Dispatched { files, requests } = report.outcome {
                            debug!("Drain tick dispatched {} files, {} requests", files, requests);
                        }
                    }
                }
            }
            debug!("Upload drain loop stopped");
        });

        *slot = Some(DrainLoop { token, handle });
        info!("Upload queue started (period {:?})", period);
    }

    /// Stop the drain loop.
    ///
    /// `discard_pending` drops every entry and deletes the local files of
    /// dropped bundles. Otherwise running attempts are awaited and the
    /// remaining entries stay queued.
    pub async fn stop(&self, discard_pending: bool) {
        let drain_loop = self.inner.drain_loop.lock().take();
        if let Some(DrainLoop { token, handle }) = drain_loop {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Upload drain loop ended abnormally: {}", e);
            }
        }

        if discard_pending {
            self.discard_all().await;
        } else {
            self.inner.attempts.close();
            self.inner.attempts.wait().await;
            self.inner.attempts.reopen();
            if !self.is_empty() {
                info!("Upload queue stopped with {} entries pending", self.len());
            }
        }
    }

    /// One drain tick followed by waiting for its attempts
    pub async fn flush(&self) -> Vec<DeliveryOutcome> {
        self.drain_once().await.settle().await
    }

    /// Drop the bundles of one session and delete their local files.
    /// Entries of other sessions and pending requests stay queued.
    pub async fn discard_session(&self, session: &SessionId) -> usize {
        let files = self
            .inner
            .files
            .lock()
            .take_where(|key| &key.session == session);
        let dropped = files.len();
        self.discard_files(files).await;
        if dropped > 0 {
            info!("Discarded {} queued bundles of session {}", dropped, session);
        }
        dropped
    }

    async fn discard_all(&self) {
        let files = self.inner.files.lock().take_all();
        let requests = self.inner.requests.lock().take_all();

        self.discard_files(files).await;
        for (key, _) in requests {
            self.discarded(DeliveryKey::Request(key));
        }
    }

    async fn discard_files(&self, files: Vec<(BundleKey, PackedBundle)>) {
        for (key, bundle) in files {
            match tokio::fs::remove_file(&bundle.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not delete discarded {}: {}", bundle.path.display(), e),
            }
            self.discarded(DeliveryKey::Bundle(key));
        }
    }

    fn discarded(&self, key: DeliveryKey) {
        self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.events.send(UploadEvent::Discarded(key));
    }

    /// Run one drain tick. Attempts run on their own tasks; the returned
    /// report can be settled to wait for them.
    pub async fn drain_once(&self) -> DrainReport {
        self.inner.counters.ticks.fetch_add(1, Ordering::Relaxed);
        if self.is_empty() {
            return DrainReport::skipped(DrainOutcome::Empty);
        }

        if !self.inner.sinks.reachability.is_reachable().await {
            self.inner
                .counters
                .unreachable_ticks
                .fetch_add(1, Ordering::Relaxed);
            debug!("Sink unreachable, skipping drain tick");
            return DrainReport::skipped(DrainOutcome::Unreachable);
        }

        let files = self.inner.files.lock().snapshot();
        let requests = self.inner.requests.lock().snapshot();
        let outcome = DrainOutcome::Dispatched {
            files: files.len(),
            requests: requests.len(),
        };

        let mut attempts = Vec::with_capacity(files.len() + requests.len());
        for (key, generation, bundle) in files {
            let queue = self.clone();
            attempts.push(
                self.inner
                    .attempts
                    .spawn(async move { queue.deliver_file(key, generation, bundle).await }),
            );
        }
        for (key, generation, url) in requests {
            let queue = self.clone();
            attempts.push(
                self.inner
                    .attempts
                    .spawn(async move { queue.deliver_request(key, generation, url).await }),
            );
        }

        DrainReport { outcome, attempts }
    }

    async fn ensure_container(&self, session: &SessionId) -> Result<(), DeliveryError> {
        if self.inner.prepared.lock().contains(session) {
            return Ok(());
        }
        self.inner.sinks.bundles.prepare(session.as_str()).await?;
        self.inner.prepared.lock().insert(session.clone());
        Ok(())
    }

    async fn deliver_file(
        &self,
        key: BundleKey,
        generation: u64,
        bundle: PackedBundle,
    ) -> DeliveryOutcome {
        self.inner.counters.attempts.fetch_add(1, Ordering::Relaxed);

        let remote_name = bundle
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}-{}", key.session, key.iteration));

        let result = match self.ensure_container(&key.session).await {
            Ok(()) => {
                self.inner
                    .sinks
                    .bundles
                    .upload(key.session.as_str(), &remote_name, &bundle.path)
                    .await
            }
            Err(e) => Err(e),
        };

        let delivery_key = DeliveryKey::Bundle(key.clone());
        match &result {
            Ok(()) => {
                let committed = self.inner.files.lock().commit(&key, generation);
                if committed.is_some() {
                    if let Err(e) = tokio::fs::remove_file(&bundle.path).await {
                        warn!("Delivered {} but could not delete it: {}", bundle.path.display(), e);
                    }
                }
                info!("Delivered {} as {}/{}", key, key.session, remote_name);
                self.delivered(delivery_key.clone());
            }
            Err(e) => {
                self.inner.files.lock().rollback(&key, generation);
                self.retrying(delivery_key.clone(), e.clone());
            }
        }

        DeliveryOutcome {
            key: delivery_key,
            result,
        }
    }

    async fn deliver_request(
        &self,
        key: RequestKey,
        generation: u64,
        url: String,
    ) -> DeliveryOutcome {
        self.inner.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.sinks.requests.get(&url).await;

        let delivery_key = DeliveryKey::Request(key);
        match &result {
            Ok(()) => {
                self.inner.requests.lock().commit(&key, generation);
                debug!("Request {} delivered", key.0);
                self.delivered(delivery_key.clone());
            }
            Err(e) => {
                self.inner.requests.lock().rollback(&key, generation);
                self.retrying(delivery_key.clone(), e.clone());
            }
        }

        DeliveryOutcome {
            key: delivery_key,
            result,
        }
    }

    fn delivered(&self, key: DeliveryKey) {
        self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.events.send(UploadEvent::Delivered(key));
    }

    fn retrying(&self, key: DeliveryKey, error: DeliveryError) {
        self.inner
            .counters
            .failed_attempts
            .fetch_add(1, Ordering::Relaxed);
        debug!("Delivery of {} failed, will retry: {}", key, error);
        let _ = self.inner.events.send(UploadEvent::Retrying { key, error });
    }
}
