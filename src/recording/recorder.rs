//! Flight Recorder - Session Orchestration
//!
//! Ties the pieces together for one recorder instance:
//!
//! ```text
//! on_value ──► live mirror ────────────────────────────┐
//!    │                                                 │ finalize: manifest
//!    └──► IterationManager ──► StreamWriter            │ + export bundle
//!              │ seal                                  ▼
//!              ▼                                 <export>/<title>.bundle
//!           Archiver ──ArchiveEvent──► dispatcher ──► UploadQueue ──► sink
//!                                          ▲                │
//!                                          └──UploadEvent───┘
//! ```
//!
//! The dispatcher is the only consumer of archive events: it records the
//! outcome in the timeline and hands finished bundles to the queue, or
//! deletes them when the session was cancelled. Delivery events flow back
//! the same way so iteration states reach `Delivered`.

use crate::recording::archive::{ArchiveEvent, Archiver};
use crate::recording::bundle::{
    dir_size, pack, unique_bundle_path, BundleError, BundleSource, Compression, PackedBundle,
};
use crate::recording::clock::{ProductionClock, RecorderClock, RecordingTimer};
use crate::recording::config::{ConfigError, RecorderConfig, RotationMode};
use crate::recording::iteration::{IterationManager, RotationError};
use crate::recording::ping::Pinger;
use crate::recording::row::{FieldValue, Row, StreamId, StreamSpec};
use crate::recording::session::{sanitize_title, Session, SessionId, SessionManifest, MANIFEST_FILE};
use crate::recording::timeline::{IterationId, IterationState};
use crate::recording::upload::{BundleKey, DeliveryKey, SinkSet, UploadEvent, UploadQueue};
use crate::recording::writer::{spawn_stream_writer, StreamHandle, StreamWriter, WriterError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Recorder error types
#[derive(Debug)]
pub enum RecorderError {
    /// Operation needs an active session
    NotRecording,
    /// `play` while a session is already recording
    AlreadyRecording,
    Config(ConfigError),
    Rotation(RotationError),
    Writer(WriterError),
    Bundle(BundleError),
    Io(std::io::Error),
}

impl std::fmt::Display for RecorderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderError::NotRecording => write!(f, "No active recording session"),
            RecorderError::AlreadyRecording => write!(f, "A session is already recording"),
            RecorderError::Config(e) => write!(f, "{}", e),
            RecorderError::Rotation(e) => write!(f, "{}", e),
            RecorderError::Writer(e) => write!(f, "{}", e),
            RecorderError::Bundle(e) => write!(f, "Export failed: {}", e),
            RecorderError::Io(e) => write!(f, "Recorder I/O error: {}", e),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<ConfigError> for RecorderError {
    fn from(e: ConfigError) -> Self {
        RecorderError::Config(e)
    }
}

impl From<RotationError> for RecorderError {
    fn from(e: RotationError) -> Self {
        RecorderError::Rotation(e)
    }
}

impl From<WriterError> for RecorderError {
    fn from(e: WriterError) -> Self {
        RecorderError::Writer(e)
    }
}

impl From<BundleError> for RecorderError {
    fn from(e: BundleError) -> Self {
        RecorderError::Bundle(e)
    }
}

impl From<std::io::Error> for RecorderError {
    fn from(e: std::io::Error) -> Self {
        RecorderError::Io(e)
    }
}

/// Recorder status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderStatus {
    Idle,
    /// `play` is setting up a session
    Starting,
    Recording,
    Paused,
}

/// What `finalize` produced
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session: SessionId,
    /// Whole-session export (live files + manifest)
    pub export: PackedBundle,
    pub iterations: u64,
    /// Recording time, pauses excluded
    pub recorded: Duration,
    pub data_size_bytes: u64,
}

/// State of the session being recorded
struct ActiveSession<C: RecorderClock> {
    session: Arc<Session>,
    /// None when rotation is disabled
    manager: Option<IterationManager<C>>,
    live: HashMap<StreamId, StreamHandle>,
    cancelled: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct Status {
    status: RecorderStatus,
    timer: RecordingTimer,
}

/// Rotating sensor recorder
pub struct FlightRecorder<C: RecorderClock = ProductionClock> {
    config: RecorderConfig,
    clock: C,
    writer: StreamWriter,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    queue: UploadQueue,
    pinger: Option<Pinger>,
    status: Mutex<Status>,
    active: RwLock<Option<Arc<ActiveSession<C>>>>,
}

impl FlightRecorder<ProductionClock> {
    /// Create a recorder with the system clock. Needs a tokio runtime.
    pub fn new(config: RecorderConfig, sinks: SinkSet) -> Result<Self, RecorderError> {
        Self::with_clock(config, sinks, ProductionClock::new())
    }
}

impl<C: RecorderClock> FlightRecorder<C> {
    pub fn with_clock(config: RecorderConfig, sinks: SinkSet, clock: C) -> Result<Self, RecorderError> {
        config.validate()?;
        let (writer, writer_task) = spawn_stream_writer(config.writer.clone());
        let queue = UploadQueue::new(config.upload.clone(), sinks);
        let pinger = config.ping.as_ref().map(Pinger::from_config);

        Ok(FlightRecorder {
            config,
            clock,
            writer,
            writer_task: Mutex::new(Some(writer_task)),
            queue,
            pinger,
            status: Mutex::new(Status {
                status: RecorderStatus::Idle,
                timer: RecordingTimer::new(),
            }),
            active: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn queue(&self) -> &UploadQueue {
        &self.queue
    }

    pub fn writer(&self) -> &StreamWriter {
        &self.writer
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.lock().status
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.active.read().as_ref().map(|a| a.session.id().clone())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a new session, or resume a paused one.
    pub fn play(&self, streams: Vec<StreamSpec>) -> Result<SessionId, RecorderError> {
        let resume = {
            let mut status = self.status.lock();
            match status.status {
                RecorderStatus::Recording | RecorderStatus::Starting => {
                    return Err(RecorderError::AlreadyRecording)
                }
                RecorderStatus::Paused => true,
                RecorderStatus::Idle => {
                    status.status = RecorderStatus::Starting;
                    false
                }
            }
        };
        if resume {
            self.resume()?;
            return self.session_id().ok_or(RecorderError::NotRecording);
        }

        self.start_session(streams).map_err(|e| {
            self.status.lock().status = RecorderStatus::Idle;
            e
        })
    }

    /// Set up a session; called with the status held at `Starting`
    fn start_session(&self, streams: Vec<StreamSpec>) -> Result<SessionId, RecorderError> {
        let session = Arc::new(Session::new(&self.config.root_dir, streams));
        let live_dir = session.live_dir();
        std::fs::create_dir_all(&live_dir)?;

        let mut live = HashMap::new();
        for spec in session.streams() {
            match self.writer.open(spec, &live_dir) {
                Ok(handle) => {
                    live.insert(spec.id.clone(), handle);
                }
                Err(e) => {
                    for handle in live.values() {
                        drop(self.writer.close(handle));
                    }
                    let _ = std::fs::remove_dir_all(session.dir());
                    return Err(e.into());
                }
            }
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let (manager, dispatcher) = if self.config.rotation.mode == RotationMode::Disabled {
            (None, None)
        } else {
            let (archiver, archive_rx) = Archiver::new(
                session.id().clone(),
                self.config.export_dir.clone(),
                self.config.bundle.clone(),
            );
            let manager = IterationManager::new(
                session.clone(),
                self.writer.clone(),
                archiver,
                self.config.rotation.clone(),
                self.clock.clone(),
            );
            if let Err(e) = manager.start() {
                for handle in live.values() {
                    drop(self.writer.close(handle));
                }
                let _ = std::fs::remove_dir_all(session.dir());
                return Err(e.into());
            }
            let dispatcher = spawn_dispatcher(
                manager.clone(),
                archive_rx,
                self.queue.clone(),
                self.queue.subscribe(),
                cancelled.clone(),
                self.config.upload.enabled,
            );
            (Some(manager), Some(dispatcher))
        };

        if self.config.upload.enabled {
            self.queue.start();
        }
        if let Some(pinger) = &self.pinger {
            pinger.reset();
        }

        let id = session.id().clone();
        let mut status = self.status.lock();
        *self.active.write() = Some(Arc::new(ActiveSession {
            session,
            manager,
            live,
            cancelled,
            dispatcher: Mutex::new(dispatcher),
        }));
        status.timer.reset();
        status.timer.start(self.clock.now());
        status.status = RecorderStatus::Recording;
        info!("Recording session {}", id);
        Ok(id)
    }

    pub async fn pause(&self) -> Result<(), RecorderError> {
        {
            let mut status = self.status.lock();
            if status.status != RecorderStatus::Recording {
                return Err(RecorderError::NotRecording);
            }
            status.status = RecorderStatus::Paused;
            status.timer.pause(self.clock.now());
        }
        if let Some(manager) = self.manager() {
            manager.on_pause().await;
        }
        info!("Recording paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), RecorderError> {
        {
            let mut status = self.status.lock();
            if status.status != RecorderStatus::Paused {
                return Err(RecorderError::NotRecording);
            }
            status.status = RecorderStatus::Recording;
            status.timer.start(self.clock.now());
        }
        if let Some(manager) = self.manager() {
            manager.on_resume();
        }
        info!("Recording resumed");
        Ok(())
    }

    /// Rotate now. Used with manual rotation; works in timer mode too.
    pub fn rotate(&self) -> Result<IterationId, RecorderError> {
        let manager = self.manager().ok_or(RecorderError::NotRecording)?;
        Ok(manager.on_tick()?)
    }

    /// Discard the session: nothing of it is archived, exported or
    /// uploaded. Bundles of earlier saved sessions stay queued.
    pub async fn cancel(&self) -> Result<(), RecorderError> {
        let active = self.take_active()?;
        active.cancelled.store(true, Ordering::SeqCst);

        self.close_live(&active).await;
        if let Some(manager) = &active.manager {
            manager.on_cancel().await;
        }
        join_dispatcher(&active).await;
        self.queue.discard_session(active.session.id()).await;
        if self.queue.is_empty() {
            self.queue.stop(false).await;
        }

        match tokio::fs::remove_dir_all(active.session.dir()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", active.session.dir().display(), e),
        }

        self.reset_status();
        info!("Session {} cancelled", active.session.id());
        Ok(())
    }

    /// Save the session: archive and queue the remaining iterations, then
    /// export the live files with a manifest as `<export>/<title>.<ext>`.
    pub async fn finalize(&self, title: &str) -> Result<SessionSummary, RecorderError> {
        let active = self.take_active()?;
        let recorded = {
            let mut status = self.status.lock();
            status.timer.pause(self.clock.now());
            status.timer.elapsed(self.clock.now())
        };

        let iterations = match &active.manager {
            Some(manager) => manager.on_finalize().await.iterations,
            None => 0,
        };
        join_dispatcher(&active).await;
        self.close_live(&active).await;

        let live_dir = active.session.live_dir();
        let data_size_bytes = dir_size(&live_dir);
        let manifest = SessionManifest::new(
            &active.session,
            title,
            recorded.as_millis() as u64,
            iterations,
            data_size_bytes,
        );
        manifest.write_to(&live_dir)?;

        let mut stem = sanitize_title(title);
        if stem.is_empty() {
            stem = active.session.id().to_string();
        }
        let export = export_live_dir(
            live_dir.clone(),
            self.config.export_dir.clone(),
            stem,
            self.config.bundle.extension.clone(),
            self.config.bundle.compression(),
        )
        .await?;

        tokio::fs::remove_dir_all(&live_dir).await?;
        // Kept when an iteration failed to archive.
        if let Err(e) = tokio::fs::remove_dir(active.session.dir()).await {
            debug!("Session directory kept: {}", e);
        }

        self.reset_status();
        info!(
            "Session {} saved to {} ({} iterations, {:?})",
            active.session.id(),
            export.path.display(),
            iterations,
            recorded
        );
        Ok(SessionSummary {
            session: active.session.id().clone(),
            export,
            iterations,
            recorded,
            data_size_bytes,
        })
    }

    /// Finalize any active session, make one last delivery attempt and stop
    /// the writer.
    pub async fn shutdown(&self) -> Result<(), RecorderError> {
        if let Some(id) = self.session_id() {
            warn!("Shutting down while recording, saving session {}", id);
            self.finalize(id.as_str()).await?;
        }
        if self.queue.is_running() {
            self.queue.flush().await;
        }
        self.queue.stop(false).await;
        self.writer.shutdown().await;
        let task = self.writer_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Writer worker ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Record one value tuple. Never blocks; values outside a running
    /// session are ignored.
    pub fn on_value(
        &self,
        stream: &StreamId,
        elapsed_system: f64,
        elapsed_sensor: Option<f64>,
        values: Vec<FieldValue>,
    ) {
        if self.status() != RecorderStatus::Recording {
            return;
        }
        let Some(active) = self.active.read().clone() else {
            return;
        };

        if let Some(pinger) = &self.pinger {
            let elapsed = self.elapsed();
            if let Some(url) =
                pinger.url_for(stream, &values, elapsed, self.clock.now(), active.session.id())
            {
                self.queue.enqueue_request(url);
            }
        }

        let row = Row::new(elapsed_system, elapsed_sensor, values);
        if let Some(handle) = active.live.get(stream) {
            if let Err(e) = self.writer.append(handle, row.clone()) {
                trace!("Live row for {} dropped: {}", stream, e);
            }
        } else {
            trace!("Value for unknown stream {} ignored", stream);
            return;
        }
        if let Some(manager) = &active.manager {
            if let Err(e) = manager.append(stream, row) {
                trace!("Iteration row for {} dropped: {}", stream, e);
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Recording time of the current session, pauses excluded
    pub fn elapsed(&self) -> Duration {
        self.status.lock().timer.elapsed(self.clock.now())
    }

    /// Bytes recorded so far in the live mirror
    pub fn data_size(&self) -> u64 {
        self.active
            .read()
            .as_ref()
            .map(|a| dir_size(&a.session.live_dir()))
            .unwrap_or(0)
    }

    pub fn current_iteration(&self) -> Option<u64> {
        self.manager().map(|m| m.current_index())
    }

    /// `(index, state)` of every iteration of the active session
    pub fn iteration_states(&self) -> Vec<(u64, IterationState)> {
        self.manager().map(|m| m.states()).unwrap_or_default()
    }

    /// Wait for running seal pipelines and archive jobs, then give the
    /// dispatcher a chance to route their events.
    pub async fn settle(&self) {
        if let Some(manager) = self.manager() {
            manager.settle().await;
        }
        tokio::task::yield_now().await;
    }

    fn manager(&self) -> Option<IterationManager<C>> {
        self.active.read().as_ref().and_then(|a| a.manager.clone())
    }

    fn take_active(&self) -> Result<Arc<ActiveSession<C>>, RecorderError> {
        self.active.write().take().ok_or(RecorderError::NotRecording)
    }

    fn reset_status(&self) {
        let mut status = self.status.lock();
        status.status = RecorderStatus::Idle;
        status.timer.reset();
    }

    async fn close_live(&self, active: &ActiveSession<C>) {
        for handle in active.live.values() {
            if let Err(e) = self.writer.close(handle).wait().await {
                warn!("Closing live file {} failed: {}", handle.path().display(), e);
            }
        }
    }
}

async fn join_dispatcher<C: RecorderClock>(active: &ActiveSession<C>) {
    let dispatcher = active.dispatcher.lock().take();
    if let Some(handle) = dispatcher {
        if let Err(e) = handle.await {
            warn!("Event dispatcher ended abnormally: {}", e);
        }
    }
}

/// Pack the live directory on the blocking pool
async fn export_live_dir(
    live_dir: PathBuf,
    export_dir: PathBuf,
    stem: String,
    extension: String,
    compression: Compression,
) -> Result<PackedBundle, RecorderError> {
    tokio::task::spawn_blocking(move || -> Result<PackedBundle, RecorderError> {
        std::fs::create_dir_all(&export_dir)?;
        let mut sources = live_sources(&live_dir)?;
        // Manifest first so readers find it without scanning.
        sources.sort_by_key(|s| (s.name != MANIFEST_FILE, s.name.clone()));
        let dest = unique_bundle_path(&export_dir, &stem, &extension);
        let created_at_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        // Iteration 0 marks a whole-session export.
        Ok(pack(&dest, &sources, 0, created_at_ms, compression, |_| {})?)
    })
    .await
    .map_err(|e| RecorderError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn live_sources(dir: &Path) -> std::io::Result<Vec<BundleSource>> {
    let mut sources = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Some(source) = BundleSource::from_path(entry.path()) {
                sources.push(source);
            }
        }
    }
    Ok(sources)
}

// ============================================================================
// Event dispatch
// ============================================================================

fn spawn_dispatcher<C: RecorderClock>(
    manager: IterationManager<C>,
    mut archive_rx: mpsc::UnboundedReceiver<ArchiveEvent>,
    queue: UploadQueue,
    mut upload_rx: broadcast::Receiver<UploadEvent>,
    cancelled: Arc<AtomicBool>,
    upload_enabled: bool,
) -> JoinHandle<()> {
    let session = manager.session().id().clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = archive_rx.recv() => match event {
                    Some(event) => {
                        route_archive_event(&manager, &queue, &session, &cancelled, upload_enabled, event).await;
                    }
                    // Archiver shut down and every job finished.
                    None => break,
                },
                event = upload_rx.recv() => match event {
                    Ok(event) => route_upload_event(&manager, &session, event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dispatcher missed {} upload events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }
        // Deliveries already reported are still applied.
        while let Ok(event) = upload_rx.try_recv() {
            route_upload_event(&manager, &session, event);
        }
        debug!("Event dispatcher for session {} finished", session);
    })
}

async fn route_archive_event<C: RecorderClock>(
    manager: &IterationManager<C>,
    queue: &UploadQueue,
    session: &SessionId,
    cancelled: &AtomicBool,
    upload_enabled: bool,
    event: ArchiveEvent,
) {
    manager.apply_archive_event(&event);
    let ArchiveEvent::Completed { iteration, bundle } = event else {
        return;
    };

    if cancelled.load(Ordering::SeqCst) {
        if let Err(e) = tokio::fs::remove_file(&bundle.path).await {
            warn!("Could not delete bundle {}: {}", bundle.path.display(), e);
        }
        let _ = manager.transition(iteration, IterationState::Discarded);
        debug!("Bundle of iteration {} discarded", iteration);
        return;
    }

    if upload_enabled {
        let _ = manager.transition(iteration, IterationState::Queued);
        queue.enqueue_file(
            BundleKey {
                session: session.clone(),
                iteration: iteration.index(),
            },
            bundle,
        );
    }
}

fn route_upload_event<C: RecorderClock>(
    manager: &IterationManager<C>,
    session: &SessionId,
    event: UploadEvent,
) {
    let (key, to) = match event {
        UploadEvent::Delivered(DeliveryKey::Bundle(key)) => (key, IterationState::Delivered),
        UploadEvent::Discarded(DeliveryKey::Bundle(key)) => (key, IterationState::Failed),
        _ => return,
    };
    if &key.session != session {
        return;
    }
    let id = IterationId::from_index(key.iteration);
    if manager.state(key.iteration) == Some(IterationState::Queued) {
        let _ = manager.transition(id, to);
    }
}
