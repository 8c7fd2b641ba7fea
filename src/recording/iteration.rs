//! Iteration Manager - Rotation State Machine
//!
//! Owns the session's [`Timeline`], the routing table that sends rows to
//! the open iteration's handles, and the rotation scheduler.
//!
//! ## Tick
//!
//! ```text
//! on_tick (opening N)
//!   1. create <session>/<N>/ and open one handle per stream
//!   2. seal N-2 if still unsealed: close handles, Sealed, spawn pipeline
//!   3. timeline.open(N): N-1 becomes Sealing
//!   4. swap the route to N's handles
//!
//! seal pipeline (async):  await every CloseAck ──► archiver.submit(N-2)
//! ```
//!
//! Iteration N-1 keeps its handles for one more interval so rows racing
//! the route swap still land. N-2 is only archived after the writer has
//! acknowledged that all of its queued rows are on disk.
//!
//! A failure in step 1 is returned to the caller and leaves the timeline
//! untouched; the next tick tries the same index again.

use crate::recording::archive::{ArchiveError, ArchiveEvent, Archiver};
use crate::recording::clock::{ProductionClock, RecorderClock};
use crate::recording::config::{RotationConfig, RotationMode};
use crate::recording::row::{Row, StreamId};
use crate::recording::session::Session;
use crate::recording::timeline::{IterationId, IterationState, Timeline, TransitionError};
use crate::recording::writer::{CloseAck, StreamHandle, StreamWriter, WriterError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Rotation error types
#[derive(Debug)]
pub enum RotationError {
    /// The new iteration's directory could not be created
    DirectoryCreateFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A stream file of the new iteration could not be opened
    ResourceUnavailable(WriterError),
    /// The manager was cancelled or finalized
    Inactive,
}

impl std::fmt::Display for RotationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationError::DirectoryCreateFailed { path, source } => {
                write!(f, "Cannot create iteration directory {}: {}", path.display(), source)
            }
            RotationError::ResourceUnavailable(e) => write!(f, "Rotation failed: {}", e),
            RotationError::Inactive => write!(f, "Iteration manager is no longer active"),
        }
    }
}

impl std::error::Error for RotationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RotationError::DirectoryCreateFailed { source, .. } => Some(source),
            RotationError::ResourceUnavailable(e) => Some(e),
            RotationError::Inactive => None,
        }
    }
}

impl From<WriterError> for RotationError {
    fn from(e: WriterError) -> Self {
        RotationError::ResourceUnavailable(e)
    }
}

/// Manager lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, no iteration yet
    Idle,
    Running,
    Paused,
    Cancelled,
    Finalized,
}

impl Phase {
    fn is_terminal(self) -> bool {
        matches!(self, Phase::Cancelled | Phase::Finalized)
    }
}

/// What happens to an iteration once sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Archive,
    Discard,
}

/// Result of `on_cancel`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Iterations force-sealed and thrown away
    pub discarded: Vec<IterationId>,
    /// Working directories removed
    pub removed_dirs: usize,
}

/// Result of `on_finalize`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Iterations force-sealed and sent to the archiver
    pub sealed: Vec<IterationId>,
    /// Total iterations of the session
    pub iterations: u64,
}

struct ManagerState {
    timeline: Timeline,
    phase: Phase,
}

/// Where rows of each stream currently go
struct Route {
    iteration: IterationId,
    handles: HashMap<StreamId, StreamHandle>,
}

struct Scheduler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct ManagerInner<C: RecorderClock> {
    session: Arc<Session>,
    writer: StreamWriter,
    archiver: Archiver,
    rotation: RotationConfig,
    clock: C,
    state: Mutex<ManagerState>,
    route: RwLock<Option<Route>>,
    pipelines: TaskTracker,
    scheduler: Mutex<Option<Scheduler>>,
}

/// Drives iteration rotation for one session; clones share state.
///
/// Ticks and seal pipelines spawn tasks, so the manager must be used from
/// within a tokio runtime.
pub struct IterationManager<C: RecorderClock = ProductionClock> {
    inner: Arc<ManagerInner<C>>,
}

impl<C: RecorderClock> Clone for IterationManager<C> {
    fn clone(&self) -> Self {
        IterationManager {
            inner: self.inner.clone(),
        }
    }
}

impl<C: RecorderClock> IterationManager<C> {
    pub fn new(
        session: Arc<Session>,
        writer: StreamWriter,
        archiver: Archiver,
        rotation: RotationConfig,
        clock: C,
    ) -> Self {
        IterationManager {
            inner: Arc::new(ManagerInner {
                session,
                writer,
                archiver,
                rotation,
                clock,
                state: Mutex::new(ManagerState {
                    timeline: Timeline::new(),
                    phase: Phase::Idle,
                }),
                route: RwLock::new(None),
                pipelines: TaskTracker::new(),
                scheduler: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// First play: open iteration 1 and start the scheduler.
    ///
    /// Nothing is sealed since there is no prior iteration.
    pub fn start(&self) -> Result<IterationId, RotationError> {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Idle {
                warn!("Iteration manager started twice");
                return state.timeline.current().ok_or(RotationError::Inactive);
            }
            state.phase = Phase::Running;
        }
        let id = match self.on_tick() {
            Ok(id) => id,
            Err(e) => {
                self.inner.state.lock().phase = Phase::Idle;
                return Err(e);
            }
        };
        self.start_scheduler();
        Ok(id)
    }

    /// Rotate: open iteration N and seal N-2.
    pub fn on_tick(&self) -> Result<IterationId, RotationError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.phase.is_terminal() || state.phase == Phase::Idle {
            return Err(RotationError::Inactive);
        }

        let next = state.timeline.next_id();
        let dir = inner.session.iteration_dir(next.index());
        std::fs::create_dir_all(&dir).map_err(|source| {
            error!("Rotation to iteration {} failed: {}", next, source);
            RotationError::DirectoryCreateFailed {
                path: dir.clone(),
                source,
            }
        })?;

        let handles = match self.open_handles(&dir) {
            Ok(handles) => handles,
            Err(e) => {
                error!("Rotation to iteration {} failed: {}", next, e);
                if let Err(rm) = std::fs::remove_dir_all(&dir) {
                    warn!("Could not remove {}: {}", dir.display(), rm);
                }
                return Err(e.into());
            }
        };

        if let Some(old) = state.timeline.behind(next, 2) {
            if state.timeline.state(old).is_some_and(IterationState::is_unsealed) {
                self.seal(&mut state.timeline, old, Disposition::Archive);
            }
        }

        let route_handles = handles
            .iter()
            .map(|h| (h.stream().clone(), h.clone()))
            .collect();
        let id = state.timeline.open(dir, handles, inner.clock.now());
        *inner.route.write() = Some(Route {
            iteration: id,
            handles: route_handles,
        });

        info!("Opened iteration {} of session {}", id, inner.session.id());
        Ok(id)
    }

    /// Suspend rotation. Iteration state is unchanged.
    pub async fn on_pause(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Running {
                return;
            }
            state.phase = Phase::Paused;
        }
        self.stop_scheduler().await;
        debug!("Rotation paused");
    }

    /// Resume rotation; the next rotation happens one full interval later.
    pub fn on_resume(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.phase != Phase::Paused {
                return;
            }
            state.phase = Phase::Running;
        }
        self.start_scheduler();
        debug!("Rotation resumed");
    }

    /// Throw the session away: force-seal the unsealed iterations without
    /// archiving, wait for their writes, then delete every working
    /// directory.
    pub async fn on_cancel(&self) -> CancelReport {
        let acks = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return CancelReport::default();
            }
            state.phase = Phase::Cancelled;
            *self.inner.route.write() = None;

            let mut acks = Vec::new();
            for id in state.timeline.unsealed() {
                acks.push((id, self.seal(&mut state.timeline, id, Disposition::Discard)));
            }
            acks
        };
        self.stop_scheduler().await;

        let mut report = CancelReport::default();
        for (id, id_acks) in acks {
            wait_acks(id, id_acks).await;
            if let Err(e) = self.transition(id, IterationState::Discarded) {
                warn!("{}", e);
            }
            report.discarded.push(id);
        }

        // Earlier iterations may still be on their way through the archiver.
        self.settle_pipelines().await;
        self.inner.archiver.shutdown().await;

        let dirs: Vec<PathBuf> = {
            let state = self.inner.state.lock();
            state.timeline.iter().map(|it| it.dir().to_path_buf()).collect()
        };
        for dir in dirs {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => report.removed_dirs += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", dir.display(), e),
            }
        }

        info!(
            "Cancelled session {} ({} iterations discarded)",
            self.inner.session.id(),
            report.discarded.len()
        );
        report
    }

    /// Save the session: force-seal the unsealed iterations, archive them
    /// and wait for every archive job. The archiver's event channel is
    /// closed when this returns.
    pub async fn on_finalize(&self) -> FinalizeReport {
        let (sealed, iterations) = {
            let mut state = self.inner.state.lock();
            if state.phase.is_terminal() {
                return FinalizeReport::default();
            }
            state.phase = Phase::Finalized;
            *self.inner.route.write() = None;

            let mut sealed = Vec::new();
            for id in state.timeline.unsealed() {
                // Acks are awaited by the pipeline.
                let _ = self.seal(&mut state.timeline, id, Disposition::Archive);
                sealed.push(id);
            }
            (sealed, state.timeline.current_index())
        };
        self.stop_scheduler().await;

        self.settle_pipelines().await;
        self.inner.archiver.shutdown().await;

        info!(
            "Finalized session {} after {} iterations",
            self.inner.session.id(),
            iterations
        );
        FinalizeReport { sealed, iterations }
    }

    // ========================================================================
    // Rows
    // ========================================================================

    /// Route a row to the open iteration's file for `stream`
    pub fn append(&self, stream: &StreamId, row: Row) -> Result<IterationId, WriterError> {
        let route = self.inner.route.read();
        let Some(route) = route.as_ref() else {
            return Err(WriterError::HandleClosed {
                stream: stream.clone(),
            });
        };
        let Some(handle) = route.handles.get(stream) else {
            return Err(WriterError::HandleClosed {
                stream: stream.clone(),
            });
        };
        self.inner.writer.append(handle, row)?;
        Ok(route.iteration)
    }

    // ========================================================================
    // Archive and delivery outcomes
    // ========================================================================

    /// Record the outcome of an archive job
    pub fn apply_archive_event(&self, event: &ArchiveEvent) {
        match event {
            ArchiveEvent::Progress {
                iteration,
                file,
                fraction,
            } => {
                debug!(
                    "Archiving iteration {}: {} ({:.0}%)",
                    iteration,
                    file,
                    fraction * 100.0
                );
            }
            ArchiveEvent::Completed { iteration, bundle } => {
                let mut state = self.inner.state.lock();
                match state.timeline.transition(*iteration, IterationState::Archived) {
                    Ok(_) => state.timeline.set_bundle(*iteration, bundle.clone()),
                    Err(e) => warn!("{}", e),
                }
            }
            ArchiveEvent::Failed { iteration, error } => {
                warn!(
                    "Iteration {} needs attention, its data stays on disk: {}",
                    iteration, error
                );
                if let Err(e) = self.transition(*iteration, IterationState::ArchiveFailed) {
                    warn!("{}", e);
                }
            }
        }
    }

    pub fn transition(
        &self,
        id: IterationId,
        to: IterationState,
    ) -> Result<IterationState, TransitionError> {
        let result = self.inner.state.lock().timeline.transition(id, to);
        debug_assert!(result.is_ok(), "{:?}", result);
        result
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn current_index(&self) -> u64 {
        self.inner.state.lock().timeline.current_index()
    }

    pub fn state(&self, index: u64) -> Option<IterationState> {
        self.inner
            .state
            .lock()
            .timeline
            .state(IterationId::from_index(index))
    }

    /// `(index, state)` of every iteration, ascending
    pub fn states(&self) -> Vec<(u64, IterationState)> {
        self.inner
            .state
            .lock()
            .timeline
            .iter()
            .map(|it| (it.id().index(), it.state()))
            .collect()
    }

    pub fn iteration_dir(&self, index: u64) -> Option<PathBuf> {
        self.inner
            .state
            .lock()
            .timeline
            .get(IterationId::from_index(index))
            .map(|it| it.dir().to_path_buf())
    }

    /// Wait until every seal pipeline and archive job started so far is done
    pub async fn settle(&self) {
        self.settle_pipelines().await;
        self.inner.archiver.wait_idle().await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn open_handles(&self, dir: &std::path::Path) -> Result<Vec<StreamHandle>, WriterError> {
        let mut handles = Vec::with_capacity(self.inner.session.streams().len());
        for spec in self.inner.session.streams() {
            match self.inner.writer.open(spec, dir) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in &handles {
                        drop(self.inner.writer.close(handle));
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Close `id`'s handles and mark it Sealed. With `Archive` a pipeline
    /// takes the acks; with `Discard` they are returned.
    fn seal(&self, timeline: &mut Timeline, id: IterationId, disposition: Disposition) -> Vec<CloseAck> {
        let handles = timeline.take_handles(id);
        let acks: Vec<CloseAck> = handles.iter().map(|h| self.inner.writer.close(h)).collect();

        if let Err(e) = timeline.transition(id, IterationState::Sealed) {
            debug_assert!(false, "{}", e);
            warn!("{}", e);
        }
        debug!("Sealed iteration {} ({} handles)", id, acks.len());

        match disposition {
            Disposition::Discard => acks,
            Disposition::Archive => {
                let Some(dir) = timeline.get(id).map(|it| it.dir().to_path_buf()) else {
                    return Vec::new();
                };
                let manager = self.clone();
                self.inner.pipelines.spawn(async move {
                    wait_acks(id, acks).await;
                    match manager.inner.archiver.submit(id, &dir) {
                        Ok(()) => {}
                        Err(ArchiveError::AlreadySubmitted(_)) => {
                            debug_assert!(false, "iteration {} archived twice", id);
                        }
                        Err(e) => {
                            error!("Iteration {} could not be archived: {}", id, e);
                            if let Err(e) = manager.transition(id, IterationState::ArchiveFailed) {
                                warn!("{}", e);
                            }
                        }
                    }
                });
                Vec::new()
            }
        }
    }

    fn start_scheduler(&self) {
        if self.inner.rotation.mode != RotationMode::Timer {
            return;
        }
        let mut slot = self.inner.scheduler.lock();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let manager = self.clone();
        let period = self.inner.rotation.interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = interval.tick() => {
                        match manager.on_tick() {
                            Ok(_) => {}
                            Err(RotationError::Inactive) => break,
                            // Already logged; recording continues on the open iteration.
                            Err(_) => {}
                        }
                    }
                }
            }
        });

        *slot = Some(Scheduler { token, handle });
    }

    async fn stop_scheduler(&self) {
        let scheduler = self.inner.scheduler.lock().take();
        if let Some(Scheduler { token, handle }) = scheduler {
            token.cancel();
            if let Err(e) = handle.await {
                warn!("Rotation scheduler ended abnormally: {}", e);
            }
        }
    }

    async fn settle_pipelines(&self) {
        self.inner.pipelines.close();
        self.inner.pipelines.wait().await;
        self.inner.pipelines.reopen();
    }
}

async fn wait_acks(id: IterationId, acks: Vec<CloseAck>) {
    for ack in acks {
        match ack.wait().await {
            Ok(Some(summary)) => debug!(
                "Iteration {}: {} drained ({} rows)",
                id,
                summary.path.display(),
                summary.rows
            ),
            Ok(None) => {}
            Err(e) => warn!("Iteration {}: close did not complete cleanly: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::clock::SimulatedClock;
    use crate::recording::config::{BundleConfig, WriterConfig};
    use crate::recording::row::{FieldValue, StreamSpec};
    use tokio::sync::mpsc;

    struct Fixture {
        _tmp: tempfile::TempDir,
        manager: IterationManager<SimulatedClock>,
        events: mpsc::UnboundedReceiver<ArchiveEvent>,
        writer: StreamWriter,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let session = Arc::new(Session::new(
            &tmp.path().join("work"),
            vec![
                StreamSpec::new("acc", &["x", "y", "z"]),
                StreamSpec::new("gps", &["lat", "lon"]),
            ],
        ));
        let (writer, _) = crate::recording::writer::spawn_stream_writer(WriterConfig::default());
        let (archiver, events) = Archiver::new(
            session.id().clone(),
            tmp.path().join("export"),
            BundleConfig::test(),
        );
        let manager = IterationManager::new(
            session,
            writer.clone(),
            archiver,
            RotationConfig::test(),
            SimulatedClock::new(0),
        );
        Fixture {
            _tmp: tmp,
            manager,
            events,
            writer,
        }
    }

    fn row(t: f64) -> Row {
        Row::new(t, None, vec![FieldValue::Float(t)])
    }

    fn drain_events(fx: &mut Fixture) {
        while let Ok(event) = fx.events.try_recv() {
            fx.manager.apply_archive_event(&event);
        }
    }

    #[tokio::test]
    async fn test_start_opens_first_iteration() {
        let fx = fixture();
        let id = fx.manager.start().unwrap();
        assert_eq!(id.index(), 1);
        assert_eq!(fx.manager.state(1), Some(IterationState::Open));
        assert!(fx.manager.iteration_dir(1).unwrap().join("acc.csv").exists());
    }

    #[tokio::test]
    async fn test_tick_before_start_is_rejected() {
        let fx = fixture();
        assert!(matches!(fx.manager.on_tick(), Err(RotationError::Inactive)));
        assert_eq!(fx.manager.current_index(), 0);
    }

    #[tokio::test]
    async fn test_two_tick_margin() {
        let mut fx = fixture();
        fx.manager.start().unwrap();
        fx.manager.on_tick().unwrap();
        // Iteration 1 is only draining, not sealed.
        assert_eq!(fx.manager.state(1), Some(IterationState::Sealing));

        fx.manager.on_tick().unwrap();
        fx.manager.settle().await;
        drain_events(&mut fx);
        assert_eq!(fx.manager.state(1), Some(IterationState::Archived));
        assert_eq!(fx.manager.state(2), Some(IterationState::Sealing));
        assert_eq!(fx.manager.state(3), Some(IterationState::Open));
    }

    #[tokio::test]
    async fn test_rows_follow_the_route() {
        let fx = fixture();
        fx.manager.start().unwrap();
        let acc = StreamId::new("acc");

        assert_eq!(fx.manager.append(&acc, row(0.1)).unwrap().index(), 1);
        fx.manager.on_tick().unwrap();
        assert_eq!(fx.manager.append(&acc, row(0.2)).unwrap().index(), 2);

        let unknown = StreamId::new("baro");
        assert!(fx.manager.append(&unknown, row(0.3)).is_err());

        fx.writer.flush().await;
        let first = std::fs::read_to_string(fx.manager.iteration_dir(1).unwrap().join("acc.csv"))
            .unwrap();
        assert_eq!(first.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_directory_failure_leaves_timeline_untouched() {
        let fx = fixture();
        fx.manager.start().unwrap();
        // A file where iteration 2's directory should go.
        let blocker = fx.manager.session().iteration_dir(2);
        std::fs::write(&blocker, b"x").unwrap();

        assert!(matches!(
            fx.manager.on_tick(),
            Err(RotationError::DirectoryCreateFailed { .. })
        ));
        assert_eq!(fx.manager.current_index(), 1);
        assert_eq!(fx.manager.state(1), Some(IterationState::Open));

        std::fs::remove_file(&blocker).unwrap();
        assert_eq!(fx.manager.on_tick().unwrap().index(), 2);
    }

    #[tokio::test]
    async fn test_cancel_discards_unsealed() {
        let mut fx = fixture();
        fx.manager.start().unwrap();
        fx.manager.on_tick().unwrap();
        fx.manager.on_tick().unwrap();

        let report = fx.manager.on_cancel().await;
        drain_events(&mut fx);

        let discarded: Vec<u64> = report.discarded.iter().map(|id| id.index()).collect();
        assert_eq!(discarded, vec![2, 3]);
        assert_eq!(fx.manager.state(2), Some(IterationState::Discarded));
        assert_eq!(fx.manager.state(3), Some(IterationState::Discarded));
        for i in 1..=3 {
            assert!(!fx.manager.session().iteration_dir(i).exists());
        }
        assert!(matches!(fx.manager.on_tick(), Err(RotationError::Inactive)));
    }

    #[tokio::test]
    async fn test_finalize_archives_everything() {
        let mut fx = fixture();
        fx.manager.start().unwrap();
        for _ in 0..3 {
            fx.manager.on_tick().unwrap();
        }

        let report = fx.manager.on_finalize().await;
        assert_eq!(report.iterations, 4);
        let sealed: Vec<u64> = report.sealed.iter().map(|id| id.index()).collect();
        assert_eq!(sealed, vec![3, 4]);

        let mut completed = Vec::new();
        while let Some(event) = fx.events.recv().await {
            if let ArchiveEvent::Completed { iteration, .. } = &event {
                completed.push(iteration.index());
            }
            fx.manager.apply_archive_event(&event);
        }
        completed.sort_unstable();
        assert_eq!(completed, vec![1, 2, 3, 4]);
        for i in 1..=4 {
            assert_eq!(fx.manager.state(i), Some(IterationState::Archived));
        }
    }

    #[tokio::test]
    async fn test_pause_keeps_state() {
        let fx = fixture();
        fx.manager.start().unwrap();
        fx.manager.on_pause().await;
        assert_eq!(fx.manager.phase(), Phase::Paused);
        assert_eq!(fx.manager.state(1), Some(IterationState::Open));
        fx.manager.on_resume();
        assert_eq!(fx.manager.phase(), Phase::Running);
    }
}
