//! Archiver - Sealed Iterations to Bundles
//!
//! Each submitted iteration becomes one job on the blocking pool. Jobs run
//! concurrently and report through a typed event channel; the consumer of
//! that channel decides what happens next (enqueue for upload, discard).
//!
//! ```text
//! submit(iteration, dir) ──► snapshot listing ──► spawn_blocking(pack)
//!                                                    │
//!          ArchiveEvent::Progress ◄──────────────────┤ per file
//!          ArchiveEvent::Completed / Failed ◄────────┘ then delete dir on success
//! ```
//!
//! Failure is non-fatal: the event is emitted, the error logged and the
//! working directory left in place.

use crate::recording::bundle::{
    pack, unique_bundle_path, BundleError, BundleSource, Compression, PackedBundle,
};
use crate::recording::config::BundleConfig;
use crate::recording::session::SessionId;
use crate::recording::timeline::IterationId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Archive lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveEvent {
    Progress {
        iteration: IterationId,
        file: String,
        fraction: f64,
    },
    Completed {
        iteration: IterationId,
        bundle: PackedBundle,
    },
    Failed {
        iteration: IterationId,
        error: String,
    },
}

/// Archive error types
#[derive(Debug)]
pub enum ArchiveError {
    /// The iteration was already submitted once
    AlreadySubmitted(IterationId),
    /// The archiver no longer accepts jobs
    Closed,
    /// The working directory could not be listed
    Io(std::io::Error),
    Bundle(BundleError),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::AlreadySubmitted(id) => {
                write!(f, "Iteration {} was already submitted for archiving", id)
            }
            ArchiveError::Closed => write!(f, "Archiver is closed"),
            ArchiveError::Io(e) => write!(f, "Archive I/O error: {}", e),
            ArchiveError::Bundle(e) => write!(f, "Archive bundle error: {}", e),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<std::io::Error> for ArchiveError {
    fn from(e: std::io::Error) -> Self {
        ArchiveError::Io(e)
    }
}

impl From<BundleError> for ArchiveError {
    fn from(e: BundleError) -> Self {
        ArchiveError::Bundle(e)
    }
}

struct ArchiverInner {
    session: SessionId,
    export_dir: PathBuf,
    config: BundleConfig,
    events: Mutex<Option<mpsc::UnboundedSender<ArchiveEvent>>>,
    submitted: Mutex<HashSet<IterationId>>,
    jobs: TaskTracker,
}

/// Bundles sealed iterations of one session
#[derive(Clone)]
pub struct Archiver {
    inner: Arc<ArchiverInner>,
}

impl Archiver {
    /// Create an archiver and the receiving end of its event channel.
    ///
    /// The channel closes once [`Archiver::shutdown`] has returned and the
    /// last job has finished.
    pub fn new(
        session: SessionId,
        export_dir: PathBuf,
        config: BundleConfig,
    ) -> (Archiver, mpsc::UnboundedReceiver<ArchiveEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let archiver = Archiver {
            inner: Arc::new(ArchiverInner {
                session,
                export_dir,
                config,
                events: Mutex::new(Some(tx)),
                submitted: Mutex::new(HashSet::new()),
                jobs: TaskTracker::new(),
            }),
        };
        (archiver, rx)
    }

    /// Submit a sealed iteration's directory.
    ///
    /// The directory listing is captured now; files added later are not
    /// part of the bundle. A second submission of the same iteration is
    /// rejected.
    pub fn submit(&self, iteration: IterationId, dir: &Path) -> Result<(), ArchiveError> {
        let events = self
            .inner
            .events
            .lock()
            .clone()
            .ok_or(ArchiveError::Closed)?;

        if !self.inner.submitted.lock().insert(iteration) {
            warn!("Iteration {} submitted for archiving twice, ignored", iteration);
            return Err(ArchiveError::AlreadySubmitted(iteration));
        }

        let sources = match snapshot_listing(dir) {
            Ok(sources) => sources,
            Err(e) => {
                // Let a later retry through once the directory exists.
                self.inner.submitted.lock().remove(&iteration);
                return Err(e.into());
            }
        };

        let job = ArchiveJob {
            iteration,
            source_dir: dir.to_path_buf(),
            sources,
            export_dir: self.inner.export_dir.clone(),
            stem: format!("{}-{}", self.inner.session, iteration.index()),
            extension: self.inner.config.extension.clone(),
            compression: self.inner.config.compression(),
            events,
        };

        debug!(
            "Archiving iteration {} ({} files)",
            iteration,
            job.sources.len()
        );
        self.inner.jobs.spawn_blocking(move || job.run());
        Ok(())
    }

    pub fn was_submitted(&self, iteration: IterationId) -> bool {
        self.inner.submitted.lock().contains(&iteration)
    }

    /// Number of jobs still running
    pub fn pending(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Wait for every running job without closing the archiver
    pub async fn wait_idle(&self) {
        self.inner.jobs.close();
        self.inner.jobs.wait().await;
        self.inner.jobs.reopen();
    }

    /// Stop accepting jobs, wait for running ones and close the event
    /// channel.
    pub async fn shutdown(&self) {
        let sender = self.inner.events.lock().take();
        self.inner.jobs.close();
        self.inner.jobs.wait().await;
        drop(sender);
    }
}

/// Regular files of `dir`, sorted by name
fn snapshot_listing(dir: &Path) -> std::io::Result<Vec<BundleSource>> {
    let mut sources = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(source) = BundleSource::from_path(entry.path()) {
            sources.push(source);
        }
    }
    sources.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(sources)
}

struct ArchiveJob {
    iteration: IterationId,
    source_dir: PathBuf,
    sources: Vec<BundleSource>,
    export_dir: PathBuf,
    stem: String,
    extension: String,
    compression: Compression,
    events: mpsc::UnboundedSender<ArchiveEvent>,
}

impl ArchiveJob {
    fn run(self) {
        match self.pack() {
            Ok(bundle) => {
                if let Err(e) = std::fs::remove_dir_all(&self.source_dir) {
                    warn!(
                        "Archived iteration {} but could not remove {}: {}",
                        self.iteration,
                        self.source_dir.display(),
                        e
                    );
                }
                info!(
                    "Archived iteration {} to {} ({} bytes)",
                    self.iteration,
                    bundle.path.display(),
                    bundle.size_bytes
                );
                let _ = self.events.send(ArchiveEvent::Completed {
                    iteration: self.iteration,
                    bundle,
                });
            }
            Err(e) => {
                error!(
                    "Archiving iteration {} failed, keeping {}: {}",
                    self.iteration,
                    self.source_dir.display(),
                    e
                );
                let _ = self.events.send(ArchiveEvent::Failed {
                    iteration: self.iteration,
                    error: e.to_string(),
                });
            }
        }
    }

    fn pack(&self) -> Result<PackedBundle, ArchiveError> {
        std::fs::create_dir_all(&self.export_dir)?;
        let dest = unique_bundle_path(&self.export_dir, &self.stem, &self.extension);
        let created_at_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

        let bundle = pack(
            &dest,
            &self.sources,
            self.iteration.index(),
            created_at_ms,
            self.compression,
            |p| {
                let _ = self.events.send(ArchiveEvent::Progress {
                    iteration: self.iteration,
                    file: p.file,
                    fraction: p.fraction,
                });
            },
        )?;
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::bundle::unpack;

    fn iteration_dir(root: &Path, index: u64, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(index.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in files {
            std::fs::write(dir.join(name), body).unwrap();
        }
        dir
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<ArchiveEvent>) -> Vec<ArchiveEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_archive_completes_and_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = iteration_dir(tmp.path(), 1, &[("acc.csv", "t\n1\n"), ("gps.csv", "lat\n")]);
        let (archiver, rx) = Archiver::new(
            SessionId::from_string("s"),
            tmp.path().join("out"),
            BundleConfig::test(),
        );

        archiver.submit(IterationId::from_index(1), &dir).unwrap();
        archiver.shutdown().await;
        let events = collect(rx).await;

        let progress = events
            .iter()
            .filter(|e| matches!(e, ArchiveEvent::Progress { .. }))
            .count();
        assert_eq!(progress, 2);

        let Some(ArchiveEvent::Completed { iteration, bundle }) = events.last() else {
            panic!("expected completion, got {:?}", events);
        };
        assert_eq!(iteration.index(), 1);
        assert_eq!(bundle.path, tmp.path().join("out").join("s-1.bundle"));
        assert!(!dir.exists());

        let (_, entries) = unpack(&bundle.path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "acc.csv");
    }

    #[tokio::test]
    async fn test_double_submission_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = iteration_dir(tmp.path(), 1, &[("a.csv", "x\n")]);
        let (archiver, rx) = Archiver::new(
            SessionId::from_string("s"),
            tmp.path().join("out"),
            BundleConfig::test(),
        );

        let id = IterationId::from_index(1);
        archiver.submit(id, &dir).unwrap();
        assert!(matches!(
            archiver.submit(id, &dir),
            Err(ArchiveError::AlreadySubmitted(_))
        ));
        archiver.shutdown().await;

        let completed = collect(rx)
            .await
            .into_iter()
            .filter(|e| matches!(e, ArchiveEvent::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert_eq!(std::fs::read_dir(tmp.path().join("out")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (archiver, _rx) = Archiver::new(
            SessionId::from_string("s"),
            tmp.path().join("out"),
            BundleConfig::test(),
        );
        let id = IterationId::from_index(4);
        assert!(matches!(
            archiver.submit(id, &tmp.path().join("4")),
            Err(ArchiveError::Io(_))
        ));
        assert!(!archiver.was_submitted(id));
    }

    #[tokio::test]
    async fn test_failed_job_keeps_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = iteration_dir(tmp.path(), 2, &[("a.csv", "x\n")]);
        // A regular file where the export directory should be.
        let blocked = tmp.path().join("out");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let (archiver, rx) =
            Archiver::new(SessionId::from_string("s"), blocked, BundleConfig::test());
        archiver.submit(IterationId::from_index(2), &dir).unwrap();
        archiver.shutdown().await;

        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(ArchiveEvent::Failed { .. })));
        assert!(dir.join("a.csv").exists());
    }

    #[tokio::test]
    async fn test_closed_archiver_rejects_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = iteration_dir(tmp.path(), 1, &[("a.csv", "x\n")]);
        let (archiver, _rx) = Archiver::new(
            SessionId::from_string("s"),
            tmp.path().join("out"),
            BundleConfig::test(),
        );
        archiver.shutdown().await;
        assert!(matches!(
            archiver.submit(IterationId::from_index(1), &dir),
            Err(ArchiveError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_iterations() {
        let tmp = tempfile::tempdir().unwrap();
        let (archiver, rx) = Archiver::new(
            SessionId::from_string("s"),
            tmp.path().join("out"),
            BundleConfig::test(),
        );
        for i in 1..=6 {
            let dir = iteration_dir(tmp.path(), i, &[("a.csv", "x\n")]);
            archiver.submit(IterationId::from_index(i), &dir).unwrap();
        }
        archiver.shutdown().await;

        let mut done: Vec<u64> = collect(rx)
            .await
            .into_iter()
            .filter_map(|e| match e {
                ArchiveEvent::Completed { iteration, .. } => Some(iteration.index()),
                _ => None,
            })
            .collect();
        done.sort_unstable();
        assert_eq!(done, vec![1, 2, 3, 4, 5, 6]);
    }
}
