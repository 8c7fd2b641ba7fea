//! Stream Writer - Single Background Worker per Writer Instance
//!
//! Producers on arbitrary threads hand rows to a dedicated worker through an
//! unbounded channel; the worker owns every open file, encodes rows and
//! writes them through a buffer. Producers never block on I/O.
//!
//! ## Architecture
//!
//! ```text
//! producer A ──┐
//! producer B ──┤──► channel ──► WriterWorker ──► BufWriter<File> per handle
//! rotation   ──┘      (FIFO)        │
//!                                   └──► close: flush + fsync ──► CloseAck
//! ```
//!
//! ## Ordering
//!
//! The channel is FIFO and the worker is single threaded, so rows of one
//! handle land in submission order. A `Close` resolves its ack only after
//! every row queued before it has been written, which is the drain
//! acknowledgment the archiver waits for.

use crate::recording::config::WriterConfig;
use crate::recording::row::{Row, StreamId, StreamSpec};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Error as IoError, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Writer-local handle identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

/// Open file resource for one (iteration, stream) pair
///
/// Clones share the closed flag, so closing through any clone closes all.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    id: HandleId,
    stream: StreamId,
    path: PathBuf,
    closed: Arc<AtomicBool>,
}

impl StreamHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Writer error types
#[derive(Debug)]
pub enum WriterError {
    /// Directory missing or file could not be created
    ResourceUnavailable { path: PathBuf, source: IoError },
    /// Append after close
    HandleClosed { stream: StreamId },
    /// The worker has exited
    WorkerUnavailable,
    /// Flushing or syncing failed
    Io(IoError),
}

impl std::fmt::Display for WriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterError::ResourceUnavailable { path, source } => {
                write!(f, "Resource unavailable: {}: {}", path.display(), source)
            }
            WriterError::HandleClosed { stream } => {
                write!(f, "Handle for stream {} is closed", stream)
            }
            WriterError::WorkerUnavailable => write!(f, "Stream writer worker unavailable"),
            WriterError::Io(e) => write!(f, "Stream writer I/O error: {}", e),
        }
    }
}

impl std::error::Error for WriterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriterError::ResourceUnavailable { source, .. } => Some(source),
            WriterError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for WriterError {
    fn from(e: IoError) -> Self {
        WriterError::Io(e)
    }
}

/// What a closed file contained
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSummary {
    pub stream: StreamId,
    pub path: PathBuf,
    pub rows: u64,
    pub bytes: u64,
}

/// Drain acknowledgment for a close request
#[must_use = "a close ack resolves once the worker has flushed the file"]
pub struct CloseAck {
    inner: Option<oneshot::Receiver<Result<CloseSummary, WriterError>>>,
}

impl CloseAck {
    fn ready() -> Self {
        CloseAck { inner: None }
    }

    /// Resolves after every row queued before the close is on disk.
    ///
    /// `Ok(None)` means the handle had already been closed.
    pub async fn wait(self) -> Result<Option<CloseSummary>, WriterError> {
        match self.inner {
            None => Ok(None),
            Some(rx) => match rx.await {
                Ok(result) => result.map(Some),
                Err(_) => Err(WriterError::WorkerUnavailable),
            },
        }
    }
}

/// Counters shared between the handle side and the worker
#[derive(Debug, Default)]
struct WriterCounters {
    files_opened: AtomicU64,
    files_closed: AtomicU64,
    rows_written: AtomicU64,
    rows_dropped: AtomicU64,
    write_errors: AtomicU64,
}

/// Snapshot of writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub files_opened: u64,
    pub files_closed: u64,
    pub rows_written: u64,
    /// Rows that reached the worker after their handle was closed
    pub rows_dropped: u64,
    pub write_errors: u64,
}

/// Messages for the writer worker
enum WriterMessage {
    Register {
        id: HandleId,
        stream: StreamId,
        path: PathBuf,
        out: BufWriter<File>,
    },
    Append {
        id: HandleId,
        row: Row,
    },
    Close {
        id: HandleId,
        ack_tx: oneshot::Sender<Result<CloseSummary, WriterError>>,
    },
    Flush {
        response_tx: oneshot::Sender<()>,
    },
    Shutdown {
        response_tx: oneshot::Sender<()>,
    },
}

struct OpenFile {
    stream: StreamId,
    path: PathBuf,
    out: BufWriter<File>,
    rows: u64,
    bytes: u64,
    /// Set after the first write error; later rows are counted, not retried
    failed: bool,
}

/// Worker that owns all open files of one writer
struct WriterWorker {
    config: WriterConfig,
    rx: mpsc::UnboundedReceiver<WriterMessage>,
    files: HashMap<HandleId, OpenFile>,
    counters: Arc<WriterCounters>,
    scratch: String,
}

impl WriterWorker {
    fn run(mut self) {
        while let Some(msg) = self.rx.blocking_recv() {
            if self.handle_message(msg) {
                return;
            }
        }
        // Every sender dropped: flush what is still open.
        self.close_all();
        debug!("Stream writer worker exiting, all handles dropped");
    }

    /// Handle a single message. Returns true on shutdown.
    fn handle_message(&mut self, msg: WriterMessage) -> bool {
        match msg {
            WriterMessage::Register {
                id,
                stream,
                path,
                out,
            } => {
                self.files.insert(
                    id,
                    OpenFile {
                        stream,
                        path,
                        out,
                        rows: 0,
                        bytes: 0,
                        failed: false,
                    },
                );
                false
            }
            WriterMessage::Append { id, row } => {
                self.append(id, &row);
                false
            }
            WriterMessage::Close { id, ack_tx } => {
                let result = self.close(id);
                let _ = ack_tx.send(result);
                false
            }
            WriterMessage::Flush { response_tx } => {
                for file in self.files.values_mut() {
                    if let Err(e) = file.out.flush() {
                        error!("Flush of {} failed: {}", file.path.display(), e);
                    }
                }
                let _ = response_tx.send(());
                false
            }
            WriterMessage::Shutdown { response_tx } => {
                self.close_all();
                info!("Stream writer worker shutting down");
                let _ = response_tx.send(());
                true
            }
        }
    }

    fn append(&mut self, id: HandleId, row: &Row) {
        let Some(file) = self.files.get_mut(&id) else {
            self.counters.rows_dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Row for closed handle {:?} dropped", id);
            return;
        };

        self.scratch.clear();
        row.encode_into(
            &mut self.scratch,
            self.config.delimiter,
            self.config.time_precision,
        );

        match file.out.write_all(self.scratch.as_bytes()) {
            Ok(()) => {
                file.rows += 1;
                file.bytes += self.scratch.len() as u64;
                self.counters.rows_written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                if !file.failed {
                    error!("Write to {} failed: {}", file.path.display(), e);
                    file.failed = true;
                }
            }
        }
    }

    fn close(&mut self, id: HandleId) -> Result<CloseSummary, WriterError> {
        let Some(mut file) = self.files.remove(&id) else {
            return Err(WriterError::Io(IoError::new(
                ErrorKind::NotFound,
                format!("handle {:?} not registered", id),
            )));
        };

        file.out.flush()?;
        file.out.get_ref().sync_data()?;
        self.counters.files_closed.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Closed {} ({} rows, {} bytes)",
            file.path.display(),
            file.rows,
            file.bytes
        );

        Ok(CloseSummary {
            stream: file.stream,
            path: file.path,
            rows: file.rows,
            bytes: file.bytes,
        })
    }

    fn close_all(&mut self) {
        let ids: Vec<HandleId> = self.files.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.close(id) {
                error!("Closing handle {:?} during shutdown failed: {}", id, e);
            }
        }
    }
}

/// Handle for sending rows to the writer worker
#[derive(Clone)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<WriterMessage>,
    next_id: Arc<AtomicU64>,
    config: WriterConfig,
    counters: Arc<WriterCounters>,
}

impl StreamWriter {
    /// Create or truncate `<dir>/<stream file>`, write the header and
    /// register the file with the worker.
    pub fn open(&self, stream: &StreamSpec, dir: &Path) -> Result<StreamHandle, WriterError> {
        let path = dir.join(stream.file_name());

        if !dir.is_dir() {
            return Err(WriterError::ResourceUnavailable {
                path,
                source: IoError::new(ErrorKind::NotFound, "directory does not exist"),
            });
        }

        let file = File::create(&path).map_err(|source| WriterError::ResourceUnavailable {
            path: path.clone(),
            source,
        })?;
        let mut out = BufWriter::with_capacity(self.config.buffer_capacity, file);
        out.write_all(stream.header(self.config.delimiter).as_bytes())
            .map_err(|source| WriterError::ResourceUnavailable {
                path: path.clone(),
                source,
            })?;

        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(WriterMessage::Register {
                id,
                stream: stream.id.clone(),
                path: path.clone(),
                out,
            })
            .map_err(|_| WriterError::WorkerUnavailable)?;
        self.counters.files_opened.fetch_add(1, Ordering::Relaxed);

        Ok(StreamHandle {
            id,
            stream: stream.id.clone(),
            path,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Queue a row. Never blocks.
    pub fn append(&self, handle: &StreamHandle, row: Row) -> Result<(), WriterError> {
        if handle.is_closed() {
            return Err(WriterError::HandleClosed {
                stream: handle.stream.clone(),
            });
        }
        self.tx
            .send(WriterMessage::Append { id: handle.id, row })
            .map_err(|_| WriterError::WorkerUnavailable)
    }

    /// Close a handle. Idempotent: a second close returns a resolved ack.
    pub fn close(&self, handle: &StreamHandle) -> CloseAck {
        if handle.closed.swap(true, Ordering::AcqRel) {
            return CloseAck::ready();
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .tx
            .send(WriterMessage::Close {
                id: handle.id,
                ack_tx,
            })
            .is_err()
        {
            // Worker gone; the receiver resolves to WorkerUnavailable.
            warn!("Close of {} after writer shutdown", handle.path.display());
        }
        CloseAck {
            inner: Some(ack_rx),
        }
    }

    /// Flush every open file's buffer
    pub async fn flush(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush { response_tx }).is_ok() {
            let _ = response_rx.await;
        }
    }

    /// Graceful shutdown, closing every still-open file
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .tx
            .send(WriterMessage::Shutdown { response_tx })
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            files_opened: self.counters.files_opened.load(Ordering::Relaxed),
            files_closed: self.counters.files_closed.load(Ordering::Relaxed),
            rows_written: self.counters.rows_written.load(Ordering::Relaxed),
            rows_dropped: self.counters.rows_dropped.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
        }
    }
}

/// Spawn a writer worker on the blocking pool and return its handle
pub fn spawn_stream_writer(config: WriterConfig) -> (StreamWriter, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(WriterCounters::default());

    let worker = WriterWorker {
        config: config.clone(),
        rx,
        files: HashMap::new(),
        counters: counters.clone(),
        scratch: String::with_capacity(256),
    };
    let task = tokio::task::spawn_blocking(move || worker.run());

    let writer = StreamWriter {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
        config,
        counters,
    };
    (writer, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::row::FieldValue;

    fn spec() -> StreamSpec {
        StreamSpec::new("acc", &["t", "x"])
    }

    #[tokio::test]
    async fn test_open_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _task) = spawn_stream_writer(WriterConfig::default());

        let handle = writer.open(&spec(), dir.path()).unwrap();
        writer.close(&handle).wait().await.unwrap();

        let contents = std::fs::read_to_string(dir.path().join("acc.csv")).unwrap();
        assert_eq!(contents, "t;x\n");
    }

    #[tokio::test]
    async fn test_open_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _task) = spawn_stream_writer(WriterConfig::default());

        let err = writer.open(&spec(), &dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, WriterError::ResourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_rows_in_order_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _task) = spawn_stream_writer(WriterConfig::default());
        let handle = writer.open(&spec(), dir.path()).unwrap();

        for i in 0..500 {
            let row = Row::new(i as f64 * 0.01, None, vec![FieldValue::Int(i)]);
            writer.append(&handle, row).unwrap();
        }
        let summary = writer.close(&handle).wait().await.unwrap().unwrap();
        assert_eq!(summary.rows, 500);

        let contents = std::fs::read_to_string(handle.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 501);
        for (i, line) in lines[1..].iter().enumerate() {
            let value: i64 = line.rsplit(';').next().unwrap().parse().unwrap();
            assert_eq!(value, i as i64);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _task) = spawn_stream_writer(WriterConfig::default());
        let handle = writer.open(&spec(), dir.path()).unwrap();

        assert!(writer.close(&handle).wait().await.unwrap().is_some());
        assert!(writer.close(&handle).wait().await.unwrap().is_none());
        assert!(writer.close(&handle.clone()).wait().await.unwrap().is_none());
        assert_eq!(writer.stats().files_closed, 1);
    }

    #[tokio::test]
    async fn test_append_after_close_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _task) = spawn_stream_writer(WriterConfig::default());
        let handle = writer.open(&spec(), dir.path()).unwrap();
        writer.close(&handle).wait().await.unwrap();

        let err = writer
            .append(&handle, Row::new(0.0, None, Vec::new()))
            .unwrap_err();
        assert!(matches!(err, WriterError::HandleClosed { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_producers_keep_per_stream_order() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _task) = spawn_stream_writer(WriterConfig::default());

        let streams: Vec<StreamSpec> = (0..4)
            .map(|i| StreamSpec::new(format!("s{}", i), &["v"]))
            .collect();
        let handles: Vec<StreamHandle> = streams
            .iter()
            .map(|s| writer.open(s, dir.path()).unwrap())
            .collect();

        let mut threads = Vec::new();
        for handle in handles.clone() {
            let writer = writer.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..1000i64 {
                    writer
                        .append(&handle, Row::new(0.0, None, vec![FieldValue::Int(i)]))
                        .unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        for handle in &handles {
            writer.close(handle).wait().await.unwrap();
            let contents = std::fs::read_to_string(handle.path()).unwrap();
            let values: Vec<i64> = contents
                .lines()
                .skip(1)
                .map(|l| l.rsplit(';').next().unwrap().parse().unwrap())
                .collect();
            assert_eq!(values, (0..1000).collect::<Vec<_>>());
        }
        assert_eq!(writer.stats().rows_written, 4000);
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, task) = spawn_stream_writer(WriterConfig::default());
        let handle = writer.open(&spec(), dir.path()).unwrap();
        writer
            .append(&handle, Row::new(1.0, Some(0.9), vec![FieldValue::Float(2.5)]))
            .unwrap();

        writer.shutdown().await;
        task.await.unwrap();

        let contents = std::fs::read_to_string(handle.path()).unwrap();
        assert_eq!(contents, "t;x\n1.000;0.900;2.5\n");
        let reopened = StreamHandle {
            closed: Arc::new(AtomicBool::new(false)),
            ..handle
        };
        assert!(matches!(
            writer.append(&reopened, Row::new(0.0, None, Vec::new())),
            Err(WriterError::WorkerUnavailable)
        ));
    }
}
