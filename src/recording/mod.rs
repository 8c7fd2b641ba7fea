//! Flight Recorder
//!
//! Records sensor streams into rotating, time-bounded iterations. Each
//! finished iteration is packed into a checksummed bundle and queued for
//! delivery to a remote sink; the whole session is mirrored into a live
//! directory exported once when the session is saved.
//!
//! ## Architecture
//!
//! ```text
//! on_value → StreamWriter (actor, one file per stream and iteration)
//!                ↑ handles
//!      IterationManager ──tick──► seal N-2 ──► Archiver ──► UploadQueue ──► sink
//!                                  (close acks)   (pack)     (drain loop)
//! ```
//!
//! ## Key Features
//!
//! - **Two-tick margin**: an iteration is sealed only after its successor
//!   has been replaced, and only once every close is acknowledged
//! - **At-most-once ack**: a queue entry is removed only by the delivery
//!   that succeeded for its current generation
//! - **Deterministic simulation**: simulated clock, sink and reachability

pub mod archive;
pub mod bundle;
pub mod clock;
pub mod config;
pub mod dst;
pub mod iteration;
pub mod object_store;
pub mod ping;
pub mod recorder;
pub mod row;
pub mod session;
pub mod simulated_sink;
pub mod sink;
pub mod timeline;
pub mod upload;
pub mod writer;

pub use archive::{ArchiveError, ArchiveEvent, Archiver};
pub use bundle::{
    pack, unpack, unpack_bytes, BundleEntry, BundleError, BundleHeader, BundleSource,
    Compression, PackProgress, PackedBundle,
};
pub use clock::{ProductionClock, RecorderClock, RecordingTimer, SimulatedClock, Timestamp};
pub use config::{
    BundleConfig, ConfigError, PingConfig, RecorderConfig, RotationConfig, RotationMode,
    SinkConfig, UploadConfig, WriterConfig,
};
pub use iteration::{CancelReport, FinalizeReport, IterationManager, Phase, RotationError};
pub use object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectMeta, ObjectStore};
pub use ping::{PingFix, PingTemplate, Pinger};
pub use recorder::{FlightRecorder, RecorderError, RecorderStatus, SessionSummary};
pub use row::{FieldValue, Row, StreamId, StreamSpec};
pub use session::{Session, SessionId, SessionManifest};
pub use simulated_sink::{
    FlakyReachability, ScriptedReachability, SimulatedSink, SimulatedSinkConfig,
    SimulatedSinkStats,
};
#[cfg(feature = "http")]
pub use sink::HttpSink;
pub use sink::{
    BundleSink, DeliveryError, LogRequestSink, ObjectStoreSink, Reachability, RequestSink,
    StaticReachability, TcpReachability,
};
pub use timeline::{Iteration, IterationId, IterationState, Timeline, TransitionError};
pub use upload::{
    BundleKey, DeliveryKey, DeliveryOutcome, DrainOutcome, DrainReport, RequestKey, SinkSet,
    UploadEvent, UploadQueue, UploadStats,
};
pub use writer::{spawn_stream_writer, CloseAck, StreamHandle, StreamWriter, WriterError, WriterStats};
