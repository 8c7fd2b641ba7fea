pub mod buggify;
pub mod observability;
pub mod recording;

pub use recording::{
    FlightRecorder, RecorderConfig, RecorderError, SessionSummary, SinkSet, StreamSpec,
    UploadQueue,
};
