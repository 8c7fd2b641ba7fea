//! Fault identifiers
//!
//! Named injection points, grouped by the component that checks them.

/// Remote sink faults
pub mod sink {
    /// Bundle upload rejected by the sink
    pub const UPLOAD_FAIL: &str = "sink.upload_fail";
    /// Bundle upload accepted by the sink but the response was lost
    pub const UPLOAD_LOST_ACK: &str = "sink.upload_lost_ack";
    /// Ping request rejected
    pub const REQUEST_FAIL: &str = "sink.request_fail";
    /// Container creation rejected
    pub const PREPARE_FAIL: &str = "sink.prepare_fail";
    /// Artificial latency before answering
    pub const DELAY: &str = "sink.delay";
}

/// Connectivity faults
pub mod network {
    /// Reachability probe reports the sink as unreachable
    pub const UNREACHABLE: &str = "network.unreachable";
}

/// All fault ids, for reporting
pub const ALL_FAULTS: &[&str] = &[
    sink::UPLOAD_FAIL,
    sink::UPLOAD_LOST_ACK,
    sink::REQUEST_FAIL,
    sink::PREPARE_FAIL,
    sink::DELAY,
    network::UNREACHABLE,
];
