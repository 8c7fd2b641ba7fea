//! Flight Recorder daemon
//!
//! Records a set of synthetic sensor streams until interrupted, then saves
//! the session and makes one last delivery attempt.
//!
//! ## Usage
//!
//! ```text
//! flight-recorder [config.toml]
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | FR_ROOT_DIR | recordings/work | Session working directories |
//! | FR_EXPORT_DIR | recordings/export | Bundles and session exports |
//! | FR_ROTATION_INTERVAL_MS | 5000 | Rotation period |
//! | FR_DRAIN_INTERVAL_MS | 1000 | Upload drain period |
//! | FR_UPLOAD_ENABLED | true | Queue iteration bundles |
//! | FR_SINK_URL | - | WebDAV base URL; local store when unset |
//! | FR_SINK_USERNAME / FR_SINK_PASSWORD | - | Basic auth |
//! | FR_PING_URL_TEMPLATE | - | Location ping URL template |
//! | FR_SESSION_TITLE | session id | Export file name |
//! | FR_SAMPLE_RATE_HZ | 50 | Synthetic sample rate |
//! | FR_LOG_LEVEL / FR_LOG_FORMAT | info / pretty | Logging |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use flight_recorder::observability::{init_tracing, TracingConfig};
use flight_recorder::recording::{
    FieldValue, FlightRecorder, LocalFsObjectStore, LogRequestSink, ObjectStoreSink,
    RecorderConfig, SinkSet, StaticReachability, StreamId, StreamSpec, TcpReachability,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_SAMPLE_RATE_HZ: u64 = 50;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = init_tracing(&TracingConfig::from_env()) {
        eprintln!("Logging not initialized: {}", e);
    }

    let config = match std::env::args().nth(1) {
        Some(path) => RecorderConfig::load(&PathBuf::from(path))?,
        None => RecorderConfig::from_env()?,
    };
    let sinks = build_sinks(&config)?;
    let recorder = Arc::new(FlightRecorder::new(config, sinks)?);

    let session = recorder.play(synthetic_streams())?;
    info!("Recording {}; Ctrl-C to stop", session);

    let rate_hz = std::env::var("FR_SAMPLE_RATE_HZ")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|hz| *hz > 0)
        .unwrap_or(DEFAULT_SAMPLE_RATE_HZ);
    let sampler = tokio::spawn(sample_loop(recorder.clone(), rate_hz));

    if let Err(e) = signal::ctrl_c().await {
        error!("Signal handler failed: {}", e);
    }
    sampler.abort();

    let title = std::env::var("FR_SESSION_TITLE").unwrap_or_default();
    match recorder.finalize(&title).await {
        Ok(summary) => info!(
            "Saved {} ({} iterations, {} bytes) to {}",
            summary.session,
            summary.iterations,
            summary.data_size_bytes,
            summary.export.path.display()
        ),
        Err(e) => error!("Saving session failed: {}", e),
    }

    let pending = recorder.queue().len();
    recorder.shutdown().await?;
    if pending > 0 {
        warn!("{} deliveries were pending at shutdown", pending);
    }
    Ok(())
}

fn build_sinks(config: &RecorderConfig) -> Result<SinkSet, Box<dyn std::error::Error>> {
    #[cfg(feature = "http")]
    {
        if let Some(url) = &config.sink.base_url {
            let http = Arc::new(flight_recorder::recording::HttpSink::new(&config.sink)?);
            let probe = config.sink.probe_addr().unwrap_or_default();
            info!("Delivering to {}", url);
            return Ok(SinkSet {
                bundles: http.clone(),
                requests: http,
                reachability: Arc::new(TcpReachability::new(probe, config.sink.probe_timeout)),
            });
        }
    }

    let outbox = config.export_dir.join("outbox");
    info!("No sink URL configured, delivering to {}", outbox.display());
    Ok(SinkSet {
        bundles: Arc::new(ObjectStoreSink::new(Arc::new(LocalFsObjectStore::new(outbox)))),
        requests: Arc::new(LogRequestSink),
        reachability: match config.sink.probe_addr() {
            Some(addr) => Arc::new(TcpReachability::new(addr, config.sink.probe_timeout)),
            None => Arc::new(StaticReachability::new(true)),
        },
    })
}

fn synthetic_streams() -> Vec<StreamSpec> {
    vec![
        StreamSpec::new("accelerometer", &["t_sys", "t_sensor", "x", "y", "z"]),
        StreamSpec::new("gyroscope", &["t_sys", "t_sensor", "x", "y", "z"]),
        StreamSpec::new("location", &["t_sys", "t_sensor", "lat", "lon", "alt"]),
    ]
}

/// Feed sine-shaped samples; location at a tenth of the rate
async fn sample_loop(recorder: Arc<FlightRecorder>, rate_hz: u64) {
    let acc = StreamId::new("accelerometer");
    let gyro = StreamId::new("gyroscope");
    let loc = StreamId::new("location");
    let start = Instant::now();
    let period = Duration::from_millis((1000 / rate_hz).max(1));
    let mut interval = tokio::time::interval(period);
    let mut n: u64 = 0;

    loop {
        interval.tick().await;
        let t = start.elapsed().as_secs_f64();
        let wave = |phase: f64| FieldValue::Float((t + phase).sin());
        recorder.on_value(&acc, t, Some(t), vec![wave(0.0), wave(1.0), wave(2.0)]);
        recorder.on_value(&gyro, t, Some(t), vec![wave(0.5), wave(1.5), wave(2.5)]);
        if n % 10 == 0 {
            let values = vec![
                FieldValue::Float(45.1885 + t.sin() * 1e-4),
                FieldValue::Float(5.7245 + t.cos() * 1e-4),
                FieldValue::Float(212.0),
            ];
            recorder.on_value(&loc, t, Some(t), values);
        }
        n += 1;
    }
}
