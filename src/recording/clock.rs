//! Clock Abstraction
//!
//! Time for the recorder goes through [`RecorderClock`] so that the
//! pause-aware recording timer and request keys can be driven by virtual
//! time in tests and simulation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timestamp in milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

/// Clock trait for time operations
///
/// Implementations:
/// - `ProductionClock`: real system time
/// - `SimulatedClock`: virtual time advanced explicitly
pub trait RecorderClock: Send + Sync + Clone + 'static {
    fn now(&self) -> Timestamp;

    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }
}

/// Production clock using real system time
#[derive(Clone)]
pub struct ProductionClock {
    start: Instant,
    start_millis: u64,
}

impl Default for ProductionClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductionClock {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        // A clock set before 1970 degrades to a zero epoch rather than failing.
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        ProductionClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl RecorderClock for ProductionClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Timestamp(self.start_millis.saturating_add(elapsed))
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
#[derive(Clone, Default)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.time_ms.store(ms, Ordering::SeqCst);
    }
}

impl RecorderClock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

/// Recording time that only advances while running.
///
/// Accumulated time survives pause/resume; `reset` returns to zero.
#[derive(Debug, Clone, Default)]
pub struct RecordingTimer {
    accumulated: Duration,
    running_since: Option<Timestamp>,
}

impl RecordingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, now: Timestamp) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    pub fn pause(&mut self, now: Timestamp) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_sub(since);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn elapsed(&self, now: Timestamp) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + now.saturating_sub(since),
            None => self.accumulated,
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        self.running_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_clock_advance() {
        let clock = SimulatedClock::new(1000);
        assert_eq!(clock.now(), Timestamp(1000));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), Timestamp(1250));
        assert_eq!(clock.elapsed(Timestamp(1000)), Duration::from_millis(250));
    }

    #[test]
    fn test_production_clock_monotonic() {
        let clock = ProductionClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_timer_accumulates_across_pause() {
        let clock = SimulatedClock::new(0);
        let mut timer = RecordingTimer::new();

        timer.start(clock.now());
        clock.advance(Duration::from_secs(3));
        timer.pause(clock.now());

        clock.advance(Duration::from_secs(60));
        assert_eq!(timer.elapsed(clock.now()), Duration::from_secs(3));

        timer.start(clock.now());
        clock.advance(Duration::from_secs(2));
        assert_eq!(timer.elapsed(clock.now()), Duration::from_secs(5));

        timer.reset();
        assert_eq!(timer.elapsed(clock.now()), Duration::ZERO);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_timer_double_start_keeps_origin() {
        let clock = SimulatedClock::new(0);
        let mut timer = RecordingTimer::new();
        timer.start(clock.now());
        clock.advance(Duration::from_secs(1));
        timer.start(clock.now());
        clock.advance(Duration::from_secs(1));
        assert_eq!(timer.elapsed(clock.now()), Duration::from_secs(2));
    }
}
