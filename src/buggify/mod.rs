//! BUGGIFY - Seeded Fault Injection
//!
//! Deterministic, reproducible fault injection for the simulated sink and
//! reachability probes. Every decision point in a simulated component asks
//! `buggify!` whether to misbehave; the answer comes from a seeded RNG so a
//! failing seed replays the same fault sequence.
//!
//! # Usage
//!
//! ```ignore
//! use crate::buggify::{faults, BuggifyStats};
//!
//! if buggify!(&mut rng, &mut stats, faults::sink::UPLOAD_FAIL, 0.05) {
//!     return Err(simulated_failure());
//! }
//! ```
//!
//! The RNG and the statistics are owned by the component that injects the
//! fault. Sinks are driven from many tokio worker threads at once, so there
//! is no thread-local context.

pub mod faults;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

/// Statistics tracking for fault injection
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    /// Number of times each fault was checked
    pub checks: HashMap<String, u64>,
    /// Number of times each fault was triggered
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn triggers_for(&self, fault_id: &str) -> u64 {
        self.triggers.get(fault_id).copied().unwrap_or(0)
    }

    pub fn trigger_rate(&self, fault_id: &str) -> f64 {
        let checks = self.checks.get(fault_id).copied().unwrap_or(0);
        let triggers = self.triggers_for(fault_id);
        if checks == 0 {
            0.0
        } else {
            triggers as f64 / checks as f64
        }
    }

    pub fn merge(&mut self, other: &BuggifyStats) {
        for (k, v) in &other.checks {
            *self.checks.entry(k.clone()).or_insert(0) += v;
        }
        for (k, v) in &other.triggers {
            *self.triggers.entry(k.clone()).or_insert(0) += v;
        }
    }

    pub fn summary(&self) -> String {
        let mut lines = vec!["BUGGIFY Statistics:".to_string()];

        let mut sorted_faults: Vec<_> = self.checks.keys().collect();
        sorted_faults.sort();

        for fault_id in sorted_faults {
            let checks = self.checks.get(fault_id).copied().unwrap_or(0);
            let triggers = self.triggers_for(fault_id);
            lines.push(format!(
                "  {}: {}/{} ({:.2}%)",
                fault_id,
                triggers,
                checks,
                self.trigger_rate(fault_id) * 100.0
            ));
        }

        lines.join("\n")
    }
}

/// Seeded RNG used by every simulated component.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Core buggify check - called by the macro
///
/// Returns true if the fault should be injected. A probability of zero never
/// consumes randomness, so disabling a fault does not shift the sequence of
/// the remaining ones.
#[inline]
pub fn should_buggify_with_prob<R: Rng + ?Sized>(
    rng: &mut R,
    stats: &mut BuggifyStats,
    fault_id: &str,
    probability: f64,
) -> bool {
    stats.record_check(fault_id);

    if probability <= 0.0 {
        return false;
    }

    let triggered = rng.gen_bool(probability.clamp(0.0, 1.0));
    if triggered {
        stats.record_trigger(fault_id);
    }
    triggered
}

/// BUGGIFY macro - the main interface for fault injection
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $stats:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $stats, $fault_id, $prob)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_probability_never_triggers() {
        let mut rng = seeded_rng(7);
        let mut stats = BuggifyStats::new();
        for _ in 0..1000 {
            assert!(!buggify!(&mut rng, &mut stats, faults::sink::UPLOAD_FAIL, 0.0));
        }
        assert_eq!(stats.checks[faults::sink::UPLOAD_FAIL], 1000);
        assert_eq!(stats.triggers_for(faults::sink::UPLOAD_FAIL), 0);
    }

    #[test]
    fn test_certain_probability_always_triggers() {
        let mut rng = seeded_rng(7);
        let mut stats = BuggifyStats::new();
        for _ in 0..100 {
            assert!(buggify!(&mut rng, &mut stats, faults::sink::REQUEST_FAIL, 1.0));
        }
        assert_eq!(stats.trigger_rate(faults::sink::REQUEST_FAIL), 1.0);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let run = |seed| {
            let mut rng = seeded_rng(seed);
            let mut stats = BuggifyStats::new();
            (0..200)
                .map(|_| buggify!(&mut rng, &mut stats, faults::sink::UPLOAD_FAIL, 0.3))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_stats_merge() {
        let mut a = BuggifyStats::new();
        a.record_check("x");
        a.record_trigger("x");
        let mut b = BuggifyStats::new();
        b.record_check("x");
        a.merge(&b);
        assert_eq!(a.checks["x"], 2);
        assert!((a.trigger_rate("x") - 0.5).abs() < f64::EPSILON);
        assert!(a.summary().contains("x: 1/2"));
    }
}
