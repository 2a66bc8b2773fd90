//! # Progress — Cross-Worker Progress Aggregation
//!
//! Workers complete chunks out of order, so two different marks describe
//! how far the sieve has come:
//!
//! - **overall**: the largest prime any worker has fully tested. The
//!   optimistic number shown in status lines.
//! - **no-gaps**: the largest prime below which *every* prime is
//!   guaranteed tested. Computed as the minimum `largest_tested` over
//!   workers currently mid-chunk (they are the only ones that can still
//!   owe results below the overall max); when no worker is mid-chunk the
//!   two marks coincide. This is the only value safe to checkpoint.
//!
//! Aggregation visits one worker's stats lock at a time — there is no
//! global lock, so values read from workers visited early may be slightly
//! stale by the end of the pass. That staleness is harmless: a worker's
//! `largest_tested` only grows, so every field of the result remains a
//! valid lower bound.

use crate::pool::WorkerPool;
use crate::worker::{WorkerStats, WorkerStatus};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default)]
pub struct ProgressStats {
    /// Largest prime any worker has fully tested.
    pub largest_tested_overall: u64,
    /// Largest prime with no untested primes below it.
    pub largest_tested_no_gaps: u64,
    /// Primes tested by this pool generation.
    pub primes_tested: u64,
    /// CPU time consumed by this pool generation.
    pub cpu_time: Duration,
    /// Workers currently mid-chunk.
    pub workers_working: usize,
}

/// Aggregate the pool's per-worker counters, one stats lock at a time.
pub fn aggregate(pool: &WorkerPool) -> ProgressStats {
    collect(pool.iter().map(|h| (h.status(), h.stats())))
}

fn collect(workers: impl Iterator<Item = (WorkerStatus, WorkerStats)>) -> ProgressStats {
    let mut out = ProgressStats::default();
    let mut min_in_flight: Option<u64> = None;
    for (status, stats) in workers {
        out.largest_tested_overall = out.largest_tested_overall.max(stats.largest_tested);
        out.primes_tested += stats.primes_tested;
        out.cpu_time += stats.cpu_time;
        if status == WorkerStatus::Working {
            out.workers_working += 1;
            min_in_flight =
                Some(min_in_flight.map_or(stats.largest_tested, |m| m.min(stats.largest_tested)));
        }
    }
    out.largest_tested_no_gaps = min_in_flight.unwrap_or(out.largest_tested_overall);
    out
}

/// Primes-per-second window. Reset on rebuild so a fresh pool generation
/// is not averaged against the old one's history.
pub struct RateWindow {
    since: Instant,
    base: u64,
}

impl RateWindow {
    pub fn start(primes_tested: u64) -> Self {
        RateWindow {
            since: Instant::now(),
            base: primes_tested,
        }
    }

    pub fn reset(&mut self, primes_tested: u64) {
        self.since = Instant::now();
        self.base = primes_tested;
    }

    /// Rate over the window given the current total. Zero while the
    /// window is too young to divide by.
    pub fn per_sec(&self, primes_tested: u64) -> f64 {
        let secs = self.since.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        primes_tested.saturating_sub(self.base) as f64 / secs
    }
}
