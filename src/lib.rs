//! # deepsieve — Factor Sieve Engine
//!
//! A single-process engine for long-running factor sieves: a coordinator
//! thread hands contiguous chunks of sieve primes to a pool of CPU (and
//! optionally GPU-dispatching) worker threads, tracks progress under
//! per-worker locks, checkpoints on a wall-clock interval, and supports a
//! mid-run **rebuild** that quiesces every worker so the application can
//! swap its internal term structures without losing sieved progress.
//!
//! The engine knows nothing about the mathematics being performed. A sieve
//! form plugs in through two seams:
//!
//! - [`SieveTask`]: "test this chunk of primes against your terms, report
//!   factors as a side effect, tell me the largest prime you fully tested."
//! - [`primes::PrimeSource`]: "produce the next N ordered work units after X."
//!
//! Two reference tasks ship with the crate: [`kbn::KbnSieve`] (k·b^n ± 1)
//! and [`cullen_woodall::CullenWoodallSieve`] (n·2^n ± 1).

pub mod cell;
pub mod checkpoint;
pub mod config;
pub mod cullen_woodall;
pub mod engine;
pub mod kbn;
pub mod metrics;
pub mod modarith;
pub mod pool;
pub mod primes;
pub mod progress;
pub mod terms;
pub mod worker;

use std::time::Duration;

/// What kind of hardware a worker dispatches to.
///
/// `CpuPrimary` is the fallback worker the pool creates when a GPU run was
/// requested with no ordinary CPU workers: it covers the range below the
/// minimum prime eligible for GPU execution and is retired the moment the
/// high-water mark crosses that minimum.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkerKind {
    CpuPrimary,
    Cpu,
    Gpu,
}

impl WorkerKind {
    pub fn label(self) -> &'static str {
        match self {
            WorkerKind::CpuPrimary => "cpu-primary",
            WorkerKind::Cpu => "cpu",
            WorkerKind::Gpu => "gpu",
        }
    }
}

/// A range of primes inside which workers split their chunk into small
/// batches instead of testing it in one call.
///
/// Purely a throughput concession for tasks whose per-call setup is cheap
/// but whose per-prime work explodes at low primes; correctness does not
/// depend on which mode runs.
#[derive(Clone, Copy, Debug)]
pub struct MiniChunkWindow {
    pub low: u64,
    pub high: u64,
    pub batch: u32,
}

impl MiniChunkWindow {
    /// True when a chunk starting at `first` should run in mini batches.
    pub fn covers(&self, first: u64) -> bool {
        self.low <= first && first <= self.high
    }
}

/// Periodic progress snapshot delivered to [`SieveTask::on_status`].
#[derive(Clone, Debug)]
pub struct StatusReport {
    /// CPU time consumed by all workers, summed across pool generations.
    pub cpu_time: Duration,
    /// Wall time since the run started.
    pub wall_time: Duration,
    /// Largest prime below which every prime is guaranteed fully tested,
    /// accounting for workers still mid-chunk. The only value safe to
    /// checkpoint.
    pub sieved_to_no_gaps: u64,
    /// Largest prime any worker has fully tested.
    pub sieved_to_overall: u64,
    /// Primes tested per second over the current rate window.
    pub primes_per_sec: f64,
    /// Total primes tested since the run started.
    pub primes_tested: u64,
}

/// What the application wants the engine to do next, returned from the
/// periodic status callback.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EngineRequest {
    None,
    /// Persist search state now, outside the regular checkpoint interval.
    Checkpoint,
    /// Quiesce the pool and invoke [`SieveTask::rebuild`].
    Rebuild,
}

/// A sieve form: the mathematical collaborator the engine drives.
///
/// Implementations own their term structures behind their own lock; the
/// engine only coordinates when it is safe to swap them (`rebuild`) or
/// read a consistent snapshot (`checkpoint`). `process_chunk` is called
/// concurrently from every worker thread.
pub trait SieveTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chunk size the engine uses when none was configured.
    fn preferred_chunk_size(&self) -> u32;

    /// Optional range of primes processed in small batches.
    fn mini_chunk_window(&self) -> Option<MiniChunkWindow> {
        None
    }

    /// Whether GPU workers may be pointed at this task. Tasks without a
    /// GPU path reject GPU worker counts at configuration time.
    fn supports_gpu(&self) -> bool {
        false
    }

    /// Test every term against the given ordered, non-overlapping primes.
    /// Factors are reported as a side effect under the task's own lock.
    /// Returns the largest prime fully tested — normally the last element.
    ///
    /// An error here is fatal to the whole process: a single bad chunk
    /// result compromises the correctness of the entire run.
    fn process_chunk(&self, kind: WorkerKind, primes: &[u64]) -> anyhow::Result<u64>;

    /// Persist search state tagged with the gap-aware mark. Runs on the
    /// coordinator thread, concurrently with workers testing chunks.
    fn checkpoint(&self, _sieved_to: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Swap internal term structures. Called only while every worker is
    /// stopped; `sieved_to` carries no gaps. Returns the mark scheduling
    /// resumes from (usually `sieved_to` unchanged).
    fn rebuild(&self, sieved_to: u64) -> anyhow::Result<u64> {
        Ok(sieved_to)
    }

    /// Periodic status callback; the application may request a checkpoint
    /// or a rebuild in response.
    fn on_status(&self, _report: &StatusReport) -> EngineRequest {
        EngineRequest::None
    }

    /// Extra text appended to the engine's status log line.
    fn status_suffix(&self) -> Option<String> {
        None
    }
}
