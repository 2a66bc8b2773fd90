//! # Worker — One Sieving Thread and Its Hand-Off Protocol
//!
//! Each worker is one OS thread driving the shared [`SieveTask`] over the
//! chunks the coordinator hands it. The life of a worker is a small state
//! machine:
//!
//! ```text
//! Uninitialized ──setup──▶ WaitingForWork ◀─────────────┐
//!                              │   ▲                    │
//!                   chunk assigned  └── chunk finished ──┘
//!                              ▼
//!                           Working
//!
//! WaitingForWork ──run leaves Running, or stop requested──▶ Stopped (terminal)
//! ```
//!
//! ## Hand-off
//!
//! The coordinator may only write a worker's chunk slot while holding the
//! slot mutex with the worker observed in `WaitingForWork`. That pairing is
//! expressed as [`HandoffGuard`]: `try_acquire_for_handoff()` returns the
//! guard only when the hand-off is legal, and `assign()` consumes it —
//! storing the chunk, flipping the status to `Working`, and releasing the
//! lock. There is no way to mutate the slot without the guard.
//!
//! ## Counters
//!
//! `WorkerStats` is written exclusively by the owning thread and read by
//! other threads only through the stats mutex. The worker updates
//! `largest_tested` and `primes_tested` after every task call (so a chunk
//! split into mini batches advances them mid-chunk), and `cpu_time` once
//! per chunk from the thread CPU clock.
//!
//! ## Failure
//!
//! A task error is fatal to the whole process: a single bad chunk result
//! compromises the run, and there is no recovery path that preserves the
//! no-gaps guarantee.

use crate::cell::{Flag, StateCell, StatusBits};
use crate::engine::EngineShared;
use crate::{MiniChunkWindow, SieveTask, WorkerKind};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkerStatus {
    Uninitialized,
    WaitingForWork,
    Working,
    /// Terminal. A stopped worker is never reused; the pool is destroyed
    /// and recreated for a new generation.
    Stopped,
}

impl StatusBits for WorkerStatus {
    fn to_bits(self) -> u8 {
        match self {
            WorkerStatus::Uninitialized => 0,
            WorkerStatus::WaitingForWork => 1,
            WorkerStatus::Working => 2,
            WorkerStatus::Stopped => 3,
        }
    }
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => WorkerStatus::Uninitialized,
            1 => WorkerStatus::WaitingForWork,
            2 => WorkerStatus::Working,
            _ => WorkerStatus::Stopped,
        }
    }
}

/// Per-worker progress counters. Written only by the owning thread; read
/// by other threads only via [`WorkerHandle::stats`] (which locks).
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerStats {
    /// Largest prime this worker has fully tested. Monotonic while the
    /// worker is alive.
    pub largest_tested: u64,
    /// Primes tested by this worker.
    pub primes_tested: u64,
    /// Thread CPU time spent inside the task.
    pub cpu_time: Duration,
}

/// The chunk hand-off slot. Mutated only through a [`HandoffGuard`];
/// drained only by the owning worker thread.
#[derive(Default)]
struct ChunkSlot {
    primes: Vec<u64>,
}

/// State shared between a worker thread and the coordinator.
struct WorkerShared {
    id: usize,
    kind: WorkerKind,
    status: StateCell<WorkerStatus>,
    stop: Flag,
    stats: Mutex<WorkerStats>,
    slot: Mutex<ChunkSlot>,
}

/// Coordinator-side handle to one worker.
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker thread. The worker advertises `WaitingForWork`
    /// once its setup completes; pool construction waits for that.
    pub(crate) fn spawn(
        id: usize,
        kind: WorkerKind,
        engine: Arc<EngineShared>,
        task: Arc<dyn SieveTask>,
        poll: Duration,
    ) -> Result<WorkerHandle> {
        let shared = Arc::new(WorkerShared {
            id,
            kind,
            status: StateCell::new(WorkerStatus::Uninitialized),
            stop: Flag::new(),
            stats: Mutex::new(WorkerStats::default()),
            slot: Mutex::new(ChunkSlot::default()),
        });
        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(format!("sieve-{}-{}", kind.label(), id))
            .spawn(move || worker_main(thread_shared, engine, task, poll))
            .with_context(|| format!("spawning worker {}", id))?;
        Ok(WorkerHandle {
            shared,
            join: Some(join),
        })
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.shared.kind
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.status.get()
    }

    /// Snapshot of the worker's counters, taken under its stats lock.
    pub fn stats(&self) -> WorkerStats {
        *self.shared.stats.lock().unwrap()
    }

    /// Begin a hand-off: returns the guard only when the worker is
    /// waiting for work and not stop-requested. While the guard lives,
    /// the worker cannot observe a half-written chunk.
    pub fn try_acquire_for_handoff(&self) -> Option<HandoffGuard<'_>> {
        let slot = self.shared.slot.lock().unwrap();
        if self.shared.status.is(WorkerStatus::WaitingForWork) && !self.shared.stop.is_raised() {
            Some(HandoffGuard {
                shared: &self.shared,
                slot,
            })
        } else {
            None
        }
    }

    /// Ask this worker (alone) to stop at its next idle check. Used to
    /// retire the primary fallback worker while the run continues.
    pub fn request_stop(&self) {
        self.shared.stop.raise();
    }

    /// Join the thread and release worker-owned resources. Must only be
    /// called once the worker is `Stopped`.
    pub(crate) fn teardown(&mut self) {
        debug_assert_eq!(self.status(), WorkerStatus::Stopped);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.shared.slot.lock().unwrap().primes = Vec::new();
    }
}

/// Exclusive permission to assign one chunk to one waiting worker.
///
/// Holds the worker's slot mutex; dropping it without `assign` leaves the
/// worker waiting, unchanged.
pub struct HandoffGuard<'a> {
    shared: &'a WorkerShared,
    slot: MutexGuard<'a, ChunkSlot>,
}

impl HandoffGuard<'_> {
    /// Store the chunk and release the worker into `Working`. Returns the
    /// provisional largest unit of the chunk (its last element), which the
    /// scheduling loop folds into the high-water mark.
    pub fn assign(mut self, primes: Vec<u64>) -> u64 {
        debug_assert!(!primes.is_empty(), "empty chunk hand-off");
        debug_assert!(primes.windows(2).all(|w| w[0] < w[1]));
        let provisional = *primes.last().unwrap();
        self.slot.primes = primes;
        // Status flips while the slot lock is still held; the worker can
        // only observe Working together with the complete chunk.
        self.shared.status.set(WorkerStatus::Working);
        provisional
    }
}

/// The worker thread body.
fn worker_main(
    shared: Arc<WorkerShared>,
    engine: Arc<EngineShared>,
    task: Arc<dyn SieveTask>,
    poll: Duration,
) {
    let mini = task.mini_chunk_window();
    shared.status.set(WorkerStatus::WaitingForWork);
    debug!(worker = shared.id, kind = shared.kind.label(), "worker ready");

    loop {
        match shared.status.get() {
            WorkerStatus::WaitingForWork => {
                // Holds through Initializing (staged start, rebuild); only a
                // run that is over — or an individual retirement — stops it.
                if engine.run_over() || shared.stop.is_raised() {
                    shared.status.set(WorkerStatus::Stopped);
                    break;
                }
                thread::sleep(poll);
            }
            WorkerStatus::Working => {
                let primes = {
                    let mut slot = shared.slot.lock().unwrap();
                    std::mem::take(&mut slot.primes)
                };
                let cpu_start = thread_cpu_now();
                if let Err(err) = run_chunk(&shared, task.as_ref(), mini, &primes) {
                    error!(
                        worker = shared.id,
                        error = format_args!("{:#}", err),
                        "sieve task failed; aborting run"
                    );
                    std::process::exit(2);
                }
                let spent = thread_cpu_now().saturating_sub(cpu_start);
                shared.stats.lock().unwrap().cpu_time += spent;
                shared.status.set(WorkerStatus::WaitingForWork);
            }
            WorkerStatus::Stopped => break,
            WorkerStatus::Uninitialized => thread::sleep(poll),
        }
    }
    debug!(worker = shared.id, "worker stopped");
}

/// Run one chunk through the task, in mega or mini batches, advancing the
/// stats after every task call so aggregation sees mid-chunk progress.
fn run_chunk(
    shared: &WorkerShared,
    task: &dyn SieveTask,
    mini: Option<MiniChunkWindow>,
    primes: &[u64],
) -> Result<()> {
    if primes.is_empty() {
        return Ok(());
    }
    let batch_len = match mini {
        Some(w) if w.covers(primes[0]) && w.batch > 0 => w.batch as usize,
        _ => primes.len(),
    };
    for batch in primes.chunks(batch_len) {
        let largest = task.process_chunk(shared.kind, batch)?;
        let mut stats = shared.stats.lock().unwrap();
        stats.largest_tested = stats.largest_tested.max(largest);
        stats.primes_tested += batch.len() as u64;
    }
    Ok(())
}

/// CPU time consumed by the calling thread.
#[cfg(unix)]
fn thread_cpu_now() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc == 0 {
        Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    } else {
        Duration::ZERO
    }
}

/// Off Unix there is no portable thread CPU clock; fall back to a
/// monotonic wall clock, which over-counts only while the thread is
/// preempted.
#[cfg(not(unix))]
fn thread_cpu_now() -> Duration {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed()
}
