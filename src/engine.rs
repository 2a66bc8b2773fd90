//! # Engine — The Coordinator
//!
//! One thread — the caller of [`Engine::run`] — owns the scheduling loop:
//!
//! 1. Service a pending rebuild request, if any.
//! 2. On wall-clock intervals, emit a status report and write a checkpoint
//!    (side effects of the loop, not separate threads).
//! 3. Scan the pool for the first waiting worker (primary, then CPU, then
//!    GPU — GPU skipped while single-threaded or below the GPU-eligible
//!    range), materialize the next chunk from the prime source, and hand
//!    it off under the worker's hand-off guard.
//! 4. Fold the chunk's last unit into the high-water mark. No other thread
//!    ever advances it, which is what makes chunk boundaries strictly
//!    increasing and non-overlapping.
//! 5. While the mark is below the single-worker threshold (or the chunk
//!    went to the primary), block until that worker is idle again before
//!    scheduling more — this keeps the factor-reporting path free of
//!    contention without any global lock.
//!
//! Suspension everywhere is short sleep-polling, not blocking waits:
//! the loop must keep observing external cancellation promptly.
//!
//! ## Rebuild
//!
//! The one operation allowed to move the high-water mark backward. Every
//! worker is driven to `Stopped`; with nobody mid-chunk, the overall max
//! of the per-worker marks carries no gaps, so it is handed to the task's
//! rebuild hook. The old pool is destroyed, the rate window reset, and a
//! fresh generation started from the mark the hook returned.
//!
//! ## Interruption
//!
//! [`EngineHandle::interrupt`] flips the run to `Interrupted`; the loop
//! notices at its next iteration and finishes normally — in-flight chunks
//! complete, and the final checkpoint uses the gap-aware mark. A clean,
//! checkpointed shutdown, not an error.

use crate::cell::{Flag, StateCell, StatusBits};
use crate::config::EngineConfig;
use crate::metrics;
use crate::pool::WorkerPool;
use crate::primes::PrimeSource;
use crate::progress::{aggregate, RateWindow};
use crate::worker::WorkerStatus;
use crate::{EngineRequest, SieveTask, StatusReport, WorkerKind};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunStatus {
    /// Pool being built or rebuilt; workers hold in place.
    Initializing,
    Running,
    /// Externally cancelled; workers drain and the run finishes cleanly.
    Interrupted,
    Finished,
}

impl StatusBits for RunStatus {
    fn to_bits(self) -> u8 {
        match self {
            RunStatus::Initializing => 0,
            RunStatus::Running => 1,
            RunStatus::Interrupted => 2,
            RunStatus::Finished => 3,
        }
    }
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => RunStatus::Initializing,
            1 => RunStatus::Running,
            2 => RunStatus::Interrupted,
            _ => RunStatus::Finished,
        }
    }
}

/// State shared between the coordinator, the workers, and every
/// [`EngineHandle`].
pub struct EngineShared {
    run_status: StateCell<RunStatus>,
    rebuild: Flag,
    checkpoint: Flag,
}

impl EngineShared {
    pub fn new() -> Self {
        EngineShared {
            run_status: StateCell::new(RunStatus::Initializing),
            rebuild: Flag::new(),
            checkpoint: Flag::new(),
        }
    }

    pub fn run_status(&self) -> RunStatus {
        self.run_status.get()
    }

    pub fn is_running(&self) -> bool {
        self.run_status.is(RunStatus::Running)
    }

    /// True once the run can never return to `Running`.
    pub fn run_over(&self) -> bool {
        matches!(
            self.run_status.get(),
            RunStatus::Interrupted | RunStatus::Finished
        )
    }

    #[cfg(test)]
    pub(crate) fn set_run_status(&self, status: RunStatus) {
        self.run_status.set(status);
    }
}

impl Default for EngineShared {
    fn default() -> Self {
        EngineShared::new()
    }
}

/// Cloneable external control surface: interrupt, rebuild and checkpoint
/// requests from signal handlers or the application.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Cancel the run. In-flight chunks complete; the final checkpoint
    /// uses the gap-aware mark. Idempotent; a no-op once finished.
    pub fn interrupt(&self) {
        let _ = self
            .shared
            .run_status
            .transition(RunStatus::Running, RunStatus::Interrupted)
            || self
                .shared
                .run_status
                .transition(RunStatus::Initializing, RunStatus::Interrupted);
    }

    /// Ask the scheduling loop to quiesce the pool and invoke the task's
    /// rebuild hook at its next iteration.
    pub fn request_rebuild(&self) {
        self.shared.rebuild.raise();
    }

    /// Ask for a checkpoint write outside the regular interval.
    pub fn request_checkpoint(&self) {
        self.shared.checkpoint.raise();
    }

    pub fn run_status(&self) -> RunStatus {
        self.shared.run_status()
    }
}

/// Aggregate result of a completed (or interrupted) run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SieveSummary {
    pub run_status: RunStatus,
    /// Largest prime fully tested. With every worker stopped this carries
    /// no gaps.
    pub largest_tested: u64,
    pub primes_tested: u64,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub chunks_assigned: u64,
    pub rebuilds: u64,
}

pub struct Engine {
    config: EngineConfig,
    task: Arc<dyn SieveTask>,
    source: Box<dyn PrimeSource>,
    shared: Arc<EngineShared>,
    pool: Option<WorkerPool>,
    /// The high-water mark: last unit handed to any worker. Owned by the
    /// scheduling loop; moves backward only inside `rebuild_pool`.
    largest_assigned: u64,
    chunk_size: u32,
    /// Floor under every reported mark: the point this pool generation
    /// resumed from (fresh workers report 0 until their first batch).
    generation_floor: u64,
    /// Counters folded in from destroyed pool generations.
    carried_primes: u64,
    carried_cpu: Duration,
    chunks_assigned: u64,
    rebuilds: u64,
    started: Instant,
    rate: RateWindow,
    last_status: Instant,
    last_checkpoint: Instant,
    ran: bool,
    final_summary: Option<SieveSummary>,
    hardware: Option<sysinfo::System>,
}

impl Engine {
    /// Validate the configuration and pair it with a task and a unit
    /// source. Fails before any worker thread exists.
    pub fn new(
        config: EngineConfig,
        task: Arc<dyn SieveTask>,
        source: Box<dyn PrimeSource>,
    ) -> Result<Engine> {
        config.validate()?;
        if config.gpu_workers > 0 && !task.supports_gpu() {
            bail!(
                "task '{}' has no GPU path; gpu workers must be 0",
                task.name()
            );
        }
        let chunk_size = if config.chunk_size > 0 {
            config.chunk_size
        } else {
            task.preferred_chunk_size()
        };
        if chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        let hardware = config.report_hardware.then(sysinfo::System::new_all);
        let now = Instant::now();
        Ok(Engine {
            largest_assigned: config.min_prime - 1,
            generation_floor: config.min_prime - 1,
            config,
            task,
            source,
            shared: Arc::new(EngineShared::new()),
            pool: None,
            chunk_size,
            carried_primes: 0,
            carried_cpu: Duration::ZERO,
            chunks_assigned: 0,
            rebuilds: 0,
            started: now,
            rate: RateWindow::start(0),
            last_status: now,
            last_checkpoint: now,
            ran: false,
            final_summary: None,
            hardware,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run the sieve to completion (or interruption) and return the final
    /// aggregate statistics.
    pub fn run(&mut self) -> Result<SieveSummary> {
        if self.final_summary.is_some() {
            bail!("engine already ran to completion");
        }
        self.ran = true;
        let start_mark = self.config.min_prime - 1;
        self.largest_assigned = start_mark;
        self.generation_floor = start_mark;

        // Staged start: every worker reaches WaitingForWork before the
        // run goes live.
        self.pool = Some(WorkerPool::build(
            &self.config,
            &self.shared,
            &self.task,
            start_mark,
        )?);
        self.started = Instant::now();
        self.rate = RateWindow::start(0);
        self.last_status = self.started;
        self.last_checkpoint = self.started;
        self.shared
            .run_status
            .transition(RunStatus::Initializing, RunStatus::Running);
        info!(
            task = self.task.name(),
            min_prime = self.config.min_prime,
            max_prime = self.config.max_prime,
            chunk_size = self.chunk_size,
            "sieve started"
        );

        while self.shared.is_running() && self.largest_assigned < self.config.max_prime {
            if self.shared.rebuild.take() {
                self.rebuild_pool()?;
                continue;
            }
            self.periodic_duties()?;
            if self.shared.rebuild.is_raised() {
                // A status callback just asked for a rebuild; service it
                // before handing out another chunk.
                continue;
            }

            let single_threaded = self.largest_assigned < self.config.single_worker_threshold;
            let gpu_eligible = self.largest_assigned >= self.config.gpu_min_prime;

            let Some((worker_id, kind, provisional)) =
                self.try_handoff(single_threaded, gpu_eligible)?
            else {
                // Transient: every eligible worker is busy, or the range
                // just ran out of units. Not an error.
                thread::sleep(self.config.poll_interval);
                continue;
            };
            self.largest_assigned = provisional;
            self.chunks_assigned += 1;

            if kind == WorkerKind::CpuPrimary || single_threaded {
                self.wait_worker_idle(worker_id);
            }
            if self.pool.as_ref().is_some_and(WorkerPool::has_primary)
                && self.largest_assigned >= self.config.gpu_min_prime
            {
                // The range the primary existed to cover is done.
                self.pool.as_mut().unwrap().retire_primary(&self.config)?;
            }
        }

        self.finish()
    }

    /// Select a waiting worker and hand it the next chunk. `None` when no
    /// worker is available right now or no units remain below the cap.
    fn try_handoff(
        &mut self,
        single_threaded: bool,
        gpu_eligible: bool,
    ) -> Result<Option<(usize, WorkerKind, u64)>> {
        let pool = self.pool.as_ref().unwrap();
        let Some(handoff) = pool.select_for_handoff(single_threaded, gpu_eligible) else {
            return Ok(None);
        };

        let mut units = self.source.next_units(self.largest_assigned, self.chunk_size);
        if units.is_empty() {
            bail!(
                "work-unit source produced nothing after {}",
                self.largest_assigned
            );
        }
        // Cap the chunk at the end of the range.
        units.truncate(units.partition_point(|&u| u <= self.config.max_prime));
        if units.is_empty() {
            // Every remaining unit lies above the cap: the range is done.
            drop(handoff);
            self.largest_assigned = self.config.max_prime;
            return Ok(None);
        }

        let worker_id = handoff.worker_id;
        let kind = handoff.kind;
        let provisional = handoff.guard.assign(units);
        Ok(Some((worker_id, kind, provisional)))
    }

    /// Block (sleep-poll) until the given worker has left `Working` —
    /// the single-worker gate below the threshold.
    fn wait_worker_idle(&self, worker_id: usize) {
        let pool = self.pool.as_ref().unwrap();
        if let Some(handle) = pool.by_id(worker_id) {
            while handle.status() == WorkerStatus::Working {
                thread::sleep(self.config.poll_interval);
            }
        }
    }

    /// Time-based status reporting and checkpointing, both side effects
    /// of the scheduling loop.
    fn periodic_duties(&mut self) -> Result<()> {
        let mut checkpoint_due = self.shared.checkpoint.take();

        if self.last_status.elapsed() >= self.config.status_interval {
            self.last_status = Instant::now();
            let report = self.status_report();
            self.log_status(&report);
            match self.task.on_status(&report) {
                EngineRequest::None => {}
                EngineRequest::Checkpoint => checkpoint_due = true,
                EngineRequest::Rebuild => self.shared.rebuild.raise(),
            }
        }

        if checkpoint_due || self.last_checkpoint.elapsed() >= self.config.checkpoint_interval {
            self.last_checkpoint = Instant::now();
            let progress = aggregate(self.pool.as_ref().unwrap());
            let mark = progress.largest_tested_no_gaps.max(self.generation_floor);
            self.task.checkpoint(mark).context("checkpoint failed")?;
        }
        Ok(())
    }

    fn status_report(&self) -> StatusReport {
        let progress = aggregate(self.pool.as_ref().unwrap());
        let primes_tested = self.carried_primes + progress.primes_tested;
        StatusReport {
            cpu_time: self.carried_cpu + progress.cpu_time,
            wall_time: self.started.elapsed(),
            sieved_to_no_gaps: progress.largest_tested_no_gaps.max(self.generation_floor),
            sieved_to_overall: progress.largest_tested_overall.max(self.generation_floor),
            primes_per_sec: self.rate.per_sec(primes_tested),
            primes_tested,
        }
    }

    fn log_status(&mut self, report: &StatusReport) {
        let suffix = self.task.status_suffix().unwrap_or_default();
        info!(
            sieved_to = report.sieved_to_no_gaps,
            tested = report.primes_tested,
            rate = format_args!("{:.0}/s", report.primes_per_sec),
            cpu = format_args!("{:.1}s", report.cpu_time.as_secs_f64()),
            extra = %suffix,
            "sieve progress"
        );
        if let Some(sys) = &mut self.hardware {
            let hw = metrics::snapshot(sys);
            info!(
                cpu_usage = format_args!("{:.1}%", hw.cpu_usage_percent),
                mem_used_gb = hw.memory_used_gb,
                load_1m = hw.load_avg_1m,
                "hardware"
            );
        }
    }

    /// Quiesce, let the task swap its structures, and restart a fresh
    /// pool generation. The only place the high-water mark moves down.
    fn rebuild_pool(&mut self) -> Result<()> {
        info!("rebuild requested; quiescing worker pool");
        self.shared
            .run_status
            .transition(RunStatus::Running, RunStatus::Initializing);

        let mut pool = self.pool.take().unwrap();
        pool.request_stop_all();
        pool.wait_all_stopped(&self.config)?;

        // Every worker is stopped, so the overall max carries no gaps.
        let progress = aggregate(&pool);
        let high_water = progress.largest_tested_overall.max(self.generation_floor);
        self.carried_primes += progress.primes_tested;
        self.carried_cpu += progress.cpu_time;

        let resume = self
            .task
            .rebuild(high_water)
            .context("rebuild hook failed")?;
        pool.teardown();

        self.largest_assigned = resume;
        self.generation_floor = resume;
        self.rebuilds += 1;
        self.rate.reset(self.carried_primes);

        if self.shared.run_over() {
            // Interrupted while quiescing: the old generation is already
            // folded into the carried counters, no new pool is needed.
            info!("interrupted during rebuild; pool not restarted");
            return Ok(());
        }

        self.pool = Some(WorkerPool::build(
            &self.config,
            &self.shared,
            &self.task,
            resume,
        )?);
        // Resume — unless an interrupt arrived while we were rebuilding,
        // in which case the loop will observe it and finish.
        self.shared
            .run_status
            .transition(RunStatus::Initializing, RunStatus::Running);
        info!(resume_from = resume, "rebuild complete; pool restarted");
        Ok(())
    }

    /// Stop every worker, write the final checkpoint, aggregate, tear the
    /// pool down. Idempotent: calling it again on an already-stopped pool
    /// returns the identical summary and does nothing else.
    pub fn finish(&mut self) -> Result<SieveSummary> {
        if let Some(summary) = self.final_summary {
            return Ok(summary);
        }
        if !self.ran {
            bail!("finish called before the run started");
        }
        let Some(pool) = self.pool.as_mut() else {
            // Interrupted during a rebuild: every worker of the old
            // generation already stopped and was folded into the carried
            // counters.
            self.task
                .checkpoint(self.generation_floor)
                .context("final checkpoint failed")?;
            let summary = SieveSummary {
                run_status: self.shared.run_status(),
                largest_tested: self.generation_floor,
                primes_tested: self.carried_primes,
                cpu_time: self.carried_cpu,
                wall_time: self.started.elapsed(),
                chunks_assigned: self.chunks_assigned,
                rebuilds: self.rebuilds,
            };
            self.final_summary = Some(summary);
            return Ok(summary);
        };

        self.shared
            .run_status
            .transition(RunStatus::Running, RunStatus::Finished);
        pool.wait_all_stopped(&self.config)?;

        let progress = aggregate(pool);
        let largest_tested = progress.largest_tested_overall.max(self.generation_floor);
        let primes_tested = self.carried_primes + progress.primes_tested;
        let cpu_time = self.carried_cpu + progress.cpu_time;

        // All workers stopped: the gap-aware mark and the overall max
        // coincide, and this is the conservative value we persist.
        self.task
            .checkpoint(largest_tested)
            .context("final checkpoint failed")?;

        let mut pool = self.pool.take().unwrap();
        pool.teardown();

        let run_status = self.shared.run_status();
        let summary = SieveSummary {
            run_status,
            largest_tested,
            primes_tested,
            cpu_time,
            wall_time: self.started.elapsed(),
            chunks_assigned: self.chunks_assigned,
            rebuilds: self.rebuilds,
        };
        match run_status {
            RunStatus::Interrupted => info!(
                sieved_to = largest_tested,
                tested = primes_tested,
                "sieve interrupted; progress checkpointed"
            ),
            _ => info!(
                sieved_to = largest_tested,
                tested = primes_tested,
                chunks = self.chunks_assigned,
                "sieve finished"
            ),
        }
        self.final_summary = Some(summary);
        Ok(summary)
    }
}
