//! # Pool — Worker Pool Construction, Selection and Teardown
//!
//! The pool owns every [`WorkerHandle`] of one generation. The coordinator
//! thread is its only user; a worker is touched from outside its own
//! thread solely through the handle's lock-guarded accessors.
//!
//! ## Composition
//!
//! - Ordinary CPU workers, then GPU workers, ids 1..N in scan order.
//! - When both requested counts are zero, exactly one fallback CPU worker
//!   is created — a pool with no workers cannot make progress and is a
//!   configuration accident, not a valid run.
//! - The **primary fallback worker** (id 0, kind `CpuPrimary`) exists only
//!   when no ordinary CPU workers were requested, GPU workers were, and
//!   the generation starts below the GPU-eligible minimum: someone has to
//!   cover the low range the GPU cannot. It is retired the moment the
//!   high-water mark crosses that minimum.
//!
//! ## Staged start
//!
//! `build` returns only once every spawned worker has finished its setup
//! and advertises `WaitingForWork`. A generation is never half-ready.
//!
//! ## Shutdown
//!
//! Workers drain to `Stopped` on their own once the run status leaves
//! `Running` (or their individual stop flag is raised). `wait_all_stopped`
//! bounds that wait; exceeding it means a worker is wedged inside the
//! task, which is fatal — the diagnostic names the stuck worker count.

use crate::config::EngineConfig;
use crate::engine::EngineShared;
use crate::worker::{HandoffGuard, WorkerHandle, WorkerStatus};
use crate::{SieveTask, WorkerKind};
use anyhow::{bail, Result};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::info;

pub struct WorkerPool {
    primary: Option<WorkerHandle>,
    workers: Vec<WorkerHandle>,
}

/// A selected worker, hand-off lock held. Dropping it without assigning
/// releases the worker unchanged.
pub struct Handoff<'a> {
    pub worker_id: usize,
    pub kind: WorkerKind,
    pub guard: HandoffGuard<'a>,
}

impl WorkerPool {
    /// Spawn one generation of workers starting at `start_mark` and wait
    /// for all of them to reach `WaitingForWork`.
    pub(crate) fn build(
        config: &EngineConfig,
        engine: &Arc<EngineShared>,
        task: &Arc<dyn SieveTask>,
        start_mark: u64,
    ) -> Result<WorkerPool> {
        let mut cpu = config.cpu_workers;
        let gpu = config.gpu_workers;
        if cpu == 0 && gpu == 0 {
            // A run with no workers was requested; cover it with one
            // fallback CPU worker.
            cpu = 1;
        }
        let with_primary =
            config.cpu_workers == 0 && gpu > 0 && start_mark < config.gpu_min_prime;

        let primary = if with_primary {
            Some(WorkerHandle::spawn(
                0,
                WorkerKind::CpuPrimary,
                Arc::clone(engine),
                Arc::clone(task),
                config.poll_interval,
            )?)
        } else {
            None
        };

        let mut workers = Vec::with_capacity(cpu + gpu);
        let mut next_id = 1;
        for _ in 0..cpu {
            workers.push(WorkerHandle::spawn(
                next_id,
                WorkerKind::Cpu,
                Arc::clone(engine),
                Arc::clone(task),
                config.poll_interval,
            )?);
            next_id += 1;
        }
        for _ in 0..gpu {
            workers.push(WorkerHandle::spawn(
                next_id,
                WorkerKind::Gpu,
                Arc::clone(engine),
                Arc::clone(task),
                config.poll_interval,
            )?);
            next_id += 1;
        }

        let pool = WorkerPool { primary, workers };
        pool.wait_all_ready(config)?;
        info!(
            cpu,
            gpu,
            primary = with_primary,
            start_mark,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Workers in scan order: primary first, then CPU, then GPU.
    pub fn iter(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.primary.iter().chain(self.workers.iter())
    }

    pub fn len(&self) -> usize {
        self.workers.len() + usize::from(self.primary.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// First waiting worker in scan order, hand-off lock held. GPU workers
    /// are skipped while the run is single-threaded or still below the
    /// GPU-eligible range.
    pub fn select_for_handoff(
        &self,
        single_threaded: bool,
        gpu_eligible: bool,
    ) -> Option<Handoff<'_>> {
        for h in self.iter() {
            if h.kind() == WorkerKind::Gpu && (single_threaded || !gpu_eligible) {
                continue;
            }
            if let Some(guard) = h.try_acquire_for_handoff() {
                return Some(Handoff {
                    worker_id: h.id(),
                    kind: h.kind(),
                    guard,
                });
            }
        }
        None
    }

    /// Handle lookup by worker id (scan order is not id order once the
    /// primary is gone, so resolve explicitly).
    pub fn by_id(&self, worker_id: usize) -> Option<&WorkerHandle> {
        self.iter().find(|h| h.id() == worker_id)
    }

    /// Ask every worker to stop at its next idle check.
    pub fn request_stop_all(&self) {
        for h in self.iter() {
            h.request_stop();
        }
    }

    /// Block until every worker is `Stopped`. Exceeding the shutdown
    /// timeout is fatal: a worker wedged inside the task cannot be
    /// recovered and the run's no-gaps guarantee is void.
    pub fn wait_all_stopped(&self, config: &EngineConfig) -> Result<()> {
        let deadline = Instant::now() + config.shutdown_timeout;
        loop {
            let stuck = self
                .iter()
                .filter(|h| h.status() != WorkerStatus::Stopped)
                .count();
            if stuck == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "{} worker(s) failed to stop within {:?}; run is wedged",
                    stuck,
                    config.shutdown_timeout
                );
            }
            thread::sleep(config.poll_interval);
        }
    }

    /// Block until every worker has finished setup. A worker that went
    /// straight to `Stopped` counts as done: that only happens when the
    /// run was interrupted during construction, and the scheduling loop
    /// will observe the interruption itself.
    fn wait_all_ready(&self, config: &EngineConfig) -> Result<()> {
        let deadline = Instant::now() + config.startup_timeout;
        loop {
            let pending = self
                .iter()
                .filter(|h| {
                    !matches!(
                        h.status(),
                        WorkerStatus::WaitingForWork | WorkerStatus::Stopped
                    )
                })
                .count();
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!(
                    "{} worker(s) failed to initialize within {:?}",
                    pending,
                    config.startup_timeout
                );
            }
            thread::sleep(config.poll_interval);
        }
    }

    /// Retire the primary fallback worker: stop it, join it, drop it. The
    /// rest of the pool keeps running.
    pub fn retire_primary(&mut self, config: &EngineConfig) -> Result<()> {
        let Some(primary) = &self.primary else {
            return Ok(());
        };
        primary.request_stop();
        let deadline = Instant::now() + config.shutdown_timeout;
        while primary.status() != WorkerStatus::Stopped {
            if Instant::now() >= deadline {
                bail!(
                    "primary worker failed to stop within {:?}",
                    config.shutdown_timeout
                );
            }
            thread::sleep(config.poll_interval);
        }
        let mut primary = self.primary.take().unwrap();
        primary.teardown();
        info!("primary fallback worker retired");
        Ok(())
    }

    /// Join every thread and free worker resources. Only legal once all
    /// workers are `Stopped`.
    pub(crate) fn teardown(&mut self) {
        if let Some(mut p) = self.primary.take() {
            p.teardown();
        }
        for mut w in self.workers.drain(..) {
            w.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    //! Pool composition and selection tests.
    //!
    //! Composition rules are pure functions of the config and the start
    //! mark, but they only become observable through a built pool, so
    //! these tests spin real (idle) worker threads with a no-op task and
    //! tear them down immediately.

    use super::*;
    use crate::engine::RunStatus;
    use std::time::Duration;

    struct NoopTask;
    impl SieveTask for NoopTask {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn preferred_chunk_size(&self) -> u32 {
            10
        }
        fn supports_gpu(&self) -> bool {
            true
        }
        fn process_chunk(&self, _kind: WorkerKind, primes: &[u64]) -> Result<u64> {
            Ok(*primes.last().unwrap())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_micros(200),
            startup_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn build_pool(config: &EngineConfig, start_mark: u64) -> (WorkerPool, Arc<EngineShared>) {
        let engine = Arc::new(EngineShared::new());
        engine.set_run_status(RunStatus::Running);
        let task: Arc<dyn SieveTask> = Arc::new(NoopTask);
        let pool = WorkerPool::build(config, &engine, &task, start_mark).unwrap();
        (pool, engine)
    }

    fn stop_pool(pool: &mut WorkerPool, engine: &EngineShared, config: &EngineConfig) {
        engine.set_run_status(RunStatus::Finished);
        pool.wait_all_stopped(config).unwrap();
        pool.teardown();
    }

    // ── Composition ─────────────────────────────────────────────────

    /// Zero workers of both kinds auto-creates exactly one fallback CPU
    /// worker.
    #[test]
    fn zero_workers_creates_one_fallback() {
        let config = EngineConfig {
            cpu_workers: 0,
            gpu_workers: 0,
            ..test_config()
        };
        let (mut pool, engine) = build_pool(&config, 0);
        assert_eq!(pool.len(), 1);
        assert!(!pool.has_primary());
        let kinds: Vec<_> = pool.iter().map(|h| h.kind()).collect();
        assert_eq!(kinds, vec![WorkerKind::Cpu]);
        stop_pool(&mut pool, &engine, &config);
    }

    /// A GPU-only run starting below the GPU minimum gets the primary
    /// fallback worker (id 0) in front of the GPU workers.
    #[test]
    fn gpu_only_run_below_threshold_gets_primary() {
        let config = EngineConfig {
            cpu_workers: 0,
            gpu_workers: 2,
            gpu_min_prime: 1000,
            ..test_config()
        };
        let (mut pool, engine) = build_pool(&config, 1); // below 1000
        assert_eq!(pool.len(), 3);
        assert!(pool.has_primary());
        let order: Vec<_> = pool.iter().map(|h| (h.id(), h.kind())).collect();
        assert_eq!(
            order,
            vec![
                (0, WorkerKind::CpuPrimary),
                (1, WorkerKind::Gpu),
                (2, WorkerKind::Gpu)
            ]
        );
        stop_pool(&mut pool, &engine, &config);
    }

    /// The primary is not created when the generation already starts at
    /// or above the GPU minimum, nor when ordinary CPU workers exist.
    #[test]
    fn primary_absent_when_not_needed() {
        let config = EngineConfig {
            cpu_workers: 0,
            gpu_workers: 1,
            gpu_min_prime: 1000,
            ..test_config()
        };
        let (mut pool, engine) = build_pool(&config, 1000); // at threshold
        assert!(!pool.has_primary());
        stop_pool(&mut pool, &engine, &config);

        let config = EngineConfig {
            cpu_workers: 1,
            gpu_workers: 1,
            gpu_min_prime: 1000,
            ..test_config()
        };
        let (mut pool, engine) = build_pool(&config, 1);
        assert!(!pool.has_primary());
        assert_eq!(pool.len(), 2);
        stop_pool(&mut pool, &engine, &config);
    }

    /// Scan order is CPU workers before GPU workers, ids ascending.
    #[test]
    fn scan_order_cpu_before_gpu() {
        let config = EngineConfig {
            cpu_workers: 2,
            gpu_workers: 2,
            gpu_min_prime: 1000,
            ..test_config()
        };
        let (mut pool, engine) = build_pool(&config, 1);
        let order: Vec<_> = pool.iter().map(|h| (h.id(), h.kind())).collect();
        assert_eq!(
            order,
            vec![
                (1, WorkerKind::Cpu),
                (2, WorkerKind::Cpu),
                (3, WorkerKind::Gpu),
                (4, WorkerKind::Gpu)
            ]
        );
        stop_pool(&mut pool, &engine, &config);
    }

    // ── Selection ───────────────────────────────────────────────────

    /// GPU workers are skipped while not yet eligible or while the run is
    /// single-threaded; CPU workers are always candidates.
    #[test]
    fn selection_honors_gpu_gating() {
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Blocks inside process_chunk until released, so a worker stays
        /// observably Working for the duration of the assertions.
        struct GateTask {
            released: AtomicBool,
        }
        impl SieveTask for GateTask {
            fn name(&self) -> &'static str {
                "gate"
            }
            fn preferred_chunk_size(&self) -> u32 {
                10
            }
            fn supports_gpu(&self) -> bool {
                true
            }
            fn process_chunk(&self, _kind: WorkerKind, primes: &[u64]) -> Result<u64> {
                while !self.released.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_micros(100));
                }
                Ok(*primes.last().unwrap())
            }
        }

        let config = EngineConfig {
            cpu_workers: 1,
            gpu_workers: 1,
            gpu_min_prime: 1000,
            ..test_config()
        };
        let engine = Arc::new(EngineShared::new());
        engine.set_run_status(RunStatus::Running);
        let gate = Arc::new(GateTask {
            released: AtomicBool::new(false),
        });
        let task: Arc<dyn SieveTask> = Arc::clone(&gate) as Arc<dyn SieveTask>;
        let mut pool = WorkerPool::build(&config, &engine, &task, 1).unwrap();

        // All idle: CPU wins by scan order.
        let h = pool.select_for_handoff(false, true).unwrap();
        assert_eq!(h.kind, WorkerKind::Cpu);
        drop(h);

        // Occupy the CPU worker (it blocks in the gate), then ask again
        // with GPU ineligible: nobody is available.
        {
            let h = pool.select_for_handoff(false, true).unwrap();
            assert_eq!(h.kind, WorkerKind::Cpu);
            h.guard.assign(vec![10_000]);
            assert!(pool.select_for_handoff(false, false).is_none());
            assert!(
                pool.select_for_handoff(true, true).is_none(),
                "single-threaded scan must skip GPU workers"
            );
            // GPU eligible and not single-threaded: the GPU worker is picked.
            let h = pool.select_for_handoff(false, true).unwrap();
            assert_eq!(h.kind, WorkerKind::Gpu);
            drop(h);
        }

        gate.released.store(true, Ordering::Release);
        stop_pool(&mut pool, &engine, &config);
    }

    /// Retiring the primary leaves the rest of the pool running and
    /// removes id 0 from the scan order.
    #[test]
    fn retire_primary_keeps_pool_running() {
        let config = EngineConfig {
            cpu_workers: 0,
            gpu_workers: 1,
            gpu_min_prime: 1000,
            ..test_config()
        };
        let (mut pool, engine) = build_pool(&config, 1);
        assert!(pool.has_primary());

        pool.retire_primary(&config).unwrap();
        assert!(!pool.has_primary());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.iter().next().unwrap().kind(), WorkerKind::Gpu);
        assert!(engine.is_running());

        // Idempotent: retiring again is a no-op.
        pool.retire_primary(&config).unwrap();

        stop_pool(&mut pool, &engine, &config);
    }

    /// wait_all_stopped reports the stuck worker count when the timeout
    /// elapses with workers still alive.
    #[test]
    fn wait_all_stopped_times_out_with_diagnostic() {
        let config = EngineConfig {
            cpu_workers: 2,
            shutdown_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (mut pool, engine) = build_pool(&config, 1);
        // Run status still Running: workers will not stop.
        let err = pool.wait_all_stopped(&config).unwrap_err().to_string();
        assert!(err.contains("2 worker(s)"), "got: {}", err);

        stop_pool(&mut pool, &engine, &config);
    }
}
