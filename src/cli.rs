//! # Cli — Subcommand Runners and Signal Wiring
//!
//! Builds the engine configuration (defaults ← TOML overrides ← explicit
//! flags), constructs the selected sieve task with checkpoint resume, and
//! drives [`Engine::run`] with SIGINT/SIGTERM wired to a clean,
//! checkpointed interruption.

use crate::{Cli, Commands};
use anyhow::Result;
use deepsieve::config::{self, EngineConfig};
use deepsieve::cullen_woodall::{CullenWoodallParams, CullenWoodallSieve};
use deepsieve::engine::{Engine, EngineHandle, RunStatus};
use deepsieve::kbn::{KbnParams, KbnSieve};
use deepsieve::primes::PrimeStream;
use deepsieve::SieveTask;
#[cfg(unix)]
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub fn run(cli: &Cli) -> Result<()> {
    let mut config = build_config(cli)?;

    let (task, resume_mark): (Arc<dyn SieveTask>, u64) = match &cli.command {
        Commands::Kbn {
            k,
            base,
            min_n,
            max_n,
        } => {
            let (sieve, resume) = KbnSieve::new(
                KbnParams {
                    k: *k,
                    base: *base,
                    min_n: *min_n,
                    max_n: *max_n,
                },
                cli.checkpoint.clone(),
                cli.factor_log.clone(),
            )?;
            (Arc::new(sieve), resume)
        }
        Commands::CullenWoodall { min_n, max_n } => {
            let (sieve, resume) = CullenWoodallSieve::new(
                CullenWoodallParams {
                    min_n: *min_n,
                    max_n: *max_n,
                },
                cli.checkpoint.clone(),
                cli.factor_log.clone(),
            )?;
            (Arc::new(sieve), resume)
        }
    };

    if resume_mark >= config.min_prime {
        info!(resume_from = resume_mark, "resuming above checkpointed mark");
        config.min_prime = resume_mark + 1;
    }
    if config.min_prime > config.max_prime {
        info!("checkpoint already covers the requested range; nothing to do");
        return Ok(());
    }

    let mut engine = Engine::new(config, task, Box::new(PrimeStream::new()))?;
    install_interrupt_handler(engine.handle());
    let summary = engine.run()?;

    info!(
        outcome = match summary.run_status {
            RunStatus::Interrupted => "interrupted",
            _ => "finished",
        },
        sieved_to = summary.largest_tested,
        primes_tested = summary.primes_tested,
        chunks = summary.chunks_assigned,
        rebuilds = summary.rebuilds,
        cpu = format_args!("{:.1}s", summary.cpu_time.as_secs_f64()),
        wall = format_args!("{:.1}s", summary.wall_time.as_secs_f64()),
        "run complete"
    );
    Ok(())
}

/// Defaults ← TOML file ← explicit flags; a flag given on the command
/// line always wins.
fn build_config(cli: &Cli) -> Result<EngineConfig> {
    let mut cfg = EngineConfig {
        min_prime: cli.min_prime,
        max_prime: cli.max_prime,
        ..Default::default()
    };
    if let Some(path) = &cli.config {
        let overrides = config::load_overrides(path)?;
        cfg.apply_overrides(&overrides);
    }
    if let Some(v) = cli.cpu_workers {
        cfg.cpu_workers = v;
    }
    if let Some(v) = cli.gpu_workers {
        cfg.gpu_workers = v;
    }
    if let Some(v) = cli.gpu_min_prime {
        cfg.gpu_min_prime = v;
    }
    if let Some(v) = cli.chunk_size {
        cfg.chunk_size = v;
    }
    if let Some(v) = cli.single_worker_threshold {
        cfg.single_worker_threshold = v;
    }
    if let Some(v) = cli.status_interval {
        cfg.status_interval = Duration::from_secs(v);
    }
    if let Some(v) = cli.checkpoint_interval {
        cfg.checkpoint_interval = Duration::from_secs(v);
    }
    if cli.report_hardware {
        cfg.report_hardware = true;
    }
    Ok(cfg)
}

#[cfg(unix)]
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// SIGINT/SIGTERM set a flag (the only async-signal-safe thing to do);
/// a monitor thread turns the flag into a clean engine interruption.
#[cfg(unix)]
fn install_interrupt_handler(handle: EngineHandle) {
    extern "C" fn on_signal(_sig: libc::c_int) {
        INTERRUPTED.store(true, Ordering::SeqCst);
    }
    unsafe {
        libc::signal(
            libc::SIGINT,
            on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }
    std::thread::spawn(move || {
        while !INTERRUPTED.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
        info!("interrupt received; letting in-flight chunks finish");
        handle.interrupt();
    });
}

#[cfg(not(unix))]
fn install_interrupt_handler(_handle: EngineHandle) {}
