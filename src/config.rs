//! # Config — Engine Configuration and Validation
//!
//! `EngineConfig` carries everything the coordinator needs before the first
//! worker is created: the prime range, the pool composition, chunk sizing,
//! the single-worker threshold, and the polling/reporting intervals.
//!
//! Configuration errors are fatal at startup — `validate()` runs before any
//! worker thread exists, so a bad range or an oversized pool never leaves a
//! half-built run behind.
//!
//! An optional TOML file (`--config`) supplies overrides that sit beneath
//! the CLI flags: a flag given on the command line always wins.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Hard cap on the total worker count (primary included).
pub const MAX_WORKERS: usize = 64;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Lowest prime of the range; sieving starts strictly above
    /// `min_prime - 1`.
    pub min_prime: u64,
    /// Largest prime of the range (inclusive).
    pub max_prime: u64,
    /// Ordinary CPU workers. 0 with `gpu_workers == 0` auto-creates one
    /// fallback CPU worker.
    pub cpu_workers: usize,
    /// GPU-dispatching workers. Requires a task with a GPU path.
    pub gpu_workers: usize,
    /// Work units per chunk; 0 uses the task's preferred size.
    pub chunk_size: u32,
    /// Below this mark at most one non-primary worker runs at a time,
    /// keeping the factor-reporting path contention-free while factors
    /// are still dense.
    pub single_worker_threshold: u64,
    /// Smallest prime eligible for GPU execution. The range below it is
    /// covered by CPU workers, or by the primary fallback worker when
    /// none were requested.
    pub gpu_min_prime: u64,
    /// Wall-clock interval between status reports.
    pub status_interval: Duration,
    /// Wall-clock interval between checkpoint writes.
    pub checkpoint_interval: Duration,
    /// Sleep used by every busy-poll cycle (hand-off scan, worker idle
    /// loop, shutdown wait).
    pub poll_interval: Duration,
    /// How long pool construction waits for every worker to report ready.
    pub startup_timeout: Duration,
    /// How long shutdown waits for every worker to stop before the run
    /// is declared wedged.
    pub shutdown_timeout: Duration,
    /// Attach a hardware snapshot to status log lines.
    pub report_hardware: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_prime: 2,
            max_prime: 1_000_000,
            cpu_workers: 1,
            gpu_workers: 0,
            chunk_size: 0,
            single_worker_threshold: 0,
            gpu_min_prime: 0,
            status_interval: Duration::from_secs(30),
            checkpoint_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1),
            startup_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(600),
            report_hardware: false,
        }
    }
}

impl EngineConfig {
    /// Reject configurations that cannot produce a sane run. Called before
    /// any worker is created.
    pub fn validate(&self) -> Result<()> {
        if self.max_prime < self.min_prime {
            bail!(
                "empty sieve range: max prime {} is below min prime {}",
                self.max_prime,
                self.min_prime
            );
        }
        if self.min_prime == 0 {
            bail!("min prime must be at least 1");
        }
        // +1 leaves room for the primary fallback worker.
        if self.cpu_workers + self.gpu_workers + 1 > MAX_WORKERS {
            bail!(
                "{} workers requested, hard cap is {}",
                self.cpu_workers + self.gpu_workers,
                MAX_WORKERS - 1
            );
        }
        if self.gpu_workers > 0 && self.gpu_min_prime == 0 {
            bail!("GPU workers require --gpu-min-prime to bound the CPU-only range");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be non-zero");
        }
        Ok(())
    }

    /// Fold TOML overrides in. CLI flags are applied after this, so they
    /// always win.
    pub fn apply_overrides(&mut self, o: &FileOverrides) {
        if let Some(v) = o.cpu_workers {
            self.cpu_workers = v;
        }
        if let Some(v) = o.gpu_workers {
            self.gpu_workers = v;
        }
        if let Some(v) = o.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = o.single_worker_threshold {
            self.single_worker_threshold = v;
        }
        if let Some(v) = o.gpu_min_prime {
            self.gpu_min_prime = v;
        }
        if let Some(v) = o.status_interval_secs {
            self.status_interval = Duration::from_secs(v);
        }
        if let Some(v) = o.checkpoint_interval_secs {
            self.checkpoint_interval = Duration::from_secs(v);
        }
        if let Some(v) = o.report_hardware {
            self.report_hardware = v;
        }
    }
}

/// Engine settings accepted from a TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOverrides {
    pub cpu_workers: Option<usize>,
    pub gpu_workers: Option<usize>,
    pub chunk_size: Option<u32>,
    pub single_worker_threshold: Option<u64>,
    pub gpu_min_prime: Option<u64>,
    pub status_interval_secs: Option<u64>,
    pub checkpoint_interval_secs: Option<u64>,
    pub report_hardware: Option<bool>,
}

/// Parse a TOML overrides file.
pub fn load_overrides(path: &Path) -> Result<FileOverrides> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    //! Configuration validation and override-merge tests.
    //!
    //! Every rejection path in `validate()` is pinned here because config
    //! errors are the only failures allowed to happen before the worker
    //! pool exists — anything that slips through surfaces later as a
    //! much harder-to-read invariant violation.

    use super::*;
    use std::io::Write;

    // ── Validation ──────────────────────────────────────────────────

    /// The default configuration must pass its own validation.
    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    /// An inverted range (max < min) is a startup error, not an empty run.
    #[test]
    fn empty_range_rejected() {
        let cfg = EngineConfig {
            min_prime: 1000,
            max_prime: 100,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("empty sieve range"), "got: {}", err);
    }

    /// A single-prime range (max == min) is valid.
    #[test]
    fn single_prime_range_accepted() {
        let cfg = EngineConfig {
            min_prime: 97,
            max_prime: 97,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    /// Worker counts above the hard cap are rejected before any thread is
    /// spawned.
    #[test]
    fn worker_cap_enforced() {
        let cfg = EngineConfig {
            cpu_workers: MAX_WORKERS,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("hard cap"), "got: {}", err);
    }

    /// The largest allowed pool (cap minus the reserved primary slot)
    /// validates.
    #[test]
    fn worker_count_at_cap_accepted() {
        let cfg = EngineConfig {
            cpu_workers: MAX_WORKERS - 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    /// GPU workers without a GPU-eligibility bound are contradictory: the
    /// scheduler would have no way to decide when GPU hand-offs start.
    #[test]
    fn gpu_workers_require_gpu_min_prime() {
        let cfg = EngineConfig {
            gpu_workers: 2,
            gpu_min_prime: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            gpu_workers: 2,
            gpu_min_prime: 1_000_000,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    /// A zero poll interval would turn every sleep-poll cycle into a hot
    /// spin; rejected.
    #[test]
    fn zero_poll_interval_rejected() {
        let cfg = EngineConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    // ── Overrides ───────────────────────────────────────────────────

    /// Overrides replace only the fields they name.
    #[test]
    fn apply_overrides_is_partial() {
        let mut cfg = EngineConfig::default();
        let o = FileOverrides {
            cpu_workers: Some(4),
            checkpoint_interval_secs: Some(5),
            ..Default::default()
        };
        cfg.apply_overrides(&o);
        assert_eq!(cfg.cpu_workers, 4);
        assert_eq!(cfg.checkpoint_interval, Duration::from_secs(5));
        // Untouched fields keep their defaults.
        assert_eq!(cfg.gpu_workers, 0);
        assert_eq!(cfg.status_interval, Duration::from_secs(30));
    }

    /// A TOML file round-trips into FileOverrides.
    #[test]
    fn load_overrides_parses_toml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "cpu_workers = 8\nchunk_size = 2000\nreport_hardware = true"
        )
        .unwrap();
        let o = load_overrides(f.path()).unwrap();
        assert_eq!(o.cpu_workers, Some(8));
        assert_eq!(o.chunk_size, Some(2000));
        assert_eq!(o.report_hardware, Some(true));
        assert!(o.gpu_workers.is_none());
    }

    /// Unknown keys are a config error, not silently ignored — a typo'd
    /// option must not vanish.
    #[test]
    fn load_overrides_rejects_unknown_keys() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "cpu_wrokers = 8").unwrap();
        assert!(load_overrides(f.path()).is_err());
    }

    /// A missing file surfaces as an error naming the path.
    #[test]
    fn load_overrides_missing_file() {
        let err = load_overrides(Path::new("/nonexistent/deepsieve.toml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("deepsieve.toml"), "got: {}", err);
    }
}
