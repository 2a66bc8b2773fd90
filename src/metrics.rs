//! # Metrics — Hardware Telemetry Snapshots
//!
//! A small [`sysinfo`] snapshot attached to the engine's periodic status
//! log line when `--report-hardware` is set. Long sieve runs live for
//! weeks; having CPU, memory and load next to the progress line in the
//! same log stream is usually all the observability they need.
//!
//! The `sysinfo::System` instance is owned by the engine and reused
//! across calls to amortize initialization.

use sysinfo::System;

#[derive(Clone, Debug, Default)]
pub struct HardwareSnapshot {
    pub cpu_usage_percent: f32,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub load_avg_1m: f64,
}

pub fn snapshot(sys: &mut System) -> HardwareSnapshot {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let gib = 1_073_741_824.0;
    let load = System::load_average();
    HardwareSnapshot {
        cpu_usage_percent: sys.global_cpu_usage(),
        memory_used_gb: (sys.used_memory() as f64 / gib * 10.0).round() / 10.0,
        memory_total_gb: (sys.total_memory() as f64 / gib * 10.0).round() / 10.0,
        load_avg_1m: (load.one * 100.0).round() / 100.0,
    }
}

#[cfg(test)]
mod tests {
    //! Sanity checks against the live machine: values must be present and
    //! in range, and the GB rounding must hold to one decimal.

    use super::*;

    /// On real hardware total memory is positive, usage percentages are
    /// non-negative, and used never exceeds total.
    #[test]
    fn snapshot_returns_sane_values() {
        let mut sys = System::new_all();
        sys.refresh_all();
        let m = snapshot(&mut sys);

        assert!(m.cpu_usage_percent >= 0.0);
        assert!(m.memory_total_gb > 0.0, "total memory should be > 0");
        assert!(m.memory_used_gb >= 0.0);
        assert!(m.memory_used_gb <= m.memory_total_gb);
        assert!(m.load_avg_1m >= 0.0);
    }

    /// GB values are rounded to one decimal place.
    #[test]
    fn snapshot_rounds_gb_to_one_decimal() {
        let mut sys = System::new_all();
        sys.refresh_all();
        let m = snapshot(&mut sys);
        let x10 = m.memory_used_gb * 10.0;
        assert!((x10 - x10.round()).abs() < 0.001);
    }
}
