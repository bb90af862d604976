//! Pure derivation of percentages and rates from counter deltas.
//!
//! Every function takes the current and previous raw records plus the time
//! delta and returns the derived value; counter resets and non-positive
//! deltas all degrade to zero so a restart never produces a negative rate.

use podwatch_common::types::CpuStats;

const MIB: f64 = 1024.0 * 1024.0;
const BYTES_PER_SECTOR: f64 = 512.0;
const JIFFIES_PER_SECOND: f64 = 100.0;

/// Node CPU utilisation over the sampling window, in percent.
pub fn node_cpu_percent(current: &CpuStats, previous: &CpuStats) -> f64 {
    let total_delta = current.total as f64 - previous.total as f64;
    if total_delta <= 0.0 {
        return 0.0;
    }

    let active = |c: &CpuStats| {
        (c.user + c.nice + c.system + c.iowait + c.irq + c.softirq + c.steal) as f64
    };
    let active_delta = active(current) - active(previous);
    if active_delta <= 0.0 {
        return 0.0;
    }

    (active_delta / total_delta) * 100.0
}

/// Byte-counter throughput in MiB/s. A counter reset (`now < prev`) or a
/// non-positive window yields zero.
pub fn rate_mib_per_sec(bytes_now: u64, bytes_prev: u64, dt_secs: f64) -> f64 {
    if dt_secs <= 0.0 || bytes_now < bytes_prev {
        return 0.0;
    }
    (bytes_now - bytes_prev) as f64 / dt_secs / MIB
}

/// Sector-counter throughput in MiB/s at 512 bytes per sector.
pub fn sector_rate_mib_per_sec(sectors_now: u64, sectors_prev: u64, dt_secs: f64) -> f64 {
    if dt_secs <= 0.0 || sectors_now < sectors_prev {
        return 0.0;
    }
    (sectors_now - sectors_prev) as f64 * BYTES_PER_SECTOR / dt_secs / MIB
}

/// Per-process CPU utilisation from utime+stime jiffy deltas, capped at 100
/// (single core).
pub fn pod_cpu_percent(utime_delta: u64, stime_delta: u64, dt_secs: f64) -> f64 {
    if dt_secs <= 0.0 {
        return 0.0;
    }
    let cpu_seconds = (utime_delta + stime_delta) as f64 / JIFFIES_PER_SECOND;
    (cpu_seconds / dt_secs * 100.0).min(100.0)
}

/// Resident-set share of the node's total memory, in percent.
pub fn pod_memory_percent(vm_rss_kb: u64, node_total_kb: u64) -> f64 {
    if node_total_kb == 0 {
        return 0.0;
    }
    vm_rss_kb as f64 / node_total_kb as f64 * 100.0
}

/// Node memory utilisation: everything not reported available.
pub fn node_memory_percent(total_kb: u64, available_kb: u64) -> f64 {
    if total_kb == 0 {
        return 0.0;
    }
    (total_kb.saturating_sub(available_kb)) as f64 / total_kb as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(user: u64, idle: u64) -> CpuStats {
        CpuStats {
            user,
            idle,
            total: user + idle,
            ..Default::default()
        }
    }

    #[test]
    fn cpu_percent_from_deltas() {
        let prev = cpu(100, 900);
        let curr = cpu(150, 950);
        // 50 active out of 100 total.
        assert!((node_cpu_percent(&curr, &prev) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_stays_in_unit_range() {
        let prev = cpu(100, 900);
        // All-active window.
        let curr = cpu(200, 900);
        let pct = node_cpu_percent(&curr, &prev);
        assert!((0.0..=100.0).contains(&pct));
        assert!((pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn cpu_percent_zero_on_counter_reset() {
        let prev = cpu(500, 500);
        let curr = cpu(10, 20);
        assert_eq!(node_cpu_percent(&curr, &prev), 0.0);
    }

    #[test]
    fn network_rate_basic() {
        // 5 MiB over 5 seconds on each direction.
        let five_mib = 5 * 1024 * 1024;
        assert!((rate_mib_per_sec(five_mib, 0, 5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rate_zero_on_reset_or_bad_window() {
        assert_eq!(rate_mib_per_sec(100, 200, 5.0), 0.0);
        assert_eq!(rate_mib_per_sec(200, 100, 0.0), 0.0);
        assert_eq!(rate_mib_per_sec(200, 100, -1.0), 0.0);
    }

    #[test]
    fn sector_rate_uses_512_byte_sectors() {
        // 2048 sectors = 1 MiB, over one second.
        assert!((sector_rate_mib_per_sec(2048, 0, 1.0) - 1.0).abs() < 1e-9);
        assert_eq!(sector_rate_mib_per_sec(100, 2048, 1.0), 0.0);
    }

    #[test]
    fn pod_cpu_capped_at_single_core() {
        // 1000 jiffies in 5 s would be 200%; the cap holds it at 100.
        assert_eq!(pod_cpu_percent(600, 400, 5.0), 100.0);
        // 250 jiffies in 5 s = 2.5 cpu-seconds over 5 s = 50%.
        assert!((pod_cpu_percent(150, 100, 5.0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn memory_percentages_guard_zero_totals() {
        assert_eq!(pod_memory_percent(1000, 0), 0.0);
        assert_eq!(node_memory_percent(0, 0), 0.0);
        assert!((node_memory_percent(1000, 250) - 75.0).abs() < 1e-9);
        assert!((pod_memory_percent(250, 1000) - 25.0).abs() < 1e-9);
    }
}
