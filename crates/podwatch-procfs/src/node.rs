//! Node-level readers: `stat`, `meminfo`, `net/dev`, `diskstats`.

use std::fs;

use podwatch_common::types::{CpuStats, DiskStats, MemoryStats, NetworkStats};

use crate::error::{ProcError, Result};
use crate::NodeReader;

impl NodeReader {
    /// Parses the aggregate `cpu ` line of `stat` into jiffy counters.
    ///
    /// The steal column is absent on older kernels; everything else is
    /// required. `total` is the sum of all present columns.
    pub fn read_cpu(&self) -> Result<CpuStats> {
        let path = self.path("stat");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        for line in content.lines() {
            let Some(rest) = line.strip_prefix("cpu ") else {
                continue;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() < 7 {
                return Err(ProcError::parse(&path, "cpu line has fewer than 8 columns"));
            }

            let user = parse_u64(fields[0]);
            let nice = parse_u64(fields[1]);
            let system = parse_u64(fields[2]);
            let idle = parse_u64(fields[3]);
            let iowait = parse_u64(fields[4]);
            let irq = parse_u64(fields[5]);
            let softirq = parse_u64(fields[6]);
            let steal = fields.get(7).copied().map(parse_u64).unwrap_or(0);

            return Ok(CpuStats {
                user,
                nice,
                system,
                idle,
                iowait,
                irq,
                softirq,
                steal,
                total: user + nice + system + idle + iowait + irq + softirq + steal,
                cpu_percent: 0.0,
            });
        }

        Err(ProcError::parse(&path, "no cpu summary line"))
    }

    /// Parses `meminfo` into kibibyte counters for the fields we track;
    /// everything else is ignored.
    pub fn read_memory(&self) -> Result<MemoryStats> {
        let path = self.path("meminfo");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        let mut mem = MemoryStats::default();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            let value = parse_u64(value);
            match key.trim_end_matches(':') {
                "MemTotal" => mem.mem_total = value,
                "MemFree" => mem.mem_free = value,
                "MemAvailable" => mem.mem_available = value,
                "Buffers" => mem.buffers = value,
                "Cached" => mem.cached = value,
                "SwapCached" => mem.swap_cached = value,
                "SwapTotal" => mem.swap_total = value,
                "SwapFree" => mem.swap_free = value,
                _ => {}
            }
        }
        Ok(mem)
    }

    /// Sums `net/dev` counters over every interface except loopback. The two
    /// header lines are skipped; lines with fewer than 17 columns are ignored.
    pub fn read_network(&self) -> Result<NetworkStats> {
        let path = self.path("net/dev");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;
        parse_net_dev(&content)
    }

    /// Sums `diskstats` over whole block devices: entries whose name contains
    /// `loop` or ends in a digit (partitions) are skipped.
    pub fn read_disk(&self) -> Result<DiskStats> {
        let path = self.path("diskstats");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        let mut disk = DiskStats::default();
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 14 {
                continue;
            }

            let device = fields[2];
            if device.contains("loop") || device.ends_with(|c: char| c.is_ascii_digit()) {
                continue;
            }

            disk.reads_completed += parse_u64(fields[3]);
            disk.reads_merged += parse_u64(fields[4]);
            disk.sectors_read += parse_u64(fields[5]);
            disk.time_reading += parse_u64(fields[6]);
            disk.writes_completed += parse_u64(fields[7]);
            disk.writes_merged += parse_u64(fields[8]);
            disk.sectors_written += parse_u64(fields[9]);
            disk.time_writing += parse_u64(fields[10]);
        }
        Ok(disk)
    }
}

/// Shared `net/dev` parser for the node-level and per-PID variants.
pub(crate) fn parse_net_dev(content: &str) -> Result<NetworkStats> {
    let mut net = NetworkStats::default();
    for line in content.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 17 {
            continue;
        }
        if fields[0].trim_end_matches(':') == "lo" {
            continue;
        }

        net.rx_bytes += parse_u64(fields[1]);
        net.rx_packets += parse_u64(fields[2]);
        net.rx_errors += parse_u64(fields[3]);
        net.tx_bytes += parse_u64(fields[9]);
        net.tx_packets += parse_u64(fields[10]);
        net.tx_errors += parse_u64(fields[11]);
    }
    Ok(net)
}

/// Malformed numeric fields fall back to zero rather than failing the parse.
pub(crate) fn parse_u64(s: &str) -> u64 {
    s.parse().unwrap_or(0)
}

pub(crate) fn parse_i64(s: &str) -> i64 {
    s.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn reader_with(files: &[(&str, &str)]) -> (TempDir, NodeReader) {
        let dir = TempDir::new().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let reader = NodeReader::new(dir.path());
        (dir, reader)
    }

    #[test]
    fn cpu_counters_and_total() {
        let stat = "cpu  100 5 50 800 30 2 8 5 0 0\ncpu0 50 2 25 400 15 1 4 2 0 0\n";
        let (_dir, reader) = reader_with(&[("stat", stat)]);

        let cpu = reader.read_cpu().unwrap();
        assert_eq!(cpu.user, 100);
        assert_eq!(cpu.steal, 5);
        assert_eq!(cpu.total, 100 + 5 + 50 + 800 + 30 + 2 + 8 + 5);
        assert_eq!(cpu.cpu_percent, 0.0);
    }

    #[test]
    fn cpu_without_steal_column() {
        let (_dir, reader) = reader_with(&[("stat", "cpu  10 1 5 80 3 1 2\n")]);
        let cpu = reader.read_cpu().unwrap();
        assert_eq!(cpu.steal, 0);
        assert_eq!(cpu.total, 102);
    }

    #[test]
    fn cpu_rejects_truncated_line() {
        let (_dir, reader) = reader_with(&[("stat", "cpu  10 1 5 80\n")]);
        assert!(matches!(
            reader.read_cpu(),
            Err(ProcError::Parse { .. })
        ));
    }

    #[test]
    fn cpu_missing_file_carries_path() {
        let (_dir, reader) = reader_with(&[]);
        match reader.read_cpu() {
            Err(ProcError::Io { path, .. }) => assert!(path.ends_with("stat")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn meminfo_tracked_fields_only() {
        let meminfo = "MemTotal:       16384000 kB\n\
                       MemFree:         4000000 kB\n\
                       MemAvailable:    8000000 kB\n\
                       Buffers:          120000 kB\n\
                       Cached:           900000 kB\n\
                       SwapCached:            0 kB\n\
                       SwapTotal:       2000000 kB\n\
                       SwapFree:        2000000 kB\n\
                       Dirty:               100 kB\n";
        let (_dir, reader) = reader_with(&[("meminfo", meminfo)]);

        let mem = reader.read_memory().unwrap();
        assert_eq!(mem.mem_total, 16_384_000);
        assert_eq!(mem.mem_available, 8_000_000);
        assert_eq!(mem.swap_free, 2_000_000);
    }

    #[test]
    fn net_dev_skips_headers_and_loopback() {
        let netdev = "Inter-|   Receive                                                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo: 9999999    9999    9    0    0     0          0         0  9999999    9999    9    0    0     0       0          0\n\
  eth0: 1000000    5000    1    0    0     0          0         0   500000    4000    2    0    0     0       0          0\n\
  eth1: 2000000    6000    0    0    0     0          0         0   700000    3000    0    0    0     0       0          0\n";
        let (_dir, reader) = reader_with(&[("net/dev", netdev)]);

        let net = reader.read_network().unwrap();
        assert_eq!(net.rx_bytes, 3_000_000);
        assert_eq!(net.tx_bytes, 1_200_000);
        assert_eq!(net.rx_packets, 11_000);
        assert_eq!(net.rx_errors, 1);
        assert_eq!(net.tx_errors, 2);
    }

    #[test]
    fn diskstats_filters_partitions_and_loops() {
        let diskstats = "   8       0 sda 900 20 40000 300 1200 45 88000 450 0 500 750\n\
   8       1 sda1 800 10 30000 200 1000 40 80000 400 0 400 600\n\
   7       0 loop0 10 0 80 1 0 0 0 0 0 1 1\n\
 259       0 nvme0n1 100 5 8000 50 200 9 16000 90 0 80 140\n";
        let (_dir, reader) = reader_with(&[("diskstats", diskstats)]);

        let disk = reader.read_disk().unwrap();
        // Only sda survives: sda1 and nvme0n1 end in a digit, loop0 is a loop
        // device.
        assert_eq!(disk.reads_completed, 900);
        assert_eq!(disk.sectors_read, 40_000);
        assert_eq!(disk.sectors_written, 88_000);
    }

    #[test]
    fn malformed_numeric_fields_become_zero() {
        let (_dir, reader) = reader_with(&[("stat", "cpu  abc 1 5 80 3 1 2 0\n")]);
        let cpu = reader.read_cpu().unwrap();
        assert_eq!(cpu.user, 0);
        assert_eq!(cpu.nice, 1);
    }
}
