//! Per-PID readers: `stat`, `status`, `io`, `net/dev`, `cmdline`, `stack`,
//! the `fd` directory, `limits`, `cgroup` and `statm`.

use std::fs;

use podwatch_common::types::{
    PidDetails, PodCpuStats, PodDiskStats, PodMemoryStats, PodNetworkStats,
};

use crate::error::{ProcError, Result};
use crate::node::{parse_i64, parse_net_dev, parse_u64};
use crate::NodeReader;

/// Raw per-process sample composed from the `<pid>/` file family.
#[derive(Debug, Clone, Default)]
pub struct PidSnapshot {
    pub cpu: PodCpuStats,
    pub memory: PodMemoryStats,
    pub network: PodNetworkStats,
    pub disk: PodDiskStats,
    pub details: PidDetails,
}

/// statm reports pages; the kernel page size on every supported target.
const PAGE_KB: u64 = 4;

impl NodeReader {
    /// Reads the full per-process sample for one PID.
    ///
    /// `stat`, `status`, `io` and `net/dev` are required; failure on any of
    /// them fails the read. The auxiliary files (`cmdline`, `stack`, `fd`,
    /// `limits`, `cgroup`, `statm`) degrade to empty or zero values so a
    /// restricted mount never loses the core sample.
    pub fn read_pid(&self, pid: i32) -> Result<PidSnapshot> {
        let mut snap = PidSnapshot::default();

        self.read_pid_stat(pid, &mut snap)?;
        self.read_pid_status(pid, &mut snap)?;
        self.read_pid_io(pid, &mut snap)?;
        snap.network = self.read_pid_net(pid)?;

        snap.details.cmdline = self.read_pid_cmdline(pid).unwrap_or_default();
        snap.details.kernel_stack = self.read_pid_stack(pid).unwrap_or_default();
        snap.details.open_fds = self.read_pid_fd_count(pid).unwrap_or(0);
        snap.details.max_fds = self.read_pid_max_fds(pid).unwrap_or(0);
        snap.details.cgroups = self.read_pid_cgroups(pid).unwrap_or_default();

        // statm backfills the size counters when status withheld them.
        if snap.memory.vm_size == 0 {
            if let Ok((size_kb, data_kb, stack_kb)) = self.read_pid_statm(pid) {
                snap.memory.vm_size = size_kb;
                if snap.details.vm_data == 0 {
                    snap.details.vm_data = data_kb;
                }
                if snap.details.vm_stk == 0 {
                    snap.details.vm_stk = stack_kb;
                }
            }
        }

        Ok(snap)
    }

    /// `<pid>/stat`: one line, whitespace-separated, with the comm name
    /// parenthesized in field 2.
    fn read_pid_stat(&self, pid: i32, snap: &mut PidSnapshot) -> Result<()> {
        let path = self.pid_path(pid, "stat");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.len() < 44 {
            return Err(ProcError::parse(&path, "fewer than 44 columns"));
        }

        snap.cpu.utime = parse_u64(fields[13]);
        snap.cpu.stime = parse_u64(fields[14]);

        let d = &mut snap.details;
        d.name = fields[1]
            .strip_prefix('(')
            .and_then(|n| n.strip_suffix(')'))
            .unwrap_or(fields[1])
            .to_string();
        d.state = fields[2].to_string();
        d.cutime = parse_u64(fields[15]);
        d.cstime = parse_u64(fields[16]);
        d.priority = parse_i64(fields[17]);
        d.nice = parse_i64(fields[18]);
        d.threads = parse_i64(fields[19]);
        d.start_time = parse_u64(fields[21]);
        d.task_cpu = parse_i64(fields[38]);
        d.realtime_priority = parse_i64(fields[39]);
        Ok(())
    }

    /// `<pid>/status`: `Key:\tvalue` lines; unknown keys are ignored.
    fn read_pid_status(&self, pid: i32, snap: &mut PidSnapshot) -> Result<()> {
        let path = self.pid_path(pid, "status");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            let d = &mut snap.details;
            match key.trim_end_matches(':') {
                "VmSize" => snap.memory.vm_size = parse_u64(value),
                "VmRSS" => snap.memory.vm_rss = parse_u64(value),
                "VmPeak" => d.vm_peak = parse_u64(value),
                "VmLck" => d.vm_lck = parse_u64(value),
                "VmPin" => d.vm_pin = parse_u64(value),
                "VmData" => d.vm_data = parse_u64(value),
                "VmStk" => d.vm_stk = parse_u64(value),
                "VmExe" => d.vm_exe = parse_u64(value),
                "VmLib" => d.vm_lib = parse_u64(value),
                "VmSwap" => d.vm_swap = parse_u64(value),
                "Cpus_allowed_list" => d.cpus_allowed_list = value.to_string(),
                "Mems_allowed_list" => d.mems_allowed_list = value.to_string(),
                "voluntary_ctxt_switches" => d.voluntary_ctxt_switches = parse_u64(value),
                "nonvoluntary_ctxt_switches" => d.nonvoluntary_ctxt_switches = parse_u64(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// `<pid>/io`: only the three byte counters we track.
    fn read_pid_io(&self, pid: i32, snap: &mut PidSnapshot) -> Result<()> {
        let path = self.pid_path(pid, "io");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            match key.trim_end_matches(':') {
                "read_bytes" => snap.disk.read_bytes = parse_u64(value),
                "write_bytes" => snap.disk.write_bytes = parse_u64(value),
                "cancelled_write_bytes" => snap.details.cancelled_writes = parse_u64(value),
                _ => {}
            }
        }
        Ok(())
    }

    fn read_pid_net(&self, pid: i32) -> Result<PodNetworkStats> {
        let path = self.pid_path(pid, "net/dev");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;
        let net = parse_net_dev(&content)?;
        Ok(PodNetworkStats {
            rx_bytes: net.rx_bytes,
            tx_bytes: net.tx_bytes,
        })
    }

    /// `<pid>/cmdline` with NUL separators replaced by spaces.
    fn read_pid_cmdline(&self, pid: i32) -> Result<String> {
        let path = self.pid_path(pid, "cmdline");
        let raw = fs::read(&path).map_err(|e| ProcError::io(&path, e))?;
        let text: String = raw
            .iter()
            .map(|&b| if b == 0 { ' ' } else { b as char })
            .collect();
        Ok(text.trim().to_string())
    }

    fn read_pid_stack(&self, pid: i32) -> Result<Vec<String>> {
        let path = self.pid_path(pid, "stack");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn read_pid_fd_count(&self, pid: i32) -> Result<u64> {
        let path = self.pid_path(pid, "fd");
        let entries = fs::read_dir(&path).map_err(|e| ProcError::io(&path, e))?;
        Ok(entries.count() as u64)
    }

    /// `<pid>/limits`: the soft limit from the `Max open files` row.
    fn read_pid_max_fds(&self, pid: i32) -> Result<u64> {
        let path = self.pid_path(pid, "limits");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        for line in content.lines() {
            if !line.contains("Max open files") {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 4 {
                if let Ok(soft) = fields[3].parse() {
                    return Ok(soft);
                }
            }
        }
        Ok(0)
    }

    fn read_pid_cgroups(&self, pid: i32) -> Result<Vec<String>> {
        let path = self.pid_path(pid, "cgroup");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `<pid>/statm`: (total size, data, stack) in kibibytes.
    fn read_pid_statm(&self, pid: i32) -> Result<(u64, u64, u64)> {
        let path = self.pid_path(pid, "statm");
        let content = fs::read_to_string(&path).map_err(|e| ProcError::io(&path, e))?;

        let fields: Vec<&str> = content.split_whitespace().collect();
        if fields.len() < 7 {
            return Err(ProcError::parse(&path, "fewer than 7 columns"));
        }
        Ok((
            parse_u64(fields[0]) * PAGE_KB,
            parse_u64(fields[5]) * PAGE_KB,
            parse_u64(fields[6]) * PAGE_KB,
        ))
    }

    /// Whether `<pid>` exists under this reader's base path.
    pub fn pid_exists(&self, pid: i32) -> bool {
        self.base().join(pid.to_string()).is_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeReader;
    use std::fs;
    use tempfile::TempDir;

    const STAT_LINE: &str = "4242 (nginx) S 1 4242 4242 0 -1 4194304 12000 0 3 0 500 120 10 5 20 0 4 0 12345678 1073741824 64000 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 2 0 0 0 0 0 0 0 0 0 0 0 0 0";

    fn pid_tree(pid: i32) -> (TempDir, NodeReader) {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join(pid.to_string());
        fs::create_dir_all(base.join("net")).unwrap();
        fs::create_dir_all(base.join("fd")).unwrap();

        fs::write(base.join("stat"), STAT_LINE).unwrap();
        fs::write(
            base.join("status"),
            "Name:\tnginx\nVmPeak:\t 1100000 kB\nVmSize:\t 1048576 kB\nVmRSS:\t 262144 kB\n\
             VmData:\t 500000 kB\nVmStk:\t 132 kB\nVmExe:\t 800 kB\nVmLib:\t 9000 kB\n\
             VmSwap:\t 0 kB\nCpus_allowed_list:\t0-3\nMems_allowed_list:\t0\n\
             voluntary_ctxt_switches:\t999\nnonvoluntary_ctxt_switches:\t12\n",
        )
        .unwrap();
        fs::write(
            base.join("io"),
            "rchar: 1000\nwchar: 2000\nread_bytes: 4096\nwrite_bytes: 8192\ncancelled_write_bytes: 77\n",
        )
        .unwrap();
        fs::write(
            base.join("net/dev"),
            "Inter-|   Receive                                                |  Transmit\n\
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n\
    lo:     555       5    0    0    0     0          0         0      555       5    0    0    0     0       0          0\n\
  eth0:    1024      10    0    0    0     0          0         0     2048      20    0    0    0     0       0          0\n",
        )
        .unwrap();
        fs::write(base.join("cmdline"), b"nginx\0-g\0daemon off;\0").unwrap();
        fs::write(base.join("stack"), "[<0>] ep_poll\n[<0>] do_epoll_wait\n").unwrap();
        fs::write(base.join("fd/0"), "").unwrap();
        fs::write(base.join("fd/1"), "").unwrap();
        fs::write(base.join("fd/2"), "").unwrap();
        fs::write(
            base.join("limits"),
            "Limit                     Soft Limit           Hard Limit           Units\n\
             Max open files            1024                 4096                 files\n",
        )
        .unwrap();
        fs::write(base.join("cgroup"), "0::/kubepods/pod1/abc123\n").unwrap();
        fs::write(base.join("statm"), "262144 65536 1000 200 0 125000 33\n").unwrap();

        let reader = NodeReader::new(dir.path());
        (dir, reader)
    }

    #[test]
    fn composite_read_fills_every_section() {
        let (_dir, reader) = pid_tree(4242);
        let snap = reader.read_pid(4242).unwrap();

        assert_eq!(snap.cpu.utime, 500);
        assert_eq!(snap.cpu.stime, 120);
        assert_eq!(snap.memory.vm_size, 1_048_576);
        assert_eq!(snap.memory.vm_rss, 262_144);
        assert_eq!(snap.network.rx_bytes, 1024);
        assert_eq!(snap.network.tx_bytes, 2048);
        assert_eq!(snap.disk.read_bytes, 4096);
        assert_eq!(snap.disk.write_bytes, 8192);

        let d = &snap.details;
        assert_eq!(d.name, "nginx");
        assert_eq!(d.state, "S");
        assert_eq!(d.cutime, 10);
        assert_eq!(d.cstime, 5);
        assert_eq!(d.priority, 20);
        assert_eq!(d.nice, 0);
        assert_eq!(d.threads, 4);
        assert_eq!(d.start_time, 12_345_678);
        assert_eq!(d.task_cpu, 2);
        assert_eq!(d.realtime_priority, 0);
        assert_eq!(d.cpus_allowed_list, "0-3");
        assert_eq!(d.voluntary_ctxt_switches, 999);
        assert_eq!(d.vm_peak, 1_100_000);
        assert_eq!(d.cancelled_writes, 77);
        assert_eq!(d.cmdline, "nginx -g daemon off;");
        assert_eq!(d.kernel_stack.len(), 2);
        assert_eq!(d.open_fds, 3);
        assert_eq!(d.max_fds, 1024);
        assert_eq!(d.cgroups, vec!["0::/kubepods/pod1/abc123".to_string()]);
    }

    #[test]
    fn missing_auxiliary_files_do_not_fail_the_read() {
        let (dir, reader) = pid_tree(4242);
        let base = dir.path().join("4242");
        fs::remove_file(base.join("cmdline")).unwrap();
        fs::remove_file(base.join("stack")).unwrap();
        fs::remove_file(base.join("limits")).unwrap();

        let snap = reader.read_pid(4242).unwrap();
        assert!(snap.details.cmdline.is_empty());
        assert!(snap.details.kernel_stack.is_empty());
        assert_eq!(snap.details.max_fds, 0);
        assert_eq!(snap.cpu.utime, 500);
    }

    #[test]
    fn missing_stat_fails_with_path() {
        let (dir, reader) = pid_tree(4242);
        fs::remove_file(dir.path().join("4242/stat")).unwrap();
        match reader.read_pid(4242) {
            Err(ProcError::Io { path, .. }) => assert!(path.ends_with("4242/stat")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn statm_backfills_vm_size_when_status_lacks_it() {
        let (dir, reader) = pid_tree(4242);
        fs::write(dir.path().join("4242/status"), "Name:\tnginx\n").unwrap();

        let snap = reader.read_pid(4242).unwrap();
        assert_eq!(snap.memory.vm_size, 262_144 * 4);
        assert_eq!(snap.details.vm_data, 125_000 * 4);
    }

    #[test]
    fn pid_existence_probe() {
        let (_dir, reader) = pid_tree(4242);
        assert!(reader.pid_exists(4242));
        assert!(!reader.pid_exists(99999));
    }
}
