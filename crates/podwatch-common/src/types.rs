use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node CPU counters from the `cpu ` summary line of `stat`, in jiffies.
///
/// `total` is the sum of all counter fields at read time; `cpu_percent` is
/// derived from the delta against the previous sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStats {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub total: u64,
    pub cpu_percent: f64,
}

/// Node memory counters from `meminfo`, in kibibytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub buffers: u64,
    pub cached: u64,
    pub swap_cached: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub memory_percent: f64,
}

/// Node network counters summed over all non-loopback interfaces.
/// Rates are MiB/s derived from byte deltas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_rate: f64,
    pub tx_rate: f64,
    pub total_rate: f64,
}

/// Node disk counters summed over whole block devices (partitions and loop
/// devices excluded). Rates are MiB/s derived from sector deltas at 512 bytes
/// per sector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStats {
    pub reads_completed: u64,
    pub reads_merged: u64,
    pub sectors_read: u64,
    pub time_reading: u64,
    pub writes_completed: u64,
    pub writes_merged: u64,
    pub sectors_written: u64,
    pub time_writing: u64,
    pub read_rate: f64,
    pub write_rate: f64,
    pub total_rate: f64,
}

/// Per-process CPU jiffies from `<pid>/stat`. `cpu_percent` is derived and
/// capped at 100 (single core).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodCpuStats {
    pub utime: u64,
    pub stime: u64,
    pub cpu_percent: f64,
}

/// Per-process memory from `<pid>/status`, in kibibytes. `mem_percent` is
/// VmRSS relative to the node's MemTotal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodMemoryStats {
    pub vm_size: u64,
    pub vm_rss: u64,
    pub mem_percent: f64,
}

/// Per-process network byte counters summed over non-loopback interfaces in
/// `<pid>/net/dev`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodNetworkStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Per-process block I/O byte counters from `<pid>/io`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodDiskStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Extended per-process details assembled from `<pid>/stat`, `<pid>/status`,
/// `<pid>/io`, `<pid>/cmdline`, `<pid>/stack`, `<pid>/fd`, `<pid>/limits` and
/// `<pid>/cgroup`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PidDetails {
    pub name: String,
    pub state: String,
    pub priority: i64,
    pub nice: i64,
    pub threads: i64,
    pub start_time: u64,
    pub realtime_priority: i64,
    pub cutime: u64,
    pub cstime: u64,
    pub task_cpu: i64,
    pub cpus_allowed_list: String,
    pub mems_allowed_list: String,
    pub voluntary_ctxt_switches: u64,
    pub nonvoluntary_ctxt_switches: u64,
    pub vm_peak: u64,
    pub vm_lck: u64,
    pub vm_pin: u64,
    pub vm_data: u64,
    pub vm_stk: u64,
    pub vm_exe: u64,
    pub vm_lib: u64,
    pub vm_swap: u64,
    pub cancelled_writes: u64,
    pub cmdline: String,
    pub kernel_stack: Vec<String>,
    pub open_fds: u64,
    pub max_fds: u64,
    pub cgroups: Vec<String>,
}

/// One pod's sample within a [`NodeSnapshot`].
///
/// A `pid` of `-1` marks a pod whose PID could not be resolved at enumeration
/// time; all derived fields stay zero for such pods.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSample {
    pub name: String,
    pub container_id: String,
    pub pid: i32,
    pub cpu: PodCpuStats,
    pub memory: PodMemoryStats,
    pub network: PodNetworkStats,
    pub disk: PodDiskStats,
    pub details: PidDetails,
}

/// One complete sample of node plus pod metrics at an instant, assembled by
/// the agent collector and streamed to the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub network: NetworkStats,
    pub disk: DiskStats,
    pub pods: Vec<PodSample>,
}

impl NodeSnapshot {
    /// Finds a pod sample by pod name.
    pub fn pod(&self, name: &str) -> Option<&PodSample> {
        self.pods.iter().find(|p| p.name == name)
    }
}
