//! Conversions between the serde-facing domain model and the wire protocol.
//!
//! Proto sub-messages are optional on the wire; missing ones decode to
//! zeroed domain records so a truncated snapshot never aborts ingest.

use chrono::{DateTime, Utc};

use crate::proto;
use crate::types::{
    CpuStats, DiskStats, MemoryStats, NetworkStats, NodeSnapshot, PidDetails, PodCpuStats,
    PodDiskStats, PodMemoryStats, PodNetworkStats, PodSample,
};

pub fn timestamp_to_proto(ts: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: ts.timestamp(),
        nanos: ts.timestamp_subsec_nanos() as i32,
    }
}

pub fn timestamp_from_proto(ts: &prost_types::Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32).unwrap_or_default()
}

pub fn snapshot_to_proto(s: &NodeSnapshot) -> proto::NodeStats {
    proto::NodeStats {
        node_name: s.node_name.clone(),
        timestamp: Some(timestamp_to_proto(s.timestamp)),
        cpu: Some(cpu_to_proto(&s.cpu)),
        memory: Some(memory_to_proto(&s.memory)),
        network: Some(network_to_proto(&s.network)),
        disk: Some(disk_to_proto(&s.disk)),
        pods: s.pods.iter().map(pod_to_proto).collect(),
    }
}

pub fn snapshot_from_proto(p: proto::NodeStats) -> NodeSnapshot {
    NodeSnapshot {
        node_name: p.node_name,
        timestamp: p
            .timestamp
            .as_ref()
            .map(timestamp_from_proto)
            .unwrap_or_default(),
        cpu: p.cpu.map(cpu_from_proto).unwrap_or_default(),
        memory: p.memory.map(memory_from_proto).unwrap_or_default(),
        network: p.network.map(network_from_proto).unwrap_or_default(),
        disk: p.disk.map(disk_from_proto).unwrap_or_default(),
        pods: p.pods.into_iter().map(pod_from_proto).collect(),
    }
}

fn cpu_to_proto(c: &CpuStats) -> proto::CpuStatsProto {
    proto::CpuStatsProto {
        user: c.user,
        nice: c.nice,
        system: c.system,
        idle: c.idle,
        iowait: c.iowait,
        irq: c.irq,
        softirq: c.softirq,
        steal: c.steal,
        total: c.total,
        cpu_percent: c.cpu_percent,
    }
}

fn cpu_from_proto(p: proto::CpuStatsProto) -> CpuStats {
    CpuStats {
        user: p.user,
        nice: p.nice,
        system: p.system,
        idle: p.idle,
        iowait: p.iowait,
        irq: p.irq,
        softirq: p.softirq,
        steal: p.steal,
        total: p.total,
        cpu_percent: p.cpu_percent,
    }
}

fn memory_to_proto(m: &MemoryStats) -> proto::MemoryStatsProto {
    proto::MemoryStatsProto {
        mem_total: m.mem_total,
        mem_free: m.mem_free,
        mem_available: m.mem_available,
        buffers: m.buffers,
        cached: m.cached,
        swap_cached: m.swap_cached,
        swap_total: m.swap_total,
        swap_free: m.swap_free,
        memory_percent: m.memory_percent,
    }
}

fn memory_from_proto(p: proto::MemoryStatsProto) -> MemoryStats {
    MemoryStats {
        mem_total: p.mem_total,
        mem_free: p.mem_free,
        mem_available: p.mem_available,
        buffers: p.buffers,
        cached: p.cached,
        swap_cached: p.swap_cached,
        swap_total: p.swap_total,
        swap_free: p.swap_free,
        memory_percent: p.memory_percent,
    }
}

fn network_to_proto(n: &NetworkStats) -> proto::NetworkStatsProto {
    proto::NetworkStatsProto {
        rx_bytes: n.rx_bytes,
        tx_bytes: n.tx_bytes,
        rx_packets: n.rx_packets,
        tx_packets: n.tx_packets,
        rx_errors: n.rx_errors,
        tx_errors: n.tx_errors,
        rx_rate: n.rx_rate,
        tx_rate: n.tx_rate,
        total_rate: n.total_rate,
    }
}

fn network_from_proto(p: proto::NetworkStatsProto) -> NetworkStats {
    NetworkStats {
        rx_bytes: p.rx_bytes,
        tx_bytes: p.tx_bytes,
        rx_packets: p.rx_packets,
        tx_packets: p.tx_packets,
        rx_errors: p.rx_errors,
        tx_errors: p.tx_errors,
        rx_rate: p.rx_rate,
        tx_rate: p.tx_rate,
        total_rate: p.total_rate,
    }
}

fn disk_to_proto(d: &DiskStats) -> proto::DiskStatsProto {
    proto::DiskStatsProto {
        reads_completed: d.reads_completed,
        reads_merged: d.reads_merged,
        sectors_read: d.sectors_read,
        time_reading: d.time_reading,
        writes_completed: d.writes_completed,
        writes_merged: d.writes_merged,
        sectors_written: d.sectors_written,
        time_writing: d.time_writing,
        read_rate: d.read_rate,
        write_rate: d.write_rate,
        total_rate: d.total_rate,
    }
}

fn disk_from_proto(p: proto::DiskStatsProto) -> DiskStats {
    DiskStats {
        reads_completed: p.reads_completed,
        reads_merged: p.reads_merged,
        sectors_read: p.sectors_read,
        time_reading: p.time_reading,
        writes_completed: p.writes_completed,
        writes_merged: p.writes_merged,
        sectors_written: p.sectors_written,
        time_writing: p.time_writing,
        read_rate: p.read_rate,
        write_rate: p.write_rate,
        total_rate: p.total_rate,
    }
}

fn pod_to_proto(p: &PodSample) -> proto::PodSampleProto {
    proto::PodSampleProto {
        name: p.name.clone(),
        container_id: p.container_id.clone(),
        pid: p.pid,
        cpu: Some(proto::PodCpuProto {
            utime: p.cpu.utime,
            stime: p.cpu.stime,
            cpu_percent: p.cpu.cpu_percent,
        }),
        memory: Some(proto::PodMemoryProto {
            vm_size: p.memory.vm_size,
            vm_rss: p.memory.vm_rss,
            mem_percent: p.memory.mem_percent,
        }),
        network: Some(proto::PodNetworkProto {
            rx_bytes: p.network.rx_bytes,
            tx_bytes: p.network.tx_bytes,
        }),
        disk: Some(proto::PodDiskProto {
            read_bytes: p.disk.read_bytes,
            write_bytes: p.disk.write_bytes,
        }),
        details: Some(details_to_proto(&p.details)),
    }
}

fn pod_from_proto(p: proto::PodSampleProto) -> PodSample {
    PodSample {
        name: p.name,
        container_id: p.container_id,
        pid: p.pid,
        cpu: p
            .cpu
            .map(|c| PodCpuStats {
                utime: c.utime,
                stime: c.stime,
                cpu_percent: c.cpu_percent,
            })
            .unwrap_or_default(),
        memory: p
            .memory
            .map(|m| PodMemoryStats {
                vm_size: m.vm_size,
                vm_rss: m.vm_rss,
                mem_percent: m.mem_percent,
            })
            .unwrap_or_default(),
        network: p
            .network
            .map(|n| PodNetworkStats {
                rx_bytes: n.rx_bytes,
                tx_bytes: n.tx_bytes,
            })
            .unwrap_or_default(),
        disk: p
            .disk
            .map(|d| PodDiskStats {
                read_bytes: d.read_bytes,
                write_bytes: d.write_bytes,
            })
            .unwrap_or_default(),
        details: p.details.map(details_from_proto).unwrap_or_default(),
    }
}

fn details_to_proto(d: &PidDetails) -> proto::PidDetailsProto {
    proto::PidDetailsProto {
        name: d.name.clone(),
        state: d.state.clone(),
        priority: d.priority,
        nice: d.nice,
        threads: d.threads,
        start_time: d.start_time,
        realtime_priority: d.realtime_priority,
        cutime: d.cutime,
        cstime: d.cstime,
        task_cpu: d.task_cpu,
        cpus_allowed_list: d.cpus_allowed_list.clone(),
        mems_allowed_list: d.mems_allowed_list.clone(),
        voluntary_ctxt_switches: d.voluntary_ctxt_switches,
        nonvoluntary_ctxt_switches: d.nonvoluntary_ctxt_switches,
        vm_peak: d.vm_peak,
        vm_lck: d.vm_lck,
        vm_pin: d.vm_pin,
        vm_data: d.vm_data,
        vm_stk: d.vm_stk,
        vm_exe: d.vm_exe,
        vm_lib: d.vm_lib,
        vm_swap: d.vm_swap,
        cancelled_writes: d.cancelled_writes,
        cmdline: d.cmdline.clone(),
        kernel_stack: d.kernel_stack.clone(),
        open_fds: d.open_fds,
        max_fds: d.max_fds,
        cgroups: d.cgroups.clone(),
    }
}

fn details_from_proto(p: proto::PidDetailsProto) -> PidDetails {
    PidDetails {
        name: p.name,
        state: p.state,
        priority: p.priority,
        nice: p.nice,
        threads: p.threads,
        start_time: p.start_time,
        realtime_priority: p.realtime_priority,
        cutime: p.cutime,
        cstime: p.cstime,
        task_cpu: p.task_cpu,
        cpus_allowed_list: p.cpus_allowed_list,
        mems_allowed_list: p.mems_allowed_list,
        voluntary_ctxt_switches: p.voluntary_ctxt_switches,
        nonvoluntary_ctxt_switches: p.nonvoluntary_ctxt_switches,
        vm_peak: p.vm_peak,
        vm_lck: p.vm_lck,
        vm_pin: p.vm_pin,
        vm_data: p.vm_data,
        vm_stk: p.vm_stk,
        vm_exe: p.vm_exe,
        vm_lib: p.vm_lib,
        vm_swap: p.vm_swap,
        cancelled_writes: p.cancelled_writes,
        cmdline: p.cmdline,
        kernel_stack: p.kernel_stack,
        open_fds: p.open_fds,
        max_fds: p.max_fds,
        cgroups: p.cgroups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use prost::Message;

    fn sample_snapshot() -> NodeSnapshot {
        NodeSnapshot {
            node_name: "worker-1".into(),
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 5).unwrap(),
            cpu: CpuStats {
                user: 100,
                nice: 2,
                system: 50,
                idle: 800,
                iowait: 10,
                irq: 1,
                softirq: 3,
                steal: 0,
                total: 966,
                cpu_percent: 17.2,
            },
            memory: MemoryStats {
                mem_total: 16_384_000,
                mem_free: 4_000_000,
                mem_available: 8_000_000,
                buffers: 120_000,
                cached: 900_000,
                swap_cached: 0,
                swap_total: 2_000_000,
                swap_free: 2_000_000,
                memory_percent: 51.17,
            },
            network: NetworkStats {
                rx_bytes: 123_456_789,
                tx_bytes: 98_765_432,
                rx_packets: 5000,
                tx_packets: 4000,
                rx_errors: 1,
                tx_errors: 0,
                rx_rate: 1.5,
                tx_rate: 0.75,
                total_rate: 2.25,
            },
            disk: DiskStats {
                reads_completed: 900,
                reads_merged: 20,
                sectors_read: 40_000,
                time_reading: 300,
                writes_completed: 1200,
                writes_merged: 45,
                sectors_written: 88_000,
                time_writing: 450,
                read_rate: 0.2,
                write_rate: 0.4,
                total_rate: 0.6,
            },
            pods: vec![PodSample {
                name: "web-6f7c".into(),
                container_id: "containerd://abc123".into(),
                pid: 4242,
                cpu: PodCpuStats {
                    utime: 500,
                    stime: 120,
                    cpu_percent: 12.4,
                },
                memory: PodMemoryStats {
                    vm_size: 1_048_576,
                    vm_rss: 262_144,
                    mem_percent: 1.6,
                },
                network: PodNetworkStats {
                    rx_bytes: 1024,
                    tx_bytes: 2048,
                },
                disk: PodDiskStats {
                    read_bytes: 4096,
                    write_bytes: 8192,
                },
                details: PidDetails {
                    name: "nginx".into(),
                    state: "S".into(),
                    priority: 20,
                    nice: 0,
                    threads: 4,
                    start_time: 12345678,
                    realtime_priority: 0,
                    cutime: 10,
                    cstime: 5,
                    task_cpu: 2,
                    cpus_allowed_list: "0-3".into(),
                    mems_allowed_list: "0".into(),
                    voluntary_ctxt_switches: 999,
                    nonvoluntary_ctxt_switches: 12,
                    vm_peak: 1_100_000,
                    vm_lck: 0,
                    vm_pin: 0,
                    vm_data: 500_000,
                    vm_stk: 132,
                    vm_exe: 800,
                    vm_lib: 9000,
                    vm_swap: 0,
                    cancelled_writes: 77,
                    cmdline: "nginx -g daemon off;".into(),
                    kernel_stack: vec!["[<0>] ep_poll".into(), "[<0>] do_epoll_wait".into()],
                    open_fds: 32,
                    max_fds: 1024,
                    cgroups: vec!["0::/kubepods/pod1/abc123".into()],
                },
            }],
        }
    }

    #[test]
    fn snapshot_round_trips_through_wire_encoding() {
        let snapshot = sample_snapshot();
        let proto = snapshot_to_proto(&snapshot);
        let bytes = proto.encode_to_vec();
        let decoded = proto::NodeStats::decode(bytes.as_slice()).unwrap();
        let back = snapshot_from_proto(decoded);
        assert_eq!(snapshot, back);
    }

    #[test]
    fn missing_submessages_decode_to_zeroed_records() {
        let wire = proto::NodeStats {
            node_name: "bare".into(),
            timestamp: None,
            cpu: None,
            memory: None,
            network: None,
            disk: None,
            pods: vec![proto::PodSampleProto {
                name: "p".into(),
                container_id: String::new(),
                pid: -1,
                cpu: None,
                memory: None,
                network: None,
                disk: None,
                details: None,
            }],
        };
        let snap = snapshot_from_proto(wire);
        assert_eq!(snap.cpu, CpuStats::default());
        assert_eq!(snap.pods[0].pid, -1);
        assert_eq!(snap.pods[0].cpu, PodCpuStats::default());
    }

    #[test]
    fn timestamp_preserves_subsecond_precision() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let wire = timestamp_to_proto(ts);
        assert_eq!(wire.seconds, 1_700_000_000);
        assert_eq!(wire.nanos, 123_456_789);
        assert_eq!(timestamp_from_proto(&wire), ts);
    }
}
