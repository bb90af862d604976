//! Previous-sample cache backing the delta calculator.
//!
//! Two segments, node-keyed and PID-keyed. Entries expire one minute after
//! their last update; expiry sweeps run opportunistically about every thirty
//! seconds from the update path, and the PID segment is additionally
//! intersected with the live PID set at the end of every tick so pod churn
//! cannot grow it without bound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use podwatch_common::types::{CpuStats, DiskStats, NetworkStats, PodCpuStats};

const ENTRY_TTL: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CachedNodeSample {
    pub cpu: CpuStats,
    pub network: NetworkStats,
    pub disk: DiskStats,
    pub sampled_at: DateTime<Utc>,
    stored_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CachedPodSample {
    pub cpu: PodCpuStats,
    pub sampled_at: DateTime<Utc>,
    stored_at: Instant,
}

/// Owned by the collector task; never shared.
pub struct MetricsCache {
    node: HashMap<String, CachedNodeSample>,
    pods: HashMap<i32, CachedPodSample>,
    last_sweep: Instant,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self {
            node: HashMap::new(),
            pods: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Stores the new node sample and returns the previous one, if still
    /// fresh.
    pub fn update_node(
        &mut self,
        node_name: &str,
        cpu: CpuStats,
        network: NetworkStats,
        disk: DiskStats,
        sampled_at: DateTime<Utc>,
    ) -> Option<CachedNodeSample> {
        self.maybe_sweep();
        self.node.insert(
            node_name.to_string(),
            CachedNodeSample {
                cpu,
                network,
                disk,
                sampled_at,
                stored_at: Instant::now(),
            },
        )
    }

    /// Stores the new per-PID sample and returns the previous one.
    pub fn update_pod(
        &mut self,
        pid: i32,
        cpu: PodCpuStats,
        sampled_at: DateTime<Utc>,
    ) -> Option<CachedPodSample> {
        self.pods.insert(
            pid,
            CachedPodSample {
                cpu,
                sampled_at,
                stored_at: Instant::now(),
            },
        )
    }

    /// Drops PID entries that are not in the tick's live set.
    pub fn retain_pids(&mut self, live: &[i32]) {
        self.pods.retain(|pid, _| live.contains(pid));
    }

    pub fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub fn contains_pid(&self, pid: i32) -> bool {
        self.pods.contains_key(&pid)
    }

    fn maybe_sweep(&mut self) {
        if self.last_sweep.elapsed() < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = Instant::now();
        self.node.retain(|_, e| e.stored_at.elapsed() < ENTRY_TTL);
        self.pods.retain(|_, e| e.stored_at.elapsed() < ENTRY_TTL);
    }
}

impl Default for MetricsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_update_returns_previous_sample() {
        let mut cache = MetricsCache::new();
        let t0 = Utc::now();

        assert!(cache
            .update_node("n1", CpuStats::default(), NetworkStats::default(), DiskStats::default(), t0)
            .is_none());

        let prev = cache
            .update_node(
                "n1",
                CpuStats {
                    user: 10,
                    ..Default::default()
                },
                NetworkStats::default(),
                DiskStats::default(),
                t0 + chrono::Duration::seconds(5),
            )
            .unwrap();
        assert_eq!(prev.sampled_at, t0);
        assert_eq!(prev.cpu.user, 0);
    }

    #[test]
    fn pid_segment_intersects_with_live_set() {
        let mut cache = MetricsCache::new();
        let now = Utc::now();
        for pid in [100, 200, 300] {
            cache.update_pod(pid, PodCpuStats::default(), now);
        }

        cache.retain_pids(&[100, 300]);
        assert_eq!(cache.pod_count(), 2);
        assert!(cache.contains_pid(100));
        assert!(!cache.contains_pid(200));

        // The key set is always a subset of the last live set.
        cache.retain_pids(&[]);
        assert_eq!(cache.pod_count(), 0);
    }

    #[test]
    fn pod_update_keeps_entries_distinct_by_pid() {
        let mut cache = MetricsCache::new();
        let now = Utc::now();
        cache.update_pod(1, PodCpuStats { utime: 5, ..Default::default() }, now);
        cache.update_pod(2, PodCpuStats { utime: 9, ..Default::default() }, now);

        let prev = cache.update_pod(1, PodCpuStats::default(), now).unwrap();
        assert_eq!(prev.cpu.utime, 5);
        assert!(cache.contains_pid(2));
    }
}
