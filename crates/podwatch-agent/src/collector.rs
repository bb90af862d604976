//! Per-tick snapshot assembly: procfs reads, pod enumeration, delta math.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use podwatch_common::types::{NodeSnapshot, PodSample};
use podwatch_procfs::NodeReader;
use tokio_util::sync::CancellationToken;

use crate::cache::MetricsCache;
use crate::calculator;
use crate::pods::PodEnumerator;
use crate::stream::SnapshotSender;

pub struct Collector {
    reader: NodeReader,
    enumerator: Arc<dyn PodEnumerator>,
    cache: MetricsCache,
    node_name: String,
}

impl Collector {
    pub fn new(reader: NodeReader, enumerator: Arc<dyn PodEnumerator>, node_name: String) -> Self {
        Self {
            reader,
            enumerator,
            cache: MetricsCache::new(),
            node_name,
        }
    }

    /// Periodic sampling loop. A failed tick is logged and skipped; the cache
    /// keeps the last good sample so the next tick still derives a correct
    /// rate over the longer window.
    pub async fn run(
        mut self,
        interval: Duration,
        sender: SnapshotSender,
        shutdown: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            node_name = %self.node_name,
            interval_secs = interval.as_secs(),
            "Starting collection loop"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.collect_at(Utc::now()) {
                        Ok(snapshot) => {
                            let pods = snapshot.pods.len();
                            if sender.send(snapshot) {
                                tracing::debug!(pods, "Snapshot queued for streaming");
                            } else {
                                tracing::debug!("Transport busy, snapshot dropped");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Skipping tick, collection failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Stopping collection loop");
                    break;
                }
            }
        }
    }

    /// Assembles one snapshot stamped `now`. Node-level read failures abort
    /// the tick before any cache update; per-pod failures zero that pod only.
    pub fn collect_at(&mut self, now: DateTime<Utc>) -> anyhow::Result<NodeSnapshot> {
        let cpu = self.reader.read_cpu()?;
        let mut memory = self.reader.read_memory()?;
        let network = self.reader.read_network()?;
        let disk = self.reader.read_disk()?;

        let pod_refs = self.enumerator.pods_for_node(&self.node_name)?;

        let previous = self
            .cache
            .update_node(&self.node_name, cpu.clone(), network.clone(), disk.clone(), now);

        let mut snapshot = NodeSnapshot {
            node_name: self.node_name.clone(),
            timestamp: now,
            cpu,
            memory: Default::default(),
            network,
            disk,
            pods: Vec::with_capacity(pod_refs.len()),
        };

        if let Some(prev) = previous {
            let dt = (now - prev.sampled_at).num_milliseconds() as f64 / 1000.0;
            snapshot.cpu.cpu_percent = calculator::node_cpu_percent(&snapshot.cpu, &prev.cpu);
            snapshot.network.rx_rate =
                calculator::rate_mib_per_sec(snapshot.network.rx_bytes, prev.network.rx_bytes, dt);
            snapshot.network.tx_rate =
                calculator::rate_mib_per_sec(snapshot.network.tx_bytes, prev.network.tx_bytes, dt);
            snapshot.network.total_rate = snapshot.network.rx_rate + snapshot.network.tx_rate;
            snapshot.disk.read_rate = calculator::sector_rate_mib_per_sec(
                snapshot.disk.sectors_read,
                prev.disk.sectors_read,
                dt,
            );
            snapshot.disk.write_rate = calculator::sector_rate_mib_per_sec(
                snapshot.disk.sectors_written,
                prev.disk.sectors_written,
                dt,
            );
            snapshot.disk.total_rate = snapshot.disk.read_rate + snapshot.disk.write_rate;
        }

        memory.memory_percent =
            calculator::node_memory_percent(memory.mem_total, memory.mem_available);
        snapshot.memory = memory;

        let mut live_pids = Vec::with_capacity(pod_refs.len());
        for pod_ref in pod_refs {
            let pod = self.collect_pod(&pod_ref, snapshot.memory.mem_total, now);
            if pod.pid > 0 {
                live_pids.push(pod.pid);
            }
            snapshot.pods.push(pod);
        }
        self.cache.retain_pids(&live_pids);

        Ok(snapshot)
    }

    /// Samples one pod. A failed per-PID read keeps the pod in the snapshot
    /// with zeroed metrics rather than aborting the tick.
    fn collect_pod(
        &mut self,
        pod_ref: &crate::pods::PodRef,
        node_mem_total_kb: u64,
        now: DateTime<Utc>,
    ) -> PodSample {
        let mut pod = PodSample {
            name: pod_ref.name.clone(),
            container_id: pod_ref.container_id.clone(),
            pid: pod_ref.pid,
            ..Default::default()
        };

        if pod_ref.pid <= 0 {
            return pod;
        }

        let raw = match self.reader.read_pid(pod_ref.pid) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(
                    pod_name = %pod_ref.name,
                    pid = pod_ref.pid,
                    error = %e,
                    "Per-PID read failed, reporting zeroed metrics"
                );
                return pod;
            }
        };

        pod.cpu = raw.cpu;
        pod.memory = raw.memory;
        pod.network = raw.network;
        pod.disk = raw.disk;
        pod.details = raw.details;

        let previous = self.cache.update_pod(pod_ref.pid, pod.cpu.clone(), now);
        if let Some(prev) = previous {
            let dt = (now - prev.sampled_at).num_milliseconds() as f64 / 1000.0;
            pod.cpu.cpu_percent = calculator::pod_cpu_percent(
                pod.cpu.utime.saturating_sub(prev.cpu.utime),
                pod.cpu.stime.saturating_sub(prev.cpu.stime),
                dt,
            );
        }
        pod.memory.mem_percent =
            calculator::pod_memory_percent(pod.memory.vm_rss, node_mem_total_kb);

        pod
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &MetricsCache {
        &self.cache
    }
}
