//! Pod enumeration interface.
//!
//! Cluster discovery is an external collaborator: something that, given a
//! node name, yields `{pod_name, container_id, pid}` triples with
//! container→PID already resolved. The agent only depends on the trait; the
//! static implementation backs dev mode and config-pinned deployments.

use serde::Deserialize;

/// One enumerated pod. A `pid` of `-1` means the PID could not be resolved.
#[derive(Debug, Clone, Deserialize)]
pub struct PodRef {
    pub name: String,
    #[serde(default)]
    pub container_id: String,
    #[serde(default = "unresolved_pid")]
    pub pid: i32,
}

fn unresolved_pid() -> i32 {
    -1
}

pub trait PodEnumerator: Send + Sync {
    fn pods_for_node(&self, node_name: &str) -> anyhow::Result<Vec<PodRef>>;
}

/// Serves a fixed pod list; the dev-mode stand-in for cluster discovery.
pub struct StaticPodEnumerator {
    pods: Vec<PodRef>,
}

impl StaticPodEnumerator {
    pub fn new(pods: Vec<PodRef>) -> Self {
        Self { pods }
    }

    /// A self-referential sample so the full per-PID pipeline runs on a
    /// laptop: the agent's own process plus one pod with an unresolvable PID.
    pub fn dev_sample() -> Self {
        Self::new(vec![
            PodRef {
                name: "podwatch-agent".to_string(),
                container_id: "dev://self".to_string(),
                pid: std::process::id() as i32,
            },
            PodRef {
                name: "unresolved-pod".to_string(),
                container_id: "dev://unresolved".to_string(),
                pid: -1,
            },
        ])
    }
}

impl PodEnumerator for StaticPodEnumerator {
    fn pods_for_node(&self, _node_name: &str) -> anyhow::Result<Vec<PodRef>> {
        Ok(self.pods.clone())
    }
}
