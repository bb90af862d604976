//! Directory of live agent streams and outstanding profile requests.
//!
//! Keyed by node name with a five-minute liveness TTL: `Hello` installs the
//! stream handle (closing any previous one, so each node has exactly one
//! live writer), every `Stats` refreshes the TTL, and reads through
//! [`AgentRegistry::sender`] refresh it too. A separate short-lived table
//! correlates profile request ids to single-shot response slots; agent
//! de-registration deliberately leaves those slots alone, because the
//! response may still arrive over a reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use podwatch_common::proto::{server_message, ProfileRequest, ProfileResponse, ServerMessage};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const AGENT_TTL: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Per-message deadline for handing a command to a stream writer.
const SEND_DEADLINE: Duration = Duration::from_secs(5);
/// Longer than any profile's planned duration plus post-processing.
pub const PROFILE_TIMEOUT: Duration = Duration::from_secs(600);

pub type StreamSender = mpsc::Sender<Result<ServerMessage, tonic::Status>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry: no agent connected for node {0}")]
    NotConnected(String),

    #[error("registry: stream to node {0} is closed")]
    StreamClosed(String),

    #[error("registry: profile request timed out")]
    Timeout,
}

struct AgentEntry {
    generation: u64,
    tx: StreamSender,
    cancel: CancellationToken,
    expires_at: Instant,
}

struct PendingProfile {
    slot: oneshot::Sender<ProfileResponse>,
    expires_at: Instant,
}

pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentEntry>>,
    requests: Mutex<HashMap<String, PendingProfile>>,
    generations: AtomicU64,
    agent_ttl: Duration,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_ttl(AGENT_TTL)
    }

    pub fn with_ttl(agent_ttl: Duration) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            agent_ttl,
        }
    }

    /// Installs the stream handle for a node, closing any pre-existing one.
    /// Returns the stream's cancellation token and its registration
    /// generation, which [`Self::deregister`] needs back.
    pub fn register(&self, node_name: &str, tx: StreamSender) -> (CancellationToken, u64) {
        let cancel = CancellationToken::new();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let previous = self.agents.lock().unwrap().insert(
            node_name.to_string(),
            AgentEntry {
                generation,
                tx,
                cancel: cancel.clone(),
                expires_at: Instant::now() + self.agent_ttl,
            },
        );
        if let Some(previous) = previous {
            tracing::info!(node_name, "Closing existing stream for node");
            previous.cancel.cancel();
        }

        tracing::info!(node_name, "Registered agent");
        (cancel, generation)
    }

    /// Removes the node's entry, but only if it still belongs to the given
    /// registration; a reconnected agent's fresh entry survives the old
    /// stream's teardown. In-flight profile slots are left untouched.
    pub fn deregister(&self, node_name: &str, generation: u64) {
        let mut agents = self.agents.lock().unwrap();
        let owned = agents
            .get(node_name)
            .is_some_and(|entry| entry.generation == generation);
        if owned {
            if let Some(entry) = agents.remove(node_name) {
                entry.cancel.cancel();
                tracing::info!(node_name, "Unregistered agent");
            }
        }
    }

    /// Refreshes the liveness TTL; called for every inbound `Stats`.
    pub fn touch(&self, node_name: &str) {
        if let Some(entry) = self.agents.lock().unwrap().get_mut(node_name) {
            entry.expires_at = Instant::now() + self.agent_ttl;
        }
    }

    /// The stream handle for a node. Reads refresh the TTL so an actively
    /// used connection never expires.
    pub fn sender(&self, node_name: &str) -> Result<StreamSender, RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let entry = agents
            .get_mut(node_name)
            .ok_or_else(|| RegistryError::NotConnected(node_name.to_string()))?;
        entry.expires_at = Instant::now() + self.agent_ttl;
        Ok(entry.tx.clone())
    }

    pub fn connected_nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.agents.lock().unwrap().keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Registers a response slot for an outstanding profile request.
    pub fn register_request(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<ProfileResponse> {
        let (slot, receiver) = oneshot::channel();
        self.requests.lock().unwrap().insert(
            request_id.to_string(),
            PendingProfile {
                slot,
                expires_at: Instant::now() + timeout,
            },
        );
        receiver
    }

    /// Delivers a response exactly once and deletes the entry. Unknown or
    /// duplicate ids are dropped without error and reported as `false`.
    pub fn complete_request(&self, request_id: &str, response: ProfileResponse) -> bool {
        let Some(pending) = self.requests.lock().unwrap().remove(request_id) else {
            return false;
        };
        // The consumer may have timed out and dropped its receiver; that is
        // not an error either.
        let _ = pending.slot.send(response);
        true
    }

    /// Frees a slot whose consumer gave up.
    pub fn cancel_request(&self, request_id: &str) {
        self.requests.lock().unwrap().remove(request_id);
    }

    /// Sends a profile command to the node's stream and awaits the
    /// correlated response.
    pub async fn dispatch_profile(
        &self,
        node_name: &str,
        pod_name: &str,
        duration_seconds: i32,
        timeout: Duration,
    ) -> Result<ProfileResponse, RegistryError> {
        let tx = self.sender(node_name)?;

        let request_id = Uuid::new_v4().to_string();
        let receiver = self.register_request(&request_id, timeout);

        let message = ServerMessage {
            payload: Some(server_message::Payload::ProfileRequest(ProfileRequest {
                request_id: request_id.clone(),
                node_name: node_name.to_string(),
                pod_name: pod_name.to_string(),
                duration_seconds,
            })),
        };
        match tokio::time::timeout(SEND_DEADLINE, tx.send(Ok(message))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                self.cancel_request(&request_id);
                return Err(RegistryError::StreamClosed(node_name.to_string()));
            }
        }

        tracing::info!(
            node_name,
            pod_name,
            request_id = %request_id,
            "Waiting for profile response"
        );
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            // Slot evicted or sweeper dropped it.
            Ok(Err(_)) => Err(RegistryError::Timeout),
            Err(_) => {
                self.cancel_request(&request_id);
                Err(RegistryError::Timeout)
            }
        }
    }

    /// Evicts expired agents (firing their cancellation tokens) and expired
    /// request slots (silently).
    pub fn sweep(&self) {
        let now = Instant::now();

        let mut expired = Vec::new();
        {
            let mut agents = self.agents.lock().unwrap();
            agents.retain(|node_name, entry| {
                if entry.expires_at <= now {
                    expired.push((node_name.clone(), entry.cancel.clone()));
                    false
                } else {
                    true
                }
            });
        }
        for (node_name, cancel) in expired {
            tracing::info!(node_name = %node_name, "Agent stream expired");
            cancel.cancel();
        }

        self.requests
            .lock()
            .unwrap()
            .retain(|_, pending| pending.expires_at > now);
    }

    /// Periodic eviction loop.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep(),
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podwatch_common::proto::server_message::Payload;

    fn agent_channel() -> (StreamSender, mpsc::Receiver<Result<ServerMessage, tonic::Status>>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn hello_replaces_existing_stream_for_node() {
        let registry = AgentRegistry::new();
        let (tx1, _rx1) = agent_channel();
        let (cancel1, gen1) = registry.register("worker-1", tx1);

        let (tx2, _rx2) = agent_channel();
        let (cancel2, _gen2) = registry.register("worker-1", tx2);

        // The first stream was told to close; the second is live.
        assert!(cancel1.is_cancelled());
        assert!(!cancel2.is_cancelled());
        assert_eq!(registry.connected_nodes(), vec!["worker-1".to_string()]);

        // The stale stream's teardown must not evict the replacement.
        registry.deregister("worker-1", gen1);
        assert_eq!(registry.connected_nodes(), vec!["worker-1".to_string()]);
    }

    #[tokio::test]
    async fn deregister_removes_own_registration() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = agent_channel();
        let (_cancel, generation) = registry.register("worker-1", tx);

        registry.deregister("worker-1", generation);
        assert!(registry.connected_nodes().is_empty());
        assert!(matches!(
            registry.sender("worker-1"),
            Err(RegistryError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_agents() {
        let registry = AgentRegistry::with_ttl(Duration::from_millis(50));
        let (tx1, _rx1) = agent_channel();
        let (cancel1, _) = registry.register("idle", tx1);
        let (tx2, _rx2) = agent_channel();
        let (cancel2, _) = registry.register("busy", tx2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // A Stats message refreshes "busy" just in time.
        registry.touch("busy");
        registry.sweep();

        assert!(cancel1.is_cancelled());
        assert!(!cancel2.is_cancelled());
        assert_eq!(registry.connected_nodes(), vec!["busy".to_string()]);
    }

    #[tokio::test]
    async fn profile_dispatch_correlates_by_request_id() {
        let registry = std::sync::Arc::new(AgentRegistry::new());
        let (tx, mut rx) = agent_channel();
        registry.register("worker-1", tx);

        // Fake agent: answer whatever request id arrives, after a delay.
        let agent_registry = registry.clone();
        let agent = tokio::spawn(async move {
            let message = rx.recv().await.unwrap().unwrap();
            let Some(Payload::ProfileRequest(request)) = message.payload else {
                panic!("expected a profile request");
            };
            tokio::time::sleep(Duration::from_millis(30)).await;
            agent_registry.complete_request(
                &request.request_id,
                ProfileResponse {
                    request_id: request.request_id.clone(),
                    payload: b"flame".to_vec(),
                    format: "json".to_string(),
                    error: String::new(),
                },
            );
        });

        let response = registry
            .dispatch_profile("worker-1", "web", 5, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.payload, b"flame");
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn late_or_unknown_responses_are_dropped_without_error() {
        let registry = AgentRegistry::new();

        // Nothing pending under this id.
        let delivered = registry.complete_request(
            "r2",
            ProfileResponse {
                request_id: "r2".to_string(),
                ..Default::default()
            },
        );
        assert!(!delivered);

        // A consumer that timed out: the slot is freed, the late response is
        // swallowed, a duplicate too.
        let receiver = registry.register_request("r1", Duration::from_secs(60));
        drop(receiver);
        assert!(registry.complete_request("r1", ProfileResponse::default()));
        assert!(!registry.complete_request("r1", ProfileResponse::default()));
    }

    #[tokio::test]
    async fn dispatch_times_out_when_agent_never_replies() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = agent_channel();
        registry.register("worker-1", tx);

        let result = registry
            .dispatch_profile("worker-1", "web", 5, Duration::from_millis(40))
            .await;
        assert!(matches!(result, Err(RegistryError::Timeout)));

        // The slot was freed; a late completion is a quiet no-op.
        assert!(!registry.complete_request("anything", ProfileResponse::default()));
    }

    #[tokio::test]
    async fn request_slots_survive_agent_deregistration() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = agent_channel();
        let (_cancel, generation) = registry.register("worker-1", tx);

        let receiver = registry.register_request("r1", Duration::from_secs(60));
        registry.deregister("worker-1", generation);

        // The response arrives over a reconnect and still finds its slot.
        assert!(registry.complete_request(
            "r1",
            ProfileResponse {
                request_id: "r1".to_string(),
                payload: b"late".to_vec(),
                ..Default::default()
            }
        ));
        assert_eq!(receiver.await.unwrap().payload, b"late");
    }

    #[tokio::test]
    async fn expired_request_slots_are_swept_silently() {
        let registry = AgentRegistry::new();
        let mut receiver = registry.register_request("r1", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.sweep();

        assert!(!registry.complete_request("r1", ProfileResponse::default()));
        assert!(receiver.try_recv().is_err());
    }
}
