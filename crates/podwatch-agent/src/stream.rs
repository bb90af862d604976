//! Agent side of the bidirectional server stream.
//!
//! One persistent stream: `Hello` first, snapshots upstream, profiling
//! commands downstream, profiling responses upstream. The tonic request
//! stream pulling from the outbound channel is the only writer on the
//! socket; the collector and the profile workers both hand their messages to
//! it through that bounded channel. On any transport error the stream is torn
//! down and redialed with exponential backoff; snapshots produced during the
//! outage are dropped, never queued.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use podwatch_common::convert;
use podwatch_common::proto::node_service_client::NodeServiceClient;
use podwatch_common::proto::{self, agent_message, server_message};
use podwatch_common::types::NodeSnapshot;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::flamegraph::FlamegraphGenerator;

/// Per-message deadline for handing a message to the stream writer.
const SEND_DEADLINE: Duration = Duration::from_secs(5);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const OUTBOUND_BUFFER: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport: failed to connect: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("transport: stream rejected: {0}")]
    Rpc(#[from] tonic::Status),
}

/// Collector-facing send handle. Non-blocking: when the transport is busy or
/// down, the snapshot is dropped and the next tick sends fresh state.
#[derive(Clone)]
pub struct SnapshotSender {
    tx: mpsc::Sender<NodeSnapshot>,
    pod_index: Arc<RwLock<HashMap<String, i32>>>,
}

impl SnapshotSender {
    /// Refreshes the pod-name → PID index and queues the snapshot. Returns
    /// whether the snapshot was accepted.
    pub fn send(&self, snapshot: NodeSnapshot) -> bool {
        {
            let mut index = self.pod_index.write().unwrap();
            index.clear();
            for pod in &snapshot.pods {
                index.insert(pod.name.clone(), pod.pid);
            }
        }
        self.tx.try_send(snapshot).is_ok()
    }
}

/// An established stream: the outbound channel feeding the request stream
/// plus the inbound message stream.
pub struct Session {
    tx: mpsc::Sender<proto::AgentMessage>,
    inbound: tonic::codec::Streaming<proto::ServerMessage>,
}

enum ServeEnd {
    Shutdown,
    Disconnected,
}

pub struct AgentStream {
    endpoint: String,
    node_name: String,
    flamegraph: Arc<FlamegraphGenerator>,
    pod_index: Arc<RwLock<HashMap<String, i32>>>,
    snapshot_rx: mpsc::Receiver<NodeSnapshot>,
    shutdown: CancellationToken,
}

/// Builds the collector-side sender and the transport it feeds.
pub fn channel(
    endpoint: String,
    node_name: String,
    flamegraph: Arc<FlamegraphGenerator>,
    shutdown: CancellationToken,
) -> (SnapshotSender, AgentStream) {
    // Capacity 1: at most one snapshot rides out a transport stall, and it is
    // drained as stale on reconnect.
    let (tx, snapshot_rx) = mpsc::channel(1);
    let pod_index = Arc::new(RwLock::new(HashMap::new()));

    let sender = SnapshotSender {
        tx,
        pod_index: Arc::clone(&pod_index),
    };
    let stream = AgentStream {
        endpoint,
        node_name,
        flamegraph,
        pod_index,
        snapshot_rx,
        shutdown,
    };
    (sender, stream)
}

impl AgentStream {
    /// Dials the server and opens the stream, sending `Hello` as the first
    /// message. The caller treats a failure of the very first dial as fatal
    /// startup error.
    pub async fn establish(&self) -> Result<Session, TransportError> {
        let mut client = NodeServiceClient::connect(self.endpoint.clone()).await?;

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let hello = proto::AgentMessage {
            payload: Some(agent_message::Payload::Hello(proto::AgentHello {
                node_name: self.node_name.clone(),
                agent_version: env!("CARGO_PKG_VERSION").to_string(),
            })),
        };
        // The channel is freshly created; the only way this fails is a bug.
        tx.try_send(hello)
            .expect("outbound channel accepts the hello message");

        let response = client.agent_stream(ReceiverStream::new(rx)).await?;
        tracing::info!(node_name = %self.node_name, "Connected to server");
        Ok(Session {
            tx,
            inbound: response.into_inner(),
        })
    }

    /// Serves the initial session and reconnects forever until shutdown.
    pub async fn run(mut self, initial: Session) {
        let mut session = Some(initial);
        loop {
            let active = match session.take() {
                Some(active) => active,
                None => match self.reconnect().await {
                    Some(active) => active,
                    None => return,
                },
            };

            match self.serve(active).await {
                ServeEnd::Shutdown => {
                    tracing::info!("Stream transport shutting down");
                    return;
                }
                ServeEnd::Disconnected => {
                    tracing::warn!("Stream lost, entering reconnect loop");
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Option<Session> {
        let mut delay = RECONNECT_BASE;
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.establish().await {
                Ok(session) => return Some(session),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_delay_secs = delay.as_secs(),
                        "Reconnection failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(RECONNECT_CAP);
                }
            }
        }
    }

    async fn serve(&mut self, session: Session) -> ServeEnd {
        let Session { tx, mut inbound } = session;

        // Anything queued while disconnected is stale by now.
        while self.snapshot_rx.try_recv().is_ok() {}

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return ServeEnd::Shutdown,

                maybe_snapshot = self.snapshot_rx.recv() => {
                    let Some(snapshot) = maybe_snapshot else {
                        return ServeEnd::Shutdown;
                    };
                    let message = proto::AgentMessage {
                        payload: Some(agent_message::Payload::Stats(
                            convert::snapshot_to_proto(&snapshot),
                        )),
                    };
                    match tokio::time::timeout(SEND_DEADLINE, tx.send(message)).await {
                        Ok(Ok(())) => {
                            tracing::debug!(pods = snapshot.pods.len(), "Snapshot sent");
                        }
                        Ok(Err(_)) => {
                            tracing::warn!("Stream writer closed while sending snapshot");
                            return ServeEnd::Disconnected;
                        }
                        Err(_) => {
                            tracing::warn!("Snapshot send exceeded deadline");
                            return ServeEnd::Disconnected;
                        }
                    }
                }

                inbound_message = inbound.message() => {
                    match inbound_message {
                        Ok(Some(message)) => self.handle_server_message(message, &tx),
                        Ok(None) => {
                            tracing::info!("Server closed the stream");
                            return ServeEnd::Disconnected;
                        }
                        Err(status) => {
                            tracing::error!(error = %status, "Receiving message failed");
                            return ServeEnd::Disconnected;
                        }
                    }
                }
            }
        }
    }

    fn handle_server_message(
        &self,
        message: proto::ServerMessage,
        tx: &mpsc::Sender<proto::AgentMessage>,
    ) {
        match message.payload {
            Some(server_message::Payload::Ack(ack)) => {
                tracing::info!(message = %ack.message, "Received ack from server");
            }
            Some(server_message::Payload::ProfileRequest(request)) => {
                self.spawn_profile_worker(request, tx.clone());
            }
            None => {
                tracing::debug!("Ignoring empty server message");
            }
        }
    }

    /// Runs the profiler off the stream tasks and hands the response back to
    /// the writer through the outbound channel. Shutdown abandons the
    /// profile mid-flight.
    fn spawn_profile_worker(
        &self,
        request: proto::ProfileRequest,
        tx: mpsc::Sender<proto::AgentMessage>,
    ) {
        let generator = Arc::clone(&self.flamegraph);
        let pod_index = Arc::clone(&self.pod_index);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let pid = pod_index
                .read()
                .unwrap()
                .get(&request.pod_name)
                .copied()
                .unwrap_or(-1);
            tracing::info!(
                pod_name = %request.pod_name,
                pid,
                duration_seconds = request.duration_seconds,
                request_id = %request.request_id,
                "Profile requested"
            );

            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = generator.generate(
                    &request.node_name,
                    &request.pod_name,
                    request.duration_seconds,
                    pid,
                ) => result,
            };

            let response = match result {
                Ok(payload) => {
                    tracing::info!(
                        request_id = %request.request_id,
                        payload_bytes = payload.len(),
                        "Profile complete"
                    );
                    proto::ProfileResponse {
                        request_id: request.request_id,
                        payload,
                        format: "json".to_string(),
                        error: String::new(),
                    }
                }
                Err(e) => {
                    tracing::error!(
                        request_id = %request.request_id,
                        error = %e,
                        "Profile failed"
                    );
                    proto::ProfileResponse {
                        request_id: request.request_id,
                        payload: Vec::new(),
                        format: "json".to_string(),
                        error: e.to_string(),
                    }
                }
            };

            let message = proto::AgentMessage {
                payload: Some(agent_message::Payload::ProfileResponse(response)),
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                sent = tokio::time::timeout(SEND_DEADLINE, tx.send(message)) => {
                    match sent {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            tracing::warn!("Stream writer gone, dropping profile response");
                        }
                        Err(_) => {
                            tracing::warn!("Profile response send exceeded deadline, dropping");
                        }
                    }
                }
            }
        });
    }
}
