//! Server side of the bidirectional agent stream.
//!
//! Each stream gets a reader task that demultiplexes inbound messages:
//! `Hello` registers the stream, `Stats` refreshes liveness and feeds the
//! alert evaluator inline, `ProfileResponse` completes its correlation slot.
//! The response half is an mpsc-backed stream owned by the registry entry,
//! which keeps exactly one writer per node.

use podwatch_common::convert;
use podwatch_common::proto::node_service_server::NodeService;
use podwatch_common::proto::{agent_message, server_message, Ack, AgentMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use crate::state::AppState;

const STREAM_BUFFER: usize = 16;

pub struct NodeStreamService {
    state: AppState,
}

impl NodeStreamService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

struct Registration {
    node_name: String,
    generation: u64,
    cancel: CancellationToken,
}

#[tonic::async_trait]
impl NodeService for NodeStreamService {
    type AgentStreamStream = ReceiverStream<Result<ServerMessage, Status>>;

    async fn agent_stream(
        &self,
        request: Request<Streaming<AgentMessage>>,
    ) -> Result<Response<Self::AgentStreamStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut registration: Option<Registration> = None;

            loop {
                let message = if let Some(reg) = &registration {
                    tokio::select! {
                        _ = reg.cancel.cancelled() => {
                            tracing::info!(
                                node_name = %reg.node_name,
                                "Stream cancelled by registry"
                            );
                            break;
                        }
                        message = inbound.message() => message,
                    }
                } else {
                    inbound.message().await
                };

                match message {
                    Ok(Some(AgentMessage {
                        payload: Some(agent_message::Payload::Hello(hello)),
                    })) => {
                        tracing::info!(
                            node_name = %hello.node_name,
                            agent_version = %hello.agent_version,
                            "Agent hello"
                        );
                        let (cancel, generation) =
                            state.registry.register(&hello.node_name, tx.clone());
                        registration = Some(Registration {
                            node_name: hello.node_name.clone(),
                            generation,
                            cancel,
                        });

                        let ack = ServerMessage {
                            payload: Some(server_message::Payload::Ack(Ack {
                                message: format!("Welcome agent {}", hello.node_name),
                            })),
                        };
                        if tx.send(Ok(ack)).await.is_err() {
                            tracing::warn!(
                                node_name = %hello.node_name,
                                "Failed to send ack, closing stream"
                            );
                            break;
                        }
                    }

                    Ok(Some(AgentMessage {
                        payload: Some(agent_message::Payload::Stats(stats)),
                    })) => {
                        let snapshot = convert::snapshot_from_proto(stats);
                        tracing::debug!(
                            node_name = %snapshot.node_name,
                            pods = snapshot.pods.len(),
                            "Snapshot received"
                        );
                        state.registry.touch(&snapshot.node_name);
                        state.evaluator.evaluate_snapshot(&snapshot);
                        state.record_snapshot(snapshot);
                    }

                    Ok(Some(AgentMessage {
                        payload: Some(agent_message::Payload::ProfileResponse(response)),
                    })) => {
                        if response.request_id.is_empty() {
                            tracing::warn!("Profile response without request id, dropping");
                        } else {
                            let request_id = response.request_id.clone();
                            if !state.registry.complete_request(&request_id, response) {
                                tracing::debug!(
                                    request_id = %request_id,
                                    "Profile response for expired request, dropping"
                                );
                            }
                        }
                    }

                    Ok(Some(AgentMessage { payload: None })) => {
                        tracing::debug!("Ignoring empty agent message");
                    }

                    Ok(None) => {
                        tracing::info!("Agent closed the stream");
                        break;
                    }

                    Err(status) => {
                        tracing::warn!(error = %status, "Stream error");
                        break;
                    }
                }
            }

            if let Some(reg) = registration {
                state.registry.deregister(&reg.node_name, reg.generation);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
