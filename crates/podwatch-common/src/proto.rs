//! Wire protocol for the agent stream (`podwatch.v1`).
//!
//! Message types and the gRPC client/server glue are written out by hand with
//! `prost` derives rather than generated at build time, so the workspace
//! builds without a `protoc` toolchain. The client and server modules follow
//! the shape `tonic-build` emits for a single bidirectional-streaming method.

use prost::Message;

/// First message on every stream; registers the agent under its node name.
#[derive(Clone, PartialEq, Message)]
pub struct AgentHello {
    #[prost(string, tag = "1")]
    pub node_name: String,
    #[prost(string, tag = "2")]
    pub agent_version: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CpuStatsProto {
    #[prost(uint64, tag = "1")]
    pub user: u64,
    #[prost(uint64, tag = "2")]
    pub nice: u64,
    #[prost(uint64, tag = "3")]
    pub system: u64,
    #[prost(uint64, tag = "4")]
    pub idle: u64,
    #[prost(uint64, tag = "5")]
    pub iowait: u64,
    #[prost(uint64, tag = "6")]
    pub irq: u64,
    #[prost(uint64, tag = "7")]
    pub softirq: u64,
    #[prost(uint64, tag = "8")]
    pub steal: u64,
    #[prost(uint64, tag = "9")]
    pub total: u64,
    #[prost(double, tag = "10")]
    pub cpu_percent: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct MemoryStatsProto {
    #[prost(uint64, tag = "1")]
    pub mem_total: u64,
    #[prost(uint64, tag = "2")]
    pub mem_free: u64,
    #[prost(uint64, tag = "3")]
    pub mem_available: u64,
    #[prost(uint64, tag = "4")]
    pub buffers: u64,
    #[prost(uint64, tag = "5")]
    pub cached: u64,
    #[prost(uint64, tag = "6")]
    pub swap_cached: u64,
    #[prost(uint64, tag = "7")]
    pub swap_total: u64,
    #[prost(uint64, tag = "8")]
    pub swap_free: u64,
    #[prost(double, tag = "9")]
    pub memory_percent: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct NetworkStatsProto {
    #[prost(uint64, tag = "1")]
    pub rx_bytes: u64,
    #[prost(uint64, tag = "2")]
    pub tx_bytes: u64,
    #[prost(uint64, tag = "3")]
    pub rx_packets: u64,
    #[prost(uint64, tag = "4")]
    pub tx_packets: u64,
    #[prost(uint64, tag = "5")]
    pub rx_errors: u64,
    #[prost(uint64, tag = "6")]
    pub tx_errors: u64,
    #[prost(double, tag = "7")]
    pub rx_rate: f64,
    #[prost(double, tag = "8")]
    pub tx_rate: f64,
    #[prost(double, tag = "9")]
    pub total_rate: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct DiskStatsProto {
    #[prost(uint64, tag = "1")]
    pub reads_completed: u64,
    #[prost(uint64, tag = "2")]
    pub reads_merged: u64,
    #[prost(uint64, tag = "3")]
    pub sectors_read: u64,
    #[prost(uint64, tag = "4")]
    pub time_reading: u64,
    #[prost(uint64, tag = "5")]
    pub writes_completed: u64,
    #[prost(uint64, tag = "6")]
    pub writes_merged: u64,
    #[prost(uint64, tag = "7")]
    pub sectors_written: u64,
    #[prost(uint64, tag = "8")]
    pub time_writing: u64,
    #[prost(double, tag = "9")]
    pub read_rate: f64,
    #[prost(double, tag = "10")]
    pub write_rate: f64,
    #[prost(double, tag = "11")]
    pub total_rate: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PodCpuProto {
    #[prost(uint64, tag = "1")]
    pub utime: u64,
    #[prost(uint64, tag = "2")]
    pub stime: u64,
    #[prost(double, tag = "3")]
    pub cpu_percent: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PodMemoryProto {
    #[prost(uint64, tag = "1")]
    pub vm_size: u64,
    #[prost(uint64, tag = "2")]
    pub vm_rss: u64,
    #[prost(double, tag = "3")]
    pub mem_percent: f64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PodNetworkProto {
    #[prost(uint64, tag = "1")]
    pub rx_bytes: u64,
    #[prost(uint64, tag = "2")]
    pub tx_bytes: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PodDiskProto {
    #[prost(uint64, tag = "1")]
    pub read_bytes: u64,
    #[prost(uint64, tag = "2")]
    pub write_bytes: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PidDetailsProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub state: String,
    #[prost(int64, tag = "3")]
    pub priority: i64,
    #[prost(int64, tag = "4")]
    pub nice: i64,
    #[prost(int64, tag = "5")]
    pub threads: i64,
    #[prost(uint64, tag = "6")]
    pub start_time: u64,
    #[prost(int64, tag = "7")]
    pub realtime_priority: i64,
    #[prost(uint64, tag = "8")]
    pub cutime: u64,
    #[prost(uint64, tag = "9")]
    pub cstime: u64,
    #[prost(int64, tag = "10")]
    pub task_cpu: i64,
    #[prost(string, tag = "11")]
    pub cpus_allowed_list: String,
    #[prost(string, tag = "12")]
    pub mems_allowed_list: String,
    #[prost(uint64, tag = "13")]
    pub voluntary_ctxt_switches: u64,
    #[prost(uint64, tag = "14")]
    pub nonvoluntary_ctxt_switches: u64,
    #[prost(uint64, tag = "15")]
    pub vm_peak: u64,
    #[prost(uint64, tag = "16")]
    pub vm_lck: u64,
    #[prost(uint64, tag = "17")]
    pub vm_pin: u64,
    #[prost(uint64, tag = "18")]
    pub vm_data: u64,
    #[prost(uint64, tag = "19")]
    pub vm_stk: u64,
    #[prost(uint64, tag = "20")]
    pub vm_exe: u64,
    #[prost(uint64, tag = "21")]
    pub vm_lib: u64,
    #[prost(uint64, tag = "22")]
    pub vm_swap: u64,
    #[prost(uint64, tag = "23")]
    pub cancelled_writes: u64,
    #[prost(string, tag = "24")]
    pub cmdline: String,
    #[prost(string, repeated, tag = "25")]
    pub kernel_stack: Vec<String>,
    #[prost(uint64, tag = "26")]
    pub open_fds: u64,
    #[prost(uint64, tag = "27")]
    pub max_fds: u64,
    #[prost(string, repeated, tag = "28")]
    pub cgroups: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PodSampleProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub container_id: String,
    #[prost(int32, tag = "3")]
    pub pid: i32,
    #[prost(message, optional, tag = "4")]
    pub cpu: Option<PodCpuProto>,
    #[prost(message, optional, tag = "5")]
    pub memory: Option<PodMemoryProto>,
    #[prost(message, optional, tag = "6")]
    pub network: Option<PodNetworkProto>,
    #[prost(message, optional, tag = "7")]
    pub disk: Option<PodDiskProto>,
    #[prost(message, optional, tag = "8")]
    pub details: Option<PidDetailsProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeStats {
    #[prost(string, tag = "1")]
    pub node_name: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "3")]
    pub cpu: Option<CpuStatsProto>,
    #[prost(message, optional, tag = "4")]
    pub memory: Option<MemoryStatsProto>,
    #[prost(message, optional, tag = "5")]
    pub network: Option<NetworkStatsProto>,
    #[prost(message, optional, tag = "6")]
    pub disk: Option<DiskStatsProto>,
    #[prost(message, repeated, tag = "7")]
    pub pods: Vec<PodSampleProto>,
}

/// Server-to-agent command to record a CPU profile for one pod.
#[derive(Clone, PartialEq, Message)]
pub struct ProfileRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub node_name: String,
    #[prost(string, tag = "3")]
    pub pod_name: String,
    #[prost(int32, tag = "4")]
    pub duration_seconds: i32,
}

/// Agent-to-server reply carrying the serialized flamegraph tree (or an
/// error message with an empty payload).
#[derive(Clone, PartialEq, Message)]
pub struct ProfileResponse {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "3")]
    pub format: String,
    #[prost(string, tag = "4")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Ack {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Envelope for everything the agent sends upstream.
#[derive(Clone, PartialEq, Message)]
pub struct AgentMessage {
    #[prost(oneof = "agent_message::Payload", tags = "1, 2, 3")]
    pub payload: Option<agent_message::Payload>,
}

pub mod agent_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Hello(super::AgentHello),
        #[prost(message, tag = "2")]
        Stats(super::NodeStats),
        #[prost(message, tag = "3")]
        ProfileResponse(super::ProfileResponse),
    }
}

/// Envelope for everything the server sends downstream.
#[derive(Clone, PartialEq, Message)]
pub struct ServerMessage {
    #[prost(oneof = "server_message::Payload", tags = "1, 2")]
    pub payload: Option<server_message::Payload>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Ack(super::Ack),
        #[prost(message, tag = "2")]
        ProfileRequest(super::ProfileRequest),
    }
}

pub mod node_service_client {
    use super::*;
    use tonic::codegen::*;

    /// Client for the bidirectional agent stream.
    #[derive(Debug, Clone)]
    pub struct NodeServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl NodeServiceClient<tonic::transport::Channel> {
        /// Connects to the server over a lazily established channel.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }

        pub fn new(channel: tonic::transport::Channel) -> Self {
            Self {
                inner: tonic::client::Grpc::new(channel),
            }
        }
    }

    impl<T> NodeServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        /// Opens the bidirectional stream. The first message sent must be an
        /// [`AgentHello`].
        pub async fn agent_stream(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = AgentMessage>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<ServerMessage>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/podwatch.v1.NodeService/AgentStream");
            self.inner
                .streaming(request.into_streaming_request(), path, codec)
                .await
        }
    }
}

pub mod node_service_server {
    use super::*;
    use tonic::codegen::*;

    /// Service trait implemented by the server's ingress handler.
    #[async_trait]
    pub trait NodeService: Send + Sync + 'static {
        /// Server streaming response type for the `AgentStream` method.
        type AgentStreamStream: tonic::codegen::tokio_stream::Stream<
                Item = std::result::Result<super::ServerMessage, tonic::Status>,
            > + Send
            + 'static;

        async fn agent_stream(
            &self,
            request: tonic::Request<tonic::Streaming<super::AgentMessage>>,
        ) -> std::result::Result<tonic::Response<Self::AgentStreamStream>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct NodeServiceServer<T: NodeService> {
        inner: Arc<T>,
    }

    impl<T: NodeService> NodeServiceServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for NodeServiceServer<T>
    where
        T: NodeService,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/podwatch.v1.NodeService/AgentStream" => {
                    #[allow(non_camel_case_types)]
                    struct AgentStreamSvc<T: NodeService>(pub Arc<T>);
                    impl<T: NodeService> tonic::server::StreamingService<super::AgentMessage>
                        for AgentStreamSvc<T>
                    {
                        type Response = super::ServerMessage;
                        type ResponseStream = T::AgentStreamStream;
                        type Future =
                            BoxFuture<tonic::Response<Self::ResponseStream>, tonic::Status>;

                        fn call(
                            &mut self,
                            request: tonic::Request<tonic::Streaming<super::AgentMessage>>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            let fut = async move { (*inner).agent_stream(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = Arc::clone(&self.inner);
                    let fut = async move {
                        let method = AgentStreamSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        let res = grpc.streaming(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }

    impl<T: NodeService> Clone for NodeServiceServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<T: NodeService> tonic::server::NamedService for NodeServiceServer<T> {
        const NAME: &'static str = "podwatch.v1.NodeService";
    }
}
