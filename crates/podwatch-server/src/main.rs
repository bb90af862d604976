use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use podwatch_alert::AlertEvaluator;
use podwatch_common::proto::node_service_server::NodeServiceServer;
use podwatch_notify::{LogNotifier, Notifier, WebhookNotifier};
use podwatch_store::{AlertStore, SqliteAlertStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use podwatch_server::api;
use podwatch_server::config::ServerConfig;
use podwatch_server::grpc::NodeStreamService;
use podwatch_server::registry::AgentRegistry;
use podwatch_server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("podwatch=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/server.toml".to_string());
    let config = ServerConfig::load(&config_path)?;

    let database_path = config.database_path();
    if let Some(parent) = Path::new(&database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store: Arc<dyn AlertStore> = Arc::new(SqliteAlertStore::open(&database_path)?);

    let notifier: Arc<dyn Notifier> = match config.webhook_url() {
        Some(url) => Arc::new(WebhookNotifier::new(url)),
        None => {
            tracing::warn!("No webhook URL configured, notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };

    let evaluator = Arc::new(AlertEvaluator::new(Arc::clone(&store), notifier));
    let registry = Arc::new(AgentRegistry::new());
    let state = AppState::new(Arc::clone(&registry), store, Arc::clone(&evaluator));

    let shutdown = CancellationToken::new();
    tokio::spawn(Arc::clone(&evaluator).run_renotifier(shutdown.clone()));
    tokio::spawn(Arc::clone(&registry).run_sweeper(shutdown.clone()));

    let grpc_addr: SocketAddr = format!("0.0.0.0:{}", config.grpc_port).parse()?;
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;

    let grpc_service = NodeServiceServer::new(NodeStreamService::new(state.clone()));
    let grpc_shutdown = shutdown.clone();
    let grpc_task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(grpc_service)
            .serve_with_shutdown(grpc_addr, async move { grpc_shutdown.cancelled().await })
            .await
    });
    tracing::info!(addr = %grpc_addr, "gRPC server listening");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(addr = %http_addr, "HTTP API listening");
    let app = api::router(state);
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    shutdown.cancel();
    let _ = grpc_task.await;
    let _ = http_task.await;

    Ok(())
}
