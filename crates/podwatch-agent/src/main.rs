mod cache;
mod calculator;
mod collector;
mod config;
mod error;
mod flamegraph;
mod pods;
mod stream;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use podwatch_procfs::NodeReader;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::collector::Collector;
use crate::flamegraph::FlamegraphGenerator;
use crate::pods::{PodEnumerator, StaticPodEnumerator};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("podwatch=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());
    let config = config::AgentConfig::load(&config_path)?;
    let dev_mode = config::dev_mode();
    let node_name = config.resolve_node_name()?;

    tracing::info!(
        node_name = %node_name,
        dev_mode,
        server = %config.server_endpoint,
        interval_secs = config.collection_interval_secs,
        "podwatch-agent starting"
    );

    let reader = NodeReader::for_mode(dev_mode);
    let enumerator: Arc<dyn PodEnumerator> = if !config.pods.is_empty() {
        Arc::new(StaticPodEnumerator::new(config.pods.clone()))
    } else if dev_mode {
        Arc::new(StaticPodEnumerator::dev_sample())
    } else {
        Arc::new(StaticPodEnumerator::new(Vec::new()))
    };

    let shutdown = CancellationToken::new();
    let flamegraph = Arc::new(FlamegraphGenerator::new(dev_mode));
    let (sender, agent_stream) = stream::channel(
        config.server_endpoint.clone(),
        node_name.clone(),
        flamegraph,
        shutdown.clone(),
    );

    // The first dial is fatal so a bad endpoint surfaces at startup; after
    // steady state begins, transport errors only trigger reconnects.
    let session = agent_stream.establish().await?;

    let collector = Collector::new(reader, enumerator, node_name);
    let collector_task = tokio::spawn(collector.run(
        Duration::from_secs(config.collection_interval_secs),
        sender,
        shutdown.clone(),
    ));
    let stream_task = tokio::spawn(agent_stream.run(session));

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    shutdown.cancel();
    let _ = collector_task.await;
    let _ = stream_task.await;

    Ok(())
}
