use std::path::Path;

use serde::Deserialize;

use crate::pods::PodRef;

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_endpoint")]
    pub server_endpoint: String,
    /// Overridden by the `NODE_NAME` environment variable; falls back to the
    /// hostname when neither is set.
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default = "default_collection_interval_secs")]
    pub collection_interval_secs: u64,
    /// Config-pinned pod list for deployments without cluster discovery.
    #[serde(default)]
    pub pods: Vec<PodRef>,
}

fn default_server_endpoint() -> String {
    "http://127.0.0.1:50051".to_string()
}

fn default_collection_interval_secs() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_endpoint: default_server_endpoint(),
            node_name: None,
            collection_interval_secs: default_collection_interval_secs(),
            pods: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Loads the TOML config; a missing file means defaults, so the agent
    /// runs from environment alone.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!(path, "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn resolve_node_name(&self) -> anyhow::Result<String> {
        if let Ok(name) = std::env::var("NODE_NAME") {
            if !name.is_empty() {
                return Ok(name);
            }
        }
        if let Some(name) = &self.node_name {
            return Ok(name.clone());
        }
        let hostname = hostname::get()?
            .into_string()
            .map_err(|_| anyhow::anyhow!("hostname is not valid UTF-8"))?;
        Ok(hostname)
    }
}

/// The dev-mode convention: the variable named `DEV_MODE` holds the literal
/// `"true"`, read once at startup.
pub fn dev_mode() -> bool {
    std::env::var("DEV_MODE").map(|v| v == "true").unwrap_or(false)
}
