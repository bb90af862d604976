use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_grpc_port() -> u16 {
    50051
}

fn default_http_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "data/podwatch.db".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
            http_port: default_http_port(),
            database_path: default_database_path(),
            webhook_url: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!(path, "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Database location; the `DATABASE_URL` environment variable wins.
    pub fn database_path(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.database_path.clone())
    }

    /// Webhook endpoint; the `WEBHOOK_URL` environment variable wins.
    pub fn webhook_url(&self) -> Option<String> {
        std::env::var("WEBHOOK_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .or_else(|| self.webhook_url.clone())
    }
}
