//! API server configuration

use std::net::SocketAddr;

use trellis_shared::PipelineConfig;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub pipeline: PipelineConfig,
}

impl ApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = std::env::var("API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        Ok(Self {
            bind_addr: format!("{host}:{port}").parse()?,
            pipeline: PipelineConfig::from_env()?,
        })
    }
}
