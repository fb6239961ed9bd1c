use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::{
    auth::AuthBridge,
    config::ServerConfig,
    registry::{ChannelRegistry, RegistryConfig},
    token::SubmissionTokens,
};

/// Process-wide relay state, shared by every handler through `Arc<AppState>`.
pub struct AppState {
    pub registry: ChannelRegistry,
    pub auth: AuthBridge,
    pub tokens: SubmissionTokens,
    pub handshake_timeout: Option<Duration>,
    pub testing: bool,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn from_config(config: &ServerConfig) -> Result<Self, reqwest::Error> {
        let registry = ChannelRegistry::new(RegistryConfig {
            channel_depth: config.channel_depth,
            send_timeout: config.send_timeout,
        });
        let auth = AuthBridge::new(config.auth_url.clone(), config.auth_timeout)?;
        Ok(Self {
            registry,
            auth,
            tokens: SubmissionTokens::new(&config.client_id, &config.client_secret),
            handshake_timeout: config.handshake_timeout,
            testing: config.testing,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn render_metrics(&self) -> Option<String> {
        self.metrics.as_ref().map(PrometheusHandle::render)
    }
}
