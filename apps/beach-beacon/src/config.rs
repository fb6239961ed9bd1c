use std::{net::SocketAddr, time::Duration};

use crate::registry::{DEFAULT_CHANNEL_DEPTH, DEFAULT_SEND_TIMEOUT};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 2;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = DEFAULT_SEND_TIMEOUT.as_millis() as u64;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Endpoint of the external authentication service.
    pub auth_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Serves the `/test` debug page when set.
    pub testing: bool,
    /// Bound on the wait for a client's token frame. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    pub auth_timeout: Duration,
    pub channel_depth: usize,
    /// Longest a notification waits on one connection's full queue.
    pub send_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn new(
        auth_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            auth_url: auth_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            testing: false,
            handshake_timeout: handshake_timeout_from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            channel_depth: DEFAULT_CHANNEL_DEPTH,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

/// `0` disables the handshake bound.
pub fn handshake_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

pub fn matches_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
