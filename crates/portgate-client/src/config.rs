//! Client configuration record.

use portgate_proto::TunnelSpec;
use std::time::Duration;

/// Configuration consumed by [`crate::TunnelClient`]. Binaries assemble this
/// from CLI flags and environment variables; tests build it directly.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub auth_token: String,
    /// Tunnels announced after every successful authentication.
    pub tunnels: Vec<TunnelSpec>,
    /// Host the local services live on.
    pub local_host: String,
    /// Reconnect attempts before giving up.
    pub reconnect_attempts: u32,
    /// Initial reconnect delay; doubles per failed attempt up to a ceiling.
    pub reconnect_delay: Duration,
    /// How long a data listener waits for the server's dial.
    pub connection_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 7000,
            auth_token: String::new(),
            tunnels: Vec::new(),
            local_host: "localhost".to_string(),
            reconnect_attempts: 999,
            reconnect_delay: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
        }
    }
}
