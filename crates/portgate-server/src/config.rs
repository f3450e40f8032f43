//! Server configuration record.

use portgate_proto::PortList;
use std::time::Duration;

/// Configuration consumed by [`crate::Server`]. Binaries assemble this from
/// CLI flags and environment variables; tests build it directly.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host for the control listener and every public tunnel port.
    pub host: String,
    /// Control port clients dial. Zero picks an ephemeral port.
    pub control_port: u16,
    /// Accepted auth tokens. Empty accepts any client (logged loudly).
    pub auth_tokens: Vec<String>,
    /// Public ports clients may register. Empty allows all.
    pub allowed_ports: PortList,
    /// Address the server dials to reach a client's data listener.
    pub client_data_host: String,
    /// Deadline for a rendezvous to complete, and for the data-channel dial.
    pub connection_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            control_port: 7000,
            auth_tokens: Vec::new(),
            allowed_ports: PortList::allow_all(),
            client_data_host: "localhost".to_string(),
            connection_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(60),
        }
    }
}
