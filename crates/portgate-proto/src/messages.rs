//! Protocol message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Control-channel message.
///
/// Serialized as a JSON object with a `type` discriminator and camelCase
/// payload fields. Unknown fields are ignored for forward compatibility;
/// unknown `type` values fail decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client credentials, first frame of every session.
    #[serde(rename_all = "camelCase")]
    Auth { token: String },

    #[serde(rename_all = "camelCase")]
    AuthSuccess { client_id: String },

    #[serde(rename_all = "camelCase")]
    AuthFailed { reason: String },

    /// Client declares the tunnels it wants exposed.
    #[serde(rename_all = "camelCase")]
    RegisterTunnels { tunnels: Vec<TunnelSpec> },

    #[serde(rename_all = "camelCase")]
    TunnelRegistered {
        remote_port: u16,
        local_port: u16,
        name: String,
    },

    #[serde(rename_all = "camelCase")]
    TunnelFailed { remote_port: u16, error: String },

    /// Server announces an accepted external connection and asks for a data
    /// channel.
    #[serde(rename_all = "camelCase")]
    NewConnection {
        connection_id: String,
        remote_port: u16,
        client_address: String,
    },

    /// Client reports the loopback port its one-shot data listener is bound
    /// to.
    #[serde(rename_all = "camelCase")]
    ConnectionReady { connection_id: String, data_port: u16 },

    #[serde(rename_all = "camelCase")]
    ConnectionClosed { connection_id: String, reason: String },

    StatusRequest,

    #[serde(rename_all = "camelCase")]
    StatusResponse {
        client_id: String,
        tunnels: Vec<TunnelInfo>,
        #[serde(rename = "uptime")]
        uptime_secs: u64,
        timestamp: DateTime<Utc>,
    },

    Ping,
    Pong,
}

impl ControlMessage {
    /// Short name for logging, mirrors the wire `type` value.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Auth { .. } => "auth",
            ControlMessage::AuthSuccess { .. } => "auth_success",
            ControlMessage::AuthFailed { .. } => "auth_failed",
            ControlMessage::RegisterTunnels { .. } => "register_tunnels",
            ControlMessage::TunnelRegistered { .. } => "tunnel_registered",
            ControlMessage::TunnelFailed { .. } => "tunnel_failed",
            ControlMessage::NewConnection { .. } => "new_connection",
            ControlMessage::ConnectionReady { .. } => "connection_ready",
            ControlMessage::ConnectionClosed { .. } => "connection_closed",
            ControlMessage::StatusRequest => "status_request",
            ControlMessage::StatusResponse { .. } => "status_response",
            ControlMessage::Ping => "ping",
            ControlMessage::Pong => "pong",
        }
    }
}

/// Tunnel protocol. TCP is the only supported value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    #[default]
    Tcp,
}

/// A client-declared tunnel: expose `remote_port` on the server, forward to
/// `local_port` next to the client. `remote_port` is the identity; `name` is
/// advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    pub remote_port: u16,
    pub local_port: u16,
    pub name: String,
    #[serde(default)]
    pub protocol: TunnelProtocol,
}

impl TunnelSpec {
    pub fn new(remote_port: u16, local_port: u16, name: impl Into<String>) -> Self {
        Self {
            remote_port,
            local_port,
            name: name.into(),
            protocol: TunnelProtocol::Tcp,
        }
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.remote_port, self.local_port, self.name)
    }
}

/// Error parsing the `"<remotePort>:<localPort>:<name>"` config form.
#[derive(Debug, Error, PartialEq)]
pub enum TunnelSpecError {
    #[error("tunnel spec '{0}' must have the form <remotePort>:<localPort>:<name>")]
    Malformed(String),

    #[error("invalid port '{0}' in tunnel spec")]
    InvalidPort(String),

    #[error("tunnel spec '{0}' has an empty name")]
    EmptyName(String),
}

impl FromStr for TunnelSpec {
    type Err = TunnelSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (remote, local, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(r), Some(l), Some(n)) => (r.trim(), l.trim(), n.trim()),
            _ => return Err(TunnelSpecError::Malformed(s.to_string())),
        };

        let remote_port: u16 = remote
            .parse()
            .map_err(|_| TunnelSpecError::InvalidPort(remote.to_string()))?;
        let local_port: u16 = local
            .parse()
            .map_err(|_| TunnelSpecError::InvalidPort(local.to_string()))?;
        if remote_port == 0 || local_port == 0 {
            return Err(TunnelSpecError::InvalidPort("0".to_string()));
        }
        if name.is_empty() {
            return Err(TunnelSpecError::EmptyName(s.to_string()));
        }

        Ok(TunnelSpec::new(remote_port, local_port, name))
    }
}

/// Per-tunnel snapshot carried in `status_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub remote_port: u16,
    pub local_port: u16,
    pub name: String,
    pub active_connections: u64,
    pub total_connections: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}
