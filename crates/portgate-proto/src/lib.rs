//! Control-channel protocol for portgate.
//!
//! Messages travel as length-delimited JSON objects, one per WebSocket text
//! frame, with a `type` discriminator. This crate holds the message types,
//! the codec, tunnel specifications, and the public-port allowlist shared by
//! server and client.

pub mod codec;
pub mod messages;
pub mod ports;

pub use codec::{decode, encode, ProtocolError};
pub use messages::{ControlMessage, TunnelInfo, TunnelProtocol, TunnelSpec};
pub use ports::PortList;
