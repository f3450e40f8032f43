//! Public-facing half of portgate.
//!
//! The server accepts client control sessions on one port and, per
//! registered tunnel, exposes a public TCP port. Each external connection is
//! matched with a freshly dialed data channel from the owning client and the
//! two sockets are spliced.

pub mod config;
pub mod control;
pub mod registry;
pub mod rendezvous;
pub mod server;

pub use config::ServerConfig;
pub use registry::{RegisterError, TunnelRegistry, TunnelStats};
pub use rendezvous::ConnectionTable;
pub use server::{Server, ServerError};
