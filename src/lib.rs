//! wirefiled — the wire-level session and request plane of a
//! multi-protocol network file server: SMB (NetBIOS-framed and
//! Direct-TCP/445) and ONC-RPC (portmapper, MOUNT) transports share one
//! connection-acceptance, packet-pool, framing, and request-dispatch core.
//!
//! The SMB dialect state machines, NFSv3 operation semantics,
//! authentication providers, storage drivers, configuration loading, and
//! CLI entry points are external collaborators; this crate specifies
//! their trait boundaries ([`external`]) without implementing their
//! bodies.

pub mod change;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connections_handler;
pub mod error;
pub mod external;
pub mod lock;
pub mod pool;
pub mod request_handler;
pub mod rpc;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use error::{Error, Result};
pub use server::Server;
