//! Tether: a symmetric binary RPC link over TCP
//!
//! One side runs as a server, the other as a client. Either side can read
//! and write the other's parameter table, send commands, and probe the
//! peer for liveness. The link reconnects on its own until stopped.
pub mod core;
pub mod network;
pub mod params;
pub mod protocol;
mod util;

// Re-export commonly used items
pub use crate::core::{CommandId, Config, Error, KeepaliveConfig, LinkState, ParamId, Result, Role};
pub use crate::network::{Connection, RequestBroker};
pub use crate::params::{MemoryStore, ParamSpec, ParameterFacade, ParameterStore};
pub use crate::protocol::{FrameDispatcher, ParameterDispatcher};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
