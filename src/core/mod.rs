//! Core types and traits for the tether link
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod config;
pub mod error;
pub mod serde;
pub mod types;

use std::net::Ipv4Addr;

pub use self::config::{default_bind_addr, Config, KeepaliveConfig};
pub use self::error::{Error, Result};
pub use self::types::{CommandId, LinkState, ParamId, Role};

/// Port the actuator controller listens on
pub const DEFAULT_PORT: u16 = 3333;

/// Address of the actuator controller on its own access point
pub const DEFAULT_SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
