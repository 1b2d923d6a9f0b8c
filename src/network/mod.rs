//! Link management
//!
//! This module owns the socket lifecycle, the request/response broker and
//! the keepalive probe.

mod broker;
mod connection;
mod keepalive;
mod role;

pub use self::broker::RequestBroker;
pub use self::connection::Connection;
pub use self::keepalive::{FailureFn, KeepaliveMonitor, ProbeFn};

pub(crate) use self::connection::send_command;

#[cfg(test)]
pub(crate) use self::broker::testing;
