//! Parameter table shared with the peer
//!
//! The store holds the local copy with its bounds; the facade reads and
//! writes the peer's copy through a request broker.

pub mod facade;
pub mod store;

pub use self::facade::ParameterFacade;
pub use self::store::{MemoryStore, ParamSpec, ParameterStore};
