//! In-process capability handles with message pipes, data pipes and shared
//! buffers.
//!
//! # Crate Structure
//!
//! - [`transport`]: control-plane contract every core operation is announced to
//! - [`wire`]: control-record codec and a stream-backed transport
//! - [`system`]: the handle table, pipes, buffers and waits
//!
//! The most used types from [`system`] are also re-exported at the root.

/// Re-export transport types.
pub mod transport {
    pub use ipcore_transport::*;
}

/// Re-export wire codec types.
pub mod wire {
    pub use ipcore_wire::*;
}

/// Re-export core types.
pub mod system {
    pub use ipcore_system::*;
}

pub use ipcore_system::{
    Core, CoreConfig, CoreError, CoreStats, Deadline, Handle, HandleId, HandleKind, Message,
    Signals, SignalsState,
};
