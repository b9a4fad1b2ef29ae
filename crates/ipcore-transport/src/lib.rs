//! Control-plane transport contract for the ipcore handle system.
//!
//! The core never moves bytes between processes itself. Every
//! create/close/write it performs is announced to a [`Transport`], and
//! waits drain the transport's event queue through
//! [`Transport::poll_event`]. This crate defines that contract plus two
//! in-process implementations:
//! - [`NullTransport`] accepts everything and never produces events
//! - [`LoopbackTransport`] reflects each control message back as an event
//!
//! This is the lowest layer of ipcore. The wire codec and the core build
//! on the types defined here.

pub mod error;
pub mod loopback;
pub mod traits;

pub use error::{Result, TransportError};
pub use loopback::LoopbackTransport;
pub use traits::{ControlEvent, ControlOp, NullTransport, ResultCode, Transport};
