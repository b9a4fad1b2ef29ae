//! Capability handle table, message pipes, data pipes and shared buffers.
//!
//! Everything starts from a [`Core`]: an explicitly constructed registry
//! that owns the handle table. Create pipes and buffers through it, move
//! handles between endpoints inside messages, and block on readiness with
//! [`Core::wait`] / [`Core::wait_many`], the only operations that suspend.
//!
//! ```
//! use ipcore_system::{Core, Deadline, ReadMessageFlags, Signals, WriteMessageFlags};
//!
//! let core = Core::new();
//! let (left, right) = core.create_message_pipe()?;
//! left.write_message(b"hello", &mut Vec::new(), WriteMessageFlags::NONE)?;
//! core.wait(&right, Signals::READABLE, Deadline::Infinite)?;
//! let message = right.read_message(0, ReadMessageFlags::NONE)?;
//! assert_eq!(message.bytes.as_ref(), b"hello");
//! left.close()?;
//! right.close()?;
//! # Ok::<(), ipcore_system::CoreError>(())
//! ```

pub mod config;
pub mod core;
pub mod data_pipe;
pub mod error;
pub mod flags;
pub mod handle;
pub mod message_pipe;
pub mod reader;
pub mod shared_buffer;
pub mod waitable;

mod table;

pub use crate::core::{Core, CoreStats};
pub use config::CoreConfig;
pub use data_pipe::{DataPipeOptions, ReadRegion, WriteRegion};
pub use error::{CoreError, Result, WaitManyError};
pub use flags::{
    MapFlags, ReadDataFlags, ReadMessageFlags, Signals, SignalsState, WriteDataFlags,
    WriteMessageFlags,
};
pub use handle::{
    AsHandle, ConsumerHandle, Handle, HandleId, HandleKind, KindMismatch, MessagePipeHandle,
    ProducerHandle, SharedBufferHandle, UntypedHandle,
};
pub use message_pipe::Message;
pub use reader::{HandleReader, ReadBatch};
pub use shared_buffer::{DuplicateOptions, Mapping, SharedBufferInfo, SharedBufferOptions};
pub use waitable::Deadline;
