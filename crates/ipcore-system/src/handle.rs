//! Handle identity and ownership.
//!
//! A [`HandleId`] is the raw, copyable table key. The owned capability is
//! [`UntypedHandle`] and its typed wrappers; they are not `Clone`, so a
//! handle has exactly one holder. Closing consumes the handle. Dropping a
//! handle that was never closed still closes it, but that is reported as a
//! leak (see [`CoreStats::leaked_handles`](crate::CoreStats)).

use std::fmt;
use std::num::NonZeroU32;

use crate::core::Core;
use crate::error::Result;

/// Process-local identifier of a live handle. Zero is never valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(NonZeroU32);

impl HandleId {
    pub fn from_u32(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    pub fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    MessagePipe,
    DataPipeProducer,
    DataPipeConsumer,
    SharedBuffer,
}

impl HandleKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::MessagePipe => "message-pipe",
            Self::DataPipeProducer => "data-pipe-producer",
            Self::DataPipeConsumer => "data-pipe-consumer",
            Self::SharedBuffer => "shared-buffer",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An owned handle whose kind has not been checked.
pub struct UntypedHandle {
    id: HandleId,
    core: Core,
    armed: bool,
}

impl UntypedHandle {
    pub(crate) fn new(id: HandleId, core: Core) -> Self {
        Self {
            id,
            core,
            armed: true,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Close the handle. The identifier is invalid once this returns.
    pub fn close(mut self) -> Result<()> {
        self.armed = false;
        self.core.close_id(self.id)
    }

    /// Whether the identifier still names a live entry.
    pub fn is_valid(&self) -> bool {
        self.core.is_live(self.id)
    }

    /// Look up the kind of the referenced object.
    pub fn kind(&self) -> Result<HandleKind> {
        self.core.kind_of(self.id)
    }

    /// Checked narrowing into the [`Handle`] sum type.
    pub fn classify(self) -> Result<Handle> {
        let handle = match self.kind()? {
            HandleKind::MessagePipe => Handle::MessagePipe(MessagePipeHandle(self)),
            HandleKind::DataPipeProducer => Handle::DataPipeProducer(ProducerHandle(self)),
            HandleKind::DataPipeConsumer => Handle::DataPipeConsumer(ConsumerHandle(self)),
            HandleKind::SharedBuffer => Handle::SharedBuffer(SharedBufferHandle(self)),
        };
        Ok(handle)
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// Give up ownership without closing; the entry has moved elsewhere.
    pub(crate) fn disarm(mut self) -> HandleId {
        self.armed = false;
        self.id
    }
}

impl Drop for UntypedHandle {
    fn drop(&mut self) {
        if self.armed {
            self.core.close_leaked(self.id);
        }
    }
}

impl fmt::Debug for UntypedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UntypedHandle")
            .field("id", &self.id)
            .field("armed", &self.armed)
            .finish()
    }
}

/// Access to the owned handle behind a typed wrapper.
pub trait AsHandle {
    fn as_untyped(&self) -> &UntypedHandle;

    fn handle_id(&self) -> HandleId {
        self.as_untyped().id()
    }
}

impl AsHandle for UntypedHandle {
    fn as_untyped(&self) -> &UntypedHandle {
        self
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident, $variant:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name(UntypedHandle);

        impl $name {
            pub(crate) fn from_untyped(handle: UntypedHandle) -> Self {
                Self(handle)
            }

            pub fn id(&self) -> HandleId {
                self.0.id()
            }

            pub fn close(self) -> Result<()> {
                self.0.close()
            }

            pub fn into_untyped(self) -> UntypedHandle {
                self.0
            }

            pub fn core(&self) -> &Core {
                self.0.core()
            }
        }

        impl AsHandle for $name {
            fn as_untyped(&self) -> &UntypedHandle {
                &self.0
            }
        }

        impl From<$name> for UntypedHandle {
            fn from(handle: $name) -> Self {
                handle.0
            }
        }

        impl From<$name> for Handle {
            fn from(handle: $name) -> Self {
                Handle::$variant(handle)
            }
        }

        impl TryFrom<Handle> for $name {
            type Error = KindMismatch;

            fn try_from(handle: Handle) -> std::result::Result<Self, KindMismatch> {
                match handle {
                    Handle::$variant(handle) => Ok(handle),
                    other => Err(KindMismatch {
                        expected: $kind,
                        handle: other,
                    }),
                }
            }
        }
    };
}

typed_handle!(
    /// One endpoint of a message pipe.
    MessagePipeHandle,
    MessagePipe,
    HandleKind::MessagePipe
);
typed_handle!(
    /// The writing end of a data pipe.
    ProducerHandle,
    DataPipeProducer,
    HandleKind::DataPipeProducer
);
typed_handle!(
    /// The reading end of a data pipe.
    ConsumerHandle,
    DataPipeConsumer,
    HandleKind::DataPipeConsumer
);
typed_handle!(
    /// A handle to a shared memory region.
    SharedBufferHandle,
    SharedBuffer,
    HandleKind::SharedBuffer
);

/// An owned handle tagged with its kind.
#[derive(Debug)]
pub enum Handle {
    MessagePipe(MessagePipeHandle),
    DataPipeProducer(ProducerHandle),
    DataPipeConsumer(ConsumerHandle),
    SharedBuffer(SharedBufferHandle),
}

impl Handle {
    pub fn kind(&self) -> HandleKind {
        match self {
            Self::MessagePipe(_) => HandleKind::MessagePipe,
            Self::DataPipeProducer(_) => HandleKind::DataPipeProducer,
            Self::DataPipeConsumer(_) => HandleKind::DataPipeConsumer,
            Self::SharedBuffer(_) => HandleKind::SharedBuffer,
        }
    }

    pub fn id(&self) -> HandleId {
        self.as_untyped().id()
    }

    pub fn close(self) -> Result<()> {
        UntypedHandle::from(self).close()
    }
}

impl AsHandle for Handle {
    fn as_untyped(&self) -> &UntypedHandle {
        match self {
            Self::MessagePipe(handle) => handle.as_untyped(),
            Self::DataPipeProducer(handle) => handle.as_untyped(),
            Self::DataPipeConsumer(handle) => handle.as_untyped(),
            Self::SharedBuffer(handle) => handle.as_untyped(),
        }
    }
}

impl From<Handle> for UntypedHandle {
    fn from(handle: Handle) -> Self {
        match handle {
            Handle::MessagePipe(handle) => handle.into(),
            Handle::DataPipeProducer(handle) => handle.into(),
            Handle::DataPipeConsumer(handle) => handle.into(),
            Handle::SharedBuffer(handle) => handle.into(),
        }
    }
}

/// A narrowing conversion found a different kind. The handle is returned
/// intact so the caller still owns it.
#[derive(Debug, thiserror::Error)]
#[error("expected a {expected} handle, found a {} handle", .handle.kind())]
pub struct KindMismatch {
    pub expected: HandleKind,
    pub handle: Handle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;

    #[test]
    fn zero_is_not_a_handle_id() {
        assert!(HandleId::from_u32(0).is_none());
        assert_eq!(HandleId::from_u32(7).unwrap().as_u32(), 7);
        assert_eq!(HandleId::from_u32(7).unwrap().to_string(), "#7");
    }

    #[test]
    fn classify_reports_the_real_kind() {
        let core = Core::new();
        let (producer, consumer) = core.create_data_pipe(None).unwrap();

        let handle = producer.into_untyped().classify().unwrap();
        assert_eq!(handle.kind(), HandleKind::DataPipeProducer);
        let handle = consumer.into_untyped().classify().unwrap();
        assert_eq!(handle.kind(), HandleKind::DataPipeConsumer);

        assert_eq!(core.stats().live_handles, 2);
    }

    #[test]
    fn narrowing_to_the_wrong_kind_hands_the_handle_back() {
        let core = Core::new();
        let buffer = core.create_shared_buffer(None, 64).unwrap();
        let id = buffer.id();

        let err = MessagePipeHandle::try_from(Handle::from(buffer)).unwrap_err();
        assert_eq!(err.expected, HandleKind::MessagePipe);
        assert_eq!(
            err.to_string(),
            "expected a message-pipe handle, found a shared-buffer handle"
        );
        assert_eq!(err.handle.id(), id);
        assert!(core.is_live(id));

        let buffer = SharedBufferHandle::try_from(err.handle).unwrap();
        buffer.close().unwrap();
        assert_eq!(core.stats().leaked_handles, 0);
    }

    #[test]
    fn close_invalidates_the_identifier_synchronously() {
        let core = Core::new();
        let (a, b) = core.create_message_pipe().unwrap();
        let id = a.id();
        a.close().unwrap();
        assert!(!core.is_live(id));
        assert!(b.as_untyped().is_valid());
        b.close().unwrap();
    }
}
