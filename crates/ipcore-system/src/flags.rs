//! Flag bitmasks accepted by core operations.

use bitflags::bitflags;

bitflags! {
    /// Readiness conditions a handle can be waited on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Signals: u32 {
        /// A message or data is available to read.
        const READABLE = 1 << 0;
        /// A write would currently make progress.
        const WRITABLE = 1 << 1;
        /// The other end of the pipe has been closed.
        const PEER_CLOSED = 1 << 2;
    }
}

impl Signals {
    pub const NONE: Self = Self::empty();
}

/// Snapshot of a handle's readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalsState {
    /// Signals that hold right now.
    pub satisfied: Signals,
    /// Signals that may still hold at some point in the future.
    pub satisfiable: Signals,
}

impl SignalsState {
    pub fn new(satisfied: Signals, satisfiable: Signals) -> Self {
        Self {
            satisfied,
            satisfiable,
        }
    }

    /// True when any of `signals` currently holds.
    pub fn satisfies(&self, signals: Signals) -> bool {
        self.satisfied.intersects(signals)
    }

    /// True when any of `signals` could still come to hold.
    pub fn can_satisfy(&self, signals: Signals) -> bool {
        self.satisfiable.intersects(signals)
    }
}

bitflags! {
    /// Options for `write_message`. No options are defined yet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteMessageFlags: u32 {}
}

impl WriteMessageFlags {
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// Options for `read_message`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadMessageFlags: u32 {
        /// Drop a message that carries more handles than the caller accepts
        /// instead of leaving it queued.
        const MAY_DISCARD = 1 << 0;
    }
}

impl ReadMessageFlags {
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// Options for `write_data` and `begin_write_data`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WriteDataFlags: u32 {
        /// Write everything or nothing.
        const ALL_OR_NONE = 1 << 0;
    }
}

impl WriteDataFlags {
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// Options for `read_data`, `discard_data` and `begin_read_data`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadDataFlags: u32 {
        /// Read (or discard) the full amount or nothing.
        const ALL_OR_NONE = 1 << 0;
        /// Drop the bytes instead of copying them out.
        const DISCARD = 1 << 1;
        /// Report the number of buffered bytes without consuming any.
        const QUERY = 1 << 2;
        /// Copy bytes out without consuming them.
        const PEEK = 1 << 3;
    }
}

impl ReadDataFlags {
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// Options for mapping a shared buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Produce a view that rejects writes even on a writable buffer.
        const READ_ONLY = 1 << 0;
    }
}

impl MapFlags {
    pub const NONE: Self = Self::empty();
}
