//! Message pipes: a pair of endpoints exchanging discrete messages.
//!
//! Each endpoint owns the queue of messages addressed to it. A write
//! detaches the attached handles from the table and parks their objects
//! inside the queued message; a read attaches them again under fresh
//! identifiers. Both steps run under the table lock, so at every instant
//! a transferred object is either in the table or in exactly one queue.
//!
//! ```text
//! endpoint 0                         endpoint 1
//! write ──► [msg][msg][msg] ──► read
//! read  ◄── [msg]            ◄── write
//! ```

use std::collections::{HashSet, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use ipcore_transport::ControlOp;
use tracing::{debug, trace};

use crate::core::Counters;
use crate::error::{CoreError, Result};
use crate::flags::{ReadMessageFlags, Signals, SignalsState, WriteMessageFlags};
use crate::handle::{HandleId, MessagePipeHandle, UntypedHandle};
use crate::table::Dispatcher;
use crate::waitable::Notifier;

/// A message taken off a pipe.
#[derive(Debug)]
pub struct Message {
    pub bytes: Bytes,
    /// Handles that travelled with the message, in the order they were
    /// attached. Each one is owned by the reader now.
    pub handles: Vec<UntypedHandle>,
}

/// Shared state of both endpoints.
pub(crate) struct MessagePipe {
    endpoints: Mutex<[Endpoint; 2]>,
}

#[derive(Default)]
struct Endpoint {
    incoming: VecDeque<QueuedMessage>,
    closed: bool,
}

impl MessagePipe {
    pub(crate) fn new() -> Self {
        Self {
            endpoints: Mutex::new([Endpoint::default(), Endpoint::default()]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [Endpoint; 2]> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn signals_state(&self, side: usize) -> SignalsState {
        let endpoints = self.lock();
        let own = &endpoints[side];
        let peer = &endpoints[1 - side];

        let mut satisfied = Signals::NONE;
        let mut satisfiable = Signals::PEER_CLOSED;
        if !own.incoming.is_empty() {
            satisfied |= Signals::READABLE;
            satisfiable |= Signals::READABLE;
        }
        if peer.closed {
            satisfied |= Signals::PEER_CLOSED;
        } else {
            satisfied |= Signals::WRITABLE;
            satisfiable |= Signals::READABLE | Signals::WRITABLE;
        }
        SignalsState::new(satisfied, satisfiable)
    }

    pub(crate) fn queued(&self, side: usize) -> usize {
        self.lock()[side].incoming.len()
    }

    /// Mark `side` closed. Messages still queued for it are dropped after
    /// the pipe lock is released, closing whatever handles they carry.
    pub(crate) fn close(&self, side: usize) {
        let undelivered = {
            let mut endpoints = self.lock();
            endpoints[side].closed = true;
            mem::take(&mut endpoints[side].incoming)
        };
        if !undelivered.is_empty() {
            debug!(count = undelivered.len(), "dropping undelivered messages");
        }
        drop(undelivered);
    }
}

/// A message parked in a queue, holding the objects of its handles.
pub(crate) struct QueuedMessage {
    bytes: Bytes,
    handles: Vec<Dispatcher>,
    notifier: Arc<Notifier>,
    counters: Arc<Counters>,
}

impl QueuedMessage {
    fn new(
        bytes: Bytes,
        handles: Vec<Dispatcher>,
        notifier: Arc<Notifier>,
        counters: Arc<Counters>,
    ) -> Self {
        counters.add_in_transit(handles.len());
        Self {
            bytes,
            handles,
            notifier,
            counters,
        }
    }

    fn take_handles(&mut self) -> Vec<Dispatcher> {
        let handles = mem::take(&mut self.handles);
        self.counters.remove_in_transit(handles.len());
        handles
    }
}

impl Drop for QueuedMessage {
    fn drop(&mut self) {
        let handles = self.take_handles();
        if handles.is_empty() {
            return;
        }
        debug!(count = handles.len(), "closing handles of an undelivered message");
        for dispatcher in handles {
            dispatcher.close(&self.notifier);
        }
    }
}

enum ReadOutcome {
    Delivered(Bytes, Vec<HandleId>),
    Discarded(QueuedMessage),
}

fn pipe_of(dispatcher: &Dispatcher, id: HandleId) -> Result<(Arc<MessagePipe>, usize)> {
    match dispatcher {
        Dispatcher::MessagePipe { pipe, side } => Ok((Arc::clone(pipe), *side)),
        _ => Err(CoreError::InvalidHandle(id)),
    }
}

impl MessagePipeHandle {
    /// Queue a message for the peer endpoint.
    ///
    /// Every handle in `handles` moves with the message. On success the
    /// vector is left empty; on failure it is left exactly as it was and
    /// the caller still owns every handle in it.
    pub fn write_message(
        &self,
        bytes: &[u8],
        handles: &mut Vec<UntypedHandle>,
        _flags: WriteMessageFlags,
    ) -> Result<()> {
        let core = self.core();
        let config = core.config();
        if bytes.len() > config.max_message_bytes {
            return Err(CoreError::exhausted(format!(
                "message of {} bytes exceeds limit of {}",
                bytes.len(),
                config.max_message_bytes
            )));
        }
        if handles.len() > config.max_message_handles {
            return Err(CoreError::exhausted(format!(
                "message carries {} handles, limit is {}",
                handles.len(),
                config.max_message_handles
            )));
        }

        let id = self.id();
        let ids: Vec<HandleId> = handles.iter().map(UntypedHandle::id).collect();
        {
            let mut table = core.table();
            let (pipe, side) = pipe_of(table.get(id)?, id)?;

            let mut seen = HashSet::with_capacity(handles.len());
            for handle in handles.iter() {
                let attached = handle.id();
                if !core.owns(handle) {
                    return Err(CoreError::invalid(format!(
                        "handle {attached} belongs to another core"
                    )));
                }
                if !seen.insert(attached) {
                    return Err(CoreError::invalid(format!(
                        "handle {attached} attached more than once"
                    )));
                }
                let dispatcher = table.get(attached)?;
                if let Dispatcher::MessagePipe { pipe: other, .. } = dispatcher {
                    if Arc::ptr_eq(other, &pipe) {
                        return Err(CoreError::invalid(format!(
                            "handle {attached} is an endpoint of the pipe it is sent over"
                        )));
                    }
                }
                if dispatcher.is_busy() {
                    return Err(CoreError::precondition(format!(
                        "handle {attached} has a two-phase operation in progress"
                    )));
                }
            }

            let mut endpoints = pipe.lock();
            let peer = &mut endpoints[1 - side];
            if peer.closed {
                return Err(CoreError::precondition("peer endpoint is closed"));
            }
            if peer.incoming.len() >= config.max_queued_messages {
                return Err(CoreError::exhausted(format!(
                    "peer queue holds {} messages",
                    peer.incoming.len()
                )));
            }

            core.announce(ControlOp::WriteMessage, bytes, &ids)?;

            let mut detached = Vec::with_capacity(ids.len());
            for attached in &ids {
                detached.push(table.remove(*attached)?);
            }
            peer.incoming.push_back(QueuedMessage::new(
                Bytes::copy_from_slice(bytes),
                detached,
                Arc::clone(core.notifier()),
                Arc::clone(core.counters()),
            ));
        }

        for handle in handles.drain(..) {
            handle.disarm();
        }
        core.notify();
        if ids.is_empty() {
            trace!(handle = %id, len = bytes.len(), "message written");
        } else {
            debug!(handle = %id, len = bytes.len(), transferred = ids.len(), "message written with handles");
        }
        Ok(())
    }

    /// Take the oldest queued message.
    ///
    /// A message carrying more than `max_handles` handles stays queued and
    /// `ResourceExhausted` is returned, unless `MAY_DISCARD` is set, in
    /// which case the message is dropped (closing its handles) instead.
    pub fn read_message(&self, max_handles: usize, flags: ReadMessageFlags) -> Result<Message> {
        let core = self.core();
        let id = self.id();

        let outcome = {
            let mut table = core.table();
            let (pipe, side) = pipe_of(table.get(id)?, id)?;
            let mut endpoints = pipe.lock();
            let peer_closed = endpoints[1 - side].closed;
            let incoming = &mut endpoints[side].incoming;

            let Some(mut message) = incoming.pop_front() else {
                return Err(if peer_closed {
                    CoreError::precondition("peer endpoint is closed and no messages remain")
                } else {
                    CoreError::ShouldWait
                });
            };

            let count = message.handles.len();
            if count > max_handles {
                if flags.contains(ReadMessageFlags::MAY_DISCARD) {
                    ReadOutcome::Discarded(message)
                } else {
                    incoming.push_front(message);
                    return Err(CoreError::exhausted(format!(
                        "message carries {count} handles, reader accepts {max_handles}"
                    )));
                }
            } else if table.available() < count {
                incoming.push_front(message);
                return Err(CoreError::exhausted(format!(
                    "no room in the handle table for {count} received handles"
                )));
            } else {
                let mut ids = Vec::with_capacity(count);
                for dispatcher in message.take_handles() {
                    ids.push(table.insert(dispatcher)?);
                }
                ReadOutcome::Delivered(mem::take(&mut message.bytes), ids)
            }
        };

        match outcome {
            ReadOutcome::Delivered(bytes, ids) => {
                core.notify();
                if !ids.is_empty() {
                    debug!(handle = %id, received = ids.len(), "message read with handles");
                }
                let handles = ids.into_iter().map(|received| core.wrap(received)).collect();
                Ok(Message { bytes, handles })
            }
            ReadOutcome::Discarded(message) => {
                let count = message.handles.len();
                drop(message);
                core.notify();
                debug!(handle = %id, count, "discarded message with too many handles");
                Err(CoreError::exhausted(format!(
                    "discarded message carrying {count} handles, reader accepts {max_handles}"
                )))
            }
        }
    }

    /// Number of messages waiting to be read on this endpoint.
    pub fn queued_messages(&self) -> Result<usize> {
        let id = self.id();
        let dispatcher = self.core().lookup(id)?;
        let (pipe, side) = pipe_of(&dispatcher, id)?;
        Ok(pipe.queued(side))
    }
}
