//! The core registry: handle table, transport and waits.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use ipcore_transport::{ControlOp, NullTransport, Transport};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::CoreConfig;
use crate::data_pipe::{DataPipe, DataPipeOptions};
use crate::error::{CoreError, Result, WaitManyError};
use crate::flags::{Signals, SignalsState};
use crate::handle::{
    AsHandle, ConsumerHandle, HandleId, HandleKind, MessagePipeHandle, ProducerHandle,
    SharedBufferHandle, UntypedHandle,
};
use crate::message_pipe::MessagePipe;
use crate::shared_buffer::{SharedBufferOptions, SharedRegion};
use crate::table::{Dispatcher, HandleTable};
use crate::waitable::{Deadline, Notifier};

/// Longest a waiter sleeps before polling an event-producing transport
/// again. Waiters on a transport without events sleep until notified.
const TRANSPORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters shared with objects that outlive a table entry.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    in_transit: AtomicUsize,
    live_mappings: AtomicUsize,
    leaked_handles: AtomicU64,
    leaked_mappings: AtomicU64,
    transport_events: AtomicU64,
}

impl Counters {
    pub(crate) fn add_in_transit(&self, count: usize) {
        self.in_transit.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn remove_in_transit(&self, count: usize) {
        self.in_transit.fetch_sub(count, Ordering::Relaxed);
    }

    pub(crate) fn mapping_created(&self) {
        self.live_mappings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mapping_released(&self) {
        self.live_mappings.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn mapping_leaked(&self) {
        self.leaked_mappings.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time counters of a [`Core`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoreStats {
    /// Entries in the handle table.
    pub live_handles: usize,
    /// Handles detached into queued messages and not yet read.
    pub in_transit: usize,
    /// Mappings not yet unmapped.
    pub live_mappings: usize,
    /// Handles closed because they were dropped without `close`.
    pub leaked_handles: u64,
    /// Mappings released because they were dropped without `unmap`.
    pub leaked_mappings: u64,
    /// Events drained from the transport by waits. Events are counted
    /// and logged only; readiness always comes from local state.
    pub transport_events: u64,
}

struct CoreInner {
    table: Mutex<HandleTable>,
    notifier: Arc<Notifier>,
    counters: Arc<Counters>,
    transport: Box<dyn Transport>,
    config: CoreConfig,
}

/// Entry point for creating, closing and waiting on handles.
///
/// Cloning is cheap and every clone refers to the same table. Handles
/// keep their core alive.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// A core with default limits and no transport.
    pub fn new() -> Self {
        Self::build(CoreConfig::default(), Box::new(NullTransport))
    }

    pub fn with_config(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, Box::new(NullTransport)))
    }

    /// A core that announces every control operation to `transport`.
    ///
    /// The transport must be able to carry a maximum-size message with a
    /// full set of attached handles.
    pub fn with_transport(config: CoreConfig, transport: impl Transport + 'static) -> Result<Self> {
        config.validate()?;
        if let Some(max) = transport.max_args_len(config.max_message_handles) {
            if max < config.max_message_bytes {
                return Err(CoreError::invalid(format!(
                    "{} transport carries {max} bytes alongside {} handles, below max_message_bytes {}",
                    transport.name(),
                    config.max_message_handles,
                    config.max_message_bytes
                )));
            }
        }
        Ok(Self::build(config, Box::new(transport)))
    }

    fn build(config: CoreConfig, transport: Box<dyn Transport>) -> Self {
        debug!(
            transport = transport.name(),
            max_handles = config.max_handles,
            "core created"
        );
        Self {
            inner: Arc::new(CoreInner {
                table: Mutex::new(HandleTable::new(config.max_handles)),
                notifier: Arc::new(Notifier::new()),
                counters: Arc::new(Counters::default()),
                transport,
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    pub fn stats(&self) -> CoreStats {
        let counters = &self.inner.counters;
        CoreStats {
            live_handles: self.table().len(),
            in_transit: counters.in_transit.load(Ordering::Relaxed),
            live_mappings: counters.live_mappings.load(Ordering::Relaxed),
            leaked_handles: counters.leaked_handles.load(Ordering::Relaxed),
            leaked_mappings: counters.leaked_mappings.load(Ordering::Relaxed),
            transport_events: counters.transport_events.load(Ordering::Relaxed),
        }
    }

    /// Whether `id` names a live entry in this core.
    pub fn is_live(&self, id: HandleId) -> bool {
        self.table().contains(id)
    }

    pub fn create_message_pipe(&self) -> Result<(MessagePipeHandle, MessagePipeHandle)> {
        let pipe = Arc::new(MessagePipe::new());
        let (a, b) = self.insert_pair(
            ControlOp::CreateMessagePipe,
            &[],
            Dispatcher::MessagePipe {
                pipe: Arc::clone(&pipe),
                side: 0,
            },
            Dispatcher::MessagePipe { pipe, side: 1 },
        )?;
        debug!(a = %a, b = %b, "message pipe created");
        Ok((
            MessagePipeHandle::from_untyped(self.wrap(a)),
            MessagePipeHandle::from_untyped(self.wrap(b)),
        ))
    }

    /// Create a data pipe. `None` uses one-byte elements and the configured
    /// default capacity.
    pub fn create_data_pipe(
        &self,
        options: Option<&DataPipeOptions>,
    ) -> Result<(ProducerHandle, ConsumerHandle)> {
        let (element_bytes, capacity) = options
            .copied()
            .unwrap_or_default()
            .resolve(&self.inner.config)?;
        if self.max_args_len(1) < element_bytes {
            return Err(CoreError::invalid(format!(
                "element of {element_bytes} bytes does not fit one {} transport record",
                self.transport_name()
            )));
        }
        let pipe = Arc::new(DataPipe::new(element_bytes, capacity));

        let mut args = BytesMut::with_capacity(16);
        args.put_u64_le(element_bytes as u64);
        args.put_u64_le(capacity as u64);
        let (producer, consumer) = self.insert_pair(
            ControlOp::CreateDataPipe,
            &args,
            Dispatcher::Producer(Arc::clone(&pipe)),
            Dispatcher::Consumer(pipe),
        )?;
        debug!(producer = %producer, consumer = %consumer, element_bytes, capacity, "data pipe created");
        Ok((
            ProducerHandle::from_untyped(self.wrap(producer)),
            ConsumerHandle::from_untyped(self.wrap(consumer)),
        ))
    }

    pub fn create_shared_buffer(
        &self,
        options: Option<&SharedBufferOptions>,
        num_bytes: u64,
    ) -> Result<SharedBufferHandle> {
        if let Some(options) = options {
            if options.flags != 0 {
                return Err(CoreError::invalid(format!(
                    "unknown shared buffer flags {:#x}",
                    options.flags
                )));
            }
        }
        if num_bytes == 0 {
            return Err(CoreError::invalid("shared buffer size must be non-zero"));
        }
        let max = self.inner.config.max_shared_buffer_size;
        let size = match usize::try_from(num_bytes) {
            Ok(size) if num_bytes <= max => size,
            _ => {
                return Err(CoreError::exhausted(format!(
                    "shared buffer of {num_bytes} bytes exceeds limit of {max}"
                )))
            }
        };

        let region = Arc::new(SharedRegion::new(size));
        let id = {
            let mut table = self.table();
            let id = table.insert(Dispatcher::SharedBuffer {
                region,
                read_only: false,
            })?;
            if let Err(err) =
                self.announce(ControlOp::CreateSharedBuffer, &num_bytes.to_le_bytes(), &[id])
            {
                table.remove(id)?;
                return Err(err);
            }
            id
        };
        debug!(handle = %id, size, "shared buffer created");
        Ok(SharedBufferHandle::from_untyped(self.wrap(id)))
    }

    /// Close an owned handle of any kind.
    pub fn close(&self, handle: impl Into<UntypedHandle>) -> Result<()> {
        handle.into().close()
    }

    /// Close the entry named by a raw identifier.
    ///
    /// The owning [`UntypedHandle`], if one is still around, becomes
    /// invalid; waits on it resolve with `Cancelled`.
    pub fn close_raw(&self, id: HandleId) -> Result<()> {
        self.close_id(id)
    }

    /// Current signals of `handle`.
    pub fn signals_state(&self, handle: &(impl AsHandle + ?Sized)) -> Result<SignalsState> {
        let handle = handle.as_untyped();
        self.check_owner(handle)?;
        self.table().get(handle.id()).map(Dispatcher::signals_state)
    }

    /// Block until any of `signals` is satisfied on `handle`.
    ///
    /// Fails with `FailedPrecondition` once none of `signals` can ever be
    /// satisfied, `Cancelled` if the handle is closed meanwhile and
    /// `DeadlineExceeded` when `deadline` passes first.
    pub fn wait(
        &self,
        handle: &(impl AsHandle + ?Sized),
        signals: Signals,
        deadline: Deadline,
    ) -> Result<SignalsState> {
        let handle = handle.as_untyped();
        self.check_owner(handle)?;
        self.wait_id(handle.id(), signals, deadline)
    }

    /// Block until one of `handles` is resolved, returning its index.
    ///
    /// Entries are checked in order, so when several are ready the lowest
    /// index wins. An entry whose signals become unsatisfiable, or whose
    /// handle is closed, resolves the wait with an error naming its index.
    pub fn wait_many(
        &self,
        handles: &[(&dyn AsHandle, Signals)],
        deadline: Deadline,
    ) -> std::result::Result<usize, WaitManyError> {
        if handles.is_empty() {
            return Err(WaitManyError::global(CoreError::invalid(
                "wait_many needs at least one handle",
            )));
        }
        let mut ids = Vec::with_capacity(handles.len());
        for (index, (handle, _)) in handles.iter().enumerate() {
            let handle = handle.as_untyped();
            self.check_owner(handle)
                .map_err(|err| WaitManyError::at(index, err))?;
            ids.push(handle.id());
        }

        let mut first_pass = true;
        loop {
            let seen = self.inner.notifier.epoch();
            self.drain_transport();
            {
                let table = self.table();
                for (index, (id, (_, signals))) in ids.iter().zip(handles).enumerate() {
                    let state = match table.get(*id) {
                        Ok(dispatcher) => dispatcher.signals_state(),
                        Err(err) if first_pass => return Err(WaitManyError::at(index, err)),
                        Err(_) => return Err(WaitManyError::at(index, CoreError::Cancelled)),
                    };
                    if state.satisfies(*signals) {
                        return Ok(index);
                    }
                    if !state.can_satisfy(*signals) {
                        return Err(WaitManyError::at(index, unsatisfiable(*id, *signals)));
                    }
                }
            }
            first_pass = false;
            self.sleep(seen, deadline).map_err(WaitManyError::global)?;
        }
    }

    #[cfg(feature = "async")]
    /// [`Core::wait`] on the blocking thread pool.
    pub async fn wait_async(
        &self,
        handle: &(impl AsHandle + ?Sized),
        signals: Signals,
        deadline: Deadline,
    ) -> Result<SignalsState> {
        let handle = handle.as_untyped();
        self.check_owner(handle)?;
        let core = self.clone();
        let id = handle.id();
        tokio::task::spawn_blocking(move || core.wait_id(id, signals, deadline))
            .await
            .map_err(|_| CoreError::Cancelled)?
    }

    pub(crate) fn wait_id(
        &self,
        id: HandleId,
        signals: Signals,
        deadline: Deadline,
    ) -> Result<SignalsState> {
        let mut first_pass = true;
        loop {
            let seen = self.inner.notifier.epoch();
            self.drain_transport();
            let state = match self.table().get(id).map(Dispatcher::signals_state) {
                Ok(state) => state,
                Err(err) if first_pass => return Err(err),
                Err(_) => return Err(CoreError::Cancelled),
            };
            if state.satisfies(signals) {
                return Ok(state);
            }
            if !state.can_satisfy(signals) {
                return Err(unsatisfiable(id, signals));
            }
            first_pass = false;
            self.sleep(seen, deadline)?;
        }
    }

    fn sleep(&self, seen: u64, deadline: Deadline) -> Result<()> {
        let now = Instant::now();
        if deadline.has_passed(now) {
            return Err(CoreError::DeadlineExceeded);
        }
        let until = if self.inner.transport.produces_events() {
            let poll_at = now + TRANSPORT_POLL_INTERVAL;
            match deadline {
                Deadline::At(at) if at < poll_at => deadline,
                _ => Deadline::At(poll_at),
            }
        } else {
            deadline
        };
        self.inner.notifier.wait_past(seen, until);
        Ok(())
    }

    /// Pull pending events off the transport. They feed the
    /// `transport_events` counter and the trace log, nothing else.
    fn drain_transport(&self) {
        if !self.inner.transport.produces_events() {
            return;
        }
        while let Some(event) = self.inner.transport.poll_event() {
            self.inner
                .counters
                .transport_events
                .fetch_add(1, Ordering::Relaxed);
            trace!(op = %event.op, handles = ?event.handles, args = event.args.len(), "transport event");
        }
    }

    fn insert_pair(
        &self,
        op: ControlOp,
        args: &[u8],
        first: Dispatcher,
        second: Dispatcher,
    ) -> Result<(HandleId, HandleId)> {
        let mut table = self.table();
        if table.available() < 2 {
            return Err(CoreError::exhausted("handle table full"));
        }
        let a = table.insert(first)?;
        let b = table.insert(second)?;
        if let Err(err) = self.announce(op, args, &[a, b]) {
            table.remove(a)?;
            table.remove(b)?;
            return Err(err);
        }
        Ok((a, b))
    }

    pub(crate) fn close_id(&self, id: HandleId) -> Result<()> {
        let dispatcher = self.table().remove(id)?;
        self.finish_close(id, dispatcher);
        Ok(())
    }

    /// Safety net for a handle dropped without `close`.
    pub(crate) fn close_leaked(&self, id: HandleId) {
        let Ok(dispatcher) = self.table().remove(id) else {
            trace!(handle = %id, "dropped handle was already closed");
            return;
        };
        self.inner
            .counters
            .leaked_handles
            .fetch_add(1, Ordering::Relaxed);
        warn!(handle = %id, kind = %dispatcher.kind(), "handle dropped without close; closing it");
        self.finish_close(id, dispatcher);
    }

    fn finish_close(&self, id: HandleId, dispatcher: Dispatcher) {
        let kind = dispatcher.kind();
        if let Err(err) = self.announce(ControlOp::Close, &[], &[id]) {
            warn!(handle = %id, error = %err, "transport refused close; handle closed anyway");
        }
        dispatcher.close(&self.inner.notifier);
        debug!(handle = %id, %kind, "handle closed");
    }

    pub(crate) fn table(&self) -> MutexGuard<'_, HandleTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lookup(&self, id: HandleId) -> Result<Dispatcher> {
        self.table().get(id).cloned()
    }

    pub(crate) fn kind_of(&self, id: HandleId) -> Result<HandleKind> {
        self.table().get(id).map(Dispatcher::kind)
    }

    /// Largest payload one control message naming `handle_count` handles
    /// may carry.
    pub(crate) fn max_args_len(&self, handle_count: usize) -> usize {
        self.inner
            .transport
            .max_args_len(handle_count)
            .unwrap_or(usize::MAX)
    }

    pub(crate) fn announce(&self, op: ControlOp, args: &[u8], handles: &[HandleId]) -> Result<()> {
        let raw: Vec<u32> = handles.iter().map(|id| id.as_u32()).collect();
        self.inner
            .transport
            .send_control(op, args, &raw)
            .into_result(op)?;
        Ok(())
    }

    pub(crate) fn notify(&self) {
        self.inner.notifier.notify();
    }

    pub(crate) fn notifier(&self) -> &Arc<Notifier> {
        &self.inner.notifier
    }

    pub(crate) fn counters(&self) -> &Arc<Counters> {
        &self.inner.counters
    }

    pub(crate) fn owns(&self, handle: &UntypedHandle) -> bool {
        Arc::ptr_eq(&self.inner, &handle.core().inner)
    }

    fn check_owner(&self, handle: &UntypedHandle) -> Result<()> {
        if self.owns(handle) {
            Ok(())
        } else {
            Err(CoreError::invalid(format!(
                "handle {} belongs to another core",
                handle.id()
            )))
        }
    }

    pub(crate) fn wrap(&self, id: HandleId) -> UntypedHandle {
        UntypedHandle::new(id, self.clone())
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("transport", &self.transport_name())
            .field("live_handles", &self.table().len())
            .finish()
    }
}

fn unsatisfiable(id: HandleId, signals: Signals) -> CoreError {
    CoreError::precondition(format!(
        "signals {signals:?} can never be satisfied on handle {id}"
    ))
}
