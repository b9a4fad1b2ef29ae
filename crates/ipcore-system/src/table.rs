use std::collections::HashMap;
use std::sync::Arc;

use crate::data_pipe::DataPipe;
use crate::error::{CoreError, Result};
use crate::flags::SignalsState;
use crate::handle::{HandleId, HandleKind};
use crate::message_pipe::MessagePipe;
use crate::shared_buffer::SharedRegion;
use crate::waitable::Notifier;

/// The object behind a table entry.
#[derive(Clone)]
pub(crate) enum Dispatcher {
    MessagePipe { pipe: Arc<MessagePipe>, side: usize },
    Producer(Arc<DataPipe>),
    Consumer(Arc<DataPipe>),
    SharedBuffer { region: Arc<SharedRegion>, read_only: bool },
}

impl Dispatcher {
    pub(crate) fn kind(&self) -> HandleKind {
        match self {
            Self::MessagePipe { .. } => HandleKind::MessagePipe,
            Self::Producer(_) => HandleKind::DataPipeProducer,
            Self::Consumer(_) => HandleKind::DataPipeConsumer,
            Self::SharedBuffer { .. } => HandleKind::SharedBuffer,
        }
    }

    pub(crate) fn signals_state(&self) -> SignalsState {
        match self {
            Self::MessagePipe { pipe, side } => pipe.signals_state(*side),
            Self::Producer(pipe) => pipe.producer_signals(),
            Self::Consumer(pipe) => pipe.consumer_signals(),
            // Buffers never become readable or writable.
            Self::SharedBuffer { .. } => SignalsState::default(),
        }
    }

    /// True while a two-phase operation is open on this endpoint.
    pub(crate) fn is_busy(&self) -> bool {
        match self {
            Self::Producer(pipe) => pipe.write_in_progress(),
            Self::Consumer(pipe) => pipe.read_in_progress(),
            _ => false,
        }
    }

    /// Close the endpoint at the object level. Must not be called with
    /// the table lock held when the object may own queued dispatchers.
    pub(crate) fn close(self, notifier: &Notifier) {
        match self {
            Self::MessagePipe { pipe, side } => pipe.close(side),
            Self::Producer(pipe) => pipe.close_producer(),
            Self::Consumer(pipe) => pipe.close_consumer(),
            Self::SharedBuffer { .. } => {}
        }
        notifier.notify();
    }
}

/// Live handle entries keyed by identifier.
pub(crate) struct HandleTable {
    entries: HashMap<HandleId, Dispatcher>,
    next_id: u32,
    max_handles: usize,
}

impl HandleTable {
    pub(crate) fn new(max_handles: usize) -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            max_handles,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries that can still be inserted before the table is full.
    pub(crate) fn available(&self) -> usize {
        self.max_handles.saturating_sub(self.entries.len())
    }

    pub(crate) fn contains(&self, id: HandleId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn get(&self, id: HandleId) -> Result<&Dispatcher> {
        self.entries.get(&id).ok_or(CoreError::InvalidHandle(id))
    }

    pub(crate) fn insert(&mut self, dispatcher: Dispatcher) -> Result<HandleId> {
        if self.available() == 0 {
            return Err(CoreError::exhausted(format!(
                "handle table full ({} entries)",
                self.max_handles
            )));
        }
        let id = self.allocate_id();
        self.entries.insert(id, dispatcher);
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> Result<Dispatcher> {
        self.entries.remove(&id).ok_or(CoreError::InvalidHandle(id))
    }

    // Monotonic with wrap-around, skipping 0 and anything still live.
    fn allocate_id(&mut self) -> HandleId {
        loop {
            let raw = self.next_id;
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if let Some(id) = HandleId::from_u32(raw) {
                if !self.entries.contains_key(&id) {
                    return id;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> Dispatcher {
        Dispatcher::SharedBuffer {
            region: Arc::new(SharedRegion::new(8)),
            read_only: false,
        }
    }

    #[test]
    fn ids_are_unique_and_never_zero() {
        let mut table = HandleTable::new(16);
        let a = table.insert(buffer()).unwrap();
        let b = table.insert(buffer()).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.as_u32(), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn removed_ids_are_not_handed_out_again_immediately() {
        let mut table = HandleTable::new(16);
        let a = table.insert(buffer()).unwrap();
        table.remove(a).unwrap();
        let b = table.insert(buffer()).unwrap();
        assert_ne!(a, b);
        assert!(matches!(table.remove(a), Err(CoreError::InvalidHandle(id)) if id == a));
    }

    #[test]
    fn wrap_around_skips_live_entries() {
        let mut table = HandleTable::new(16);
        let first = table.insert(buffer()).unwrap();
        assert_eq!(first.as_u32(), 1);

        table.next_id = u32::MAX;
        let last = table.insert(buffer()).unwrap();
        assert_eq!(last.as_u32(), u32::MAX);

        // 0 is skipped and 1 is still live.
        let wrapped = table.insert(buffer()).unwrap();
        assert_eq!(wrapped.as_u32(), 2);
    }

    #[test]
    fn full_table_is_resource_exhausted() {
        let mut table = HandleTable::new(1);
        table.insert(buffer()).unwrap();
        assert!(matches!(
            table.insert(buffer()),
            Err(CoreError::ResourceExhausted(_))
        ));
        assert_eq!(table.available(), 0);
    }
}
