use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::traits::{ControlEvent, ControlOp, ResultCode, Transport};

/// In-process transport that reflects each control message back as an event.
///
/// The event queue is bounded; once full, the oldest event is dropped so a
/// core that nobody waits on never stalls on its own notifications.
pub struct LoopbackTransport {
    events: Mutex<VecDeque<ControlEvent>>,
    capacity: usize,
    failures: Mutex<HashMap<ControlOp, ResultCode>>,
    sent: AtomicU64,
    dropped: AtomicU64,
    shut_down: AtomicBool,
}

impl LoopbackTransport {
    /// Default number of events retained before the oldest is dropped.
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            failures: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `op` fail with `code` until cleared.
    pub fn fail_op(&self, op: ControlOp, code: ResultCode) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op, code);
    }

    /// Remove an injected failure.
    pub fn clear_failure(&self, op: ControlOp) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&op);
    }

    /// Refuse all further control messages.
    pub fn shutdown(&self) {
        debug!("loopback transport shut down");
        self.shut_down.store(true, Ordering::Release);
    }

    /// Number of control messages accepted so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Number of events evicted because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Number of events waiting to be polled.
    pub fn pending(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drain and return every pending event.
    pub fn drain(&self) -> Vec<ControlEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn send_control(&self, op: ControlOp, args: &[u8], handles: &[u32]) -> ResultCode {
        if self.shut_down.load(Ordering::Acquire) {
            return ResultCode::FailedPrecondition;
        }
        if let Some(code) = self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&op)
            .copied()
        {
            trace!(%op, %code, "injected transport failure");
            return code;
        }

        let event = ControlEvent::new(op, Bytes::copy_from_slice(args), handles.to_vec());
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.capacity {
            events.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
        self.sent.fetch_add(1, Ordering::Relaxed);
        ResultCode::Ok
    }

    fn poll_event(&self) -> Option<ControlEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .field("sent", &self.sent_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflects_control_messages_in_order() {
        let transport = LoopbackTransport::new();
        assert!(transport
            .send_control(ControlOp::CreateMessagePipe, b"", &[1, 2])
            .is_ok());
        assert!(transport
            .send_control(ControlOp::WriteMessage, b"abc", &[3])
            .is_ok());

        let first = transport.poll_event().unwrap();
        assert_eq!(first.op, ControlOp::CreateMessagePipe);
        assert_eq!(first.handles, vec![1, 2]);

        let second = transport.poll_event().unwrap();
        assert_eq!(second.op, ControlOp::WriteMessage);
        assert_eq!(second.args.as_ref(), b"abc");

        assert!(transport.poll_event().is_none());
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let transport = LoopbackTransport::with_capacity(2);
        for id in 1..=3u32 {
            transport.send_control(ControlOp::Close, b"", &[id]);
        }

        assert_eq!(transport.dropped_count(), 1);
        let remaining: Vec<u32> = transport
            .drain()
            .into_iter()
            .flat_map(|event| event.handles)
            .collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[test]
    fn injected_failure_applies_to_one_op() {
        let transport = LoopbackTransport::new();
        transport.fail_op(ControlOp::CreateDataPipe, ResultCode::ResourceExhausted);

        assert_eq!(
            transport.send_control(ControlOp::CreateDataPipe, b"", &[]),
            ResultCode::ResourceExhausted
        );
        assert!(transport
            .send_control(ControlOp::CreateMessagePipe, b"", &[])
            .is_ok());

        transport.clear_failure(ControlOp::CreateDataPipe);
        assert!(transport
            .send_control(ControlOp::CreateDataPipe, b"", &[])
            .is_ok());
    }

    #[test]
    fn shutdown_refuses_further_messages() {
        let transport = LoopbackTransport::new();
        transport.shutdown();
        assert_eq!(
            transport.send_control(ControlOp::Close, b"", &[1]),
            ResultCode::FailedPrecondition
        );
        assert_eq!(transport.pending(), 0);
    }
}
