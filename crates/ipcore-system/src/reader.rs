//! Blocking read loop over one message pipe endpoint.
//!
//! The loop is the usual watch-then-drain cycle: wait for `READABLE`, read
//! until the pipe reports `ShouldWait`, and stop for good once the peer
//! has closed and every queued message has been taken.

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::flags::{ReadMessageFlags, Signals};
use crate::handle::MessagePipeHandle;
use crate::message_pipe::Message;
use crate::waitable::Deadline;

/// Messages collected by one [`HandleReader::drain`] pass.
#[derive(Debug, Default)]
pub struct ReadBatch {
    pub messages: Vec<Message>,
    /// The peer is gone and nothing more will arrive.
    pub peer_closed: bool,
}

/// Owns a message pipe endpoint and reads whole messages from it.
#[derive(Debug)]
pub struct HandleReader {
    pipe: MessagePipeHandle,
    max_handles: usize,
}

impl HandleReader {
    /// Accept as many handles per message as the core allows.
    pub fn new(pipe: MessagePipeHandle) -> Self {
        let max_handles = pipe.core().config().max_message_handles;
        Self { pipe, max_handles }
    }

    pub fn with_max_handles(pipe: MessagePipeHandle, max_handles: usize) -> Self {
        Self { pipe, max_handles }
    }

    pub fn pipe(&self) -> &MessagePipeHandle {
        &self.pipe
    }

    /// Read one message if one is queued. `Ok(None)` means try later;
    /// a closed and drained peer is `FailedPrecondition`.
    pub fn try_recv(&self) -> Result<Option<Message>> {
        match self.pipe.read_message(self.max_handles, ReadMessageFlags::NONE) {
            Ok(message) => Ok(Some(message)),
            Err(CoreError::ShouldWait) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Wait for the next message. `Ok(None)` once the peer has closed and
    /// every message has been read.
    pub fn recv(&self, deadline: Deadline) -> Result<Option<Message>> {
        loop {
            match self.pipe.read_message(self.max_handles, ReadMessageFlags::NONE) {
                Ok(message) => return Ok(Some(message)),
                Err(CoreError::ShouldWait) => {}
                Err(CoreError::FailedPrecondition(_)) => return Ok(None),
                Err(err) => return Err(err),
            }
            match self.pipe.core().wait(&self.pipe, Signals::READABLE, deadline) {
                // Unsatisfiable means the peer closed; the next read says so.
                Ok(_) | Err(CoreError::FailedPrecondition(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    #[cfg(feature = "async")]
    /// [`HandleReader::recv`] without blocking the async runtime.
    pub async fn recv_async(&self, deadline: Deadline) -> Result<Option<Message>> {
        loop {
            match self.pipe.read_message(self.max_handles, ReadMessageFlags::NONE) {
                Ok(message) => return Ok(Some(message)),
                Err(CoreError::ShouldWait) => {}
                Err(CoreError::FailedPrecondition(_)) => return Ok(None),
                Err(err) => return Err(err),
            }
            match self
                .pipe
                .core()
                .wait_async(&self.pipe, Signals::READABLE, deadline)
                .await
            {
                Ok(_) | Err(CoreError::FailedPrecondition(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Take every message queued right now without waiting.
    pub fn drain(&self) -> Result<ReadBatch> {
        let mut batch = ReadBatch::default();
        loop {
            match self.pipe.read_message(self.max_handles, ReadMessageFlags::NONE) {
                Ok(message) => batch.messages.push(message),
                Err(CoreError::ShouldWait) => break,
                Err(CoreError::FailedPrecondition(_)) => {
                    batch.peer_closed = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if batch.peer_closed {
            debug!(handle = %self.pipe.id(), drained = batch.messages.len(), "reader reached end of pipe");
        }
        Ok(batch)
    }

    pub fn into_inner(self) -> MessagePipeHandle {
        self.pipe
    }

    pub fn close(self) -> Result<()> {
        self.pipe.close()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::core::Core;
    use crate::flags::WriteMessageFlags;

    #[test]
    fn drain_stops_at_should_wait() {
        let core = Core::new();
        let (a, b) = core.create_message_pipe().unwrap();
        for text in ["a", "b"] {
            a.write_message(text.as_bytes(), &mut Vec::new(), WriteMessageFlags::NONE)
                .unwrap();
        }

        let reader = HandleReader::new(b);
        let batch = reader.drain().unwrap();
        assert_eq!(batch.messages.len(), 2);
        assert!(!batch.peer_closed);
        assert!(reader.try_recv().unwrap().is_none());

        a.close().unwrap();
        reader.close().unwrap();
    }

    #[test]
    fn drain_reports_peer_closed() {
        let core = Core::new();
        let (a, b) = core.create_message_pipe().unwrap();
        a.write_message(b"bye", &mut Vec::new(), WriteMessageFlags::NONE)
            .unwrap();
        a.close().unwrap();

        let reader = HandleReader::new(b);
        let batch = reader.drain().unwrap();
        assert_eq!(batch.messages.len(), 1);
        assert!(batch.peer_closed);
        assert!(matches!(
            reader.try_recv(),
            Err(CoreError::FailedPrecondition(_))
        ));
        reader.close().unwrap();
    }

    #[test]
    fn recv_blocks_until_a_message_then_sees_end_of_stream() {
        let core = Core::new();
        let (a, b) = core.create_message_pipe().unwrap();

        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            a.write_message(b"first", &mut Vec::new(), WriteMessageFlags::NONE)
                .unwrap();
            a.close().unwrap();
        });

        let reader = HandleReader::new(b);
        let message = reader.recv(Deadline::Infinite).unwrap().unwrap();
        assert_eq!(message.bytes.as_ref(), b"first");
        writer.join().unwrap();
        assert!(reader.recv(Deadline::Infinite).unwrap().is_none());
        reader.close().unwrap();
    }

    #[test]
    fn recv_honours_the_deadline() {
        let core = Core::new();
        let (a, b) = core.create_message_pipe().unwrap();
        let reader = HandleReader::with_max_handles(b, 0);
        assert!(matches!(
            reader.recv(Deadline::after(Duration::from_millis(10))),
            Err(CoreError::DeadlineExceeded)
        ));
        a.close().unwrap();
        reader.into_inner().close().unwrap();
    }

    #[cfg(feature = "async")]
    #[tokio::test(flavor = "multi_thread")]
    async fn recv_async_yields_messages() {
        let core = Core::new();
        let (a, b) = core.create_message_pipe().unwrap();
        a.write_message(b"async", &mut Vec::new(), WriteMessageFlags::NONE)
            .unwrap();
        a.close().unwrap();

        let reader = HandleReader::new(b);
        let message = reader.recv_async(Deadline::Infinite).await.unwrap().unwrap();
        assert_eq!(message.bytes.as_ref(), b"async");
        assert!(reader.recv_async(Deadline::Infinite).await.unwrap().is_none());
        reader.close().unwrap();
    }
}
