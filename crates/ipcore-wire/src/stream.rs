use std::io::{ErrorKind, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};
use ipcore_transport::{ControlEvent, ControlOp, ResultCode, Transport};
use tracing::{debug, trace, warn};

use crate::codec::{decode_record, encode_record, WireConfig, HANDLE_REF_SIZE, HEADER_SIZE};
use crate::error::WireError;

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// A [`Transport`] that carries control records over a byte stream.
///
/// `send_control` encodes one record and writes as much of it as the
/// stream takes. When a non-blocking stream reports `WouldBlock` the rest
/// stays queued and is flushed by later calls and by `poll_event`; a
/// record that would push the queue past
/// [`WireConfig::max_pending_bytes`] is refused with `ResourceExhausted`.
/// Neither call ever waits for the stream.
pub struct StreamTransport<S> {
    state: Mutex<StreamState<S>>,
    config: WireConfig,
}

struct StreamState<S> {
    stream: S,
    read_buf: BytesMut,
    pending: BytesMut,
    closed: bool,
}

impl<S: Read + Write + Send> StreamTransport<S> {
    pub fn new(stream: S) -> Self {
        Self::with_config(stream, WireConfig::default())
    }

    pub fn with_config(stream: S, config: WireConfig) -> Self {
        Self {
            state: Mutex::new(StreamState {
                stream,
                read_buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
                pending: BytesMut::with_capacity(READ_CHUNK_SIZE),
                closed: false,
            }),
            config,
        }
    }

    /// Whether the peer has closed the stream.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Encoded bytes accepted but not yet written to the stream.
    pub fn pending_bytes(&self) -> usize {
        self.lock().pending.len()
    }

    /// Write out as much of the queued bytes as the stream takes now.
    pub fn flush(&self) -> ResultCode {
        self.lock().flush()
    }

    /// Consume the transport and return the inner stream.
    pub fn into_inner(self) -> S {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .stream
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Read + Write> StreamState<S> {
    fn flush(&mut self) -> ResultCode {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    self.closed = true;
                    return ResultCode::FailedPrecondition;
                }
                Ok(n) => self.pending.advance(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    self.closed = true;
                    return ResultCode::FailedPrecondition;
                }
                Err(err) => {
                    warn!(error = %err, "control stream write failed");
                    return ResultCode::Internal;
                }
            }
        }
        ResultCode::Ok
    }

    fn write_record(&mut self, op: ControlOp, args: &[u8], handles: &[u32], config: &WireConfig) -> ResultCode {
        let payload_len = handles.len() * HANDLE_REF_SIZE + args.len();
        if payload_len > config.max_record_payload {
            warn!(%op, payload_len, max = config.max_record_payload, "control record exceeds wire limit");
            return ResultCode::ResourceExhausted;
        }

        let code = self.flush();
        if !code.is_ok() {
            return code;
        }
        let backlog = self.pending.len();
        if backlog + HEADER_SIZE + payload_len > config.max_pending_bytes {
            warn!(%op, backlog, max = config.max_pending_bytes, "control stream backlog full");
            return ResultCode::ResourceExhausted;
        }

        if let Err(err) = encode_record(op, handles, args, &mut self.pending) {
            warn!(%op, error = %err, "failed to encode control record");
            self.pending.truncate(backlog);
            return ResultCode::ResourceExhausted;
        }
        let code = self.flush();
        if code.is_ok() {
            trace!(%op, queued = self.pending.len(), "control record sent");
        }
        code
    }

    fn next_event(&mut self, max: usize) -> Option<ControlEvent> {
        if !self.closed {
            let _ = self.flush();
        }
        loop {
            match decode_record(&mut self.read_buf, max) {
                Ok(Some(record)) => return Some(record.into()),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "discarding undecodable control stream data");
                    self.read_buf.clear();
                    return None;
                }
            }
            if self.closed {
                return None;
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("control stream closed by peer");
                    self.closed = true;
                    return None;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return None,
                Err(err) => {
                    warn!(error = %WireError::Io(err), "control stream read failed");
                    return None;
                }
            }
        }
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn send_control(&self, op: ControlOp, args: &[u8], handles: &[u32]) -> ResultCode {
        let mut state = self.lock();
        if state.closed {
            return ResultCode::FailedPrecondition;
        }
        state.write_record(op, args, handles, &self.config)
    }

    fn poll_event(&self) -> Option<ControlEvent> {
        self.lock().next_event(self.config.max_record_payload)
    }

    fn max_args_len(&self, handle_count: usize) -> Option<usize> {
        Some(
            self.config
                .max_record_payload
                .saturating_sub(handle_count * HANDLE_REF_SIZE),
        )
    }

    fn name(&self) -> &'static str {
        "stream"
    }
}

impl<S> std::fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("max_record_payload", &self.config.max_record_payload)
            .field("max_pending_bytes", &self.config.max_pending_bytes)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;
    use crate::reader::RecordReader;

    #[test]
    fn send_control_writes_decodable_records() {
        let (local, remote) = UnixStream::pair().unwrap();
        let transport = StreamTransport::new(local);

        assert!(transport
            .send_control(ControlOp::CreateMessagePipe, b"", &[1, 2])
            .is_ok());
        assert!(transport
            .send_control(ControlOp::WriteMessage, b"hi", &[3])
            .is_ok());

        let mut reader = RecordReader::new(remote);
        let first = reader.read_record().unwrap();
        assert_eq!(first.op, ControlOp::CreateMessagePipe);
        assert_eq!(first.handles, vec![1, 2]);
        let second = reader.read_record().unwrap();
        assert_eq!(second.args.as_ref(), b"hi");
    }

    #[test]
    fn poll_event_is_non_blocking() {
        let (local, remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let local_transport = StreamTransport::new(local);
        assert!(local_transport.poll_event().is_none());

        let remote_transport = StreamTransport::new(remote);
        assert!(remote_transport
            .send_control(ControlOp::Close, b"", &[42])
            .is_ok());

        let mut event = None;
        for _ in 0..100 {
            event = local_transport.poll_event();
            if event.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let event = event.expect("close event should arrive");
        assert_eq!(event.op, ControlOp::Close);
        assert_eq!(event.handles, vec![42]);
    }

    #[test]
    fn peer_hangup_marks_transport_closed() {
        let (local, remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let transport = StreamTransport::new(local);
        drop(remote);

        for _ in 0..100 {
            let _ = transport.poll_event();
            if transport.is_closed() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(transport.is_closed());
        assert_eq!(
            transport.send_control(ControlOp::Close, b"", &[1]),
            ResultCode::FailedPrecondition
        );
    }

    #[test]
    fn oversized_record_is_refused_locally() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let transport = StreamTransport::with_config(
            local,
            WireConfig {
                max_record_payload: 8,
                ..WireConfig::default()
            },
        );
        assert_eq!(
            transport.send_control(ControlOp::WriteData, &[0u8; 32], &[]),
            ResultCode::ResourceExhausted
        );
        assert_eq!(transport.max_args_len(0), Some(8));
        assert_eq!(transport.max_args_len(1), Some(4));
        assert_eq!(transport.max_args_len(3), Some(0));
    }

    #[test]
    fn unread_peer_backs_up_into_a_bounded_queue() {
        let (local, remote) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let transport = StreamTransport::with_config(
            local,
            WireConfig {
                max_record_payload: 64 * 1024,
                max_pending_bytes: 256 * 1024,
            },
        );

        let args = vec![7u8; 60 * 1024];
        let mut accepted = 0usize;
        let mut refused = false;
        for _ in 0..4096 {
            match transport.send_control(ControlOp::WriteData, &args, &[1]) {
                ResultCode::Ok => accepted += 1,
                ResultCode::ResourceExhausted => {
                    refused = true;
                    break;
                }
                other => panic!("unexpected code {other}"),
            }
        }
        assert!(refused, "backlog never filled after {accepted} records");
        assert!(transport.pending_bytes() > 0);
        assert!(transport.pending_bytes() <= 256 * 1024);

        let reader = std::thread::spawn(move || {
            let mut reader = RecordReader::new(remote);
            let mut seen = 0usize;
            for _ in 0..accepted {
                let record = reader.read_record().unwrap();
                assert_eq!(record.args.len(), 60 * 1024);
                seen += 1;
            }
            seen
        });

        let started = std::time::Instant::now();
        while transport.pending_bytes() > 0 {
            assert!(started.elapsed() < std::time::Duration::from_secs(10));
            assert!(transport.flush().is_ok());
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(reader.join().unwrap(), accepted);
    }
}
