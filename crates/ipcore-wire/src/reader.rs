use std::io::{ErrorKind, Read};

use bytes::BytesMut;

use crate::codec::{decode_record, ControlRecord, WireConfig};
use crate::error::{Result, WireError};

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Reads complete control records from any blocking `Read` stream.
///
/// This is the receiving half used by whoever sits on the other side of a
/// [`StreamTransport`](crate::StreamTransport).
pub struct RecordReader<R> {
    inner: R,
    buf: BytesMut,
    config: WireConfig,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_config(inner, WireConfig::default())
    }

    pub fn with_config(inner: R, config: WireConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            config,
        }
    }

    /// Read the next complete record (blocking).
    ///
    /// Returns `Err(WireError::ConnectionClosed)` when EOF is reached.
    pub fn read_record(&mut self) -> Result<ControlRecord> {
        loop {
            if let Some(record) = decode_record(&mut self.buf, self.config.max_record_payload)? {
                return Ok(record);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(WireError::Io(err)),
            };
            if read == 0 {
                return Err(WireError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
