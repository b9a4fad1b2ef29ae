use bytes::{Buf, BufMut, Bytes, BytesMut};
use ipcore_transport::{ControlEvent, ControlOp};

use crate::error::{Result, WireError};

/// Record header: magic (2) + length (4) + opcode (2) + handle count (2).
pub const HEADER_SIZE: usize = 10;

/// Magic bytes: "MJ" (0x4D 0x4A).
pub const MAGIC: [u8; 2] = [0x4D, 0x4A];

/// Default maximum record payload: 8 MiB, enough for a maximum-size
/// message with its handle refs under the default core limits.
pub const DEFAULT_MAX_RECORD_PAYLOAD: usize = 8 * 1024 * 1024;

/// Default cap on encoded bytes waiting for a writable stream: 16 MiB.
pub const DEFAULT_MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Handle count is a u16 on the wire.
pub const MAX_RECORD_HANDLES: usize = u16::MAX as usize;

pub(crate) const HANDLE_REF_SIZE: usize = 4;

/// A decoded control record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub op: ControlOp,
    pub handles: Vec<u32>,
    pub args: Bytes,
}

impl ControlRecord {
    pub fn new(op: ControlOp, handles: Vec<u32>, args: impl Into<Bytes>) -> Self {
        Self {
            op,
            handles,
            args: args.into(),
        }
    }

    /// Payload size on the wire (handle refs + args).
    pub fn payload_size(&self) -> usize {
        self.handles.len() * HANDLE_REF_SIZE + self.args.len()
    }

    /// Total wire size of this record (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload_size()
    }
}

impl From<ControlRecord> for ControlEvent {
    fn from(record: ControlRecord) -> Self {
        ControlEvent {
            op: record.op,
            args: record.args,
            handles: record.handles,
        }
    }
}

/// Encode a control record into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬───────────┬──────────┬──────────┬──────────────┬────────┐
/// │ Magic (2B) │ Length    │ Opcode   │ Handles  │ Handle refs  │ Args   │
/// │ 0x4D 0x4A  │ (4B LE)   │ (2B LE)  │ (2B LE)  │ (4B LE × n)  │        │
/// └────────────┴───────────┴──────────┴──────────┴──────────────┴────────┘
/// ```
/// `Length` counts the handle refs and the args, not the header.
pub fn encode_record(op: ControlOp, handles: &[u32], args: &[u8], dst: &mut BytesMut) -> Result<()> {
    if handles.len() > MAX_RECORD_HANDLES {
        return Err(WireError::TooManyHandles {
            count: handles.len(),
            max: MAX_RECORD_HANDLES,
        });
    }
    let payload_len = handles.len() * HANDLE_REF_SIZE + args.len();
    if payload_len > u32::MAX as usize {
        return Err(WireError::PayloadTooLarge {
            size: payload_len,
            max: u32::MAX as usize,
        });
    }

    dst.reserve(HEADER_SIZE + payload_len);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload_len as u32);
    dst.put_u16_le(op.as_u16());
    dst.put_u16_le(handles.len() as u16);
    for handle in handles {
        dst.put_u32_le(*handle);
    }
    dst.put_slice(args);
    Ok(())
}

/// Decode a control record from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't hold a complete record yet.
/// On success, consumes the record bytes from the buffer.
pub fn decode_record(src: &mut BytesMut, max_payload: usize) -> Result<Option<ControlRecord>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(WireError::InvalidMagic);
    }

    let mut header = &src[2..HEADER_SIZE];
    let payload_len = header.get_u32_le() as usize;
    let raw_op = header.get_u16_le();
    let handle_count = header.get_u16_le() as usize;

    if payload_len > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    if handle_count * HANDLE_REF_SIZE > payload_len {
        return Err(WireError::Malformed("handle refs exceed payload length"));
    }
    let op = ControlOp::try_from(raw_op)?;

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let mut payload = src.split_to(payload_len);
    let handles = (0..handle_count).map(|_| payload.get_u32_le()).collect();
    let args = payload.freeze();

    Ok(Some(ControlRecord { op, handles, args }))
}

/// Configuration for the record codec.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum record payload in bytes. Default: 8 MiB.
    pub max_record_payload: usize,
    /// Encoded bytes a stream transport may hold back while its stream
    /// is not writable. Records beyond it are refused. Default: 16 MiB.
    pub max_pending_bytes: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_record_payload: DEFAULT_MAX_RECORD_PAYLOAD,
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_preserves_fields() {
        let mut buf = BytesMut::new();
        encode_record(ControlOp::WriteMessage, &[7, 9], b"hello", &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 8 + 5);

        let record = decode_record(&mut buf, DEFAULT_MAX_RECORD_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(record.op, ControlOp::WriteMessage);
        assert_eq!(record.handles, vec![7, 9]);
        assert_eq!(record.args.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_header_needs_more_data() {
        let mut buf = BytesMut::from(&MAGIC[..]);
        assert!(decode_record(&mut buf, DEFAULT_MAX_RECORD_PAYLOAD)
            .unwrap()
            .is_none());
    }

    #[test]
    fn incomplete_payload_needs_more_data() {
        let mut buf = BytesMut::new();
        encode_record(ControlOp::Close, &[1], b"", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);
        assert!(decode_record(&mut buf, DEFAULT_MAX_RECORD_PAYLOAD)
            .unwrap()
            .is_none());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::from(&[0xFFu8; HEADER_SIZE][..]);
        let result = decode_record(&mut buf, DEFAULT_MAX_RECORD_PAYLOAD);
        assert!(matches!(result, Err(WireError::InvalidMagic)));
    }

    #[test]
    fn oversized_payload_is_rejected_from_header() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(64 * 1024);
        buf.put_u16_le(ControlOp::WriteData.as_u16());
        buf.put_u16_le(0);

        let result = decode_record(&mut buf, 1024);
        assert!(matches!(result, Err(WireError::PayloadTooLarge { .. })));
    }

    #[test]
    fn handle_count_beyond_payload_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(4);
        buf.put_u16_le(ControlOp::Close.as_u16());
        buf.put_u16_le(3);
        buf.put_u32_le(1);

        let result = decode_record(&mut buf, DEFAULT_MAX_RECORD_PAYLOAD);
        assert!(matches!(result, Err(WireError::Malformed(_))));
    }

    #[test]
    fn unknown_opcode_is_a_transport_error() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(0);
        buf.put_u16_le(0x0BAD);
        buf.put_u16_le(0);

        let result = decode_record(&mut buf, DEFAULT_MAX_RECORD_PAYLOAD);
        assert!(matches!(result, Err(WireError::Transport(_))));
    }

    #[test]
    fn back_to_back_records_decode_in_order() {
        let mut buf = BytesMut::new();
        encode_record(ControlOp::CreateMessagePipe, &[1, 2], b"", &mut buf).unwrap();
        encode_record(ControlOp::Close, &[1], b"", &mut buf).unwrap();

        let first = decode_record(&mut buf, usize::MAX).unwrap().unwrap();
        let second = decode_record(&mut buf, usize::MAX).unwrap().unwrap();
        assert_eq!(first.op, ControlOp::CreateMessagePipe);
        assert_eq!(second.op, ControlOp::Close);
        assert_eq!(second.handles, vec![1]);
        assert!(buf.is_empty());
    }

    #[test]
    fn record_sizes_account_for_handles() {
        let record = ControlRecord::new(ControlOp::WriteMessage, vec![1, 2, 3], &b"ab"[..]);
        assert_eq!(record.payload_size(), 14);
        assert_eq!(record.wire_size(), HEADER_SIZE + 14);
    }
}
