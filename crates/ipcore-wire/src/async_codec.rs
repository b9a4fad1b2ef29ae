use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_record, encode_record, ControlRecord, WireConfig};
use crate::error::{Result, WireError};

/// `tokio_util` codec for control records.
#[derive(Debug, Clone, Default)]
pub struct RecordCodec {
    config: WireConfig,
}

impl RecordCodec {
    pub fn new(config: WireConfig) -> Self {
        Self { config }
    }
}

impl Decoder for RecordCodec {
    type Item = ControlRecord;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlRecord>> {
        decode_record(src, self.config.max_record_payload)
    }
}

impl Encoder<ControlRecord> for RecordCodec {
    type Error = WireError;

    fn encode(&mut self, item: ControlRecord, dst: &mut BytesMut) -> Result<()> {
        if item.payload_size() > self.config.max_record_payload {
            return Err(WireError::PayloadTooLarge {
                size: item.payload_size(),
                max: self.config.max_record_payload,
            });
        }
        encode_record(item.op, &item.handles, &item.args, dst)
    }
}
