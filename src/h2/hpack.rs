use bytes::Bytes;
use hpack::{Decoder, Encoder};

use crate::types::{Header, ProtocolError};

/// Header block compression for one connection. Both directions share the
/// instance; calls arrive in wire order.
pub trait HeaderCodec: Send {
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes, ProtocolError>;

    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>, ProtocolError>;

    /// The peer's SETTINGS_HEADER_TABLE_SIZE.
    fn set_encoder_max_table_size(&mut self, _size: usize) {}

    /// Our SETTINGS_HEADER_TABLE_SIZE, once the peer has acknowledged it.
    fn set_decoder_max_table_size(&mut self, _size: usize) {}
}

pub struct HpackCodec {
    encoder: Encoder<'static>,
    decoder: Decoder<'static>,
    encoder_max_table_size: usize,
    decoder_max_table_size: usize,
}

impl HpackCodec {
    pub fn new(decoder_max_table_size: usize) -> Self {
        let mut decoder = Decoder::new();
        decoder.set_max_table_size(decoder_max_table_size);
        Self {
            encoder: Encoder::new(),
            decoder,
            encoder_max_table_size: 4_096,
            decoder_max_table_size,
        }
    }

    pub fn encoder_max_table_size(&self) -> usize {
        self.encoder_max_table_size
    }

    pub fn decoder_max_table_size(&self) -> usize {
        self.decoder_max_table_size
    }

    fn into_header(name: Vec<u8>, value: Vec<u8>) -> Result<Header, ProtocolError> {
        let name = String::from_utf8(name).map_err(|e| {
            ProtocolError::HeaderEncodingError(format!("Invalid UTF-8 in header name: {}", e))
        })?;
        let value = String::from_utf8(value).map_err(|e| {
            ProtocolError::HeaderEncodingError(format!("Invalid UTF-8 in header value: {}", e))
        })?;
        Ok(Header { name, value })
    }
}

impl Default for HpackCodec {
    fn default() -> Self {
        Self::new(4_096)
    }
}

impl HeaderCodec for HpackCodec {
    fn encode(&mut self, headers: &[Header]) -> Result<Bytes, ProtocolError> {
        let header_tuples = headers
            .iter()
            .map(|h| (h.name.as_bytes(), h.value.as_bytes()))
            .collect::<Vec<_>>();

        Ok(Bytes::from(self.encoder.encode(header_tuples)))
    }

    fn decode(&mut self, block: &[u8]) -> Result<Vec<Header>, ProtocolError> {
        match self.decoder.decode(block) {
            Ok(entries) => entries
                .into_iter()
                .map(|(name, value)| Self::into_header(name, value))
                .collect(),
            Err(err) => Err(ProtocolError::HeaderEncodingError(format!(
                "HPACK decode error: {:?}",
                err
            ))),
        }
    }

    fn set_encoder_max_table_size(&mut self, size: usize) {
        // The hpack encoder never grows its dynamic table past the protocol
        // default, so only a record of the peer's limit is kept.
        self.encoder_max_table_size = size;
    }

    fn set_decoder_max_table_size(&mut self, size: usize) {
        if size != self.decoder_max_table_size {
            self.decoder.set_max_table_size(size);
            self.decoder_max_table_size = size;
        }
    }
}
