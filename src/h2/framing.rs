use crate::h2::consts::*;
use crate::types::{Frame, FrameType, H2ErrorCode, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

// HTTP/2 Frame Format (RFC 7540 Section 4.1):
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Length (24)                   |
// +---------------+---------------+---------------+
// |   Type (8)    |   Flags (8)   |
// +-+-+-----------+---------------+-------------------------------+
// |R|                 Stream Identifier (31)                      |
// +=+=============================================================+
// |                   Frame Payload (0...)                      ...
// +---------------------------------------------------------------+

/// Decoded GOAWAY payload (RFC 7540 Section 6.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: u32,
    pub error_code: H2ErrorCode,
    pub debug_data: Bytes,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            DATA_FRAME_TYPE => FrameType::Data,
            HEADERS_FRAME_TYPE => FrameType::Headers,
            PRIORITY_FRAME_TYPE => FrameType::Priority,
            RST_STREAM_FRAME_TYPE => FrameType::RstStream,
            SETTINGS_FRAME_TYPE => FrameType::Settings,
            PUSH_PROMISE_FRAME_TYPE => FrameType::PushPromise,
            PING_FRAME_TYPE => FrameType::Ping,
            GOAWAY_FRAME_TYPE => FrameType::GoAway,
            WINDOW_UPDATE_FRAME_TYPE => FrameType::WindowUpdate,
            CONTINUATION_FRAME_TYPE => FrameType::Continuation,
            other => FrameType::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameType::Data => DATA_FRAME_TYPE,
            FrameType::Headers => HEADERS_FRAME_TYPE,
            FrameType::Priority => PRIORITY_FRAME_TYPE,
            FrameType::RstStream => RST_STREAM_FRAME_TYPE,
            FrameType::Settings => SETTINGS_FRAME_TYPE,
            FrameType::PushPromise => PUSH_PROMISE_FRAME_TYPE,
            FrameType::Ping => PING_FRAME_TYPE,
            FrameType::GoAway => GOAWAY_FRAME_TYPE,
            FrameType::WindowUpdate => WINDOW_UPDATE_FRAME_TYPE,
            FrameType::Continuation => CONTINUATION_FRAME_TYPE,
            FrameType::Unknown(value) => *value,
        }
    }
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: u8, stream_id: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            flags,
            stream_id: stream_id & STREAM_ID_MASK,
            payload,
        }
    }

    pub fn data(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let flags = if end_stream { END_STREAM_FLAG } else { 0 };
        Self::new(FrameType::Data, flags, stream_id, data)
    }

    /// Wraps an already-encoded header block. The caller is responsible for
    /// sizing; see [`Frame::header_block`] for splitting.
    pub fn headers(stream_id: u32, block: Bytes, end_stream: bool, end_headers: bool) -> Self {
        let mut flags = 0;
        if end_stream {
            flags |= END_STREAM_FLAG;
        }
        if end_headers {
            flags |= END_HEADERS_FLAG;
        }
        Self::new(FrameType::Headers, flags, stream_id, block)
    }

    pub fn continuation(stream_id: u32, block: Bytes, end_headers: bool) -> Self {
        let flags = if end_headers { END_HEADERS_FLAG } else { 0 };
        Self::new(FrameType::Continuation, flags, stream_id, block)
    }

    pub fn push_promise(stream_id: u32, promised_id: u32, block: &[u8], end_headers: bool) -> Self {
        let flags = if end_headers { END_HEADERS_FLAG } else { 0 };
        let mut payload = BytesMut::with_capacity(4 + block.len());
        payload.put_u32(promised_id & STREAM_ID_MASK);
        payload.put_slice(block);
        Self::new(FrameType::PushPromise, flags, stream_id, payload.freeze())
    }

    /// Splits an encoded header block into one HEADERS frame followed by as
    /// many CONTINUATION frames as `max_frame_size` requires.
    pub fn header_block(
        stream_id: u32,
        mut block: Bytes,
        end_stream: bool,
        max_frame_size: usize,
    ) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(1 + block.len() / max_frame_size.max(1));
        let mut first = true;

        loop {
            let chunk_len = block.len().min(max_frame_size);
            let chunk = block.split_to(chunk_len);
            let is_last = block.is_empty();

            if first {
                frames.push(Frame::headers(stream_id, chunk, end_stream, is_last));
            } else {
                frames.push(Frame::continuation(stream_id, chunk, is_last));
            }

            if is_last {
                break;
            }
            first = false;
        }

        frames
    }

    pub fn settings(settings: &[(u16, u32)]) -> Self {
        let mut payload = BytesMut::with_capacity(settings.len() * 6);
        for &(id, value) in settings {
            payload.put_u16(id);
            payload.put_u32(value);
        }
        Self::new(FrameType::Settings, 0, 0, payload.freeze())
    }

    pub fn settings_ack() -> Self {
        Self::new(FrameType::Settings, ACK_FLAG, 0, Bytes::new())
    }

    pub fn window_update(stream_id: u32, increment: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(increment & MAX_WINDOW_SIZE);
        Self::new(FrameType::WindowUpdate, 0, stream_id, payload.freeze())
    }

    pub fn rst(stream_id: u32, error_code: H2ErrorCode) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(error_code.into());
        Self::new(FrameType::RstStream, 0, stream_id, payload.freeze())
    }

    pub fn ping(data: [u8; 8]) -> Self {
        Self::new(FrameType::Ping, 0, 0, Bytes::copy_from_slice(&data))
    }

    pub fn ping_ack(data: [u8; 8]) -> Self {
        Self::new(FrameType::Ping, ACK_FLAG, 0, Bytes::copy_from_slice(&data))
    }

    pub fn goaway(last_stream_id: u32, error_code: H2ErrorCode, debug_data: Option<&[u8]>) -> Self {
        let mut payload = BytesMut::with_capacity(8 + debug_data.map(|d| d.len()).unwrap_or(0));

        payload.put_u32(last_stream_id & STREAM_ID_MASK);
        payload.put_u32(error_code.into());

        if let Some(debug) = debug_data {
            payload.put_slice(debug);
        }

        Self::new(FrameType::GoAway, 0, 0, payload.freeze())
    }

    pub fn is_end_stream(&self) -> bool {
        (self.flags & END_STREAM_FLAG) != 0
    }

    pub fn is_end_headers(&self) -> bool {
        (self.flags & END_HEADERS_FLAG) != 0
    }

    pub fn is_ack(&self) -> bool {
        (self.flags & ACK_FLAG) != 0
    }

    pub fn is_padded(&self) -> bool {
        (self.flags & PADDED_FLAG) != 0
    }

    pub fn has_priority(&self) -> bool {
        (self.flags & PRIORITY_FLAG) != 0
    }

    /// Size charged against flow control: the whole payload, padding included.
    pub fn flow_controlled_len(&self) -> usize {
        match self.frame_type {
            FrameType::Data => self.payload.len(),
            _ => 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if self.payload.len() > MAX_FRAME_SIZE_UPPER_BOUND as usize {
            return Err(ProtocolError::frame_size(format!(
                "Frame payload size {} exceeds maximum {}",
                self.payload.len(),
                MAX_FRAME_SIZE_UPPER_BOUND
            )));
        }

        dst.reserve(self.encoded_len());

        // Length (24 bits)
        let length = self.payload.len() as u32;
        dst.put_u8(((length >> 16) & 0xFF) as u8);
        dst.put_u8(((length >> 8) & 0xFF) as u8);
        dst.put_u8((length & 0xFF) as u8);

        dst.put_u8(self.frame_type.as_u8());
        dst.put_u8(self.flags);

        // Stream ID (31 bits, with reserved bit clear)
        dst.put_u32(self.stream_id & STREAM_ID_MASK);

        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn serialize(&self) -> Result<Bytes, ProtocolError> {
        let mut result = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut result)?;
        Ok(result.freeze())
    }

    /// Parses one frame from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::frame_size("Frame too short"));
        }

        let (length, frame_type, flags, stream_id) = Self::parse_header(data);

        if data.len() < FRAME_HEADER_SIZE + length {
            return Err(ProtocolError::frame_size("Incomplete frame payload"));
        }

        let payload = Bytes::copy_from_slice(&data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + length]);
        Ok(Frame {
            frame_type,
            flags,
            stream_id,
            payload,
        })
    }

    fn parse_header(data: &[u8]) -> (usize, FrameType, u8, u32) {
        let length = ((data[0] as usize) << 16) | ((data[1] as usize) << 8) | (data[2] as usize);
        let frame_type = FrameType::from_u8(data[3]);
        let flags = data[4];
        // Clear the reserved bit
        let stream_id = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) & STREAM_ID_MASK;
        (length, frame_type, flags, stream_id)
    }

    /// Reads exactly one frame from `reader`. A clean end of stream before the
    /// first header byte yields `Ok(None)`; payloads larger than
    /// `max_frame_size` are a FRAME_SIZE_ERROR.
    pub async fn read_from<R>(reader: &mut R, max_frame_size: u32) -> Result<Option<Frame>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < FRAME_HEADER_SIZE {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame header",
                )
                .into());
            }
            filled += n;
        }

        let (length, frame_type, flags, stream_id) = Self::parse_header(&header);
        if length > max_frame_size as usize {
            return Err(ProtocolError::frame_size(format!(
                "Frame of {} bytes exceeds advertised maximum {}",
                length, max_frame_size
            )));
        }

        let mut payload = BytesMut::zeroed(length);
        if length > 0 {
            reader.read_exact(&mut payload).await?;
        }

        Ok(Some(Frame {
            frame_type,
            flags,
            stream_id,
            payload: payload.freeze(),
        }))
    }

    pub fn settings_entries(&self) -> Result<Vec<(u16, u32)>, ProtocolError> {
        if self.stream_id != 0 {
            return Err(ProtocolError::protocol("SETTINGS frame on a non-zero stream"));
        }
        if self.is_ack() {
            if !self.payload.is_empty() {
                return Err(ProtocolError::frame_size("SETTINGS ACK with a payload"));
            }
            return Ok(Vec::new());
        }
        if self.payload.len() % 6 != 0 {
            return Err(ProtocolError::frame_size(
                "SETTINGS payload is not a multiple of 6 bytes",
            ));
        }

        let mut payload = self.payload.clone();
        let mut entries = Vec::with_capacity(payload.len() / 6);
        while payload.has_remaining() {
            let id = payload.get_u16();
            let value = payload.get_u32();
            entries.push((id, value));
        }
        Ok(entries)
    }

    pub fn window_increment(&self) -> Result<u32, ProtocolError> {
        if self.payload.len() != 4 {
            return Err(ProtocolError::frame_size("Invalid WINDOW_UPDATE frame size"));
        }
        Ok(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]) & MAX_WINDOW_SIZE)
    }

    pub fn rst_error_code(&self) -> Result<H2ErrorCode, ProtocolError> {
        if self.stream_id == 0 {
            return Err(ProtocolError::protocol("RST_STREAM frame on stream 0"));
        }
        if self.payload.len() != 4 {
            return Err(ProtocolError::frame_size(
                "RST_STREAM frame must have 4-byte payload",
            ));
        }
        Ok(H2ErrorCode::from(u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ])))
    }

    pub fn ping_data(&self) -> Result<[u8; 8], ProtocolError> {
        if self.stream_id != 0 {
            return Err(ProtocolError::protocol("PING frame on a non-zero stream"));
        }
        if self.payload.len() != 8 {
            return Err(ProtocolError::frame_size("PING payload must be 8 bytes"));
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(&self.payload);
        Ok(data)
    }

    pub fn goaway_payload(&self) -> Result<GoAway, ProtocolError> {
        if self.stream_id != 0 {
            return Err(ProtocolError::protocol("GOAWAY frame on a non-zero stream"));
        }
        if self.payload.len() < 8 {
            return Err(ProtocolError::frame_size("Invalid GOAWAY frame size"));
        }

        let mut payload = self.payload.clone();
        let last_stream_id = payload.get_u32() & STREAM_ID_MASK;
        let error_code = H2ErrorCode::from(payload.get_u32());
        Ok(GoAway {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }

    /// DATA payload with padding removed.
    pub fn data_payload(&self) -> Result<Bytes, ProtocolError> {
        let (start, end) = self.padded_bounds()?;
        Ok(self.payload.slice(start..end))
    }

    /// Header block fragment of a HEADERS or CONTINUATION frame, with padding
    /// and priority fields removed.
    pub fn header_fragment(&self) -> Result<Bytes, ProtocolError> {
        match self.frame_type {
            FrameType::Continuation => Ok(self.payload.clone()),
            FrameType::Headers => {
                let (mut start, end) = self.padded_bounds()?;
                if self.has_priority() {
                    if end < start + 5 {
                        return Err(ProtocolError::protocol(
                            "PRIORITY flag set but insufficient payload",
                        ));
                    }
                    start += 5;
                }
                Ok(self.payload.slice(start..end))
            }
            _ => Err(ProtocolError::protocol("Frame does not carry a header block")),
        }
    }

    /// Promised stream id and header block fragment of a PUSH_PROMISE frame.
    pub fn push_promise_payload(&self) -> Result<(u32, Bytes), ProtocolError> {
        let (start, end) = self.padded_bounds()?;
        if end < start + 4 {
            return Err(ProtocolError::frame_size("PUSH_PROMISE payload too short"));
        }
        let promised = u32::from_be_bytes([
            self.payload[start],
            self.payload[start + 1],
            self.payload[start + 2],
            self.payload[start + 3],
        ]) & STREAM_ID_MASK;
        Ok((promised, self.payload.slice(start + 4..end)))
    }

    fn padded_bounds(&self) -> Result<(usize, usize), ProtocolError> {
        let len = self.payload.len();
        if !self.is_padded() {
            return Ok((0, len));
        }
        if len == 0 {
            return Err(ProtocolError::protocol(
                "PADDED flag set but no pad length available",
            ));
        }
        let pad_length = self.payload[0] as usize;
        if pad_length > len - 1 {
            return Err(ProtocolError::protocol("Padding exceeds payload size"));
        }
        Ok((1, len - pad_length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_splits_into_continuations() {
        let block = Bytes::from(vec![7u8; 40]);
        let frames = Frame::header_block(3, block, true, 16);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame_type, FrameType::Headers);
        assert!(frames[0].is_end_stream());
        assert!(!frames[0].is_end_headers());
        assert_eq!(frames[1].frame_type, FrameType::Continuation);
        assert!(!frames[1].is_end_headers());
        assert_eq!(frames[2].frame_type, FrameType::Continuation);
        assert!(frames[2].is_end_headers());
        assert_eq!(frames[2].payload.len(), 8);
    }

    #[test]
    fn empty_header_block_still_emits_headers() {
        let frames = Frame::header_block(1, Bytes::new(), false, 16_384);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_end_headers());
        assert!(!frames[0].is_end_stream());
    }

    #[test]
    fn strips_padding_and_priority_from_headers() {
        let mut payload = BytesMut::new();
        payload.put_u8(2); // pad length
        payload.put_u32(0x8000_0003); // exclusive dependency on stream 3
        payload.put_u8(15); // weight
        payload.put_slice(b"hdr");
        payload.put_slice(&[0, 0]);
        let frame = Frame::new(
            FrameType::Headers,
            PADDED_FLAG | PRIORITY_FLAG | END_HEADERS_FLAG,
            1,
            payload.freeze(),
        );

        assert_eq!(frame.header_fragment().unwrap(), Bytes::from_static(b"hdr"));
    }

    #[test]
    fn rejects_padding_longer_than_payload() {
        let frame = Frame::new(FrameType::Data, PADDED_FLAG, 1, Bytes::from_static(&[9, 1, 2]));
        assert!(frame.data_payload().is_err());
    }

    #[test]
    fn settings_payload_must_be_multiple_of_six() {
        let frame = Frame::new(FrameType::Settings, 0, 0, Bytes::from_static(&[0, 1, 0]));
        let err = frame.settings_entries().unwrap_err();
        assert_eq!(err.error_code(), H2ErrorCode::FrameSizeError);
    }

    #[test]
    fn unknown_frame_types_are_preserved() {
        let frame = Frame::new(FrameType::Unknown(0xfa), 0, 0, Bytes::from_static(b"x"));
        let parsed = Frame::parse(&frame.serialize().unwrap()).unwrap();
        assert_eq!(parsed.frame_type, FrameType::Unknown(0xfa));
    }

    #[test]
    fn reserved_bit_is_cleared() {
        let raw = [0, 0, 0, DATA_FRAME_TYPE, 0, 0x80, 0, 0, 5];
        let frame = Frame::parse(&raw).unwrap();
        assert_eq!(frame.stream_id, 5);
    }

    #[tokio::test]
    async fn read_from_rejects_oversized_frames() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; 32]), false);
        let bytes = frame.serialize().unwrap();
        let mut reader = tokio_test::io::Builder::new().read(&bytes).build();

        let err = Frame::read_from(&mut reader, 16).await.unwrap_err();
        assert_eq!(err.error_code(), H2ErrorCode::FrameSizeError);
    }

    #[tokio::test]
    async fn read_from_reports_clean_eof() {
        let mut reader = tokio_test::io::Builder::new().build();
        assert!(Frame::read_from(&mut reader, 16_384).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_from_handles_split_reads() {
        let frame = Frame::ping(*b"abcdefgh");
        let bytes = frame.serialize().unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&bytes[..4])
            .read(&bytes[4..11])
            .read(&bytes[11..])
            .build();

        let parsed = Frame::read_from(&mut reader, 16_384).await.unwrap().unwrap();
        assert_eq!(parsed, frame);
    }
}
