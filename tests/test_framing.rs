use async_trait::async_trait;
use bytes::Bytes;
use h2mux::h2::consts::{END_HEADERS_FLAG, END_STREAM_FLAG, PADDED_FLAG};
use h2mux::{Frame, FrameSink, FrameType, H2ErrorCode, ProtocolError};

struct MockSink {
    frames: Vec<Frame>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.frames.push(frame.clone());
        Ok(())
    }
}

impl MockSink {
    fn new() -> Self {
        Self { frames: Vec::new() }
    }

    fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

fn roundtrip(frame: &Frame) -> Frame {
    let serialized = frame.serialize().expect("serialization succeeds");
    Frame::parse(&serialized).expect("parsing succeeds")
}

#[tokio::test]
async fn default_write_frames_keeps_order() {
    let frames = Frame::header_block(1, Bytes::from(vec![7u8; 40]), true, 16);
    let mut sink = MockSink::new();

    sink.write_frames(&frames).await.expect("send header block");

    assert_eq!(sink.frames().len(), 3);
    assert_eq!(sink.frames()[0].frame_type, FrameType::Headers);
    assert_eq!(sink.frames()[1].frame_type, FrameType::Continuation);
    assert_eq!(sink.frames()[2].frame_type, FrameType::Continuation);
    assert!(sink.frames()[2].is_end_headers());
}

#[test]
fn header_block_marks_end_stream_on_headers_only() {
    let frames = Frame::header_block(3, Bytes::from(vec![1u8; 20_000]), true, 16_384);
    assert_eq!(frames.len(), 2);

    let headers = &frames[0];
    assert_eq!(headers.flags & END_STREAM_FLAG, END_STREAM_FLAG);
    assert_eq!(headers.flags & END_HEADERS_FLAG, 0);
    assert_eq!(headers.payload.len(), 16_384);

    let continuation = &frames[1];
    assert_eq!(continuation.flags & END_STREAM_FLAG, 0);
    assert!(continuation.is_end_headers());
    assert_eq!(continuation.payload.len(), 20_000 - 16_384);
}

#[test]
fn small_header_block_fits_one_frame() {
    let frames = Frame::header_block(5, Bytes::from_static(b"\x82\x84"), false, 16_384);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].is_end_headers());
    assert!(!frames[0].is_end_stream());
}

#[test]
fn data_roundtrip() {
    let frame = Frame::data(3, Bytes::from_static(b"hello"), true);
    let parsed = roundtrip(&frame);
    assert_eq!(parsed.frame_type, FrameType::Data);
    assert_eq!(parsed.stream_id, 3);
    assert!(parsed.is_end_stream());
    assert_eq!(parsed.data_payload().unwrap(), Bytes::from_static(b"hello"));
}

#[test]
fn padded_data_counts_padding_against_flow_control() {
    // pad length 3, "hi", three padding bytes
    let payload = Bytes::from_static(&[3, b'h', b'i', 0, 0, 0]);
    let frame = Frame::new(FrameType::Data, PADDED_FLAG, 1, payload);
    assert_eq!(frame.flow_controlled_len(), 6);
    assert_eq!(frame.data_payload().unwrap(), Bytes::from_static(b"hi"));
}

#[test]
fn padding_longer_than_payload_is_rejected() {
    let payload = Bytes::from_static(&[9, b'h']);
    let frame = Frame::new(FrameType::Data, PADDED_FLAG, 1, payload);
    assert!(frame.data_payload().is_err());
}

#[test]
fn settings_roundtrip() {
    let frame = Frame::settings(&[(0x3, 100), (0x4, 1 << 20)]);
    let parsed = roundtrip(&frame);
    assert_eq!(
        parsed.settings_entries().unwrap(),
        vec![(0x3, 100), (0x4, 1 << 20)]
    );
    assert!(!parsed.is_ack());
    assert!(roundtrip(&Frame::settings_ack()).is_ack());
}

#[test]
fn settings_with_ragged_payload_is_frame_size_error() {
    let frame = Frame::new(FrameType::Settings, 0, 0, Bytes::from_static(&[0, 3, 0]));
    let err = frame.settings_entries().unwrap_err();
    assert_eq!(err.error_code(), H2ErrorCode::FrameSizeError);
}

#[test]
fn push_promise_roundtrip() {
    let frame = Frame::push_promise(1, 2, b"\x82\x87", true);
    let parsed = roundtrip(&frame);
    let (promised, fragment) = parsed.push_promise_payload().unwrap();
    assert_eq!(promised, 2);
    assert_eq!(&fragment[..], b"\x82\x87");
    assert!(parsed.is_end_headers());
}

#[test]
fn goaway_roundtrip() {
    let frame = Frame::goaway(7, H2ErrorCode::EnhanceYourCalm, Some(b"slow down"));
    let goaway = roundtrip(&frame).goaway_payload().unwrap();
    assert_eq!(goaway.last_stream_id, 7);
    assert_eq!(goaway.error_code, H2ErrorCode::EnhanceYourCalm);
    assert_eq!(&goaway.debug_data[..], b"slow down");
}

#[test]
fn control_frames_roundtrip() {
    let rst = roundtrip(&Frame::rst(9, H2ErrorCode::Cancel));
    assert_eq!(rst.rst_error_code().unwrap(), H2ErrorCode::Cancel);

    let update = roundtrip(&Frame::window_update(0, 1_000));
    assert_eq!(update.window_increment().unwrap(), 1_000);

    let ping = roundtrip(&Frame::ping_ack(*b"abcdefgh"));
    assert!(ping.is_ack());
    assert_eq!(&ping.ping_data().unwrap(), b"abcdefgh");
}

#[test]
fn reserved_stream_bit_is_ignored_on_parse() {
    let mut bytes = Frame::rst(1, H2ErrorCode::NoError)
        .serialize()
        .unwrap()
        .to_vec();
    bytes[5] |= 0x80;
    assert_eq!(Frame::parse(&bytes).unwrap().stream_id, 1);
}

#[tokio::test]
async fn read_from_enforces_max_frame_size() {
    let bytes = Frame::data(1, Bytes::from(vec![0u8; 100]), false)
        .serialize()
        .unwrap();
    let mut reader = &bytes[..];
    let err = Frame::read_from(&mut reader, 64).await.unwrap_err();
    assert_eq!(err.error_code(), H2ErrorCode::FrameSizeError);
}

#[tokio::test]
async fn read_from_reports_clean_eof() {
    let mut reader: &[u8] = &[];
    assert!(Frame::read_from(&mut reader, 16_384).await.unwrap().is_none());

    let mut truncated: &[u8] = &[0, 0, 4, 0];
    assert!(Frame::read_from(&mut truncated, 16_384).await.is_err());
}
