use super::error::ProtocolError;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,         // 0x0
    Headers,      // 0x1
    Priority,     // 0x2
    RstStream,    // 0x3
    Settings,     // 0x4
    PushPromise,  // 0x5
    Ping,         // 0x6
    GoAway,       // 0x7
    WindowUpdate, // 0x8
    Continuation, // 0x9
    Unknown(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// The single write path of a connection. Every call emits whole frames.
#[async_trait]
pub trait FrameSink {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError>;

    /// Writes `frames` back to back. Header blocks split over HEADERS and
    /// CONTINUATION frames must go through here so nothing lands between them.
    async fn write_frames(&mut self, frames: &[Frame]) -> Result<(), ProtocolError> {
        for frame in frames {
            self.write_frame(frame).await?;
        }
        Ok(())
    }
}
