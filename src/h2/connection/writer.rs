use crate::h2::consts::CONNECTION_PREFACE;
use crate::types::{Frame, FrameSink, H2ConnectionErrorKind, ProtocolError};
use crate::utils::timeout_result;
use async_trait::async_trait;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write half of the transport. Every outbound byte of a connection goes
/// through the one instance behind the connection's async mutex, so frames
/// passed to a single call are never interleaved with anything else.
pub(crate) struct FrameWriter {
    io: Box<dyn AsyncWrite + Send + Unpin>,
    buf: BytesMut,
    timeout: Option<Duration>,
    closed: bool,
}

impl FrameWriter {
    pub(crate) fn new(io: Box<dyn AsyncWrite + Send + Unpin>, timeout: Option<Duration>) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(16_384),
            timeout,
            closed: false,
        }
    }

    /// Client connection preface followed by the initial frames.
    pub(crate) async fn write_preface(&mut self, frames: &[Frame]) -> Result<(), ProtocolError> {
        self.buf.clear();
        self.buf.extend_from_slice(CONNECTION_PREFACE);
        for frame in frames {
            frame.encode_into(&mut self.buf)?;
        }
        self.flush_buf().await
    }

    pub(crate) async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.io.shutdown().await?;
        Ok(())
    }

    async fn flush_buf(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(H2ConnectionErrorKind::Closed.into());
        }

        let io = &mut self.io;
        let buf = &self.buf;
        let result = timeout_result(self.timeout, async move {
            io.write_all(buf).await?;
            io.flush().await?;
            Ok(())
        })
        .await;

        match result {
            Err(ProtocolError::Timeout) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "timed out writing to the transport",
            )
            .into()),
            other => other,
        }
    }
}

#[async_trait]
impl FrameSink for FrameWriter {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), ProtocolError> {
        self.buf.clear();
        frame.encode_into(&mut self.buf)?;
        self.flush_buf().await
    }

    async fn write_frames(&mut self, frames: &[Frame]) -> Result<(), ProtocolError> {
        self.buf.clear();
        for frame in frames {
            frame.encode_into(&mut self.buf)?;
        }
        self.flush_buf().await
    }
}
