use crate::h2::stream::StreamState;
use std::sync::Arc;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("HTTP/2 stream error: {0}")]
    H2StreamError(H2StreamErrorKind),
    #[error("HTTP/2 connection error: {0}")]
    H2ConnectionError(H2ConnectionErrorKind),
    #[error("Connection pool exhausted for {destination}: {reason}")]
    PoolExhausted { destination: String, reason: String },
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
    #[error("Malformed headers: {0}")]
    MalformedHeaders(String),
    #[error("Header encoding error: {0}")]
    HeaderEncodingError(String),
    #[error("Request timeout")]
    Timeout,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum H2StreamErrorKind {
    #[error("stream reset by peer: {0}")]
    RemoteReset(H2ErrorCode),
    #[error("stream reset locally: {0}")]
    LocalReset(H2ErrorCode),
    #[error("invalid stream state: cannot {operation} while {state}")]
    InvalidState {
        state: StreamState,
        operation: &'static str,
    },
    #[error("stream refused: {0}")]
    Refused(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum H2ConnectionErrorKind {
    #[error("connection terminated with GOAWAY ({0}): {1}")]
    GoAway(H2ErrorCode, String),
    #[error("protocol violation ({0}): {1}")]
    Protocol(H2ErrorCode, String),
    #[error("transport failure: {0}")]
    Io(#[source] Arc<std::io::Error>),
    #[error("connection closed")]
    Closed,
    #[error("settings acknowledgment timeout")]
    SettingsTimeout,
}

// HTTP/2 Error Codes (RFC 7540 Section 7)
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum H2ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ProtocolError {
    pub fn connection(code: H2ErrorCode, reason: impl Into<String>) -> Self {
        ProtocolError::H2ConnectionError(H2ConnectionErrorKind::Protocol(code, reason.into()))
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::connection(H2ErrorCode::ProtocolError, reason)
    }

    pub fn frame_size(reason: impl Into<String>) -> Self {
        Self::connection(H2ErrorCode::FrameSizeError, reason)
    }

    pub fn flow_control(reason: impl Into<String>) -> Self {
        Self::connection(H2ErrorCode::FlowControlError, reason)
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        ProtocolError::H2StreamError(H2StreamErrorKind::Refused(reason.into()))
    }

    /// The code this error carries on the wire in RST_STREAM or GOAWAY.
    pub fn error_code(&self) -> H2ErrorCode {
        match self {
            ProtocolError::H2StreamError(kind) => match kind {
                H2StreamErrorKind::RemoteReset(code) | H2StreamErrorKind::LocalReset(code) => {
                    *code
                }
                H2StreamErrorKind::InvalidState { .. } => H2ErrorCode::StreamClosed,
                H2StreamErrorKind::Refused(_) => H2ErrorCode::RefusedStream,
            },
            ProtocolError::H2ConnectionError(kind) => match kind {
                H2ConnectionErrorKind::GoAway(code, _) | H2ConnectionErrorKind::Protocol(code, _) => {
                    *code
                }
                H2ConnectionErrorKind::Closed => H2ErrorCode::NoError,
                H2ConnectionErrorKind::SettingsTimeout => H2ErrorCode::SettingsTimeout,
                H2ConnectionErrorKind::Io(_) => H2ErrorCode::InternalError,
            },
            ProtocolError::MalformedHeaders(_) => H2ErrorCode::ProtocolError,
            ProtocolError::HeaderEncodingError(_) => H2ErrorCode::CompressionError,
            _ => H2ErrorCode::InternalError,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, ProtocolError::H2ConnectionError(_))
    }

    pub fn is_stream_error(&self) -> bool {
        matches!(self, ProtocolError::H2StreamError(_))
    }

    /// Whether the same request may be attempted again on another connection.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::PoolExhausted { .. } | ProtocolError::ConnectionFailed(_) => true,
            ProtocolError::H2StreamError(H2StreamErrorKind::Refused(_)) => true,
            ProtocolError::H2StreamError(H2StreamErrorKind::RemoteReset(code)) => {
                *code == H2ErrorCode::RefusedStream
            }
            ProtocolError::H2ConnectionError(H2ConnectionErrorKind::GoAway(code, _)) => {
                *code == H2ErrorCode::NoError
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for H2ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, description) = match self {
            H2ErrorCode::NoError => ("NO_ERROR", "graceful shutdown"),
            H2ErrorCode::ProtocolError => ("PROTOCOL_ERROR", "protocol error detected"),
            H2ErrorCode::InternalError => ("INTERNAL_ERROR", "implementation fault"),
            H2ErrorCode::FlowControlError => {
                ("FLOW_CONTROL_ERROR", "flow control protocol violated")
            }
            H2ErrorCode::SettingsTimeout => ("SETTINGS_TIMEOUT", "settings not acknowledged"),
            H2ErrorCode::StreamClosed => ("STREAM_CLOSED", "frame received for closed stream"),
            H2ErrorCode::FrameSizeError => ("FRAME_SIZE_ERROR", "frame size incorrect"),
            H2ErrorCode::RefusedStream => ("REFUSED_STREAM", "stream not processed"),
            H2ErrorCode::Cancel => ("CANCEL", "stream cancelled"),
            H2ErrorCode::CompressionError => ("COMPRESSION_ERROR", "compression state not updated"),
            H2ErrorCode::ConnectError => {
                ("CONNECT_ERROR", "TCP connection error for CONNECT method")
            }
            H2ErrorCode::EnhanceYourCalm => ("ENHANCE_YOUR_CALM", "processing capacity exceeded"),
            H2ErrorCode::InadequateSecurity => (
                "INADEQUATE_SECURITY",
                "negotiated TLS parameters inadequate",
            ),
            H2ErrorCode::Http11Required => ("HTTP_1_1_REQUIRED", "use HTTP/1.1 for request"),
        };
        write!(f, "{} (0x{:x}): {}", name, *self as u32, description)
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::H2ConnectionError(H2ConnectionErrorKind::Io(Arc::new(err)))
    }
}

impl From<H2StreamErrorKind> for ProtocolError {
    fn from(kind: H2StreamErrorKind) -> Self {
        ProtocolError::H2StreamError(kind)
    }
}

impl From<H2ConnectionErrorKind> for ProtocolError {
    fn from(kind: H2ConnectionErrorKind) -> Self {
        ProtocolError::H2ConnectionError(kind)
    }
}

impl From<u32> for H2ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0x0 => H2ErrorCode::NoError,
            0x1 => H2ErrorCode::ProtocolError,
            0x2 => H2ErrorCode::InternalError,
            0x3 => H2ErrorCode::FlowControlError,
            0x4 => H2ErrorCode::SettingsTimeout,
            0x5 => H2ErrorCode::StreamClosed,
            0x6 => H2ErrorCode::FrameSizeError,
            0x7 => H2ErrorCode::RefusedStream,
            0x8 => H2ErrorCode::Cancel,
            0x9 => H2ErrorCode::CompressionError,
            0xa => H2ErrorCode::ConnectError,
            0xb => H2ErrorCode::EnhanceYourCalm,
            0xc => H2ErrorCode::InadequateSecurity,
            0xd => H2ErrorCode::Http11Required,
            _ => H2ErrorCode::InternalError, // Default for unknown error codes
        }
    }
}

impl From<H2ErrorCode> for u32 {
    fn from(code: H2ErrorCode) -> Self {
        code as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_map_to_internal_error() {
        assert_eq!(H2ErrorCode::from(0x42), H2ErrorCode::InternalError);
        assert_eq!(H2ErrorCode::from(0x8), H2ErrorCode::Cancel);
        assert_eq!(u32::from(H2ErrorCode::EnhanceYourCalm), 0xb);
    }

    #[test]
    fn refused_streams_are_retryable() {
        assert!(ProtocolError::refused("limit").is_retryable());
        assert!(ProtocolError::H2StreamError(H2StreamErrorKind::RemoteReset(
            H2ErrorCode::RefusedStream
        ))
        .is_retryable());
        assert!(!ProtocolError::protocol("bad frame").is_retryable());
    }

    #[test]
    fn io_errors_are_connection_errors() {
        let err = ProtocolError::from(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(err.is_connection_error());
        assert_eq!(err.error_code(), H2ErrorCode::InternalError);
    }
}
