use crate::types::{H2StreamErrorKind, ProtocolError};

// Stream States (RFC 7540 Section 5.1), seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    /// Promised by the peer with PUSH_PROMISE, its HEADERS not yet received.
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamState::Idle => write!(f, "idle"),
            StreamState::ReservedRemote => write!(f, "reserved (remote)"),
            StreamState::Open => write!(f, "open"),
            StreamState::HalfClosedLocal => write!(f, "half-closed (local)"),
            StreamState::HalfClosedRemote => write!(f, "half-closed (remote)"),
            StreamState::Closed => write!(f, "closed"),
        }
    }
}

impl StreamState {
    pub fn send_headers(self, end_stream: bool) -> Result<Self, ProtocolError> {
        match (self, end_stream) {
            (StreamState::Idle, false) | (StreamState::Open, false) => Ok(StreamState::Open),
            (StreamState::Idle, true) | (StreamState::Open, true) => {
                Ok(StreamState::HalfClosedLocal)
            }
            (StreamState::HalfClosedRemote, false) => Ok(StreamState::HalfClosedRemote),
            (StreamState::HalfClosedRemote, true) => Ok(StreamState::Closed),
            _ => Err(self.invalid("send headers")),
        }
    }

    pub fn send_data(self, end_stream: bool) -> Result<Self, ProtocolError> {
        match (self, end_stream) {
            (StreamState::Open, false) => Ok(StreamState::Open),
            (StreamState::Open, true) => Ok(StreamState::HalfClosedLocal),
            (StreamState::HalfClosedRemote, false) => Ok(StreamState::HalfClosedRemote),
            (StreamState::HalfClosedRemote, true) => Ok(StreamState::Closed),
            _ => Err(self.invalid("send data")),
        }
    }

    pub fn recv_headers(self, end_stream: bool) -> Result<Self, ProtocolError> {
        match (self, end_stream) {
            (StreamState::Idle, false) | (StreamState::Open, false) => Ok(StreamState::Open),
            (StreamState::Idle, true) | (StreamState::Open, true) => {
                Ok(StreamState::HalfClosedRemote)
            }
            (StreamState::ReservedRemote, false) | (StreamState::HalfClosedLocal, false) => {
                Ok(StreamState::HalfClosedLocal)
            }
            (StreamState::ReservedRemote, true) | (StreamState::HalfClosedLocal, true) => {
                Ok(StreamState::Closed)
            }
            _ => Err(self.invalid("receive headers")),
        }
    }

    pub fn recv_data(self, end_stream: bool) -> Result<Self, ProtocolError> {
        match (self, end_stream) {
            (StreamState::Open, false) => Ok(StreamState::Open),
            (StreamState::Open, true) => Ok(StreamState::HalfClosedRemote),
            (StreamState::HalfClosedLocal, false) => Ok(StreamState::HalfClosedLocal),
            (StreamState::HalfClosedLocal, true) => Ok(StreamState::Closed),
            _ => Err(self.invalid("receive data")),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }

    /// No more frames will be sent from this side.
    pub fn is_send_closed(&self) -> bool {
        matches!(
            self,
            StreamState::HalfClosedLocal | StreamState::Closed | StreamState::ReservedRemote
        )
    }

    /// The peer has finished sending.
    pub fn is_recv_closed(&self) -> bool {
        matches!(self, StreamState::HalfClosedRemote | StreamState::Closed)
    }

    /// Counts against MAX_CONCURRENT_STREAMS.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }

    fn invalid(self, operation: &'static str) -> ProtocolError {
        ProtocolError::H2StreamError(H2StreamErrorKind::InvalidState {
            state: self,
            operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_body_half_closes_locally() {
        let state = StreamState::Idle.send_headers(true).unwrap();
        assert_eq!(state, StreamState::HalfClosedLocal);
        let state = state.recv_headers(false).unwrap();
        assert_eq!(state, StreamState::HalfClosedLocal);
        assert_eq!(state.recv_data(true).unwrap(), StreamState::Closed);
    }

    #[test]
    fn request_with_body_stays_open_until_end_stream() {
        let state = StreamState::Idle.send_headers(false).unwrap();
        assert_eq!(state, StreamState::Open);
        let state = state.recv_headers(true).unwrap();
        assert_eq!(state, StreamState::HalfClosedRemote);
        let state = state.send_data(false).unwrap();
        assert_eq!(state, StreamState::HalfClosedRemote);
        assert_eq!(state.send_data(true).unwrap(), StreamState::Closed);
    }

    #[test]
    fn data_after_local_end_stream_is_invalid() {
        let state = StreamState::Idle.send_headers(true).unwrap();
        let err = state.send_data(false).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::H2StreamError(H2StreamErrorKind::InvalidState {
                state: StreamState::HalfClosedLocal,
                ..
            })
        ));
    }

    #[test]
    fn pushed_stream_receives_only() {
        let state = StreamState::ReservedRemote;
        assert!(state.send_data(false).is_err());
        let state = state.recv_headers(false).unwrap();
        assert_eq!(state, StreamState::HalfClosedLocal);
        assert_eq!(state.recv_data(true).unwrap(), StreamState::Closed);
    }

    #[test]
    fn nothing_moves_a_closed_stream() {
        let state = StreamState::Closed;
        assert!(state.send_headers(false).is_err());
        assert!(state.send_data(true).is_err());
        assert!(state.recv_headers(true).is_err());
        assert!(state.recv_data(false).is_err());
    }
}
