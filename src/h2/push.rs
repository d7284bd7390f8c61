use crate::types::{H2ErrorCode, Header};
use bytes::Bytes;

/// Returned from [`PushObserver`] callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
    Continue,
    /// Asks the connection to reset the pushed stream with CANCEL. Frames the
    /// server already sent may still be in flight and are dropped on arrival.
    Cancel,
}

/// Receives server-initiated streams.
///
/// Callbacks for one stream id arrive in order on the connection's reader
/// task: `on_request` once, then `on_headers` unless the push was cancelled,
/// then `on_data` once per DATA frame in wire order. `on_reset` may arrive at
/// any point and ends the sequence for that id. Implementations must not
/// block; the reader task stalls for every stream until they return.
pub trait PushObserver: Send + Sync {
    /// `stream_id` is the even, server-initiated id. `request_headers` carry at
    /// least `:method`, `:scheme`, `:authority` and `:path`.
    fn on_request(&self, stream_id: u32, request_headers: &[Header]) -> PushAction;

    /// Response headers of the pushed request. `last` means no DATA follows.
    fn on_headers(&self, stream_id: u32, response_headers: &[Header], last: bool) -> PushAction;

    /// One DATA frame's payload. Ownership of the bytes passes to the
    /// observer; dropping them is how a chunk is skipped.
    fn on_data(&self, stream_id: u32, data: Bytes, last: bool) -> PushAction;

    fn on_reset(&self, stream_id: u32, error_code: H2ErrorCode);
}

/// Refuses every push.
#[derive(Debug, Clone, Copy, Default)]
pub struct CancelAll;

impl PushObserver for CancelAll {
    fn on_request(&self, _stream_id: u32, _request_headers: &[Header]) -> PushAction {
        PushAction::Cancel
    }

    fn on_headers(&self, _stream_id: u32, _response_headers: &[Header], _last: bool) -> PushAction {
        PushAction::Cancel
    }

    fn on_data(&self, _stream_id: u32, _data: Bytes, _last: bool) -> PushAction {
        PushAction::Cancel
    }

    fn on_reset(&self, _stream_id: u32, _error_code: H2ErrorCode) {}
}
