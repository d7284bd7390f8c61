pub mod state;

pub use state::StreamState;

use crate::h2::connection::Inner;
use crate::h2::flow::{RecvWindow, SendWindow};
use crate::types::{status_code, H2ErrorCode, Header, ProtocolError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Registry entry for one stream, shared by the reader task and every
/// [`Stream`] handle.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    inner: Mutex<StreamInner>,
    /// Woken on every state change: inbound frames, window credit, resets.
    pub(crate) notify: Notify,
    /// Live [`Stream`] handles. Pushed streams never have any.
    handles: AtomicUsize,
}

pub(crate) struct StreamInner {
    pub(crate) state: StreamState,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,
    pub(crate) header_blocks: VecDeque<Vec<Header>>,
    pub(crate) final_headers_received: bool,
    pub(crate) final_headers_delivered: bool,
    pub(crate) data: VecDeque<Bytes>,
    pub(crate) trailers: Option<Vec<Header>>,
    pub(crate) end_stream_received: bool,
    pub(crate) error: Option<ProtocolError>,
    pub(crate) pushed: bool,
}

impl StreamShared {
    pub(crate) fn new(id: u32, state: StreamState, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner {
                state,
                send_window: SendWindow::new(send_window),
                recv_window: RecvWindow::new(recv_window),
                header_blocks: VecDeque::new(),
                final_headers_received: false,
                final_headers_delivered: false,
                data: VecDeque::new(),
                trailers: None,
                end_stream_received: false,
                error: None,
                pushed: state == StreamState::ReservedRemote,
            }),
            notify: Notify::new(),
            handles: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamInner {
    /// Whether unread DATA is still charged to the connection window.
    pub(crate) fn has_buffered_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Closes the stream with `err` and drops everything buffered. Returns the
    /// number of DATA bytes discarded, which the caller hands back to the
    /// connection receive window.
    pub(crate) fn fail(&mut self, err: ProtocolError) -> usize {
        self.state = StreamState::Closed;
        if self.error.is_none() {
            self.error = Some(err);
        }
        let discarded = self.data.iter().map(Bytes::len).sum();
        self.data.clear();
        self.header_blocks.clear();
        self.trailers = None;
        discarded
    }

    /// Queues an inbound header block. The first block with a final status
    /// is the response head; any later block is the trailer section.
    pub(crate) fn push_header_block(&mut self, headers: Vec<Header>, end_stream: bool) -> bool {
        if !self.final_headers_received {
            if !is_informational(&headers) {
                self.final_headers_received = true;
            }
            self.header_blocks.push_back(headers);
        } else {
            if !end_stream {
                return false;
            }
            self.trailers = Some(headers);
        }
        if end_stream {
            self.end_stream_received = true;
        }
        true
    }
}

fn is_informational(headers: &[Header]) -> bool {
    matches!(status_code(headers), Some(code) if code < 200)
}

/// Handle to one client-initiated stream.
///
/// Reads and writes may run from different tasks. Clones share the stream;
/// dropping the last one cancels it with `CANCEL` if it is still open and
/// hands any unread response data back to the connection window.
pub struct Stream {
    shared: Arc<StreamShared>,
    conn: Arc<Inner>,
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Self::new(self.shared.clone(), self.conn.clone())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.conn.cancel_stream(&self.shared, H2ErrorCode::Cancel);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, conn: Arc<Inner>) -> Self {
        shared.handles.fetch_add(1, Ordering::Relaxed);
        Self { shared, conn }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.lock().state
    }

    /// Sends `data` as one or more DATA frames, waiting for window credit as
    /// needed. `end_stream` marks the last frame.
    pub async fn write_data(&self, data: Bytes, end_stream: bool) -> Result<(), ProtocolError> {
        self.conn.send_data(&self.shared, data, end_stream).await
    }

    /// Sends a trailing header block, which always ends the stream.
    pub async fn write_trailers(&self, trailers: Vec<Header>) -> Result<(), ProtocolError> {
        self.conn.send_trailers(&self.shared, trailers).await
    }

    /// Next response header block. Informational (1xx) blocks come first;
    /// `None` once the final block has been handed out.
    pub async fn read_headers(&self) -> Result<Option<Vec<Header>>, ProtocolError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.lock();
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                if let Some(block) = inner.header_blocks.pop_front() {
                    if !is_informational(&block) {
                        inner.final_headers_delivered = true;
                    }
                    return Ok(Some(block));
                }
                if inner.final_headers_delivered || inner.end_stream_received {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    /// Next chunk of the response body, in arrival order. `None` after the
    /// peer's END_STREAM once every chunk has been read.
    pub async fn read_data(&self) -> Result<Option<Bytes>, ProtocolError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = {
                let mut state = self.conn.lock_state();
                let mut inner = self.shared.lock();
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                match inner.data.pop_front() {
                    Some(chunk) => {
                        let stream_increment = if inner.state.is_recv_closed() {
                            None
                        } else {
                            inner.recv_window.release(chunk.len())
                        };
                        let connection_increment = state.recv_window.release(chunk.len());
                        Some((chunk, stream_increment, connection_increment))
                    }
                    None if inner.end_stream_received => return Ok(None),
                    None => None,
                }
            };

            match taken {
                Some((chunk, stream_increment, connection_increment)) => {
                    // A failed write already failed the connection; the chunk is still valid.
                    let _ = self
                        .conn
                        .send_window_updates(self.shared.id, stream_increment, connection_increment)
                        .await;
                    return Ok(Some(chunk));
                }
                None => notified.await,
            }
        }
    }

    /// Waits for the end of the response and returns its trailers, if any.
    pub async fn read_trailers(&self) -> Result<Option<Vec<Header>>, ProtocolError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.shared.lock();
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                if inner.end_stream_received {
                    return Ok(inner.trailers.take());
                }
            }

            notified.await;
        }
    }

    /// Resets the stream with `code`. Pending and future reads and writes
    /// fail; buffered response data is discarded. A stream that is already
    /// closed gets no RST_STREAM, but unread data is still discarded.
    pub fn cancel(&self, code: H2ErrorCode) {
        self.conn.cancel_stream(&self.shared, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::H2StreamErrorKind;

    fn shared() -> StreamShared {
        StreamShared::new(1, StreamState::Open, 65_535, 65_535)
    }

    #[test]
    fn fail_reports_discarded_bytes_once() {
        let shared = shared();
        let mut inner = shared.lock();
        inner.data.push_back(Bytes::from_static(b"hello"));
        inner.data.push_back(Bytes::from_static(b"!"));

        let discarded = inner.fail(H2StreamErrorKind::RemoteReset(H2ErrorCode::Cancel).into());
        assert_eq!(discarded, 6);
        assert_eq!(inner.state, StreamState::Closed);
        assert!(inner.data.is_empty());

        let discarded = inner.fail(ProtocolError::protocol("later"));
        assert_eq!(discarded, 0);
        assert_eq!(
            inner.error.as_ref().map(ProtocolError::error_code),
            Some(H2ErrorCode::Cancel)
        );
    }

    #[test]
    fn informational_blocks_precede_the_final_one() {
        let shared = shared();
        let mut inner = shared.lock();
        assert!(inner.push_header_block(vec![Header::new(":status", "103")], false));
        assert!(!inner.final_headers_received);
        assert!(inner.push_header_block(vec![Header::new(":status", "200")], false));
        assert!(inner.final_headers_received);
        assert_eq!(inner.header_blocks.len(), 2);
    }

    #[test]
    fn trailers_must_end_the_stream() {
        let shared = shared();
        let mut inner = shared.lock();
        inner.push_header_block(vec![Header::new(":status", "200")], false);
        assert!(!inner.push_header_block(vec![Header::new("grpc-status", "0")], false));
        assert!(inner.push_header_block(vec![Header::new("grpc-status", "0")], true));
        assert!(inner.end_stream_received);
        assert_eq!(inner.trailers.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn reserved_streams_are_marked_pushed() {
        let shared = StreamShared::new(2, StreamState::ReservedRemote, 65_535, 65_535);
        assert!(shared.lock().pushed);
    }
}
