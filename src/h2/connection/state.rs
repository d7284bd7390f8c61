use crate::h2::consts::{DEFAULT_INITIAL_WINDOW_SIZE, MAX_STREAM_ID};
use crate::h2::flow::{RecvWindow, SendWindow};
use crate::h2::framing::GoAway;
use crate::h2::settings::Settings;
use crate::h2::stream::StreamShared;
use crate::types::{H2ConnectionErrorKind, ProtocolError};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Everything the reader task and the callers share about one connection.
/// Lock order: this state first, then any stream's inner state.
pub(crate) struct ConnectionState {
    pub(crate) streams: HashMap<u32, Arc<StreamShared>>,
    pub(crate) next_stream_id: u32,
    pub(crate) last_promised_id: u32,
    pub(crate) send_window: SendWindow,
    pub(crate) recv_window: RecvWindow,
    pub(crate) local: Settings,
    /// Until the peer acknowledges `local`, it may still send against the
    /// protocol defaults.
    pub(crate) local_acked: bool,
    pub(crate) peer: Settings,
    pub(crate) goaway: Option<GoAway>,
    pub(crate) shutdown: bool,
    pub(crate) failure: Option<ProtocolError>,
    pub(crate) pings: Vec<PendingPing>,
    pub(crate) ping_counter: u64,
}

pub(crate) struct PendingPing {
    pub(crate) payload: [u8; 8],
    pub(crate) sent_at: Instant,
    pub(crate) reply: Option<oneshot::Sender<Duration>>,
}

impl PendingPing {
    pub(crate) fn is_keepalive(&self) -> bool {
        self.reply.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    Headers { end_stream: bool },
    PushPromise { promised_id: u32 },
}

/// Header block being reassembled from HEADERS/PUSH_PROMISE + CONTINUATION.
#[derive(Debug)]
pub(crate) struct PendingHeaderBlock {
    pub(crate) stream_id: u32,
    pub(crate) kind: BlockKind,
    pub(crate) block: BytesMut,
}

impl PendingHeaderBlock {
    pub(crate) fn new(stream_id: u32, kind: BlockKind, fragment: &[u8]) -> Self {
        Self {
            stream_id,
            kind,
            block: BytesMut::from(fragment),
        }
    }

    pub(crate) fn append(&mut self, fragment: &[u8]) {
        self.block.extend_from_slice(fragment);
    }
}

impl ConnectionState {
    pub(crate) fn new(local: Settings) -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: 1,
            last_promised_id: 0,
            send_window: SendWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: RecvWindow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            local,
            local_acked: false,
            peer: Settings::default(),
            goaway: None,
            shutdown: false,
            failure: None,
            pings: Vec::new(),
            ping_counter: 0,
        }
    }

    /// Fails unless new streams may still be opened.
    pub(crate) fn check_open(&self) -> Result<(), ProtocolError> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if let Some(err) = self.goaway_error() {
            return Err(err);
        }
        if self.shutdown {
            return Err(ProtocolError::H2ConnectionError(H2ConnectionErrorKind::Closed));
        }
        Ok(())
    }

    pub(crate) fn goaway_error(&self) -> Option<ProtocolError> {
        self.goaway.as_ref().map(|goaway| {
            ProtocolError::H2ConnectionError(H2ConnectionErrorKind::GoAway(
                goaway.error_code,
                String::from_utf8_lossy(&goaway.debug_data).into_owned(),
            ))
        })
    }

    pub(crate) fn is_usable(&self) -> bool {
        self.failure.is_none()
            && self.goaway.is_none()
            && !self.shutdown
            && self.next_stream_id <= MAX_STREAM_ID
    }

    pub(crate) fn active_local_streams(&self) -> usize {
        self.streams.keys().filter(|id| *id % 2 == 1).count()
    }

    pub(crate) fn max_concurrent_streams(&self) -> usize {
        self.peer
            .max_concurrent_streams
            .map(|max| max as usize)
            .unwrap_or(usize::MAX)
    }

    /// Receive window for a new stream: ours once acknowledged, the
    /// protocol default before that.
    pub(crate) fn recv_initial_window(&self) -> u32 {
        if self.local_acked {
            self.local.initial_window_size
        } else {
            DEFAULT_INITIAL_WINDOW_SIZE
        }
    }

    /// Marks our SETTINGS acknowledged. Returns the change to apply to the
    /// receive window of every stream opened before, or `None` when the
    /// acknowledgement is a repeat.
    pub(crate) fn ack_local_settings(&mut self) -> Option<i64> {
        if self.local_acked {
            return None;
        }
        self.local_acked = true;
        Some(self.local.initial_window_size as i64 - DEFAULT_INITIAL_WINDOW_SIZE as i64)
    }

    /// An id neither side has opened yet. Frames other than the opening
    /// HEADERS or PUSH_PROMISE on such an id are a protocol error.
    pub(crate) fn is_idle_id(&self, stream_id: u32) -> bool {
        if stream_id % 2 == 1 {
            stream_id >= self.next_stream_id
        } else {
            stream_id > self.last_promised_id
        }
    }

    /// Highest stream id initiated by the peer, reported in our GOAWAY.
    pub(crate) fn last_peer_stream_id(&self) -> u32 {
        self.last_promised_id
    }

    pub(crate) fn next_ping_payload(&mut self) -> [u8; 8] {
        self.ping_counter += 1;
        self.ping_counter.to_be_bytes()
    }

    /// Resolves the ping matching an ACK payload, if it was ours.
    pub(crate) fn ack_ping(&mut self, payload: [u8; 8]) -> Option<PendingPing> {
        let index = self.pings.iter().position(|p| p.payload == payload)?;
        Some(self.pings.swap_remove(index))
    }
}
