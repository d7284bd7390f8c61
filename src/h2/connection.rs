//! One multiplexed HTTP/2 client connection.
//!
//! A spawned reader task owns the read half of the transport and is the only
//! place inbound frames are handled. Outbound frames from any task go through
//! a single [`FrameWriter`] behind an async mutex, so a header block split over
//! HEADERS and CONTINUATION frames always leaves in one piece and HPACK
//! encoding order matches wire order.

mod reader;
pub(crate) mod state;
mod writer;

use crate::h2::consts::{DEFAULT_HEADER_TABLE_SIZE, MAX_STREAM_ID, MAX_WINDOW_SIZE};
use crate::h2::flow;
use crate::h2::hpack::{HeaderCodec, HpackCodec};
use crate::h2::push::{CancelAll, PushObserver};
use crate::h2::settings::Settings;
use crate::h2::stream::{Stream, StreamShared, StreamState};
use crate::types::{
    validate_header_block, ConnectionConfig, Frame, FrameSink, H2ConnectionErrorKind,
    H2ErrorCode, H2StreamErrorKind, Header, ProtocolError,
};
use crate::utils::timeout_result;
use bytes::Bytes;
use reader::Reader;
use state::{ConnectionState, PendingPing};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};
use writer::FrameWriter;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an HTTP/2 connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    id: u64,
    state: Mutex<ConnectionState>,
    writer: AsyncMutex<FrameWriter>,
    codec: Mutex<Box<dyn HeaderCodec>>,
    observer: Arc<dyn PushObserver>,
    config: ConnectionConfig,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("streams", &state.streams.len())
            .field("usable", &state.is_usable())
            .finish()
    }
}

impl Connection {
    /// Runs the client side of the HTTP/2 handshake over an established
    /// transport. Pushed streams are refused.
    pub async fn handshake<T>(io: T, config: ConnectionConfig) -> Result<Self, ProtocolError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::handshake_with_observer(io, config, Arc::new(CancelAll)).await
    }

    /// Sends the connection preface and our SETTINGS, starts the reader task
    /// and waits until the peer's first SETTINGS frame has been applied and
    /// acknowledged.
    pub async fn handshake_with_observer<T>(
        io: T,
        config: ConnectionConfig,
        observer: Arc<dyn PushObserver>,
    ) -> Result<Self, ProtocolError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let local = Settings::local(&config);
        let mut state = ConnectionState::new(local);

        let mut preface = vec![Frame::settings(&local.entries())];
        let connection_window = config.connection_window_size.min(MAX_WINDOW_SIZE);
        if let Some(increment) = state.recv_window.grow_to(connection_window) {
            preface.push(Frame::window_update(0, increment));
        }

        let (read_half, write_half) = tokio::io::split(io);
        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(state),
            writer: AsyncMutex::new(FrameWriter::new(
                Box::new(write_half),
                config.timeouts.write,
            )),
            // The peer may index up to the default table size until it has
            // seen our SETTINGS.
            codec: Mutex::new(Box::new(HpackCodec::new(
                local.header_table_size.max(DEFAULT_HEADER_TABLE_SIZE) as usize,
            ))),
            observer,
            config,
            tasks: Mutex::new(Vec::new()),
        });

        debug!(connection = inner.id, "Sending HTTP/2 connection preface");
        inner.writer.lock().await.write_preface(&preface).await?;

        let (settings_tx, settings_rx) = oneshot::channel();
        let reader = tokio::spawn(Reader::new(read_half, inner.clone(), settings_tx).run());
        inner.track(reader.abort_handle());

        let settings = timeout_result(inner.config.timeouts.settings, async {
            settings_rx
                .await
                .unwrap_or_else(|_| Err(H2ConnectionErrorKind::Closed.into()))
        })
        .await;

        if let Err(err) = settings {
            let err = match err {
                ProtocolError::Timeout => H2ConnectionErrorKind::SettingsTimeout.into(),
                other => other,
            };
            inner.fail(err.clone());
            return Err(err);
        }

        if let Some(interval) = inner.config.ping_interval {
            let keepalive = tokio::spawn(keepalive(inner.clone(), interval));
            inner.track(keepalive.abort_handle());
        }

        debug!(connection = inner.id, "HTTP/2 connection established");
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether new streams may be opened: no failure, no GOAWAY, no local
    /// shutdown and stream ids left.
    pub fn is_usable(&self) -> bool {
        self.inner.lock_state().is_usable()
    }

    /// Client-initiated streams currently in the registry.
    pub fn active_streams(&self) -> usize {
        self.inner.lock_state().active_local_streams()
    }

    /// The peer's SETTINGS_MAX_CONCURRENT_STREAMS, unbounded until it says otherwise.
    pub fn max_concurrent_streams(&self) -> usize {
        self.inner.lock_state().max_concurrent_streams()
    }

    pub fn has_capacity(&self) -> bool {
        let state = self.inner.lock_state();
        state.is_usable() && state.active_local_streams() < state.max_concurrent_streams()
    }

    pub fn peer_settings(&self) -> Settings {
        self.inner.lock_state().peer
    }

    /// The error that terminated the connection, if any.
    pub fn failure(&self) -> Option<ProtocolError> {
        self.inner.lock_state().failure.clone()
    }

    /// Opens a client stream by sending `headers`. With `end_stream` the
    /// request has no body and the stream is half-closed (local) right away.
    pub async fn open_stream(
        &self,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<Stream, ProtocolError> {
        self.inner.open_stream(headers, end_stream).await
    }

    /// Opens a stream and, when given, sends `body` as the whole request body.
    pub async fn open_stream_with_body(
        &self,
        headers: Vec<Header>,
        body: Option<Bytes>,
    ) -> Result<Stream, ProtocolError> {
        match body {
            None => self.open_stream(headers, true).await,
            Some(body) => {
                let stream = self.open_stream(headers, false).await?;
                stream.write_data(body, true).await?;
                Ok(stream)
            }
        }
    }

    /// Sends a PING and waits for its acknowledgement. Returns the round trip time.
    pub async fn ping(&self) -> Result<Duration, ProtocolError> {
        let (tx, rx) = oneshot::channel();
        let payload = {
            let mut state = self.inner.lock_state();
            if let Some(err) = &state.failure {
                return Err(err.clone());
            }
            let payload = state.next_ping_payload();
            state.pings.push(PendingPing {
                payload,
                sent_at: Instant::now(),
                reply: Some(tx),
            });
            payload
        };

        self.inner.write_frames(&[Frame::ping(payload)]).await?;
        rx.await.map_err(|_| self.inner.failure_or_closed())
    }

    /// Sends GOAWAY with `code` and closes the transport. Every stream still
    /// open fails with a connection error.
    pub async fn close(&self, code: H2ErrorCode) {
        if let Some(last_stream_id) = self.inner.terminate(&H2ConnectionErrorKind::Closed.into()) {
            debug!(connection = self.inner.id, error_code = %code, "Closing connection");
            self.inner
                .close_transport(Some(Frame::goaway(last_stream_id, code, None)))
                .await;
        }
    }
}

impl Inner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_codec(&self) -> MutexGuard<'_, Box<dyn HeaderCodec>> {
        self.codec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, task: AbortHandle) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    fn failure_or_closed(&self) -> ProtocolError {
        self.lock_state()
            .failure
            .clone()
            .unwrap_or_else(|| H2ConnectionErrorKind::Closed.into())
    }

    fn is_terminated(&self) -> bool {
        self.lock_state().failure.is_some()
    }

    fn decode_block(&self, block: &[u8]) -> Result<Vec<Header>, ProtocolError> {
        self.lock_codec()
            .decode(block)
            .map_err(|err| ProtocolError::connection(H2ErrorCode::CompressionError, err.to_string()))
    }

    async fn open_stream(
        self: &Arc<Self>,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<Stream, ProtocolError> {
        validate_header_block(&headers)?;

        let mut writer = self.writer.lock().await;
        let (shared, frames) = {
            let mut state = self.lock_state();
            state.check_open()?;

            let limit = state.max_concurrent_streams();
            if state.active_local_streams() >= limit {
                return Err(ProtocolError::refused(format!(
                    "peer allows at most {} concurrent streams",
                    limit
                )));
            }
            if state.next_stream_id > MAX_STREAM_ID {
                state.shutdown = true;
                return Err(ProtocolError::refused("stream ids exhausted"));
            }

            let stream_state = StreamState::Idle.send_headers(end_stream)?;
            let block = self.lock_codec().encode(&headers)?;

            let id = state.next_stream_id;
            state.next_stream_id += 2;
            let shared = Arc::new(StreamShared::new(
                id,
                stream_state,
                state.peer.initial_window_size,
                state.recv_initial_window(),
            ));
            state.streams.insert(id, shared.clone());

            let frames = Frame::header_block(id, block, end_stream, state.peer.max_frame_size as usize);
            (shared, frames)
        };

        debug!(
            connection = self.id,
            stream_id = shared.id,
            end_stream,
            "Opening stream"
        );
        self.write_locked(&mut writer, &frames).await?;

        Ok(Stream::new(shared, self.clone()))
    }

    pub(crate) async fn send_data(
        self: &Arc<Self>,
        shared: &Arc<StreamShared>,
        mut data: Bytes,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        if data.is_empty() && !end_stream {
            return Ok(());
        }

        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut writer = self.writer.lock().await;
            let frame = {
                let mut state = self.lock_state();
                let mut inner = shared.lock();
                if let Some(err) = &inner.error {
                    return Err(err.clone());
                }
                if let Some(err) = &state.failure {
                    return Err(err.clone());
                }
                inner.state.send_data(end_stream)?;

                let max_frame_size = state.peer.max_frame_size as usize;
                let len = flow::reserve(
                    &mut inner.send_window,
                    &mut state.send_window,
                    data.len(),
                    max_frame_size,
                );

                if len == 0 && !data.is_empty() {
                    None
                } else {
                    let chunk = data.split_to(len);
                    let last = end_stream && data.is_empty();
                    inner.state = inner.state.send_data(last)?;
                    if inner.state.is_closed() {
                        state.streams.remove(&shared.id);
                    }
                    Some(Frame::data(shared.id, chunk, last))
                }
            };

            match frame {
                Some(frame) => {
                    self.write_locked(&mut writer, std::slice::from_ref(&frame))
                        .await?;
                    drop(writer);
                    if data.is_empty() {
                        self.maybe_finish();
                        return Ok(());
                    }
                }
                None => {
                    drop(writer);
                    trace!(
                        connection = self.id,
                        stream_id = shared.id,
                        pending = data.len(),
                        "Waiting for flow-control credit"
                    );
                    notified.await;
                }
            }
        }
    }

    pub(crate) async fn send_trailers(
        self: &Arc<Self>,
        shared: &Arc<StreamShared>,
        trailers: Vec<Header>,
    ) -> Result<(), ProtocolError> {
        validate_header_block(&trailers)?;
        if let Some(header) = trailers.iter().find(|h| h.is_pseudo()) {
            return Err(ProtocolError::MalformedHeaders(format!(
                "Pseudo-header {} in trailers",
                header.name
            )));
        }

        let mut writer = self.writer.lock().await;
        let frames = {
            let mut state = self.lock_state();
            let mut inner = shared.lock();
            if let Some(err) = &inner.error {
                return Err(err.clone());
            }
            if let Some(err) = &state.failure {
                return Err(err.clone());
            }
            let next = inner.state.send_headers(true)?;
            let block = self.lock_codec().encode(&trailers)?;
            inner.state = next;
            if next.is_closed() {
                state.streams.remove(&shared.id);
            }
            Frame::header_block(shared.id, block, true, state.peer.max_frame_size as usize)
        };

        self.write_locked(&mut writer, &frames).await?;
        drop(writer);
        self.maybe_finish();
        Ok(())
    }

    pub(crate) async fn send_window_updates(
        self: &Arc<Self>,
        stream_id: u32,
        stream_increment: Option<u32>,
        connection_increment: Option<u32>,
    ) -> Result<(), ProtocolError> {
        let mut frames = Vec::with_capacity(2);
        if let Some(increment) = connection_increment {
            frames.push(Frame::window_update(0, increment));
        }
        if let Some(increment) = stream_increment {
            frames.push(Frame::window_update(stream_id, increment));
        }
        if frames.is_empty() {
            return Ok(());
        }
        self.write_frames(&frames).await
    }

    pub(crate) async fn write_frames(self: &Arc<Self>, frames: &[Frame]) -> Result<(), ProtocolError> {
        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, frames).await
    }

    async fn write_locked(
        self: &Arc<Self>,
        writer: &mut FrameWriter,
        frames: &[Frame],
    ) -> Result<(), ProtocolError> {
        if let Err(err) = writer.write_frames(frames).await {
            self.fail(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Closes `shared` locally with `code` and discards its unread data.
    /// Returns the frames to send: RST_STREAM unless the stream had already
    /// closed, and a connection WINDOW_UPDATE once the discarded bytes are
    /// due. `None` when there is nothing to do.
    fn reset_locked(&self, shared: &StreamShared, code: H2ErrorCode) -> Option<Vec<Frame>> {
        let mut state = self.lock_state();
        let (discarded, was_closed) = {
            let mut inner = shared.lock();
            let was_closed = inner.state.is_closed();
            if was_closed && !inner.has_buffered_data() {
                return None;
            }
            (inner.fail(H2StreamErrorKind::LocalReset(code).into()), was_closed)
        };

        let mut frames = Vec::with_capacity(2);
        if !was_closed {
            state.streams.remove(&shared.id);
            frames.push(Frame::rst(shared.id, code));
        }
        if discarded > 0 {
            if let Some(increment) = state.recv_window.release(discarded) {
                frames.push(Frame::window_update(0, increment));
            }
        }
        Some(frames)
    }

    pub(crate) async fn reset_stream(
        self: &Arc<Self>,
        shared: &Arc<StreamShared>,
        code: H2ErrorCode,
    ) -> Result<(), ProtocolError> {
        let Some(frames) = self.reset_locked(shared, code) else {
            return Ok(());
        };
        debug!(connection = self.id, stream_id = shared.id, error_code = %code, "Resetting stream");
        shared.notify.notify_waiters();
        if !frames.is_empty() {
            self.write_frames(&frames).await?;
        }
        self.maybe_finish();
        Ok(())
    }

    /// Synchronous reset used by [`Stream::cancel`] and by dropping the last
    /// handle; the frames are written from a spawned task.
    pub(crate) fn cancel_stream(self: &Arc<Self>, shared: &Arc<StreamShared>, code: H2ErrorCode) {
        let Some(frames) = self.reset_locked(shared, code) else {
            return;
        };
        debug!(connection = self.id, stream_id = shared.id, error_code = %code, "Cancelling stream");
        shared.notify.notify_waiters();
        if frames.is_empty() {
            return;
        }

        let inner = self.clone();
        spawn_detached(async move {
            if inner.write_frames(&frames).await.is_ok() {
                inner.maybe_finish();
            }
        });
    }

    /// Records the first fatal error and fails every registered stream with
    /// it. Returns the last peer-initiated stream id for our GOAWAY, or `None`
    /// when the connection had already terminated.
    fn terminate(&self, err: &ProtocolError) -> Option<u32> {
        let (streams, last_stream_id) = {
            let mut state = self.lock_state();
            if state.failure.is_some() {
                return None;
            }
            state.failure = Some(err.clone());
            state.shutdown = true;
            state.pings.clear();
            let streams: Vec<_> = state.streams.drain().map(|(_, shared)| shared).collect();
            (streams, state.last_peer_stream_id())
        };

        for shared in streams {
            let pushed = {
                let mut inner = shared.lock();
                inner.fail(err.clone());
                inner.pushed
            };
            shared.notify.notify_waiters();
            if pushed {
                self.observer.on_reset(shared.id, err.error_code());
            }
        }

        Some(last_stream_id)
    }

    /// Terminates the connection with `err`. Unless the transport itself is
    /// gone or the peer already sent GOAWAY, a GOAWAY carrying the error code
    /// is written before the transport is shut down.
    pub(crate) fn fail(self: &Arc<Self>, err: ProtocolError) {
        let Some(last_stream_id) = self.terminate(&err) else {
            return;
        };

        let goaway = match &err {
            ProtocolError::H2ConnectionError(
                H2ConnectionErrorKind::Io(_) | H2ConnectionErrorKind::GoAway(..),
            ) => {
                debug!(connection = self.id, error = %err, "Connection terminated");
                None
            }
            _ => {
                warn!(connection = self.id, error = %err, "Connection failed, sending GOAWAY");
                let debug_data = err.to_string();
                Some(Frame::goaway(
                    last_stream_id,
                    err.error_code(),
                    Some(debug_data.as_bytes()),
                ))
            }
        };

        let inner = self.clone();
        spawn_detached(async move { inner.close_transport(goaway).await });
    }

    /// After a peer GOAWAY, closes the connection once the last stream is done.
    pub(crate) fn maybe_finish(self: &Arc<Self>) {
        let err = {
            let state = self.lock_state();
            if state.failure.is_some() || !state.streams.is_empty() {
                return;
            }
            match state.goaway_error() {
                Some(err) => err,
                None => return,
            }
        };
        debug!(connection = self.id, "All streams finished after GOAWAY");
        self.fail(err);
    }

    async fn close_transport(&self, goaway: Option<Frame>) {
        {
            let mut writer = self.writer.lock().await;
            if let Some(frame) = goaway {
                if let Err(err) = writer.write_frame(&frame).await {
                    debug!(connection = self.id, error = %err, "Failed to send GOAWAY");
                }
            }
            let _ = writer.shutdown().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    }
}

/// Sends a PING every `interval`. A ping still unanswered when the next one
/// is due fails the connection.
async fn keepalive(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let payload = {
            let mut state = inner.lock_state();
            if state.failure.is_some() {
                return;
            }
            if state.pings.iter().any(PendingPing::is_keepalive) {
                None
            } else {
                let payload = state.next_ping_payload();
                state.pings.push(PendingPing {
                    payload,
                    sent_at: Instant::now(),
                    reply: None,
                });
                Some(payload)
            }
        };

        match payload {
            Some(payload) => {
                trace!(connection = inner.id, "Sending keep-alive PING");
                if inner.write_frames(&[Frame::ping(payload)]).await.is_err() {
                    return;
                }
            }
            None => {
                inner.fail(ProtocolError::protocol("ping timeout"));
                return;
            }
        }
    }
}
