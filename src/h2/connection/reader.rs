use super::state::{BlockKind, PendingHeaderBlock};
use super::Inner;
use crate::h2::push::PushAction;
use crate::h2::stream::{StreamShared, StreamState};
use crate::types::{
    validate_header_block, Frame, FrameType, H2ErrorCode, H2StreamErrorKind, Header,
    ProtocolError,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type SettingsSignal = oneshot::Sender<Result<(), ProtocolError>>;

/// Owns the read half of the transport and applies every inbound frame to
/// the shared connection state, in wire order.
pub(super) struct Reader<R> {
    io: R,
    conn: Arc<Inner>,
    pending: Option<PendingHeaderBlock>,
    /// Fired once the peer's first SETTINGS frame has been applied.
    settings_tx: Option<SettingsSignal>,
}

enum HeadersOutcome {
    Delivered,
    Push { headers: Vec<Header>, last: bool },
    Reset(H2ErrorCode),
}

enum DataOutcome {
    Discarded {
        increment: Option<u32>,
    },
    Reset {
        shared: Arc<StreamShared>,
        code: H2ErrorCode,
        increment: Option<u32>,
    },
    Accepted {
        shared: Arc<StreamShared>,
        push_payload: Option<Bytes>,
        stream_increment: Option<u32>,
        connection_increment: Option<u32>,
    },
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub(super) fn new(io: R, conn: Arc<Inner>, settings_tx: SettingsSignal) -> Self {
        Self {
            io,
            conn,
            pending: None,
            settings_tx: Some(settings_tx),
        }
    }

    pub(super) async fn run(mut self) {
        let max_frame_size = self.conn.lock_state().local.max_frame_size;

        loop {
            let frame = match Frame::read_from(&mut self.io, max_frame_size).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.conn.fail(
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "peer closed the connection",
                        )
                        .into(),
                    );
                    break;
                }
                Err(err) => {
                    self.conn.fail(err);
                    break;
                }
            };

            if let Err(err) = self.dispatch(frame).await {
                self.conn.fail(err);
                break;
            }
            if self.conn.is_terminated() {
                break;
            }
        }

        if let Some(tx) = self.settings_tx.take() {
            let _ = tx.send(Err(self.conn.failure_or_closed()));
        }
        debug!(connection = self.conn.id, "Reader task finished");
    }

    /// Applies one frame. Any error returned is a connection error.
    async fn dispatch(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        trace!(
            connection = self.conn.id,
            frame_type = ?frame.frame_type,
            stream_id = frame.stream_id,
            flags = frame.flags,
            len = frame.payload.len(),
            "Received frame"
        );

        if let Some(pending) = &self.pending {
            if frame.frame_type != FrameType::Continuation || frame.stream_id != pending.stream_id {
                return Err(ProtocolError::protocol(format!(
                    "Expected CONTINUATION for stream {}, got {:?} on stream {}",
                    pending.stream_id, frame.frame_type, frame.stream_id
                )));
            }
        }

        if self.settings_tx.is_some() && (frame.frame_type != FrameType::Settings || frame.is_ack()) {
            return Err(ProtocolError::protocol(
                "First frame from the server must be SETTINGS",
            ));
        }

        match frame.frame_type {
            FrameType::Data => self.on_data(frame).await,
            FrameType::Headers => self.on_headers(frame).await,
            FrameType::Continuation => self.on_continuation(frame).await,
            FrameType::PushPromise => self.on_push_promise(frame).await,
            FrameType::RstStream => self.on_rst_stream(frame).await,
            FrameType::Settings => self.on_settings(frame).await,
            FrameType::Ping => self.on_ping(frame).await,
            FrameType::GoAway => self.on_goaway(frame),
            FrameType::WindowUpdate => self.on_window_update(frame),
            FrameType::Priority => {
                if frame.stream_id == 0 {
                    return Err(ProtocolError::protocol("PRIORITY frame on stream 0"));
                }
                Ok(())
            }
            FrameType::Unknown(kind) => {
                trace!(connection = self.conn.id, kind, "Ignoring unknown frame type");
                Ok(())
            }
        }
    }

    async fn on_settings(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let entries = frame.settings_entries()?;
        if frame.is_ack() {
            self.on_settings_ack();
            return Ok(());
        }

        let delta = {
            let mut state = self.conn.lock_state();
            let delta = state.peer.apply(&entries)?;
            if delta.window_delta != 0 {
                for shared in state.streams.values() {
                    shared
                        .lock()
                        .send_window
                        .apply_delta(delta.window_delta)
                        .map_err(|err| {
                            ProtocolError::flow_control(format!("stream {}: {}", shared.id, err))
                        })?;
                }
            }
            delta
        };
        debug!(connection = self.conn.id, ?entries, "Applied peer SETTINGS");

        if let Some(size) = delta.header_table_size {
            self.conn.lock_codec().set_encoder_max_table_size(size as usize);
        }

        self.conn.write_frames(&[Frame::settings_ack()]).await?;

        if delta.window_delta > 0 {
            self.notify_all_streams();
        }
        if let Some(tx) = self.settings_tx.take() {
            let _ = tx.send(Ok(()));
        }
        Ok(())
    }

    /// Our SETTINGS take effect for inbound accounting only from here on.
    fn on_settings_ack(&mut self) {
        let table_size = {
            let mut state = self.conn.lock_state();
            let Some(delta) = state.ack_local_settings() else {
                trace!(connection = self.conn.id, "Ignoring repeated SETTINGS ACK");
                return;
            };
            if delta != 0 {
                for shared in state.streams.values() {
                    shared.lock().recv_window.apply_delta(delta);
                }
            }
            state.local.header_table_size
        };
        self.conn
            .lock_codec()
            .set_decoder_max_table_size(table_size as usize);
        debug!(connection = self.conn.id, "Peer acknowledged our SETTINGS");
    }

    async fn on_ping(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let payload = frame.ping_data()?;
        if !frame.is_ack() {
            return self.conn.write_frames(&[Frame::ping_ack(payload)]).await;
        }

        let ping = self.conn.lock_state().ack_ping(payload);
        match ping {
            Some(ping) => {
                let rtt = ping.sent_at.elapsed();
                trace!(connection = self.conn.id, ?rtt, "PING acknowledged");
                if let Some(reply) = ping.reply {
                    let _ = reply.send(rtt);
                }
            }
            None => debug!(connection = self.conn.id, "Ignoring unsolicited PING ACK"),
        }
        Ok(())
    }

    fn on_goaway(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let goaway = frame.goaway_payload()?;
        debug!(
            connection = self.conn.id,
            last_stream_id = goaway.last_stream_id,
            error_code = %goaway.error_code,
            debug_data = %String::from_utf8_lossy(&goaway.debug_data),
            "Received GOAWAY"
        );

        let refused: Vec<Arc<StreamShared>> = {
            let mut state = self.conn.lock_state();
            let ids: Vec<u32> = state
                .streams
                .keys()
                .copied()
                .filter(|id| id % 2 == 1 && *id > goaway.last_stream_id)
                .collect();
            let refused = ids
                .iter()
                .filter_map(|id| state.streams.remove(id))
                .collect();
            state.goaway = Some(goaway);
            state.shutdown = true;
            refused
        };

        for shared in refused {
            shared.lock().fail(ProtocolError::refused(format!(
                "stream {} was not processed before GOAWAY",
                shared.id
            )));
            shared.notify.notify_waiters();
        }

        self.conn.maybe_finish();
        Ok(())
    }

    fn on_window_update(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let increment = frame.window_increment()?;
        if increment == 0 {
            debug!(
                connection = self.conn.id,
                stream_id = frame.stream_id,
                "Ignoring WINDOW_UPDATE with zero increment"
            );
            return Ok(());
        }

        if frame.stream_id == 0 {
            self.conn
                .lock_state()
                .send_window
                .increase(increment)
                .map_err(|err| ProtocolError::flow_control(format!("connection window: {}", err)))?;
            self.notify_all_streams();
            return Ok(());
        }

        let shared = {
            let state = self.conn.lock_state();
            match state.streams.get(&frame.stream_id) {
                Some(shared) => {
                    shared
                        .lock()
                        .send_window
                        .increase(increment)
                        .map_err(|err| {
                            ProtocolError::flow_control(format!("stream {}: {}", shared.id, err))
                        })?;
                    shared.clone()
                }
                None if state.is_idle_id(frame.stream_id) => {
                    return Err(ProtocolError::protocol(format!(
                        "WINDOW_UPDATE on idle stream {}",
                        frame.stream_id
                    )))
                }
                None => return Ok(()),
            }
        };
        shared.notify.notify_waiters();
        Ok(())
    }

    async fn on_rst_stream(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        if frame.stream_id == 0 {
            return Err(ProtocolError::protocol("RST_STREAM on stream 0"));
        }
        let code = frame.rst_error_code()?;

        let (shared, pushed, increment) = {
            let mut state = self.conn.lock_state();
            match state.streams.remove(&frame.stream_id) {
                Some(shared) => {
                    let (discarded, pushed) = {
                        let mut inner = shared.lock();
                        let discarded = inner.fail(H2StreamErrorKind::RemoteReset(code).into());
                        (discarded, inner.pushed)
                    };
                    let increment = if discarded > 0 {
                        state.recv_window.release(discarded)
                    } else {
                        None
                    };
                    (shared, pushed, increment)
                }
                None if state.is_idle_id(frame.stream_id) => {
                    return Err(ProtocolError::protocol(format!(
                        "RST_STREAM on idle stream {}",
                        frame.stream_id
                    )))
                }
                None => return Ok(()),
            }
        };

        debug!(
            connection = self.conn.id,
            stream_id = shared.id,
            error_code = %code,
            "Stream reset by peer"
        );
        shared.notify.notify_waiters();
        if pushed {
            self.conn.observer.on_reset(shared.id, code);
        }
        self.conn.send_window_updates(0, None, increment).await?;
        self.conn.maybe_finish();
        Ok(())
    }

    async fn on_headers(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        if frame.stream_id == 0 {
            return Err(ProtocolError::protocol("HEADERS frame on stream 0"));
        }
        let fragment = frame.header_fragment()?;
        let kind = BlockKind::Headers {
            end_stream: frame.is_end_stream(),
        };
        self.begin_block(frame.stream_id, kind, &fragment, frame.is_end_headers())
            .await
    }

    async fn on_push_promise(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        if frame.stream_id == 0 {
            return Err(ProtocolError::protocol("PUSH_PROMISE frame on stream 0"));
        }
        let (promised_id, fragment) = frame.push_promise_payload()?;
        let kind = BlockKind::PushPromise { promised_id };
        self.begin_block(frame.stream_id, kind, &fragment, frame.is_end_headers())
            .await
    }

    async fn on_continuation(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let Some(mut block) = self.pending.take() else {
            return Err(ProtocolError::protocol(
                "CONTINUATION without a preceding HEADERS or PUSH_PROMISE",
            ));
        };
        block.append(&frame.payload);
        if frame.is_end_headers() {
            return self.on_header_block(block).await;
        }
        self.check_block_size(&block)?;
        self.pending = Some(block);
        Ok(())
    }

    async fn begin_block(
        &mut self,
        stream_id: u32,
        kind: BlockKind,
        fragment: &[u8],
        end_headers: bool,
    ) -> Result<(), ProtocolError> {
        let block = PendingHeaderBlock::new(stream_id, kind, fragment);
        if end_headers {
            return self.on_header_block(block).await;
        }
        self.check_block_size(&block)?;
        self.pending = Some(block);
        Ok(())
    }

    /// Bounds a block still waiting for CONTINUATION frames.
    fn check_block_size(&self, block: &PendingHeaderBlock) -> Result<(), ProtocolError> {
        let limit = self.conn.config.max_header_list_size as usize;
        if block.block.len() > limit {
            return Err(ProtocolError::connection(
                H2ErrorCode::EnhanceYourCalm,
                format!(
                    "Header block for stream {} exceeds {} bytes",
                    block.stream_id, limit
                ),
            ));
        }
        Ok(())
    }

    /// Every complete block is decoded, even for streams that are gone, so
    /// the HPACK dynamic table stays in step with the peer.
    async fn on_header_block(&mut self, block: PendingHeaderBlock) -> Result<(), ProtocolError> {
        let headers = self.conn.decode_block(&block.block)?;
        match block.kind {
            BlockKind::Headers { end_stream } => {
                self.on_response_headers(block.stream_id, headers, end_stream)
                    .await
            }
            BlockKind::PushPromise { promised_id } => {
                self.on_promise(block.stream_id, promised_id, headers).await
            }
        }
    }

    async fn on_response_headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_stream: bool,
    ) -> Result<(), ProtocolError> {
        let (shared, outcome) = {
            let mut state = self.conn.lock_state();
            let Some(shared) = state.streams.get(&stream_id).cloned() else {
                if state.is_idle_id(stream_id) {
                    return Err(ProtocolError::protocol(format!(
                        "HEADERS on idle stream {}",
                        stream_id
                    )));
                }
                trace!(connection = self.conn.id, stream_id, "Ignoring HEADERS for closed stream");
                return Ok(());
            };

            let mut inner = shared.lock();
            let outcome = if let Err(err) = validate_header_block(&headers) {
                debug!(connection = self.conn.id, stream_id, error = %err, "Malformed response headers");
                HeadersOutcome::Reset(H2ErrorCode::ProtocolError)
            } else {
                match inner.state.recv_headers(end_stream) {
                    Err(_) => HeadersOutcome::Reset(H2ErrorCode::StreamClosed),
                    Ok(next) => {
                        inner.state = next;
                        if inner.pushed {
                            if end_stream {
                                inner.end_stream_received = true;
                            }
                            HeadersOutcome::Push {
                                headers,
                                last: end_stream,
                            }
                        } else if inner.push_header_block(headers, end_stream) {
                            HeadersOutcome::Delivered
                        } else {
                            HeadersOutcome::Reset(H2ErrorCode::ProtocolError)
                        }
                    }
                }
            };

            let closed = inner.state.is_closed();
            drop(inner);
            if closed {
                state.streams.remove(&stream_id);
            }
            (shared, outcome)
        };

        shared.notify.notify_waiters();
        match outcome {
            HeadersOutcome::Delivered => {}
            HeadersOutcome::Reset(code) => self.reset(&shared, code).await?,
            HeadersOutcome::Push { headers, last } => {
                let action = self.conn.observer.on_headers(stream_id, &headers, last);
                if action == PushAction::Cancel && !last {
                    self.conn.reset_stream(&shared, H2ErrorCode::Cancel).await?;
                }
            }
        }
        self.conn.maybe_finish();
        Ok(())
    }

    async fn on_promise(
        &mut self,
        associated_id: u32,
        promised_id: u32,
        headers: Vec<Header>,
    ) -> Result<(), ProtocolError> {
        let shared = {
            let mut state = self.conn.lock_state();
            if !state.local.enable_push {
                return Err(ProtocolError::protocol(
                    "PUSH_PROMISE received with push disabled",
                ));
            }
            if promised_id == 0 || promised_id % 2 != 0 {
                return Err(ProtocolError::protocol(format!(
                    "Promised stream id {} is not even",
                    promised_id
                )));
            }
            if promised_id <= state.last_promised_id {
                return Err(ProtocolError::protocol(format!(
                    "Promised stream id {} does not exceed {}",
                    promised_id, state.last_promised_id
                )));
            }

            let associated_open = associated_id % 2 == 1
                && state.streams.get(&associated_id).is_some_and(|shared| {
                    matches!(
                        shared.lock().state,
                        StreamState::Open | StreamState::HalfClosedLocal
                    )
                });
            if !associated_open {
                return Err(ProtocolError::protocol(format!(
                    "PUSH_PROMISE on stream {} which is not open",
                    associated_id
                )));
            }

            state.last_promised_id = promised_id;
            let shared = Arc::new(StreamShared::new(
                promised_id,
                StreamState::ReservedRemote,
                state.peer.initial_window_size,
                state.recv_initial_window(),
            ));
            state.streams.insert(promised_id, shared.clone());
            shared
        };

        debug!(
            connection = self.conn.id,
            associated_id, promised_id, "Received PUSH_PROMISE"
        );

        if let Err(err) = validate_header_block(&headers) {
            debug!(connection = self.conn.id, promised_id, error = %err, "Malformed promised request");
            return self.reset(&shared, H2ErrorCode::ProtocolError).await;
        }

        if self.conn.observer.on_request(promised_id, &headers) == PushAction::Cancel {
            self.conn.reset_stream(&shared, H2ErrorCode::Cancel).await?;
        }
        Ok(())
    }

    async fn on_data(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let stream_id = frame.stream_id;
        if stream_id == 0 {
            return Err(ProtocolError::protocol("DATA frame on stream 0"));
        }
        let len = frame.flow_controlled_len();
        let payload = frame.data_payload()?;
        let padding = len - payload.len();
        let end_stream = frame.is_end_stream();

        let outcome = {
            let mut state = self.conn.lock_state();
            state
                .recv_window
                .receive(len)
                .map_err(|err| ProtocolError::flow_control(format!("connection window: {}", err)))?;

            match state.streams.get(&stream_id).cloned() {
                None if state.is_idle_id(stream_id) => {
                    return Err(ProtocolError::protocol(format!(
                        "DATA on idle stream {}",
                        stream_id
                    )))
                }
                None => DataOutcome::Discarded {
                    increment: state.recv_window.release(len),
                },
                Some(shared) => {
                    let mut inner = shared.lock();
                    let accepted = match inner.recv_window.receive(len) {
                        Err(_) => Err(H2ErrorCode::FlowControlError),
                        Ok(()) => inner
                            .state
                            .recv_data(end_stream)
                            .map_err(|_| H2ErrorCode::StreamClosed),
                    };

                    match accepted {
                        Err(code) => {
                            drop(inner);
                            DataOutcome::Reset {
                                shared,
                                code,
                                increment: state.recv_window.release(len),
                            }
                        }
                        Ok(next) => {
                            inner.state = next;
                            if end_stream {
                                inner.end_stream_received = true;
                            }

                            // Pushed DATA goes straight to the observer, so all of it is
                            // consumed now; buffered DATA is released as it is read.
                            let released = if inner.pushed { len } else { padding };
                            let stream_increment = if released > 0 && !next.is_recv_closed() {
                                inner.recv_window.release(released)
                            } else {
                                None
                            };
                            let push_payload = if inner.pushed {
                                Some(payload)
                            } else {
                                if !payload.is_empty() {
                                    inner.data.push_back(payload);
                                }
                                None
                            };

                            drop(inner);
                            if next.is_closed() {
                                state.streams.remove(&stream_id);
                            }
                            let connection_increment = if released > 0 {
                                state.recv_window.release(released)
                            } else {
                                None
                            };
                            DataOutcome::Accepted {
                                shared,
                                push_payload,
                                stream_increment,
                                connection_increment,
                            }
                        }
                    }
                }
            }
        };

        match outcome {
            DataOutcome::Discarded { increment } => {
                trace!(connection = self.conn.id, stream_id, len, "Discarding DATA for closed stream");
                self.conn.send_window_updates(0, None, increment).await?;
            }
            DataOutcome::Reset {
                shared,
                code,
                increment,
            } => {
                self.conn.send_window_updates(0, None, increment).await?;
                self.reset(&shared, code).await?;
            }
            DataOutcome::Accepted {
                shared,
                push_payload,
                stream_increment,
                connection_increment,
            } => {
                shared.notify.notify_waiters();
                self.conn
                    .send_window_updates(stream_id, stream_increment, connection_increment)
                    .await?;
                if let Some(data) = push_payload {
                    let action = self.conn.observer.on_data(stream_id, data, end_stream);
                    if action == PushAction::Cancel && !end_stream {
                        self.conn.reset_stream(&shared, H2ErrorCode::Cancel).await?;
                    }
                }
                self.conn.maybe_finish();
            }
        }
        Ok(())
    }

    /// Resets a stream for a peer violation. Observers learn about pushed
    /// streams ending this way through `on_reset`.
    async fn reset(
        &mut self,
        shared: &Arc<StreamShared>,
        code: H2ErrorCode,
    ) -> Result<(), ProtocolError> {
        let pushed = shared.lock().pushed;
        self.conn.reset_stream(shared, code).await?;
        if pushed {
            self.conn.observer.on_reset(shared.id, code);
        }
        Ok(())
    }

    fn notify_all_streams(&self) {
        let streams: Vec<Arc<StreamShared>> =
            self.conn.lock_state().streams.values().cloned().collect();
        for shared in streams {
            shared.notify.notify_waiters();
        }
    }
}
