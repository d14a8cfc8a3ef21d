//! The connection engine (§4.5): preface handshake, SETTINGS exchange, and
//! the cooperatively scheduled Reader/Writer/Dispatcher trio that drive
//! request and response frames across one transport. Generalizes the
//! teacher's thread-based `spawn_request_sender`/`spawn_response_receiver`
//! pair (`std::sync::mpsc` + `Condvar`) to async tokio tasks communicating
//! over channels and a shared, lock-guarded connection state.
use crate::error::{ErrorScope, H2Error};
use crate::flow;
use crate::frame::Frame;
use crate::hpack;
use crate::request::Request;
use crate::response::Response;
use crate::settings::ConnectionSettings;
use crate::stream::Stream;
use crate::streams::StreamMap;
use crate::transport::{self, Transport};
use crate::types::{ErrorType, NonZeroStreamId, SettingsParameter, CLIENT_PREFACE, MAX_WINDOW_SIZE};
use bytes::Bytes;
use log::{debug, error, trace, warn};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::timeout;
use url::Url;

const MAX_HEADER_COUNT: usize = 256;

/// Connect/request/ping timeouts (§5, §9 Open Question 3). All are
/// overridable; the defaults match common practice and are not prescribed
/// by the wire protocol itself.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// Read-only per-connection counters (§6: "a small introspection API
/// reports per-connection counters... read-only and task-safe").
#[derive(Debug, Default)]
pub struct ConnectionStats {
    streams_opened: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionStatsSnapshot {
    pub streams_opened: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub conn_send_window: i64,
    pub conn_recv_window: i64,
}

struct Shared {
    streams: StreamMap,
    encoder: Mutex<hpack::Encoder>,
    decoder: Mutex<hpack::Decoder>,
    local_settings: ConnectionSettings,
    peer_settings: Mutex<ConnectionSettings>,
    conn_send_window: AtomicI64,
    conn_recv_window: AtomicI64,
    window_notify: Notify,
    draining: AtomicBool,
    closed: AtomicBool,
    highest_stream_seen: AtomicU32,
    pending_ping: Mutex<Option<oneshot::Sender<()>>>,
    stats: ConnectionStats,
    /// Stream id with an incomplete header block, or 0 when none (§4.1/§4.3:
    /// while set, only a CONTINUATION for that exact stream may legally
    /// arrive next -- a frame for any *other* stream is a connection error).
    expecting_continuation: AtomicU32,
}

/// A single HTTP/2 connection (§4.5). `request()` may be called
/// concurrently from many callers; the connection itself is driven by three
/// background tasks spawned in `connect`/`from_transport`.
pub struct Connection {
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<Frame>,
    request_timeout: Duration,
}

impl Connection {
    pub async fn connect(
        url: &Url,
        rustls_config: Arc<rustls::ClientConfig>,
        config: ClientConfig,
    ) -> Result<Self, H2Error> {
        let transport = timeout(config.connect_timeout, transport::connect_tls(url, rustls_config))
            .await
            .map_err(|_| timeout_error("connect timed out"))??;
        Self::from_transport(transport, config).await
    }

    pub async fn from_transport(transport: Box<dyn Transport>, config: ClientConfig) -> Result<Self, H2Error> {
        let (reader, mut writer) = split(transport);
        writer.write_all(CLIENT_PREFACE).await?;

        let local_settings = ConnectionSettings::client_defaults();
        let initial_settings = Frame::Settings {
            ack: false,
            params: local_settings.as_params(),
        };
        writer.write_all(&initial_settings.encode()).await?;

        let shared = Arc::new(Shared {
            streams: StreamMap::default(),
            encoder: Mutex::new(hpack::Encoder::with_size(local_settings.header_table_size as usize)),
            decoder: Mutex::new(hpack::Decoder::with_size(local_settings.header_table_size as usize)),
            // Connection-level windows start at the RFC default and change only
            // via WINDOW_UPDATE; SETTINGS_INITIAL_WINDOW_SIZE affects streams only.
            conn_send_window: AtomicI64::new(i64::from(crate::types::DEFAULT_INITIAL_WINDOW_SIZE)),
            conn_recv_window: AtomicI64::new(i64::from(crate::types::DEFAULT_INITIAL_WINDOW_SIZE)),
            local_settings,
            peer_settings: Mutex::new(ConnectionSettings::default()),
            window_notify: Notify::new(),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            highest_stream_seen: AtomicU32::new(0),
            pending_ping: Mutex::new(None),
            stats: ConnectionStats::default(),
            expecting_continuation: AtomicU32::new(0),
        });

        let (frame_tx, frame_rx) = mpsc::channel::<Frame>(128);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<Frame, H2Error>>(128);

        let max_frame_size = shared.local_settings.max_frame_size;
        tokio::spawn(run_reader(reader, inbound_tx, max_frame_size));
        tokio::spawn(run_writer(writer, frame_rx, shared.clone()));
        tokio::spawn(run_dispatcher(inbound_rx, shared.clone(), frame_tx.clone()));
        tokio::spawn(run_idle_ping(
            shared.clone(),
            frame_tx.clone(),
            config.ping_interval,
            config.ping_timeout,
        ));

        Ok(Self {
            shared,
            frame_tx,
            request_timeout: config.request_timeout,
        })
    }

    /// Submits a request and awaits its response (§4.5 "request lifecycle").
    pub async fn request(&self, request: Request) -> Result<Response, H2Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(H2Error::Closed);
        }
        if self.shared.draining.load(Ordering::Acquire) {
            return Err(H2Error::Graceful {
                last_stream_id: self.shared.highest_stream_seen.load(Ordering::Acquire),
                retryable: true,
            });
        }

        let stream_id = self.shared.streams.allocate_id();
        let header_block = {
            let mut encoder = self.shared.encoder.lock().await;
            encoder.encode(&request.headers)?
        };

        let mut stream = Stream::new(stream_id, request.id, self.shared.local_settings.initial_window_size);
        let (tx, rx) = oneshot::channel();
        stream.set_response_tx(tx);
        let end_stream_after_headers = request.body.is_empty();
        stream.note_local_headers_sent(end_stream_after_headers);
        self.shared.streams.insert(stream);
        self.shared.stats.streams_opened.fetch_add(1, Ordering::Relaxed);

        let peer_max_frame_size = self.shared.peer_settings.lock().await.max_frame_size;

        for frame in split_header_block(stream_id, header_block, peer_max_frame_size, end_stream_after_headers) {
            self.send_frame(frame).await?;
        }
        if !end_stream_after_headers {
            self.send_body(stream_id, request.body, peer_max_frame_size).await?;
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(H2Error::Cancelled {
                stream: stream_id.get(),
                reason: "response sender dropped before completion",
            }),
            Err(_) => {
                self.shared.streams.with_stream(stream_id, |s| {
                    s.fail(H2Error::Cancelled {
                        stream: stream_id.get(),
                        reason: "request timed out",
                    });
                });
                self.frame_tx
                    .send(Frame::ResetStream {
                        stream_id,
                        error: ErrorType::Cancel,
                    })
                    .await
                    .ok();
                Err(H2Error::Cancelled {
                    stream: stream_id.get(),
                    reason: "request timed out",
                })
            }
        }
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), H2Error> {
        self.frame_tx.send(frame).await.map_err(|_| H2Error::Closed)
    }

    async fn send_body(&self, stream_id: NonZeroStreamId, mut remaining: Bytes, max_frame_size: u32) -> Result<(), H2Error> {
        loop {
            let stream_window = self
                .shared
                .streams
                .with_stream(stream_id, |s| s.send_window)
                .ok_or(H2Error::Closed)?;
            let conn_window = self.shared.conn_send_window.load(Ordering::Acquire);
            let chunk_len = (flow::max_emittable(stream_window, conn_window, max_frame_size) as usize).min(remaining.len());
            if chunk_len == 0 {
                self.shared.window_notify.notified().await;
                if self.shared.closed.load(Ordering::Acquire) {
                    return Err(H2Error::Closed);
                }
                continue;
            }
            let chunk = remaining.split_to(chunk_len);
            let end_stream = remaining.is_empty();
            self.shared
                .streams
                .with_stream(stream_id, |s| flow::debit(&mut s.send_window, chunk_len as u32, false))
                .ok_or(H2Error::Closed)??;
            atomic_debit(&self.shared.conn_send_window, chunk_len as u32, true)?;
            self.send_frame(Frame::Data {
                stream_id,
                end_stream,
                data: chunk,
            })
            .await?;
            if end_stream {
                return Ok(());
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            streams_opened: self.shared.stats.streams_opened.load(Ordering::Relaxed),
            bytes_sent: self.shared.stats.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.stats.bytes_received.load(Ordering::Relaxed),
            conn_send_window: self.shared.conn_send_window.load(Ordering::Relaxed),
            conn_recv_window: self.shared.conn_recv_window.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Graceful shutdown (§4.5): stop accepting new streams and let
    /// in-flight ones finish; existing callers observe `Graceful` instead of
    /// a hard close once draining starts.
    pub async fn close(&self) {
        self.shared.draining.store(true, Ordering::Release);
        self.frame_tx
            .send(Frame::GoAway {
                last_stream_id: self.shared.highest_stream_seen.load(Ordering::Acquire),
                error: ErrorType::NoError,
                debug: Bytes::new(),
            })
            .await
            .ok();
    }
}

fn timeout_error(msg: &'static str) -> H2Error {
    H2Error::Transport(io::Error::new(io::ErrorKind::TimedOut, msg))
}

fn split_header_block(
    stream_id: NonZeroStreamId,
    block: Bytes,
    max_frame_size: u32,
    end_stream: bool,
) -> Vec<Frame> {
    let max = max_frame_size as usize;
    let mut block = block;
    if block.len() <= max {
        return vec![Frame::Headers {
            stream_id,
            end_stream,
            end_headers: true,
            dependency: None,
            block,
        }];
    }
    let first = block.split_to(max);
    let mut frames = vec![Frame::Headers {
        stream_id,
        end_stream,
        end_headers: false,
        dependency: None,
        block: first,
    }];
    while !block.is_empty() {
        let take = max.min(block.len());
        let chunk = block.split_to(take);
        let end_headers = block.is_empty();
        frames.push(Frame::Continuation {
            stream_id,
            end_headers,
            block: chunk,
        });
    }
    frames
}

fn atomic_debit(window: &AtomicI64, amount: u32, connection_scoped_for_err: bool) -> Result<(), H2Error> {
    let prev = window.fetch_sub(i64::from(amount), Ordering::AcqRel);
    if prev - i64::from(amount) < 0 {
        window.fetch_add(i64::from(amount), Ordering::AcqRel);
        return Err(H2Error::flow_control(connection_scoped_for_err, "flow-control window went negative"));
    }
    Ok(())
}

/// Replenishes the connection-level recv window with a WINDOW_UPDATE once it
/// has drained to half of its starting value (§4.4 "Replenishment").
async fn maybe_replenish_connection(shared: &Arc<Shared>, frame_tx: &mpsc::Sender<Frame>) {
    let initial = i64::from(crate::types::DEFAULT_INITIAL_WINDOW_SIZE);
    let current = shared.conn_recv_window.load(Ordering::Acquire);
    let Some(increment) = flow::replenishment(current, initial) else {
        return;
    };
    if atomic_credit(&shared.conn_recv_window, increment).is_ok() {
        frame_tx.send(Frame::WindowUpdate { stream_id: 0, increment }).await.ok();
    }
}

/// Replenishes one stream's recv window the same way, using the window size
/// we ourselves advertised when the stream was created.
async fn maybe_replenish_stream(shared: &Arc<Shared>, frame_tx: &mpsc::Sender<Frame>, stream_id: NonZeroStreamId) {
    let initial = i64::from(shared.local_settings.initial_window_size);
    let increment = shared
        .streams
        .with_stream(stream_id, |s| flow::replenishment(s.recv_window, initial))
        .flatten();
    let Some(increment) = increment else {
        return;
    };
    let credited = shared
        .streams
        .with_stream(stream_id, |s| flow::credit(&mut s.recv_window, increment, false));
    if matches!(credited, Some(Ok(()))) {
        frame_tx
            .send(Frame::WindowUpdate { stream_id: stream_id.get(), increment })
            .await
            .ok();
    }
}

fn atomic_credit(window: &AtomicI64, increment: u32) -> Result<(), H2Error> {
    let prev = window.fetch_add(i64::from(increment), Ordering::AcqRel);
    if prev + i64::from(increment) > MAX_WINDOW_SIZE {
        window.fetch_sub(i64::from(increment), Ordering::AcqRel);
        return Err(H2Error::flow_control(true, "WINDOW_UPDATE increment overflows 2^31-1"));
    }
    Ok(())
}

async fn run_reader(
    mut reader: ReadHalf<Box<dyn Transport>>,
    inbound_tx: mpsc::Sender<Result<Frame, H2Error>>,
    max_frame_size: u32,
) {
    loop {
        match Frame::read_from(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => {
                trace!("reader: {frame:?}");
                if inbound_tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("reader: clean EOF");
                break;
            }
            Err(err) => {
                inbound_tx.send(Err(err)).await.ok();
                break;
            }
        }
    }
}

async fn run_writer(mut writer: WriteHalf<Box<dyn Transport>>, mut frame_rx: mpsc::Receiver<Frame>, shared: Arc<Shared>) {
    while let Some(frame) = frame_rx.recv().await {
        trace!("writer: {frame:?}");
        let bytes = frame.encode();
        if let Err(err) = writer.write_all(&bytes).await {
            error!("writer: transport error: {err}");
            break;
        }
        shared.stats.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
    writer.shutdown().await.ok();
    shared.closed.store(true, Ordering::Release);
    shared.window_notify.notify_waiters();
}

async fn run_idle_ping(shared: Arc<Shared>, frame_tx: mpsc::Sender<Frame>, interval: Duration, ping_timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately
    loop {
        ticker.tick().await;
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        *shared.pending_ping.lock().await = Some(tx);
        if frame_tx
            .send(Frame::Ping { ack: false, data: *b"h2engine" })
            .await
            .is_err()
        {
            return;
        }
        if timeout(ping_timeout, rx).await.is_err() {
            warn!("idle ping timed out after {ping_timeout:?}; closing connection");
            shared.closed.store(true, Ordering::Release);
            shared.window_notify.notify_waiters();
            for mut stream in shared.streams.drain_all() {
                stream.fail(H2Error::Closed);
            }
            return;
        }
    }
}

async fn run_dispatcher(
    mut inbound_rx: mpsc::Receiver<Result<Frame, H2Error>>,
    shared: Arc<Shared>,
    frame_tx: mpsc::Sender<Frame>,
) {
    while let Some(item) = inbound_rx.recv().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(err) => {
                fail_connection(&shared, &frame_tx, err).await;
                break;
            }
        };
        let stream_id = frame.stream_id();
        if stream_id != 0 {
            shared.highest_stream_seen.fetch_max(stream_id, Ordering::AcqRel);
        }
        if let Err(err) = dispatch_one(frame, &shared, &frame_tx).await {
            match err.scope() {
                ErrorScope::Connection => {
                    fail_connection(&shared, &frame_tx, err).await;
                    break;
                }
                ErrorScope::Stream => {
                    let code = err.wire_code();
                    // Don't reply to a peer-initiated RST_STREAM with one of our own.
                    let already_reset = matches!(err, H2Error::RemoteRefusal { .. });
                    if let Some(nz) = NonZeroStreamId::new(stream_id) {
                        shared.streams.with_stream(nz, |s| s.fail(err));
                        if !already_reset {
                            frame_tx
                                .send(Frame::ResetStream { stream_id: nz, error: code })
                                .await
                                .ok();
                        }
                    }
                }
            }
        }
    }
    shared.closed.store(true, Ordering::Release);
    shared.window_notify.notify_waiters();
}

async fn fail_connection(shared: &Arc<Shared>, frame_tx: &mpsc::Sender<Frame>, err: H2Error) {
    error!("connection-fatal error: {err}");
    let code = err.wire_code();
    shared.draining.store(true, Ordering::Release);
    shared.closed.store(true, Ordering::Release);
    frame_tx
        .send(Frame::GoAway {
            last_stream_id: shared.highest_stream_seen.load(Ordering::Acquire),
            error: code,
            debug: Bytes::new(),
        })
        .await
        .ok();
    for mut stream in shared.streams.drain_all() {
        stream.fail(H2Error::Closed);
    }
    shared.window_notify.notify_waiters();
}

async fn dispatch_one(frame: Frame, shared: &Arc<Shared>, frame_tx: &mpsc::Sender<Frame>) -> Result<(), H2Error> {
    let max_header_list_size = shared.local_settings.max_header_list_size.unwrap_or(u32::MAX) as usize;

    let expecting = shared.expecting_continuation.load(Ordering::Acquire);
    if expecting != 0 {
        let is_matching_continuation =
            matches!(&frame, Frame::Continuation { stream_id, .. } if stream_id.get() == expecting);
        if !is_matching_continuation {
            return Err(H2Error::Protocol(
                "frame other than CONTINUATION received for a stream with an incomplete header block",
            ));
        }
    }

    match frame {
        Frame::Settings { ack, params } => {
            if ack {
                return Ok(());
            }
            let delta = apply_peer_settings(shared, &params).await?;
            if let Some(delta) = delta {
                let mut first_err = None;
                shared.streams.for_each(|s| {
                    if let Err(e) = s.apply_settings_window_delta(delta) {
                        first_err.get_or_insert(e);
                    }
                });
                if let Some(e) = first_err {
                    return Err(e);
                }
            }
            frame_tx
                .send(Frame::Settings { ack: true, params: Vec::new() })
                .await
                .ok();
            Ok(())
        }
        Frame::Ping { ack, data } => {
            if ack {
                if let Some(tx) = shared.pending_ping.lock().await.take() {
                    tx.send(()).ok();
                }
            } else {
                frame_tx.send(Frame::Ping { ack: true, data }).await.ok();
            }
            Ok(())
        }
        Frame::GoAway { last_stream_id, error, debug } => {
            warn!("peer sent GOAWAY(last_stream_id={last_stream_id}, error={error:?})");
            if !debug.is_empty() {
                if let Ok(text) = std::str::from_utf8(&debug) {
                    debug!("GOAWAY debug data: {text}");
                }
            }
            shared.draining.store(true, Ordering::Release);
            let retryable = error == ErrorType::NoError;
            shared.streams.fail_streams_after(last_stream_id, |id| H2Error::Graceful {
                last_stream_id: id,
                retryable,
            });
            Err(H2Error::Graceful {
                last_stream_id,
                retryable: error == ErrorType::NoError,
            })
        }
        Frame::WindowUpdate { stream_id, increment } => {
            if stream_id == 0 {
                atomic_credit(&shared.conn_send_window, increment)?;
                shared.window_notify.notify_waiters();
                Ok(())
            } else {
                let nz = NonZeroStreamId::new(stream_id).expect("checked non-zero above");
                let result = shared
                    .streams
                    .with_stream(nz, |s| flow::credit(&mut s.send_window, increment, false));
                shared.window_notify.notify_waiters();
                result.unwrap_or(Ok(()))
            }
        }
        Frame::PushPromise { stream_id, .. } => {
            if !shared.local_settings.enable_push {
                return Err(H2Error::Protocol("PUSH_PROMISE received despite SETTINGS_ENABLE_PUSH=0"));
            }
            // Accepted but never delivered to a caller (§9 Open Question 1).
            frame_tx
                .send(Frame::ResetStream {
                    stream_id,
                    error: ErrorType::RefusedStream,
                })
                .await
                .ok();
            Ok(())
        }
        Frame::Data { stream_id, end_stream, data } => {
            let len = data.len() as u32;
            atomic_debit(&shared.conn_recv_window, len, true)?;
            let mut decoder = shared.decoder.lock().await;
            let result = shared
                .streams
                .with_stream(stream_id, |s| {
                    s.handle_frame(
                        Frame::Data { stream_id, end_stream, data },
                        &mut decoder,
                        max_header_list_size,
                        MAX_HEADER_COUNT,
                    )
                })
                .unwrap_or(Ok(()));
            drop(decoder);
            maybe_replenish_connection(shared, frame_tx).await;
            if !end_stream {
                maybe_replenish_stream(shared, frame_tx, stream_id).await;
            }
            result
        }
        Frame::Headers { stream_id, end_stream, end_headers, dependency, block } => {
            shared.expecting_continuation.store(
                if end_headers { 0 } else { stream_id.get() },
                Ordering::Release,
            );
            let mut decoder = shared.decoder.lock().await;
            shared
                .streams
                .with_stream(stream_id, |s| {
                    s.handle_frame(
                        Frame::Headers { stream_id, end_stream, end_headers, dependency, block },
                        &mut decoder,
                        max_header_list_size,
                        MAX_HEADER_COUNT,
                    )
                })
                .unwrap_or(Ok(()))
        }
        Frame::Priority { stream_id, dependency, exclusive, weight } => {
            let mut decoder = shared.decoder.lock().await;
            shared
                .streams
                .with_stream(stream_id, |s| {
                    s.handle_frame(
                        Frame::Priority { stream_id, dependency, exclusive, weight },
                        &mut decoder,
                        max_header_list_size,
                        MAX_HEADER_COUNT,
                    )
                })
                .unwrap_or(Ok(()))
        }
        Frame::ResetStream { stream_id, error } => {
            let mut decoder = shared.decoder.lock().await;
            let result = shared
                .streams
                .with_stream(stream_id, |s| {
                    s.handle_frame(
                        Frame::ResetStream { stream_id, error },
                        &mut decoder,
                        max_header_list_size,
                        MAX_HEADER_COUNT,
                    )
                })
                .unwrap_or(Ok(()));
            if shared.streams.note_reset_and_check_abuse() {
                return Err(H2Error::Protocol("peer reset more than 100 streams in 10 seconds"));
            }
            result
        }
        Frame::Continuation { stream_id, end_headers, block } => {
            if end_headers {
                shared.expecting_continuation.store(0, Ordering::Release);
            }
            let mut decoder = shared.decoder.lock().await;
            shared
                .streams
                .with_stream(stream_id, |s| {
                    s.handle_frame(
                        Frame::Continuation { stream_id, end_headers, block },
                        &mut decoder,
                        max_header_list_size,
                        MAX_HEADER_COUNT,
                    )
                })
                .unwrap_or(Ok(()))
        }
        Frame::Unknown { .. } => Ok(()),
    }
}

async fn apply_peer_settings(shared: &Arc<Shared>, params: &[(SettingsParameter, u32)]) -> Result<Option<i64>, H2Error> {
    let mut peer = shared.peer_settings.lock().await;
    let delta = peer.apply(params)?;
    for &(param, value) in params {
        if param == SettingsParameter::HeaderTableSize {
            shared.encoder.lock().await.set_peer_bound(value as usize);
        }
    }
    Ok(delta)
}

#[cfg(test)]
mod scenario_tests {
    use super::*;
    use crate::hpack;
    use crate::types::CLIENT_PREFACE;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    /// Drives the preface/SETTINGS exchange against an in-memory peer and
    /// hands back the live connection plus the peer's half of the pipe for
    /// the rest of a scenario to script (§8 S1).
    async fn handshake() -> (Connection, DuplexStream) {
        let (client_io, mut peer) = duplex(1 << 20);
        let connection = Connection::from_transport(Box::new(client_io), ClientConfig::default())
            .await
            .unwrap();

        let mut preface = [0u8; CLIENT_PREFACE.len()];
        peer.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface, CLIENT_PREFACE);

        let client_settings = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        assert!(matches!(client_settings, Frame::Settings { ack: false, .. }));
        peer.write_all(&Frame::Settings { ack: true, params: Vec::new() }.encode())
            .await
            .unwrap();

        peer.write_all(
            &Frame::Settings {
                ack: false,
                params: vec![
                    (SettingsParameter::InitialWindowSize, 65535),
                    (SettingsParameter::MaxFrameSize, 16384),
                ],
            }
            .encode(),
        )
        .await
        .unwrap();
        let ack = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        assert!(matches!(ack, Frame::Settings { ack: true, .. }));

        (connection, peer)
    }

    fn example_url(path: &str) -> Url {
        Url::parse(&format!("https://example.com{path}")).unwrap()
    }

    #[tokio::test]
    async fn s1_s2_preface_handshake_then_minimal_get() {
        let (connection, mut peer) = handshake().await;

        let request_task = tokio::spawn(async move { connection.request(Request::get(example_url("/"), None)).await });

        let headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        let (stream_id, end_stream, end_headers, block) = match headers {
            Frame::Headers { stream_id, end_stream, end_headers, block, .. } => (stream_id, end_stream, end_headers, block),
            other => panic!("expected HEADERS, got {other:?}"),
        };
        assert_eq!(stream_id.get(), 1, "first client stream id must be 1");
        assert!(end_stream, "bodyless GET must carry END_STREAM on HEADERS");
        assert!(end_headers);

        let mut decoder = hpack::Decoder::default();
        let decoded = decoder.decode(&block, 1 << 20, 100).unwrap();
        assert!(decoded.contains(&(":method".to_string(), "GET".to_string())));
        assert!(decoded.contains(&(":scheme".to_string(), "https".to_string())));
        assert!(decoded.contains(&(":authority".to_string(), "example.com".to_string())));
        assert!(decoded.contains(&(":path".to_string(), "/".to_string())));

        let mut encoder = hpack::Encoder::default();
        let response_block = encoder
            .encode(&vec![
                (":status".to_string(), "200".to_string()),
                ("content-length".to_string(), "0".to_string()),
            ])
            .unwrap();
        peer.write_all(
            &Frame::Headers {
                stream_id,
                end_stream: true,
                end_headers: true,
                dependency: None,
                block: response_block,
            }
            .encode(),
        )
        .await
        .unwrap();

        let response = request_task.await.unwrap().unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn s3_flow_controlled_post_blocks_for_window_update() {
        let (connection, mut peer) = handshake().await;
        let body = Bytes::from(vec![0xABu8; 100_000]);

        let request_task =
            tokio::spawn(async move { connection.request(Request::post(example_url("/upload"), None, body)).await });

        let headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        assert!(matches!(headers, Frame::Headers { end_stream: false, .. }));

        let mut received = 0usize;
        loop {
            match Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap() {
                Frame::Data { data, end_stream, .. } => {
                    received += data.len();
                    assert!(!end_stream, "must not complete before the window is exhausted");
                    if received == 65_535 {
                        break;
                    }
                }
                other => panic!("unexpected frame while draining first window: {other:?}"),
            }
        }

        peer.write_all(&Frame::WindowUpdate { stream_id: 1, increment: 34_465 }.encode())
            .await
            .unwrap();
        peer.write_all(&Frame::WindowUpdate { stream_id: 0, increment: 34_465 }.encode())
            .await
            .unwrap();

        loop {
            match Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap() {
                Frame::Data { data, end_stream, .. } => {
                    received += data.len();
                    if end_stream {
                        break;
                    }
                }
                other => panic!("unexpected frame while draining remainder: {other:?}"),
            }
        }
        assert_eq!(received, 100_000);

        let mut encoder = hpack::Encoder::default();
        let block = encoder.encode(&vec![(":status".to_string(), "200".to_string())]).unwrap();
        peer.write_all(
            &Frame::Headers {
                stream_id: NonZeroStreamId::new(1).unwrap(),
                end_stream: true,
                end_headers: true,
                dependency: None,
                block,
            }
            .encode(),
        )
        .await
        .unwrap();

        let response = request_task.await.unwrap().unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn s4_goaway_fails_later_stream_but_completes_earlier_one() {
        let (connection, mut peer) = handshake().await;
        let connection = Arc::new(connection);

        let c1 = connection.clone();
        let first = tokio::spawn(async move { c1.request(Request::get(example_url("/one"), None)).await });
        let first_headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        assert_eq!(first_headers.stream_id(), 1);

        let c2 = connection.clone();
        let second = tokio::spawn(async move { c2.request(Request::get(example_url("/two"), None)).await });
        let second_headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        assert_eq!(second_headers.stream_id(), 3);

        peer.write_all(
            &Frame::GoAway {
                last_stream_id: 1,
                error: ErrorType::NoError,
                debug: Bytes::new(),
            }
            .encode(),
        )
        .await
        .unwrap();

        let second_result = second.await.unwrap();
        assert!(matches!(second_result, Err(H2Error::Graceful { retryable: true, .. })));

        let mut encoder = hpack::Encoder::default();
        let block = encoder.encode(&vec![(":status".to_string(), "200".to_string())]).unwrap();
        peer.write_all(
            &Frame::Headers {
                stream_id: NonZeroStreamId::new(1).unwrap(),
                end_stream: true,
                end_headers: true,
                dependency: None,
                block,
            }
            .encode(),
        )
        .await
        .unwrap();

        let first_result = first.await.unwrap();
        assert_eq!(first_result.unwrap().status(), 200);
    }

    #[tokio::test]
    async fn s5_data_before_end_headers_is_connection_fatal() {
        let (connection, mut peer) = handshake().await;

        let request_task = tokio::spawn(async move { connection.request(Request::get(example_url("/"), None)).await });
        let headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        let stream_id = NonZeroStreamId::new(headers.stream_id()).unwrap();

        // HEADERS without END_HEADERS, immediately followed by DATA: illegal interleave.
        peer.write_all(
            &Frame::Headers {
                stream_id,
                end_stream: false,
                end_headers: false,
                dependency: None,
                block: Bytes::from_static(b"\x00"),
            }
            .encode(),
        )
        .await
        .unwrap();
        peer.write_all(
            &Frame::Data {
                stream_id,
                end_stream: true,
                data: Bytes::from_static(b"x"),
            }
            .encode(),
        )
        .await
        .unwrap();

        let result = request_task.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn s6_rapid_reset_trips_abuse_threshold() {
        let (connection, mut peer) = handshake().await;
        let connection = Arc::new(connection);

        let mut resets_sent = 0;
        loop {
            if connection.is_closed() {
                break;
            }
            let c = connection.clone();
            let task = tokio::spawn(async move { c.request(Request::get(example_url("/"), None)).await });
            let frame = match Frame::read_from(&mut peer, 1 << 20).await.unwrap() {
                Some(frame) => frame,
                None => {
                    task.await.ok();
                    break;
                }
            };
            let stream_id = NonZeroStreamId::new(frame.stream_id()).unwrap();
            peer.write_all(
                &Frame::ResetStream {
                    stream_id,
                    error: ErrorType::Cancel,
                }
                .encode(),
            )
            .await
            .ok();
            resets_sent += 1;
            task.await.ok();
            assert!(resets_sent <= 200, "abuse threshold never tripped after 200 resets");
        }

        assert!(connection.is_closed());
        assert!(resets_sent > 100, "expected more than 100 resets before the trip, got {resets_sent}");
    }

    #[tokio::test]
    async fn recv_window_replenished_past_half_threshold() {
        let (connection, mut peer) = handshake().await;

        let request_task = tokio::spawn(async move { connection.request(Request::get(example_url("/"), None)).await });

        let headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        let stream_id = NonZeroStreamId::new(headers.stream_id()).unwrap();

        let mut encoder = hpack::Encoder::default();
        let block = encoder.encode(&vec![(":status".to_string(), "200".to_string())]).unwrap();
        peer.write_all(
            &Frame::Headers {
                stream_id,
                end_stream: false,
                end_headers: true,
                dependency: None,
                block,
            }
            .encode(),
        )
        .await
        .unwrap();

        // Past half of the 65535-byte initial window but still under it --
        // without replenishment the rest of the body would stall forever.
        // Split across frames to respect the negotiated 16384-byte max frame size.
        let mut sent = 0usize;
        while sent < 40_000 {
            let len = (40_000 - sent).min(16_384);
            let chunk = Bytes::from(vec![0xCDu8; len]);
            peer.write_all(&Frame::Data { stream_id, end_stream: false, data: chunk }.encode())
                .await
                .unwrap();
            sent += len;
        }

        let mut saw_stream_update = false;
        let mut saw_conn_update = false;
        for _ in 0..2 {
            match Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap() {
                Frame::WindowUpdate { stream_id: 0, increment } => {
                    assert!(increment > 0);
                    saw_conn_update = true;
                }
                Frame::WindowUpdate { stream_id: sid, increment } if sid == stream_id.get() => {
                    assert!(increment > 0);
                    saw_stream_update = true;
                }
                other => panic!("expected a WINDOW_UPDATE, got {other:?}"),
            }
        }
        assert!(saw_stream_update, "stream recv window was never replenished");
        assert!(saw_conn_update, "connection recv window was never replenished");

        peer.write_all(&Frame::Data { stream_id, end_stream: true, data: Bytes::new() }.encode())
            .await
            .unwrap();

        let response = request_task.await.unwrap().unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn continuation_guard_is_connection_scoped_across_streams() {
        let (connection, mut peer) = handshake().await;
        let connection = Arc::new(connection);

        let c1 = connection.clone();
        let first = tokio::spawn(async move { c1.request(Request::get(example_url("/one"), None)).await });
        let first_headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        let stream1 = NonZeroStreamId::new(first_headers.stream_id()).unwrap();

        let c2 = connection.clone();
        let second = tokio::spawn(async move { c2.request(Request::get(example_url("/two"), None)).await });
        let second_headers = Frame::read_from(&mut peer, 1 << 20).await.unwrap().unwrap();
        let stream2 = NonZeroStreamId::new(second_headers.stream_id()).unwrap();

        // Leave stream1's header block open, then send a HEADERS frame for a
        // *different* stream instead of the matching CONTINUATION.
        peer.write_all(
            &Frame::Headers {
                stream_id: stream1,
                end_stream: false,
                end_headers: false,
                dependency: None,
                block: Bytes::from_static(b"\x88"),
            }
            .encode(),
        )
        .await
        .unwrap();
        peer.write_all(
            &Frame::Headers {
                stream_id: stream2,
                end_stream: true,
                end_headers: true,
                dependency: None,
                block: Bytes::from_static(b"\x88"),
            }
            .encode(),
        )
        .await
        .unwrap();

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
    }
}
