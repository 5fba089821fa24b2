//! The client transport.
//!
//! One [`Transport`] owns one connection to the peer and the set of open
//! streams on it. Outbound frames funnel through the write queue; inbound
//! frames are pulled by a dedicated dispatcher thread that runs the
//! per-frame handlers. The transport lock guards stream-id assignment and
//! the GOAWAY/stopped latches; the stream registry has its own lock and is
//! only iterated in bulk while the transport lock is held.

use crate::codec::{Codec, ErrorCode, FrameHandler, FrameReader, FrameWriter, Header, Settings};
use crate::headers::{self, MethodDescriptor};
use crate::metadata::Metadata;
use crate::status::Status;
use crate::stream::{ClientStream, ClientStreamListener};
use crate::write_queue::{ErrorHook, WriteQueue};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, OnceLock};
use std::thread;
use tracing::{debug, error, warn};

/// Default initial flow-control window (64 KiB, stream and connection).
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 64 * 1024;

/// Unacknowledged-byte threshold that triggers a WINDOW_UPDATE.
pub(crate) const WINDOW_UPDATE_THRESHOLD: u32 = DEFAULT_INITIAL_WINDOW_SIZE / 2;

/// Largest assignable stream id (31 bits).
const MAX_STREAM_ID: u32 = i32::MAX as u32;

/// Transport lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Constructed, not yet started.
    New,
    /// Started; streams may be created.
    Running,
    /// In GOAWAY mode, draining remaining streams.
    Stopping,
    /// Terminated cleanly.
    Stopped,
    /// Terminated by a failure.
    Failed,
}

/// Observer of transport lifecycle transitions.
pub trait TransportListener: Send + Sync {
    /// The transport started and is ready for streams.
    fn transport_started(&self);

    /// The transport reached quiescence and shut down cleanly.
    fn transport_stopped(&self);

    /// The transport failed; all streams were finished with `status`.
    fn transport_failed(&self, status: &Status);
}

/// Errors surfaced by [`Transport::start`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport already started")]
    AlreadyStarted,
    #[error("failed to connect")]
    Connect(#[source] io::Error),
}

struct Lifecycle {
    /// Next client-initiated stream id. Odd, monotonically increasing.
    next_stream_id: u32,
    /// Once set, no new streams are admitted.
    go_away: bool,
    /// Status used to finish streams rejected or aborted due to GOAWAY.
    go_away_status: Option<Status>,
    /// Terminal latch; set at most once.
    stopped: bool,
    phase: Phase,
}

pub(crate) struct TransportCore {
    address: Option<SocketAddr>,
    pub(crate) authority: String,
    codec: Option<Box<dyn Codec>>,
    listener: Box<dyn TransportListener>,
    state: Mutex<Lifecycle>,
    streams: Mutex<HashMap<u32, Arc<ClientStream>>>,
    writer: OnceLock<WriteQueue>,
    /// Reader parked until `start` hands it to the dispatcher (test mode).
    pending_reader: Mutex<Option<Box<dyn FrameReader>>>,
    socket: Mutex<Option<TcpStream>>,
}

/// A client-side RPC transport over a single HTTP/2 connection.
pub struct Transport {
    core: Arc<TransportCore>,
}

impl Transport {
    /// Transport that will dial `address` on [`start`](Self::start).
    pub fn new(
        address: SocketAddr,
        codec: Box<dyn Codec>,
        listener: Box<dyn TransportListener>,
    ) -> Self {
        let authority = format!("{}:{}", address.ip(), address.port());
        Self {
            core: Arc::new(TransportCore {
                address: Some(address),
                authority,
                codec: Some(codec),
                listener,
                state: Mutex::new(Lifecycle::new(3)),
                streams: Mutex::new(HashMap::new()),
                writer: OnceLock::new(),
                pending_reader: Mutex::new(None),
                socket: Mutex::new(None),
            }),
        }
    }

    /// Transport over a preconstructed reader/writer pair with a seeded
    /// stream id, for tests. `start` skips dialing and the preface.
    pub fn new_for_test(
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        next_stream_id: u32,
        listener: Box<dyn TransportListener>,
    ) -> Self {
        let core = Arc::new(TransportCore {
            address: None,
            authority: "test.invalid:80".to_string(),
            codec: None,
            listener,
            state: Mutex::new(Lifecycle::new(next_stream_id)),
            streams: Mutex::new(HashMap::new()),
            writer: OnceLock::new(),
            pending_reader: Mutex::new(Some(reader)),
            socket: Mutex::new(None),
        });
        let queue = WriteQueue::new(writer, abort_hook(&core));
        core.writer.set(queue).ok();
        Self { core }
    }

    /// Dial the peer (unless in test mode), send the connection preface and
    /// initial SETTINGS, and start the inbound dispatcher.
    pub fn start(&self) -> Result<(), TransportError> {
        {
            let mut state = self.core.state.lock();
            if state.phase != Phase::New {
                return Err(TransportError::AlreadyStarted);
            }
            state.phase = Phase::Running;
        }

        let reader = if self.core.address.is_some() {
            match self.dial() {
                Ok(reader) => reader,
                Err(e) => {
                    self.core
                        .on_go_away(0, Status::from_io_error(&e), true);
                    return Err(TransportError::Connect(e));
                }
            }
        } else {
            self.core
                .pending_reader
                .lock()
                .take()
                .expect("test transport has a reader")
        };

        let core = Arc::clone(&self.core);
        thread::Builder::new()
            .name("grpc-transport-reader".to_string())
            .spawn(move || run_dispatcher(core, reader))
            .expect("failed to spawn reader thread");

        debug!(authority = %self.core.authority, "transport started");
        self.core.listener.transport_started();
        Ok(())
    }

    fn dial(&self) -> io::Result<Box<dyn FrameReader>> {
        let address = self.core.address.expect("dialing transport has an address");
        let codec = self.core.codec.as_ref().expect("dialing transport has a codec");

        let socket = TcpStream::connect(address)?;
        let read_half = socket.try_clone()?;
        let write_half = socket.try_clone()?;
        *self.core.socket.lock() = Some(socket);

        let reader = codec.new_reader(Box::new(read_half));
        let writer = codec.new_writer(Box::new(write_half));
        let queue = WriteQueue::new(writer, abort_hook(&self.core));
        self.core.writer.set(queue).ok();

        let writer = self.core.writer();
        writer.connection_preface();
        writer.settings(Settings::default());
        writer.flush();
        Ok(reader)
    }

    /// Open a new stream for `method`.
    ///
    /// The returned stream already carries its terminal status if the
    /// transport is in GOAWAY mode; no frame reaches the wire in that case.
    pub fn new_stream(
        &self,
        method: &MethodDescriptor,
        metadata: &Metadata,
        listener: Box<dyn ClientStreamListener>,
    ) -> Arc<ClientStream> {
        self.core.new_stream(method, metadata, listener)
    }

    /// Begin graceful shutdown: send GOAWAY, refuse new streams, and stop
    /// once every open stream completes. Idempotent.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Abortive shutdown: finish every stream with a status derived from
    /// `cause` and tear the connection down.
    pub fn abort(&self, cause: io::Error) {
        error!(error = %cause, "transport aborted");
        self.core.on_go_away(0, Status::from_io_error(&cause), true);
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.core.state.lock().phase
    }

    /// Number of streams currently live on the wire.
    pub fn active_streams(&self) -> usize {
        self.core.streams.lock().len()
    }

    /// The `:authority` used for outbound requests.
    pub fn authority(&self) -> &str {
        &self.core.authority
    }
}

fn abort_hook(core: &Arc<TransportCore>) -> ErrorHook {
    let weak = Arc::downgrade(core);
    Arc::new(move |status: Status| {
        if let Some(core) = weak.upgrade() {
            core.on_go_away(0, status, true);
        }
    })
}

impl TransportCore {
    pub(crate) fn writer(&self) -> &WriteQueue {
        self.writer.get().expect("transport not started")
    }

    fn get_stream(&self, stream_id: u32) -> Option<Arc<ClientStream>> {
        self.streams.lock().get(&stream_id).cloned()
    }

    pub(crate) fn remove_stream(&self, stream_id: u32) -> Option<Arc<ClientStream>> {
        self.streams.lock().remove(&stream_id)
    }

    /// Remove a stream and, if it was live, deliver `status` to it.
    /// Returns whether the stream was live.
    pub(crate) fn finish_stream(&self, stream_id: u32, status: Option<Status>) -> bool {
        match self.remove_stream(stream_id) {
            Some(stream) => {
                if let Some(status) = status {
                    stream.set_status(status, Metadata::new());
                }
                true
            }
            None => false,
        }
    }

    fn new_stream(
        self: &Arc<Self>,
        method: &MethodDescriptor,
        metadata: &Metadata,
        listener: Box<dyn ClientStreamListener>,
    ) -> Arc<ClientStream> {
        let stream = ClientStream::new(self, listener);
        let exhausted = {
            let mut state = self.state.lock();
            if state.go_away {
                let status = state
                    .go_away_status
                    .clone()
                    .unwrap_or_else(|| Status::unavailable("Transport is closed"));
                drop(state);
                stream.set_status(status, Metadata::new());
                return stream;
            }

            // Assign the id and enqueue the HEADERS frame in one critical
            // section so stream ids appear on the wire in increasing order.
            let id = state.next_stream_id;
            stream.set_id(id);
            self.streams.lock().insert(id, Arc::clone(&stream));
            let exhausted = if state.next_stream_id >= MAX_STREAM_ID - 2 {
                state.go_away = true;
                state.go_away_status = Some(Status::internal("Stream id exhaust"));
                true
            } else {
                state.next_stream_id += 2;
                false
            };

            let block = headers::create_request_headers(metadata, &method.path(), &self.authority);
            self.writer().headers(id, block, true, false);
            exhausted
        };

        if exhausted {
            // The just-assigned stream stays valid; no live id exceeds the
            // 31-bit ceiling, so this only flips the transport into its
            // draining state.
            self.on_go_away(MAX_STREAM_ID, Status::internal("Stream id exhaust"), false);
        }
        stream
    }

    /// Enter GOAWAY mode: refuse future streams and finish every stream
    /// above `last_known_stream_id` with `status`.
    pub(crate) fn on_go_away(
        self: &Arc<Self>,
        last_known_stream_id: u32,
        status: Status,
        failure: bool,
    ) {
        let (to_fail, notify_failed) = {
            let mut state = self.state.lock();
            state.go_away = true;
            state.go_away_status = Some(status.clone());

            let mut to_fail = Vec::new();
            self.streams.lock().retain(|id, stream| {
                if *id > last_known_stream_id {
                    to_fail.push(Arc::clone(stream));
                    false
                } else {
                    true
                }
            });

            let notify_failed = match state.phase {
                Phase::New | Phase::Running => {
                    if failure {
                        state.phase = Phase::Failed;
                        true
                    } else {
                        state.phase = Phase::Stopping;
                        false
                    }
                }
                _ => false,
            };
            (to_fail, notify_failed)
        };

        if notify_failed {
            self.listener.transport_failed(&status);
        }
        for stream in to_fail {
            stream.set_status(status.clone(), Metadata::new());
        }
        self.stop_if_necessary();
    }

    fn stop(self: &Arc<Self>) {
        let normal_close = {
            let mut state = self.state.lock();
            if state.go_away {
                false
            } else {
                // Flag and frame go together under the lock so a concurrent
                // stop cannot send a second GOAWAY.
                state.go_away = true;
                state.go_away_status = Some(Status::internal("Transport stopped"));
                if let Some(writer) = self.writer.get() {
                    writer.go_away(0, ErrorCode::NoError, Vec::new());
                }
                true
            }
        };
        if normal_close {
            self.on_go_away(0, Status::internal("Transport stopped"), false);
        }
        self.stop_if_necessary();
    }

    /// Shut down once quiescent: GOAWAY mode entered and no live streams.
    /// Runs at most once.
    pub(crate) fn stop_if_necessary(&self) {
        let notify_stopped = {
            let mut state = self.state.lock();
            let quiescent = state.go_away && self.streams.lock().is_empty();
            if !quiescent || state.stopped {
                return;
            }
            state.stopped = true;
            if state.phase == Phase::Failed {
                false
            } else {
                state.phase = Phase::Stopped;
                true
            }
        };

        if let Some(writer) = self.writer.get() {
            writer.close();
        }
        if let Some(socket) = self.socket.lock().take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if notify_stopped {
            debug!("transport stopped");
            self.listener.transport_stopped();
        }
    }
}

fn run_dispatcher(core: Arc<TransportCore>, mut reader: Box<dyn FrameReader>) {
    let mut dispatcher = FrameDispatcher {
        core: Arc::clone(&core),
        connection_unacknowledged: 0,
    };
    loop {
        match reader.next_frame(&mut dispatcher) {
            Ok(true) => {}
            Ok(false) => {
                debug!("reader reached end of stream");
                core.on_go_away(0, Status::unavailable("End of stream"), true);
                return;
            }
            Err(e) => {
                error!(error = %e, "reader failed, aborting transport");
                core.on_go_away(0, Status::from_io_error(&e), true);
                return;
            }
        }
    }
}

/// Runs on the dispatcher thread; one method per inbound frame type.
struct FrameDispatcher {
    core: Arc<TransportCore>,
    /// Bytes received on any stream not yet acknowledged by a
    /// connection-level WINDOW_UPDATE. Only this thread touches it.
    connection_unacknowledged: u32,
}

impl FrameHandler for FrameDispatcher {
    fn data(&mut self, end_stream: bool, stream_id: u32, data: Bytes) {
        let Some(stream) = self.core.get_stream(stream_id) else {
            warn!(stream_id, "DATA for unknown stream");
            self.core
                .writer()
                .rst_stream(stream_id, ErrorCode::InvalidStream);
            return;
        };

        let length = data.len() as u32;
        stream.deliver_data(&self.core, data, end_stream, length);

        self.connection_unacknowledged += length;
        if self.connection_unacknowledged >= WINDOW_UPDATE_THRESHOLD {
            self.core
                .writer()
                .window_update(0, self.connection_unacknowledged as u64);
            self.connection_unacknowledged = 0;
        }
    }

    fn headers(&mut self, end_stream: bool, stream_id: u32, headers: Vec<Header>) {
        let Some(stream) = self.core.get_stream(stream_id) else {
            warn!(stream_id, "HEADERS for unknown stream");
            self.core
                .writer()
                .rst_stream(stream_id, ErrorCode::InvalidStream);
            return;
        };
        stream.deliver_headers(&self.core, headers, end_stream);
    }

    fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        debug!(stream_id, code = %error_code, "stream reset by peer");
        if self
            .core
            .finish_stream(stream_id, Some(error_code.to_status()))
        {
            self.core.stop_if_necessary();
        }
    }

    fn settings(&mut self, settings: Settings) {
        // The payload is acknowledged but not otherwise applied.
        self.core.writer().ack_settings(settings);
    }

    fn ack_settings(&mut self) {}

    fn ping(&mut self, ack: bool, payload1: u32, payload2: u32) {
        if !ack {
            self.core.writer().ping(true, payload1, payload2);
        }
    }

    fn go_away(&mut self, last_good_stream_id: u32, error_code: ErrorCode, _debug_data: Bytes) {
        debug!(last_good_stream_id, code = %error_code, "received GOAWAY");
        self.core
            .on_go_away(last_good_stream_id, Status::unavailable("Go away"), false);
    }

    fn push_promise(&mut self, _stream_id: u32, promised_stream_id: u32, _headers: Vec<Header>) {
        // Server-initiated streams are not accepted.
        self.core
            .writer()
            .rst_stream(promised_stream_id, ErrorCode::ProtocolError);
    }

    fn window_update(&mut self, _stream_id: u32, _delta: u64) {
        // Outbound flow control is not enforced.
    }

    fn priority(&mut self, _stream_id: u32, _dependency: u32, _weight: u8, _exclusive: bool) {}

    fn alternate_service(&mut self, _stream_id: u32, _origin: String, _protocol: Bytes) {}
}

impl Lifecycle {
    fn new(next_stream_id: u32) -> Self {
        Self {
            next_stream_id,
            go_away: false,
            go_away_status: None,
            stopped: false,
            phase: Phase::New,
        }
    }
}
