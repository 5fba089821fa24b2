//! Per-call stream state.
//!
//! A [`ClientStream`] is one logical RPC multiplexed over the connection.
//! Inbound delivery runs under the stream's monitor, a reentrant lock, so
//! listener callbacks for a stream are totally ordered and never concurrent,
//! and a listener may call back into its own stream (for example to cancel)
//! without deadlocking. The terminal status is delivered exactly once and is
//! always the last callback.

use crate::codec::{ErrorCode, Header};
use crate::completion::Completion;
use crate::frame::MessageDeframer;
use crate::metadata::{self, Metadata};
use crate::status::Status;
use crate::transport::{TransportCore, WINDOW_UPDATE_THRESHOLD};

use bytes::Bytes;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Inbound progress of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundPhase {
    /// Waiting for response headers.
    Headers,
    /// Headers seen; messages may arrive.
    Message,
    /// Trailers stashed; draining buffered messages.
    Status,
    /// Terminal status delivered.
    Closed,
}

/// Outbound progress of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundPhase {
    Headers,
    Message,
    Status,
}

/// Callback surface the application registers per stream.
///
/// Callbacks for one stream never run concurrently. `closed` is delivered
/// exactly once and nothing follows it.
pub trait ClientStreamListener: Send + Sync {
    /// Response headers arrived. Return a pending [`Completion`] to hold
    /// back buffered messages until header processing finishes.
    fn headers_read(&self, headers: Metadata) -> Option<Completion>;

    /// A complete message arrived. Return a pending [`Completion`] to pause
    /// further delivery and flow-control credit until the message is
    /// consumed.
    fn message_read(&self, message: Bytes) -> Option<Completion>;

    /// Terminal status, with whatever trailers the peer sent.
    fn closed(&self, status: Status, trailers: Metadata);
}

struct Inbound {
    deframer: MessageDeframer,
    inbound_phase: InboundPhase,
    outbound_phase: OutboundPhase,
    unacknowledged_bytes: u32,
    window_update_disabled: bool,
    trailers: Option<Metadata>,
    status_delivered: bool,
}

/// One logical call multiplexed over the transport.
pub struct ClientStream {
    transport: Weak<TransportCore>,
    /// 0 until assigned under the transport lock; immutable afterwards.
    id: AtomicU32,
    listener: Box<dyn ClientStreamListener>,
    monitor: ReentrantMutex<RefCell<Inbound>>,
}

impl ClientStream {
    pub(crate) fn new(
        transport: &Arc<TransportCore>,
        listener: Box<dyn ClientStreamListener>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport: Arc::downgrade(transport),
            id: AtomicU32::new(0),
            listener,
            monitor: ReentrantMutex::new(RefCell::new(Inbound {
                deframer: MessageDeframer::new(),
                inbound_phase: InboundPhase::Headers,
                outbound_phase: OutboundPhase::Headers,
                unacknowledged_bytes: 0,
                window_update_disabled: false,
                trailers: None,
                status_delivered: false,
            })),
        })
    }

    /// The assigned stream id, or 0 if the stream was never admitted.
    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub(crate) fn set_id(&self, id: u32) {
        assert_eq!(self.id(), 0, "stream id already assigned");
        self.id.store(id, Ordering::Release);
    }

    /// Whether the terminal status has been delivered.
    pub fn is_closed(&self) -> bool {
        self.monitor.lock().borrow().status_delivered
    }

    /// Write a DATA frame carrying `data`, followed by a flush.
    ///
    /// The stream must have an assigned id and the payload must be shorter
    /// than the writer's `max_data_length`; both are programming-error
    /// preconditions.
    pub fn send_frame(&self, data: &[u8], end_stream: bool) {
        let id = self.id();
        assert_ne!(id, 0, "stream id not assigned");
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        let writer = transport.writer();
        assert!(
            data.len() < writer.max_data_length(),
            "DATA payload of {} bytes exceeds max frame length {}",
            data.len(),
            writer.max_data_length()
        );
        {
            let guard = self.monitor.lock();
            guard.borrow_mut().outbound_phase = OutboundPhase::Message;
        }
        writer.data(end_stream, id, Bytes::copy_from_slice(data));
        writer.flush();
    }

    /// Cancel the call.
    ///
    /// Idempotent: at most one RST_STREAM reaches the wire, the listener
    /// sees CANCELLED at most once, and nothing follows it. A stream with no
    /// id must already be closed (the constructor failed it).
    pub fn cancel(&self) {
        let id = self.id();
        {
            let guard = self.monitor.lock();
            let mut inbound = guard.borrow_mut();
            if id == 0 {
                assert!(inbound.status_delivered, "an unclosed stream has no id");
            }
            inbound.outbound_phase = OutboundPhase::Status;
        }
        if id == 0 {
            return;
        }
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        if let Some(stream) = transport.remove_stream(id) {
            transport.writer().rst_stream(id, ErrorCode::Cancel);
            stream.set_status(ErrorCode::Cancel.to_status(), Metadata::new());
            transport.stop_if_necessary();
        }
    }

    /// Remove the stream from the transport once the peer's end-of-stream
    /// has been fully consumed. No RST_STREAM is sent.
    pub fn remote_end_closed(&self) {
        let id = self.id();
        if id == 0 {
            return;
        }
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        if transport.remove_stream(id).is_some() {
            transport.stop_if_necessary();
        }
    }

    /// Suppress per-stream WINDOW_UPDATE until `signal` resolves; the
    /// deferred update is emitted on resolution if the threshold is met.
    pub fn disable_window_update(self: &Arc<Self>, signal: Option<Completion>) {
        let Some(signal) = signal else {
            return;
        };
        if signal.is_done() {
            return;
        }
        {
            let guard = self.monitor.lock();
            guard.borrow_mut().window_update_disabled = true;
        }
        let stream = Arc::downgrade(self);
        signal.on_complete(move || {
            if let Some(stream) = stream.upgrade() {
                stream.window_update_enabled();
            }
        });
    }

    fn window_update_enabled(&self) {
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        let guard = self.monitor.lock();
        let mut inbound = guard.borrow_mut();
        inbound.window_update_disabled = false;
        if inbound.unacknowledged_bytes >= WINDOW_UPDATE_THRESHOLD {
            transport
                .writer()
                .window_update(self.id(), inbound.unacknowledged_bytes as u64);
            inbound.unacknowledged_bytes = 0;
        }
    }

    /// Deliver the terminal status to the listener. Exactly-once; later
    /// calls are ignored.
    pub(crate) fn set_status(&self, status: Status, trailers: Metadata) {
        let guard = self.monitor.lock();
        {
            let mut inbound = guard.borrow_mut();
            if inbound.status_delivered {
                return;
            }
            inbound.status_delivered = true;
            inbound.inbound_phase = InboundPhase::Closed;
            inbound.deframer.close();
        }
        self.listener.closed(status, trailers);
    }

    /// Hand an inbound DATA payload to the deframer and account receive
    /// flow control.
    pub(crate) fn deliver_data(
        self: &Arc<Self>,
        transport: &Arc<TransportCore>,
        data: Bytes,
        end_of_stream: bool,
        length: u32,
    ) {
        let guard = self.monitor.lock();
        {
            let mut inbound = guard.borrow_mut();
            if inbound.status_delivered {
                return;
            }
            inbound.deframer.deframe(&data, end_of_stream);
        }
        self.drain_deframer(transport, &guard);

        let mut inbound = guard.borrow_mut();
        if inbound.status_delivered {
            return;
        }
        inbound.unacknowledged_bytes += length;
        if !inbound.window_update_disabled
            && inbound.unacknowledged_bytes >= WINDOW_UPDATE_THRESHOLD
        {
            transport
                .writer()
                .window_update(self.id(), inbound.unacknowledged_bytes as u64);
            inbound.unacknowledged_bytes = 0;
        }
    }

    /// Deliver an inbound header block.
    ///
    /// The first block is the response headers; delivery may gate buffered
    /// messages on the listener's completion signal so headers stay ahead of
    /// messages in listener-visible order. A block with `end_of_stream` is
    /// the trailers: stash them and flush the deframer pipeline.
    pub(crate) fn deliver_headers(
        self: &Arc<Self>,
        transport: &Arc<TransportCore>,
        headers: Vec<Header>,
        end_of_stream: bool,
    ) {
        let guard = self.monitor.lock();
        let deliver_headers = {
            let mut inbound = guard.borrow_mut();
            if inbound.status_delivered {
                return;
            }
            if inbound.inbound_phase == InboundPhase::Headers {
                inbound.inbound_phase = InboundPhase::Message;
                !end_of_stream
            } else {
                false
            }
        };

        if deliver_headers {
            let signal = self.listener.headers_read(Metadata::from_headers(&headers));
            if let Some(signal) = signal {
                if !signal.is_done() {
                    guard.borrow_mut().deframer.pause();
                    let stream = Arc::downgrade(self);
                    signal.on_complete(move || {
                        if let Some(stream) = stream.upgrade() {
                            stream.resume_delivery();
                        }
                    });
                }
            }
        }

        if end_of_stream {
            {
                let mut inbound = guard.borrow_mut();
                inbound.trailers = Some(Metadata::from_headers(&headers));
                inbound.inbound_phase = InboundPhase::Status;
                inbound.deframer.deframe(&[], true);
            }
            self.drain_deframer(transport, &guard);
        }
    }

    /// Re-enable delivery after a gating signal resolves: flow-control
    /// credit first, then the paused deframer.
    fn resume_delivery(self: &Arc<Self>) {
        let Some(transport) = self.transport.upgrade() else {
            return;
        };
        let guard = self.monitor.lock();
        {
            let mut inbound = guard.borrow_mut();
            if inbound.status_delivered {
                return;
            }
            inbound.window_update_disabled = false;
            if inbound.unacknowledged_bytes >= WINDOW_UPDATE_THRESHOLD {
                transport
                    .writer()
                    .window_update(self.id(), inbound.unacknowledged_bytes as u64);
                inbound.unacknowledged_bytes = 0;
            }
            inbound.deframer.resume();
        }
        self.drain_deframer(&transport, &guard);
    }

    /// Pump buffered messages out of the deframer to the listener, stopping
    /// at a gate, at end of input, or at stream completion.
    ///
    /// Callers hold the monitor; `RefCell` borrows stay scoped so listener
    /// callbacks can reenter the stream.
    fn drain_deframer(self: &Arc<Self>, transport: &Arc<TransportCore>, cell: &RefCell<Inbound>) {
        loop {
            let step = {
                let mut inbound = cell.borrow_mut();
                if inbound.status_delivered {
                    return;
                }
                match inbound.deframer.next_message() {
                    Ok(Some(message)) => Step::Deliver(message),
                    Ok(None) => {
                        if inbound.deframer.is_paused() || inbound.deframer.is_closed() {
                            Step::Idle
                        } else if inbound.deframer.end_of_stream_reached() {
                            let trailers = inbound.trailers.take().unwrap_or_default();
                            let status = metadata::status_from_trailers(&trailers);
                            Step::Complete(status, trailers)
                        } else if inbound.deframer.end_of_stream_mid_message() {
                            Step::Fail(
                                Status::internal("end of stream mid-message"),
                                ErrorCode::InternalError,
                            )
                        } else {
                            Step::Idle
                        }
                    }
                    Err(e) => {
                        Step::Fail(Status::internal(e.to_string()), ErrorCode::FlowControlError)
                    }
                }
            };

            match step {
                Step::Idle => return,
                Step::Deliver(message) => {
                    let signal = self.listener.message_read(message);
                    if let Some(signal) = signal {
                        if !signal.is_done() {
                            {
                                let mut inbound = cell.borrow_mut();
                                inbound.deframer.pause();
                                inbound.window_update_disabled = true;
                            }
                            let stream = Arc::downgrade(self);
                            signal.on_complete(move || {
                                if let Some(stream) = stream.upgrade() {
                                    stream.resume_delivery();
                                }
                            });
                            return;
                        }
                    }
                }
                Step::Complete(status, trailers) => {
                    self.set_status(status, trailers);
                    self.remote_end_closed();
                    return;
                }
                Step::Fail(status, error_code) => {
                    let id = self.id();
                    if id != 0 && transport.remove_stream(id).is_some() {
                        transport.writer().rst_stream(id, error_code);
                    }
                    self.set_status(status, Metadata::new());
                    transport.stop_if_necessary();
                    return;
                }
            }
        }
    }

    /// Current inbound phase.
    pub fn inbound_phase(&self) -> InboundPhase {
        self.monitor.lock().borrow().inbound_phase
    }

    /// Current outbound phase.
    pub fn outbound_phase(&self) -> OutboundPhase {
        self.monitor.lock().borrow().outbound_phase
    }
}

enum Step {
    Deliver(Bytes),
    Complete(Status, Metadata),
    Fail(Status, ErrorCode),
    Idle,
}
