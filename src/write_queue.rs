//! The write serializer.
//!
//! All outbound frames, whether from application threads or the inbound
//! dispatcher, are enqueued here and applied to the codec writer by a single
//! writer thread in FIFO order. Callers never block on the socket.
//!
//! The queue is bounded. A full queue means the peer is not draining; rather
//! than block the caller, the enqueue aborts the transport. The writer
//! thread also flushes whenever it drains the queue dry, coalescing flushes
//! across bursts of frames.

use crate::codec::{ErrorCode, FrameWriter, Header, Settings};
use crate::status::Status;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError, sync_channel};
use std::thread::{self, JoinHandle};
use tracing::error;

/// Maximum number of queued frame writes before enqueueing aborts the
/// transport.
const QUEUE_CAPACITY: usize = 1024;

/// Invoked when the writer fails; the transport aborts with the status.
pub(crate) type ErrorHook = Arc<dyn Fn(Status) + Send + Sync>;

enum WriteOp {
    Preface,
    Settings(Settings),
    AckSettings(Settings),
    Ping {
        ack: bool,
        payload1: u32,
        payload2: u32,
    },
    Headers {
        stream_id: u32,
        headers: Vec<Header>,
        end_headers: bool,
        end_stream: bool,
    },
    Data {
        end_stream: bool,
        stream_id: u32,
        data: Bytes,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    GoAway {
        last_good_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u64,
    },
    Flush,
    Close,
}

/// Serializes frame writes from many callers onto one codec writer.
pub(crate) struct WriteQueue {
    tx: SyncSender<WriteOp>,
    max_data_length: usize,
    closed: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    on_error: ErrorHook,
}

impl WriteQueue {
    /// Take ownership of the codec writer and start the writer thread.
    pub(crate) fn new(writer: Box<dyn FrameWriter>, on_error: ErrorHook) -> Self {
        let (tx, rx) = sync_channel(QUEUE_CAPACITY);
        let max_data_length = writer.max_data_length();
        let closed = Arc::new(AtomicBool::new(false));

        let thread_closed = Arc::clone(&closed);
        let thread_hook = Arc::clone(&on_error);
        let handle = thread::Builder::new()
            .name("grpc-transport-writer".to_string())
            .spawn(move || run_writer(writer, rx, thread_closed, thread_hook))
            .expect("failed to spawn writer thread");

        Self {
            tx,
            max_data_length,
            closed,
            handle: Mutex::new(Some(handle)),
            on_error,
        }
    }

    /// Largest DATA payload the underlying writer accepts.
    pub(crate) fn max_data_length(&self) -> usize {
        self.max_data_length
    }

    pub(crate) fn connection_preface(&self) {
        self.enqueue(WriteOp::Preface);
    }

    pub(crate) fn settings(&self, settings: Settings) {
        self.enqueue(WriteOp::Settings(settings));
    }

    pub(crate) fn ack_settings(&self, settings: Settings) {
        self.enqueue(WriteOp::AckSettings(settings));
    }

    pub(crate) fn ping(&self, ack: bool, payload1: u32, payload2: u32) {
        self.enqueue(WriteOp::Ping {
            ack,
            payload1,
            payload2,
        });
    }

    pub(crate) fn headers(
        &self,
        stream_id: u32,
        headers: Vec<Header>,
        end_headers: bool,
        end_stream: bool,
    ) {
        self.enqueue(WriteOp::Headers {
            stream_id,
            headers,
            end_headers,
            end_stream,
        });
    }

    pub(crate) fn data(&self, end_stream: bool, stream_id: u32, data: Bytes) {
        self.enqueue(WriteOp::Data {
            end_stream,
            stream_id,
            data,
        });
    }

    pub(crate) fn rst_stream(&self, stream_id: u32, error_code: ErrorCode) {
        self.enqueue(WriteOp::RstStream {
            stream_id,
            error_code,
        });
    }

    pub(crate) fn go_away(
        &self,
        last_good_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    ) {
        self.enqueue(WriteOp::GoAway {
            last_good_stream_id,
            error_code,
            debug_data,
        });
    }

    pub(crate) fn window_update(&self, stream_id: u32, delta: u64) {
        self.enqueue(WriteOp::WindowUpdate { stream_id, delta });
    }

    pub(crate) fn flush(&self) {
        self.enqueue(WriteOp::Flush);
    }

    /// Drain outstanding writes, release the codec writer, and stop the
    /// writer thread. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.handle.lock().take();
        let on_writer_thread = handle
            .as_ref()
            .is_none_or(|h| h.thread().id() == thread::current().id());
        if on_writer_thread {
            // Closing from within the writer thread itself (abort raised by
            // a failed write): the drain loop sees the closed flag once the
            // current operation returns.
            let _ = self.tx.try_send(WriteOp::Close);
            return;
        }
        let _ = self.tx.send(WriteOp::Close);
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn enqueue(&self, op: WriteOp) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                error!("write queue overflow, aborting transport");
                // The caller may hold the transport lock; the abort must not
                // reenter it from this stack.
                let hook = Arc::clone(&self.on_error);
                let _ = thread::Builder::new()
                    .name("grpc-transport-abort".to_string())
                    .spawn(move || hook(Status::unavailable("Write queue overflow")));
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

fn run_writer(
    mut writer: Box<dyn FrameWriter>,
    rx: Receiver<WriteOp>,
    closed: Arc<AtomicBool>,
    on_error: ErrorHook,
) {
    let mut failed = false;
    let mut dirty = false;
    loop {
        if closed.load(Ordering::SeqCst) {
            // Drain whatever is already queued, then release the writer.
            while let Ok(op) = rx.try_recv() {
                if matches!(op, WriteOp::Close) {
                    break;
                }
                if !failed {
                    failed = apply(&mut *writer, op, &on_error).is_err();
                }
            }
            if !failed {
                let _ = writer.flush();
            }
            let _ = writer.close();
            return;
        }

        let op = match rx.try_recv() {
            Ok(op) => op,
            Err(TryRecvError::Empty) => {
                // Queue ran dry: flush what was written, then block.
                if !failed && dirty {
                    if let Err(e) = writer.flush() {
                        failed = true;
                        report(&on_error, e);
                    }
                    dirty = false;
                }
                match rx.recv() {
                    Ok(op) => op,
                    Err(_) => {
                        let _ = writer.close();
                        return;
                    }
                }
            }
            Err(TryRecvError::Disconnected) => {
                let _ = writer.close();
                return;
            }
        };

        match op {
            WriteOp::Close => {
                if !failed {
                    let _ = writer.flush();
                }
                let _ = writer.close();
                return;
            }
            op => {
                if failed {
                    continue;
                }
                dirty = true;
                failed = apply(&mut *writer, op, &on_error).is_err();
            }
        }
    }
}

fn apply(writer: &mut dyn FrameWriter, op: WriteOp, on_error: &ErrorHook) -> Result<(), ()> {
    let result = match op {
        WriteOp::Preface => writer.connection_preface(),
        WriteOp::Settings(settings) => writer.settings(&settings),
        WriteOp::AckSettings(settings) => writer.ack_settings(&settings),
        WriteOp::Ping {
            ack,
            payload1,
            payload2,
        } => writer.ping(ack, payload1, payload2),
        WriteOp::Headers {
            stream_id,
            headers,
            end_headers,
            end_stream,
        } => writer.headers(stream_id, headers, end_headers, end_stream),
        WriteOp::Data {
            end_stream,
            stream_id,
            data,
        } => writer.data(end_stream, stream_id, &data),
        WriteOp::RstStream {
            stream_id,
            error_code,
        } => writer.rst_stream(stream_id, error_code),
        WriteOp::GoAway {
            last_good_stream_id,
            error_code,
            debug_data,
        } => writer.go_away(last_good_stream_id, error_code, &debug_data),
        WriteOp::WindowUpdate { stream_id, delta } => writer.window_update(stream_id, delta),
        WriteOp::Flush => writer.flush(),
        WriteOp::Close => unreachable!("Close handled by the drain loop"),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            report(on_error, e);
            Err(())
        }
    }
}

fn report(on_error: &ErrorHook, error: std::io::Error) {
    error!(error = %error, "frame write failed, aborting transport");
    (on_error)(Status::from_io_error(&error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Clone, Default)]
    struct RecordingWriter {
        ops: Arc<Mutex<Vec<String>>>,
        fail_on_data: bool,
    }

    impl FrameWriter for RecordingWriter {
        fn connection_preface(&mut self) -> io::Result<()> {
            self.ops.lock().push("preface".into());
            Ok(())
        }

        fn settings(&mut self, _settings: &Settings) -> io::Result<()> {
            self.ops.lock().push("settings".into());
            Ok(())
        }

        fn ack_settings(&mut self, _settings: &Settings) -> io::Result<()> {
            self.ops.lock().push("ack_settings".into());
            Ok(())
        }

        fn ping(&mut self, ack: bool, payload1: u32, payload2: u32) -> io::Result<()> {
            self.ops
                .lock()
                .push(format!("ping {} {} {}", ack, payload1, payload2));
            Ok(())
        }

        fn headers(
            &mut self,
            stream_id: u32,
            _headers: Vec<Header>,
            _end_headers: bool,
            end_stream: bool,
        ) -> io::Result<()> {
            self.ops
                .lock()
                .push(format!("headers {} {}", stream_id, end_stream));
            Ok(())
        }

        fn data(&mut self, end_stream: bool, stream_id: u32, data: &[u8]) -> io::Result<()> {
            if self.fail_on_data {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            self.ops
                .lock()
                .push(format!("data {} {} {}", stream_id, data.len(), end_stream));
            Ok(())
        }

        fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> io::Result<()> {
            self.ops
                .lock()
                .push(format!("rst_stream {} {}", stream_id, error_code));
            Ok(())
        }

        fn go_away(
            &mut self,
            last_good_stream_id: u32,
            error_code: ErrorCode,
            _debug_data: &[u8],
        ) -> io::Result<()> {
            self.ops
                .lock()
                .push(format!("go_away {} {}", last_good_stream_id, error_code));
            Ok(())
        }

        fn window_update(&mut self, stream_id: u32, delta: u64) -> io::Result<()> {
            self.ops
                .lock()
                .push(format!("window_update {} {}", stream_id, delta));
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.ops.lock().push("flush".into());
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.ops.lock().push("close".into());
            Ok(())
        }

        fn max_data_length(&self) -> usize {
            16384
        }
    }

    fn noop_hook() -> ErrorHook {
        Arc::new(|_status| {})
    }

    #[test]
    fn test_ops_applied_in_fifo_order() {
        let writer = RecordingWriter::default();
        let ops = writer.ops.clone();
        let queue = WriteQueue::new(Box::new(writer), noop_hook());

        queue.connection_preface();
        queue.settings(Settings::default());
        queue.headers(3, vec![Header::new(":method", "POST")], true, false);
        queue.data(true, 3, Bytes::from_static(b"payload"));
        queue.close();

        let ops = ops.lock();
        let frame_ops: Vec<&String> = ops.iter().filter(|op| *op != "flush").collect();
        assert_eq!(
            frame_ops,
            vec!["preface", "settings", "headers 3 false", "data 3 7 true", "close"]
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let writer = RecordingWriter::default();
        let ops = writer.ops.clone();
        let queue = WriteQueue::new(Box::new(writer), noop_hook());

        queue.close();
        queue.close();

        let closes = ops.lock().iter().filter(|op| *op == "close").count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn test_writes_after_close_are_dropped() {
        let writer = RecordingWriter::default();
        let ops = writer.ops.clone();
        let queue = WriteQueue::new(Box::new(writer), noop_hook());

        queue.close();
        queue.ping(false, 1, 2);

        assert!(!ops.lock().iter().any(|op| op.starts_with("ping")));
    }

    #[test]
    fn test_write_failure_invokes_error_hook() {
        let writer = RecordingWriter {
            fail_on_data: true,
            ..Default::default()
        };
        let ops = writer.ops.clone();
        let reported: Arc<Mutex<Vec<Status>>> = Arc::new(Mutex::new(Vec::new()));
        let reported2 = reported.clone();
        let hook: ErrorHook = Arc::new(move |status| reported2.lock().push(status));
        let queue = WriteQueue::new(Box::new(writer), hook);

        queue.data(false, 3, Bytes::from_static(b"boom"));
        queue.ping(false, 1, 2);
        queue.close();

        let reported = reported.lock();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].code(), crate::status::Code::Unavailable);
        // Ops after the failure are dropped.
        assert!(!ops.lock().iter().any(|op| op.starts_with("ping")));
    }

    #[test]
    fn test_max_data_length_cached() {
        let queue = WriteQueue::new(Box::new(RecordingWriter::default()), noop_hook());
        assert_eq!(queue.max_data_length(), 16384);
        queue.close();
    }
}
