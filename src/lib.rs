//! grpc-transport - client-side gRPC transport over HTTP/2.
//!
//! This crate multiplexes many concurrent logical RPC calls over a single
//! HTTP/2 connection. Each call gets an ordered, flow-controlled,
//! cancellable message channel; the transport translates calls into frames
//! and demultiplexes inbound frames back to the right call.
//!
//! The wire codec is not included: the transport drives a codec supplied by
//! the embedding application through the [`FrameReader`] and [`FrameWriter`]
//! traits, which exchange typed frames. HPACK, TLS, and serialization all
//! live outside this crate.
//!
//! # Architecture
//!
//! - `codec`: the typed frame vocabulary and the codec boundary traits
//! - `write_queue`: serializes all outbound frames onto one writer thread
//! - `transport`: stream registry, inbound dispatcher, lifecycle and GOAWAY
//! - `stream`: per-call state, inbound delivery, receive flow control
//! - `frame`: message-boundary recovery over DATA payloads
//! - `status`, `metadata`, `headers`: the gRPC-facing vocabulary
//!
//! Three roles cooperate at runtime: application threads create streams,
//! send messages, and cancel; a single dispatcher thread reads frames and
//! runs the per-frame handlers; a single writer thread drains the write
//! queue. Only the dispatcher blocks on socket reads and only the writer
//! blocks on socket writes.

mod codec;
mod completion;
mod frame;
mod headers;
mod metadata;
mod status;
mod stream;
mod transport;
mod write_queue;

pub use codec::{Codec, ErrorCode, FrameHandler, FrameReader, FrameWriter, Header, Settings};
pub use completion::Completion;
pub use frame::{HEADER_SIZE, MAX_MESSAGE_SIZE, MessageDeframer, encode_message};
pub use headers::{MethodDescriptor, create_request_headers};
pub use metadata::{Metadata, status_from_trailers};
pub use status::{Code, Status};
pub use stream::{ClientStream, ClientStreamListener, InboundPhase, OutboundPhase};
pub use transport::{
    DEFAULT_INITIAL_WINDOW_SIZE, Phase, Transport, TransportError, TransportListener,
};
