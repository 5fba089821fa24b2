//! The frame codec boundary.
//!
//! The transport does not parse or serialize HTTP/2 frames itself. It talks
//! to a codec through the [`FrameReader`] and [`FrameWriter`] traits, which
//! deliver and accept typed frames. HPACK and the wire format live behind
//! this boundary.
//!
//! [`FrameWriter`] implementations are driven from a single thread (the
//! write queue guarantees this). [`FrameReader::next_frame`] is blocking and
//! is called only from the inbound dispatcher.

use crate::status::Status;

use bytes::Bytes;
use std::io;

/// A single header field as carried by HEADERS and PUSH_PROMISE frames.
///
/// Names and values are opaque byte strings; HPACK has already been applied
/// (inbound) or will be applied (outbound) by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header name. Lowercase ASCII for HTTP/2.
    pub name: Vec<u8>,
    /// Header value.
    pub value: Vec<u8>,
}

impl Header {
    /// Create a new header field.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// SETTINGS frame payload.
///
/// The transport acknowledges peer settings but does not otherwise apply
/// them; in particular a peer change to `initial_window_size` is not pushed
/// down into per-stream windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Settings {
    /// SETTINGS_HEADER_TABLE_SIZE.
    pub header_table_size: Option<u32>,
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: Option<u32>,
    /// SETTINGS_INITIAL_WINDOW_SIZE.
    pub initial_window_size: Option<u32>,
    /// SETTINGS_MAX_FRAME_SIZE.
    pub max_frame_size: Option<u32>,
}

/// Stream error codes carried by RST_STREAM and GOAWAY frames.
///
/// The set is wider than RFC 7540 section 7: it keeps the SPDY-era codes
/// (INVALID_STREAM, UNSUPPORTED_VERSION, STREAM_IN_USE, STREAM_ALREADY_CLOSED,
/// INVALID_CREDENTIALS) because the transport's status mapping distinguishes
/// them. Codes without an HTTP/2 wire value collapse to PROTOCOL_ERROR when
/// encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Graceful shutdown.
    NoError,
    /// Protocol error detected.
    ProtocolError,
    /// Frame received for a stream that is not open.
    InvalidStream,
    /// Peer speaks an unsupported protocol version.
    UnsupportedVersion,
    /// Stream identifier already in use.
    StreamInUse,
    /// Frame received for a stream that already closed.
    StreamAlreadyClosed,
    /// Implementation fault.
    InternalError,
    /// Flow control limits exceeded.
    FlowControlError,
    /// Frame received for a half-closed stream.
    StreamClosed,
    /// Frame size incorrect.
    FrameTooLarge,
    /// Stream not processed.
    RefusedStream,
    /// Stream cancelled.
    Cancel,
    /// Compression state not updated.
    CompressionError,
    /// TCP connection error on a CONNECT request.
    ConnectError,
    /// Processing capacity exceeded.
    EnhanceYourCalm,
    /// Negotiated TLS requirements not met.
    InadequateSecurity,
    /// Credentials rejected by the peer.
    InvalidCredentials,
    /// Wire code not recognized by this implementation.
    Unknown,
}

impl ErrorCode {
    /// Decode an HTTP/2 wire error code.
    pub fn from_wire(code: u32) -> Self {
        match code {
            0x0 => ErrorCode::NoError,
            0x1 => ErrorCode::ProtocolError,
            0x2 => ErrorCode::InternalError,
            0x3 => ErrorCode::FlowControlError,
            0x5 => ErrorCode::StreamClosed,
            0x6 => ErrorCode::FrameTooLarge,
            0x7 => ErrorCode::RefusedStream,
            0x8 => ErrorCode::Cancel,
            0x9 => ErrorCode::CompressionError,
            0xa => ErrorCode::ConnectError,
            0xb => ErrorCode::EnhanceYourCalm,
            0xc => ErrorCode::InadequateSecurity,
            _ => ErrorCode::Unknown,
        }
    }

    /// Encode to an HTTP/2 wire error code.
    pub fn to_wire(self) -> u32 {
        match self {
            ErrorCode::NoError => 0x0,
            ErrorCode::ProtocolError
            | ErrorCode::InvalidStream
            | ErrorCode::UnsupportedVersion
            | ErrorCode::StreamInUse
            | ErrorCode::StreamAlreadyClosed
            | ErrorCode::InvalidCredentials => 0x1,
            ErrorCode::InternalError | ErrorCode::Unknown => 0x2,
            ErrorCode::FlowControlError => 0x3,
            ErrorCode::StreamClosed => 0x5,
            ErrorCode::FrameTooLarge => 0x6,
            ErrorCode::RefusedStream => 0x7,
            ErrorCode::Cancel => 0x8,
            ErrorCode::CompressionError => 0x9,
            ErrorCode::ConnectError => 0xa,
            ErrorCode::EnhanceYourCalm => 0xb,
            ErrorCode::InadequateSecurity => 0xc,
        }
    }

    /// Map a peer-visible error code to the logical status taxonomy.
    pub fn to_status(self) -> Status {
        match self {
            ErrorCode::NoError => Status::ok(),
            ErrorCode::ProtocolError => Status::internal("Protocol error"),
            ErrorCode::InvalidStream => Status::internal("Invalid stream"),
            ErrorCode::UnsupportedVersion => Status::internal("Unsupported version"),
            ErrorCode::StreamInUse => Status::internal("Stream in use"),
            ErrorCode::StreamAlreadyClosed => Status::internal("Stream already closed"),
            ErrorCode::InternalError => Status::internal("Internal error"),
            ErrorCode::FlowControlError => Status::internal("Flow control error"),
            ErrorCode::StreamClosed => Status::internal("Stream closed"),
            ErrorCode::FrameTooLarge => Status::internal("Frame too large"),
            ErrorCode::RefusedStream => Status::internal("Refused stream"),
            ErrorCode::Cancel => Status::cancelled("Cancelled"),
            ErrorCode::CompressionError => Status::internal("Compression error"),
            ErrorCode::ConnectError => Status::internal("Connect error"),
            ErrorCode::EnhanceYourCalm => Status::internal("Enhance your calm"),
            ErrorCode::InadequateSecurity => Status::internal("Inadequate security"),
            ErrorCode::InvalidCredentials => Status::permission_denied("Invalid credentials"),
            ErrorCode::Unknown => Status::internal("Unknown error code"),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InvalidStream => "INVALID_STREAM",
            ErrorCode::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorCode::StreamInUse => "STREAM_IN_USE",
            ErrorCode::StreamAlreadyClosed => "STREAM_ALREADY_CLOSED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameTooLarge => "FRAME_TOO_LARGE",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

/// Callback surface invoked by [`FrameReader::next_frame`], one method per
/// frame type.
pub trait FrameHandler {
    /// DATA frame. The handler takes ownership of the payload.
    fn data(&mut self, end_stream: bool, stream_id: u32, data: Bytes);

    /// HEADERS frame (or a completed HEADERS + CONTINUATION sequence).
    fn headers(&mut self, end_stream: bool, stream_id: u32, headers: Vec<Header>);

    /// RST_STREAM frame.
    fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode);

    /// SETTINGS frame (not an ACK).
    fn settings(&mut self, settings: Settings);

    /// SETTINGS ACK frame.
    fn ack_settings(&mut self);

    /// PING frame with its two payload words.
    fn ping(&mut self, ack: bool, payload1: u32, payload2: u32);

    /// GOAWAY frame.
    fn go_away(&mut self, last_good_stream_id: u32, error_code: ErrorCode, debug_data: Bytes);

    /// PUSH_PROMISE frame.
    fn push_promise(&mut self, stream_id: u32, promised_stream_id: u32, headers: Vec<Header>);

    /// WINDOW_UPDATE frame. Stream id 0 means connection level.
    fn window_update(&mut self, stream_id: u32, delta: u64);

    /// PRIORITY frame.
    fn priority(&mut self, stream_id: u32, dependency: u32, weight: u8, exclusive: bool);

    /// ALTSVC frame.
    fn alternate_service(&mut self, stream_id: u32, origin: String, protocol: Bytes);
}

/// Blocking reader half of the codec.
pub trait FrameReader: Send {
    /// Read and dispatch the next frame.
    ///
    /// Blocks until a frame is available, invokes the matching handler
    /// method, and returns `Ok(true)`. Returns `Ok(false)` on clean EOF and
    /// `Err` on an I/O or framing error.
    fn next_frame(&mut self, handler: &mut dyn FrameHandler) -> io::Result<bool>;
}

/// Writer half of the codec. Single-threaded use only; the write queue owns
/// the sole reference.
pub trait FrameWriter: Send {
    /// Write the client connection preface.
    fn connection_preface(&mut self) -> io::Result<()>;

    /// Write a SETTINGS frame.
    fn settings(&mut self, settings: &Settings) -> io::Result<()>;

    /// Write a SETTINGS ACK for previously received settings.
    fn ack_settings(&mut self, settings: &Settings) -> io::Result<()>;

    /// Write a PING frame.
    fn ping(&mut self, ack: bool, payload1: u32, payload2: u32) -> io::Result<()>;

    /// Write a HEADERS frame opening or continuing a stream.
    fn headers(
        &mut self,
        stream_id: u32,
        headers: Vec<Header>,
        end_headers: bool,
        end_stream: bool,
    ) -> io::Result<()>;

    /// Write a DATA frame. The payload must be shorter than
    /// [`max_data_length`](Self::max_data_length).
    fn data(&mut self, end_stream: bool, stream_id: u32, data: &[u8]) -> io::Result<()>;

    /// Write a RST_STREAM frame.
    fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> io::Result<()>;

    /// Write a GOAWAY frame.
    fn go_away(
        &mut self,
        last_good_stream_id: u32,
        error_code: ErrorCode,
        debug_data: &[u8],
    ) -> io::Result<()>;

    /// Write a WINDOW_UPDATE frame. Stream id 0 means connection level.
    fn window_update(&mut self, stream_id: u32, delta: u64) -> io::Result<()>;

    /// Flush buffered frames to the socket.
    fn flush(&mut self) -> io::Result<()>;

    /// Release the underlying sink.
    fn close(&mut self) -> io::Result<()>;

    /// Largest DATA payload this writer accepts.
    fn max_data_length(&self) -> usize;
}

/// Factory producing a reader/writer pair over a freshly dialed socket.
pub trait Codec: Send + Sync {
    /// Build the reader half over the socket's read side.
    fn new_reader(&self, source: Box<dyn io::Read + Send>) -> Box<dyn FrameReader>;

    /// Build the writer half over the socket's write side.
    fn new_writer(&self, sink: Box<dyn io::Write + Send>) -> Box<dyn FrameWriter>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_error_code_from_wire() {
        assert_eq!(ErrorCode::from_wire(0x0), ErrorCode::NoError);
        assert_eq!(ErrorCode::from_wire(0x1), ErrorCode::ProtocolError);
        assert_eq!(ErrorCode::from_wire(0x2), ErrorCode::InternalError);
        assert_eq!(ErrorCode::from_wire(0x3), ErrorCode::FlowControlError);
        assert_eq!(ErrorCode::from_wire(0x5), ErrorCode::StreamClosed);
        assert_eq!(ErrorCode::from_wire(0x6), ErrorCode::FrameTooLarge);
        assert_eq!(ErrorCode::from_wire(0x7), ErrorCode::RefusedStream);
        assert_eq!(ErrorCode::from_wire(0x8), ErrorCode::Cancel);
        assert_eq!(ErrorCode::from_wire(0x9), ErrorCode::CompressionError);
        assert_eq!(ErrorCode::from_wire(0xa), ErrorCode::ConnectError);
        assert_eq!(ErrorCode::from_wire(0xb), ErrorCode::EnhanceYourCalm);
        assert_eq!(ErrorCode::from_wire(0xc), ErrorCode::InadequateSecurity);
    }

    #[test]
    fn test_error_code_from_wire_unknown() {
        assert_eq!(ErrorCode::from_wire(0x4), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_wire(0xd), ErrorCode::Unknown);
        assert_eq!(ErrorCode::from_wire(0xffff), ErrorCode::Unknown);
    }

    #[test]
    fn test_error_code_wire_roundtrip_for_http2_codes() {
        let codes = [
            ErrorCode::NoError,
            ErrorCode::ProtocolError,
            ErrorCode::InternalError,
            ErrorCode::FlowControlError,
            ErrorCode::StreamClosed,
            ErrorCode::FrameTooLarge,
            ErrorCode::RefusedStream,
            ErrorCode::Cancel,
            ErrorCode::CompressionError,
            ErrorCode::ConnectError,
            ErrorCode::EnhanceYourCalm,
            ErrorCode::InadequateSecurity,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_wire(code.to_wire()), code);
        }
    }

    #[test]
    fn test_spdy_era_codes_collapse_on_the_wire() {
        assert_eq!(ErrorCode::InvalidStream.to_wire(), 0x1);
        assert_eq!(ErrorCode::StreamInUse.to_wire(), 0x1);
        assert_eq!(ErrorCode::InvalidCredentials.to_wire(), 0x1);
    }

    #[test]
    fn test_status_mapping_no_error() {
        let status = ErrorCode::NoError.to_status();
        assert!(status.is_ok());
    }

    #[test]
    fn test_status_mapping_cancel() {
        let status = ErrorCode::Cancel.to_status();
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.message(), Some("Cancelled"));
    }

    #[test]
    fn test_status_mapping_invalid_credentials() {
        let status = ErrorCode::InvalidCredentials.to_status();
        assert_eq!(status.code(), Code::PermissionDenied);
        assert_eq!(status.message(), Some("Invalid credentials"));
    }

    #[test]
    fn test_status_mapping_all_other_known_codes_are_internal() {
        let codes = [
            ErrorCode::ProtocolError,
            ErrorCode::InvalidStream,
            ErrorCode::UnsupportedVersion,
            ErrorCode::StreamInUse,
            ErrorCode::StreamAlreadyClosed,
            ErrorCode::InternalError,
            ErrorCode::FlowControlError,
            ErrorCode::StreamClosed,
            ErrorCode::FrameTooLarge,
            ErrorCode::RefusedStream,
            ErrorCode::CompressionError,
            ErrorCode::ConnectError,
            ErrorCode::EnhanceYourCalm,
            ErrorCode::InadequateSecurity,
        ];
        for code in codes {
            let status = code.to_status();
            assert_eq!(status.code(), Code::Internal, "{}", code);
            assert!(status.message().is_some());
        }
    }

    #[test]
    fn test_status_mapping_unknown_code_is_internal_generic() {
        let status = ErrorCode::from_wire(0x4242).to_status();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), Some("Unknown error code"));
    }

    #[test]
    fn test_header_new() {
        let header = Header::new(":status", "200");
        assert_eq!(header.name, b":status");
        assert_eq!(header.value, b"200");
    }

    #[test]
    fn test_settings_default_is_empty() {
        let settings = Settings::default();
        assert!(settings.header_table_size.is_none());
        assert!(settings.max_concurrent_streams.is_none());
        assert!(settings.initial_window_size.is_none());
        assert!(settings.max_frame_size.is_none());
    }
}
