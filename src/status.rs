//! Status taxonomy for stream and transport outcomes.

use std::fmt;
use std::io;

/// Canonical RPC status codes, as carried in the `grpc-status` trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// Completed normally.
    Ok = 0,
    /// Call was cancelled, locally or by the peer.
    Cancelled = 1,
    /// Outcome could not be classified.
    Unknown = 2,
    /// Caller supplied a malformed argument.
    InvalidArgument = 3,
    /// Deadline passed before the call finished.
    DeadlineExceeded = 4,
    /// Requested entity does not exist.
    NotFound = 5,
    /// Entity being created already exists.
    AlreadyExists = 6,
    /// Caller may not perform the operation.
    PermissionDenied = 7,
    /// A quota or resource limit was hit.
    ResourceExhausted = 8,
    /// System is not in a state the operation requires.
    FailedPrecondition = 9,
    /// Aborted, typically after a concurrency conflict.
    Aborted = 10,
    /// Argument fell outside the valid range.
    OutOfRange = 11,
    /// Peer does not implement the operation.
    Unimplemented = 12,
    /// Invariant broken inside the transport or the peer.
    Internal = 13,
    /// Service cannot be reached or is shedding load.
    Unavailable = 14,
    /// Data was lost or corrupted beyond recovery.
    DataLoss = 15,
    /// Missing or invalid authentication credentials.
    Unauthenticated = 16,
}

/// Codes in wire order; the index is the `grpc-status` value.
const CODES: [Code; 17] = [
    Code::Ok,
    Code::Cancelled,
    Code::Unknown,
    Code::InvalidArgument,
    Code::DeadlineExceeded,
    Code::NotFound,
    Code::AlreadyExists,
    Code::PermissionDenied,
    Code::ResourceExhausted,
    Code::FailedPrecondition,
    Code::Aborted,
    Code::OutOfRange,
    Code::Unimplemented,
    Code::Internal,
    Code::Unavailable,
    Code::DataLoss,
    Code::Unauthenticated,
];

impl Code {
    /// Decode a `grpc-status` value. Values outside the table collapse to
    /// [`Code::Unknown`].
    pub fn from_u32(value: u32) -> Self {
        CODES
            .get(value as usize)
            .copied()
            .unwrap_or(Code::Unknown)
    }

    /// The numeric `grpc-status` value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Whether this code means the call succeeded.
    pub fn is_ok(self) -> bool {
        matches!(self, Code::Ok)
    }

    /// The conventional upper-case name of the code.
    pub fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal outcome of a stream or transport operation: a [`Code`] plus an
/// optional human-readable message.
#[derive(Debug, Clone)]
pub struct Status {
    code: Code,
    message: Option<String>,
}

impl Status {
    /// Status with both a code and a message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }

    /// Bare status with no message.
    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// The OK status.
    pub fn ok() -> Self {
        Self::from_code(Code::Ok)
    }

    /// CANCELLED with a message.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    /// PERMISSION_DENIED with a message.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    /// INTERNAL with a message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    /// UNAVAILABLE with a message.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    /// The machine-readable code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// The message, if one was attached.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Whether the call succeeded.
    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Derive a status from an I/O failure cause.
    ///
    /// Connection loss maps to UNAVAILABLE, timeouts to DEADLINE_EXCEEDED,
    /// anything else to INTERNAL.
    pub fn from_io_error(error: &io::Error) -> Self {
        let code = match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Code::Unavailable,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Code::DeadlineExceeded,
            _ => Code::Internal,
        };
        Self::new(code, error.to_string())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code.name())?;
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wire_value_roundtrip() {
        for value in 0..=16 {
            assert_eq!(Code::from_u32(value).as_u32(), value);
        }
    }

    #[test]
    fn test_code_out_of_table_is_unknown() {
        assert_eq!(Code::from_u32(17), Code::Unknown);
        assert_eq!(Code::from_u32(u32::MAX), Code::Unknown);
    }

    #[test]
    fn test_code_is_ok() {
        assert!(Code::Ok.is_ok());
        assert!(!Code::Internal.is_ok());
        assert!(!Code::Cancelled.is_ok());
    }

    #[test]
    fn test_code_names() {
        assert_eq!(Code::Ok.name(), "OK");
        assert_eq!(Code::PermissionDenied.name(), "PERMISSION_DENIED");
        assert_eq!(format!("{}", Code::DeadlineExceeded), "DEADLINE_EXCEEDED");
    }

    #[test]
    fn test_status_ok() {
        let status = Status::ok();
        assert!(status.is_ok());
        assert_eq!(status.code(), Code::Ok);
        assert!(status.message().is_none());
    }

    #[test]
    fn test_status_with_message() {
        let status = Status::cancelled("Cancelled");
        assert!(!status.is_ok());
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.message(), Some("Cancelled"));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            format!("{}", Status::internal("Stream id exhaust")),
            "INTERNAL: Stream id exhaust"
        );
        assert_eq!(format!("{}", Status::ok()), "OK");
    }

    #[test]
    fn test_status_from_io_error_connection_loss() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let status = Status::from_io_error(&err);
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), Some("reset by peer"));
    }

    #[test]
    fn test_status_from_io_error_timeout() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "timed out");
        assert_eq!(Status::from_io_error(&err).code(), Code::DeadlineExceeded);
    }

    #[test]
    fn test_status_from_io_error_other() {
        let err = io::Error::other("boom");
        assert_eq!(Status::from_io_error(&err).code(), Code::Internal);
    }

    #[test]
    fn test_status_is_error() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<Status>();
    }
}
