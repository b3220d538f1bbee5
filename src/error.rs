//! The error taxonomy shared by every layer of the stack.
//!
//! Each category gets its own enum so that protocol code can name exactly
//! what went wrong, and everything converts into the crate-wide [`Error`]
//! which is what events carry.

use rustix::io::Errno;
use std::io;
use thiserror::Error as ThisError;

/// Errors carried by events, sockets and every protocol built on them.
#[derive(Debug, ThisError, Clone, PartialEq)]
pub enum Error {
    #[error("Bad file descriptor")]
    BadDescriptor,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Overflow(#[from] OverflowError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A failure reported by the peer of an RPC channel.
    #[error("Origin {origin}\n{traceback}")]
    Remote { origin: String, traceback: String },
    /// A failure raised by an application handler.
    #[error("{0}")]
    Handler(String),
    #[error("{message}")]
    Io { kind: io::ErrorKind, message: String },
    #[error("No scheduled events left")]
    EmptySchedule,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection reset by peer")]
    Reset,
    #[error("Connection refused")]
    Refused,
    #[error("Connection aborted")]
    Aborted,
    #[error("Broken pipe")]
    BrokenPipe,
    #[error("Transport endpoint is not connected")]
    NotConnected,
    #[error("Transport endpoint is already connected")]
    AlreadyConnected,
    #[error("Address already in use")]
    AddressInUse,
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("No route to host")]
    HostUnreachable,
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Header size limit exceeded")]
    HeaderTooLarge,
    #[error("Malformed header:\n{0}")]
    MalformedHeader(String),
    #[error("Chunk header size limit exceeded")]
    ChunkHeaderTooLarge,
    #[error("Malformed chunk header:\n{0}")]
    MalformedChunkHeader(String),
    #[error("Chunk trailer size limit exceeded")]
    ChunkTrailerTooLarge,
    #[error("Malformed content length {0:?}")]
    MalformedContentLength(String),
    #[error("Missing header {0}")]
    MissingHeader(&'static str),
    #[error("Unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("Unsupported version {0}")]
    UnsupportedVersion(String),
    #[error("WebSocket accept key mismatch")]
    AcceptKeyMismatch,
    #[error("Masking bit was not set")]
    MaskNotSet,
    #[error("Masking bit was set on a frame from the server")]
    UnexpectedMask,
    #[error("Frame too large. Allowed {allowed} bytes but got {actual} bytes")]
    FrameTooLarge { allowed: usize, actual: u64 },
    #[error("Unsupported opcode {0:#x}")]
    UnsupportedOpcode(u8),
    #[error("Unsupported frame type {0:#x}")]
    UnsupportedFrame(u8),
    #[error("Invalid UTF-8 payload")]
    InvalidUtf8,
    #[error("Invalid message type {0}")]
    InvalidMessageType(i64),
    #[error("No pending request with id {0}")]
    UnknownMessageId(u64),
    #[error("Malformed message envelope")]
    MalformedEnvelope,
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum OverflowError {
    #[error("Packet too large. Allowed {allowed} bytes but got {actual} bytes")]
    PacketTooLarge { allowed: usize, actual: usize },
    #[error("Outgoing message limit of {0} has been exceeded")]
    OutgoingLimit(usize),
    #[error("Incoming message limit of {0} has been exceeded")]
    IncomingLimit(usize),
    #[error("Proxy limit of {0} has been exceeded")]
    ProxyLimit(usize),
}

/// Programming errors. These are reported synchronously and never retried.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("Already reading")]
    AlreadyReading,
    #[error("Already writing")]
    AlreadyWriting,
    #[error("Already accepting")]
    AlreadyAccepting,
    #[error("Already receiving")]
    AlreadyReceiving,
    #[error("Already sending")]
    AlreadySending,
    #[error("Concurrent read attempt")]
    ConcurrentRead,
    #[error("Concurrent write attempt")]
    ConcurrentWrite,
    #[error("Concurrent receive attempt")]
    ConcurrentReceive,
    #[error("Out of order response")]
    OutOfOrderResponse,
    #[error("Message has already been sent")]
    MessageAlreadySent,
    #[error("Event has already been triggered")]
    AlreadyTriggered,
    #[error("{0} belongs to a different hierarchy")]
    HierarchyMismatch(String),
    #[error("Failed to resolve path {0}")]
    UnresolvedPath(String),
    #[error("Unknown path {0}")]
    UnknownPath(String),
    #[error("Missing argument {0}")]
    MissingArgument(usize),
    #[error("Argument {index} is not a {expected}")]
    ArgumentType { index: usize, expected: &'static str },
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode {value}: {reason}")]
    Encode { value: String, reason: String },
    #[error("Failed to decode {data:?}: {reason}")]
    Decode { data: String, reason: String },
    #[error("Invalid type identifier {0}")]
    InvalidTypeId(i64),
    #[error("Proxy {0} belongs to a different connection")]
    ForeignProxy(String),
    #[error("No broker is attached to the codec")]
    Detached,
}

impl Error {
    /// Connection errors that may be silenced without aborting the scheduler.
    pub fn is_uncritical(&self) -> bool {
        matches!(
            self,
            Error::BadDescriptor
                | Error::Connection(ConnectionError::Reset)
                | Error::Connection(ConnectionError::NotConnected)
        )
    }

    /// The category name shown in remote tracebacks.
    pub fn category(&self) -> &'static str {
        match self {
            Error::BadDescriptor => "DescriptorError",
            Error::Connection(_) => "ConnectionError",
            Error::Protocol(_) => "ProtocolError",
            Error::Overflow(_) => "OverflowError",
            Error::Usage(_) => "UsageError",
            Error::Codec(_) => "CodecError",
            Error::Remote { .. } => "RemoteError",
            Error::Handler(_) => "HandlerError",
            Error::Io { .. } => "IoError",
            Error::EmptySchedule => "ScheduleError",
        }
    }

    /// Renders the error the way it travels inside a failure envelope. The
    /// last line always ends with the error message and a newline.
    pub fn traceback(&self) -> String {
        let mut traceback = String::new();
        let mut source = std::error::Error::source(self);
        let mut causes = Vec::new();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        for cause in causes.iter().rev() {
            traceback.push_str(&format!("Caused by: {}\n", cause));
        }
        traceback.push_str(&format!("{}: {}\n", self.category(), self));
        traceback
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Error::Handler(message.into())
    }
}

fn mapped(errno: Errno) -> Option<Error> {
    let error = match errno {
        Errno::BADF => Error::BadDescriptor,
        Errno::CONNRESET => ConnectionError::Reset.into(),
        Errno::CONNREFUSED => ConnectionError::Refused.into(),
        Errno::CONNABORTED => ConnectionError::Aborted.into(),
        Errno::PIPE => ConnectionError::BrokenPipe.into(),
        Errno::NOTCONN => ConnectionError::NotConnected.into(),
        Errno::ISCONN => ConnectionError::AlreadyConnected.into(),
        Errno::ADDRINUSE => ConnectionError::AddressInUse.into(),
        Errno::INVAL => ConnectionError::InvalidArgument.into(),
        Errno::HOSTUNREACH | Errno::NETUNREACH => ConnectionError::HostUnreachable.into(),
        _ => return None,
    };
    Some(error)
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        mapped(errno).unwrap_or_else(|| io::Error::from_raw_os_error(errno.raw_os_error()).into())
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        error
            .raw_os_error()
            .and_then(|code| mapped(Errno::from_raw_os_error(code)))
            .unwrap_or_else(|| Error::Io {
                kind: error.kind(),
                message: error.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncritical_errors() {
        assert!(Error::BadDescriptor.is_uncritical());
        assert!(Error::from(ConnectionError::Reset).is_uncritical());
        assert!(Error::from(ConnectionError::NotConnected).is_uncritical());
        assert!(!Error::from(ConnectionError::BrokenPipe).is_uncritical());
        assert!(!Error::from(UsageError::ConcurrentRead).is_uncritical());
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::from(Errno::BADF), Error::BadDescriptor);
        assert_eq!(
            Error::from(Errno::CONNREFUSED),
            Error::Connection(ConnectionError::Refused)
        );
        assert_eq!(
            Error::from(io::Error::from_raw_os_error(libc::EPIPE)),
            Error::Connection(ConnectionError::BrokenPipe)
        );
        assert!(matches!(Error::from(Errno::NOMEM), Error::Io { .. }));
    }

    #[test]
    fn traceback_ends_with_message() {
        let error = Error::handler("I failed");
        assert!(error.traceback().ends_with("I failed\n"));
        let error = Error::from(UsageError::UnresolvedPath("greet".into()));
        assert_eq!(
            error.traceback(),
            "UsageError: Failed to resolve path greet\n"
        );
    }

    #[test]
    fn packet_size_message() {
        let error = Error::from(OverflowError::PacketTooLarge {
            allowed: 16384,
            actual: 16385,
        });
        assert_eq!(
            error.to_string(),
            "Packet too large. Allowed 16384 bytes but got 16385 bytes"
        );
    }
}
