//! Error types for the NBD (Network Block Device) protocol.
//!
//! This module defines the error types used on both sides of a connection:
//!
//! - [`ErrorCode`]: The error codes carried in command replies on the wire
//! - [`OptionReplyError`]: Error replies of the option negotiation phase
//! - [`ProtocolError`]: A server-reported failure as seen by the client
//! - [`ValidationError`]: A request refused locally, before it reached the wire
//! - [`NegotiationError`] / [`ConnectError`]: Failures to establish a connection
//! - [`IoError`]: Transport failures, always fatal to the connection
//! - [`Error`]: The umbrella type returned by the client API
//!
//! Every failure exposes the same three fields: a human readable `string`,
//! a POSIX `errno` and the raw protocol error number `errnum`. The string is
//! always derived from the error itself, so the three can never disagree.
//!
//! # Examples
//!
//! ```
//! use nbd_core::errors::{ErrorCode, ProtocolError};
//!
//! let error = ProtocolError::from_wire(95);
//! assert_eq!(error.raw_code(), 95);
//! assert_eq!(error.errno(), libc::ENOTSUP);
//! assert_eq!(error.message(), ErrorCode::CommandNotSupported.to_string());
//! ```

use std::io;

use int_enum::IntEnum;
use thiserror::Error;

use crate::command_request::CommandKind;

/// Error codes that can be sent in a command reply.
///
/// These errors correspond to the standard NBD error codes defined in the protocol
/// specification. Each error maps to a specific numeric value that is sent over
/// the wire to the client.
///
/// The numeric values are the Linux errno values, which is what the protocol
/// specification fixes them to. [`ErrorCode::errno`] maps them to the errno of
/// the platform the code is running on.
#[repr(u32)]
#[derive(Debug, Error, IntEnum, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    /// The client is not permitted to perform the requested operation.
    ///
    /// Corresponds to POSIX EPERM (1) and NBD_EPERM.
    #[error("Command not permitted (NBD_EPERM)")]
    CommandNotPermitted = 1,

    /// An input/output error occurred during the operation.
    ///
    /// Corresponds to POSIX EIO (5) and NBD_EIO.
    #[error("Input/output error (NBD_EIO)")]
    IO = 5,

    /// The server cannot allocate sufficient memory to complete the operation.
    ///
    /// Corresponds to POSIX ENOMEM (12) and NBD_ENOMEM.
    #[error("Cannot allocate memory (NBD_ENOMEM)")]
    OutOfMemory = 12,

    /// The client provided an invalid argument or request structure.
    ///
    /// Corresponds to POSIX EINVAL (22) and NBD_EINVAL. The dispatcher uses
    /// this code for every request that breaks the negotiated capabilities.
    #[error("Invalid argument (NBD_EINVAL)")]
    InvalidArgument = 22,

    /// There is no space left on the storage device to complete the operation.
    ///
    /// Corresponds to POSIX ENOSPC (28) and NBD_ENOSPC.
    #[error("No space left on device (NBD_ENOSPC)")]
    NoSpaceLeft = 28,

    /// The requested operation would cause a value to overflow.
    ///
    /// Corresponds to POSIX EOVERFLOW (75) and NBD_EOVERFLOW.
    #[error("Value too large (NBD_EOVERFLOW)")]
    ValueTooLarge = 75,

    /// The requested command is not supported by the server implementation.
    ///
    /// Corresponds to POSIX ENOTSUP (95) and NBD_ENOTSUP.
    #[error("Command not supported (NBD_ENOTSUP)")]
    CommandNotSupported = 95,

    /// The server is in the process of shutting down and cannot process the request.
    ///
    /// Corresponds to POSIX ESHUTDOWN (108) and NBD_ESHUTDOWN.
    #[error("Server is in the process of being shut down (NBD_ESHUTDOWN)")]
    ServerShuttingDown = 108,
}

impl ErrorCode {
    /// The POSIX errno of the running platform for this wire code.
    pub fn errno(self) -> i32 {
        match self {
            Self::CommandNotPermitted => libc::EPERM,
            Self::IO => libc::EIO,
            Self::OutOfMemory => libc::ENOMEM,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoSpaceLeft => libc::ENOSPC,
            Self::ValueTooLarge => libc::EOVERFLOW,
            Self::CommandNotSupported => libc::ENOTSUP,
            Self::ServerShuttingDown => libc::ESHUTDOWN,
        }
    }

    /// The wire code a server sends for a local errno.
    ///
    /// Errno values without an NBD equivalent become `NBD_EINVAL`, as the
    /// protocol specification asks servers to do.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPERM => Self::CommandNotPermitted,
            libc::EIO => Self::IO,
            libc::ENOMEM => Self::OutOfMemory,
            libc::ENOSPC => Self::NoSpaceLeft,
            libc::EOVERFLOW => Self::ValueTooLarge,
            libc::ENOTSUP => Self::CommandNotSupported,
            libc::ESHUTDOWN => Self::ServerShuttingDown,
            _ => Self::InvalidArgument,
        }
    }

    /// The code as it appears in a reply header.
    pub fn raw(self) -> u32 {
        self.into()
    }
}

/// Errors that can occur during the option negotiation phase of the NBD protocol.
///
/// These errors are sent in reply to option requests from the client during the handshake
/// and negotiation phase. All of these error codes have bit 31 set (0x80000000) to
/// distinguish them from successful replies.
#[repr(u32)]
#[derive(Debug, Error, IntEnum, PartialEq, Eq, Clone, Copy)]
pub enum OptionReplyError {
    /// The option sent by the client is unknown by this server implementation.
    ///
    /// Corresponds to NBD_REP_ERR_UNSUP (2^31 + 1).
    #[error("Unsupported option (NBD_REP_ERR_UNSUP)")]
    Unsupported = 0x80000001,

    /// The option sent by the client is known but forbidden by server policy.
    ///
    /// Corresponds to NBD_REP_ERR_POLICY (2^31 + 2).
    #[error("Policy error (NBD_REP_ERR_POLICY)")]
    Policy = 0x80000002,

    /// The option sent by the client is known but syntactically or semantically invalid.
    ///
    /// For instance, the client sent an NBD_OPT_LIST with nonzero data length.
    ///
    /// Corresponds to NBD_REP_ERR_INVALID (2^31 + 3).
    #[error("Invalid option (NBD_REP_ERR_INVALID)")]
    Invalid = 0x80000003,

    /// The option is not supported on the platform where the server is running.
    ///
    /// Corresponds to NBD_REP_ERR_PLATFORM (2^31 + 4).
    #[error("Platform error (NBD_REP_ERR_PLATFORM)")]
    Platform = 0x80000004,

    /// The server requires TLS to be initiated before continuing negotiation.
    ///
    /// Corresponds to NBD_REP_ERR_TLS_REQD (2^31 + 5).
    #[error("TLS required (NBD_REP_ERR_TLS_REQD)")]
    TLSRequired = 0x80000005,

    /// The requested export is not available on the server.
    ///
    /// Corresponds to NBD_REP_ERR_UNKNOWN (2^31 + 6).
    #[error("Unknown export (NBD_REP_ERR_UNKNOWN)")]
    Unknown = 0x80000006,

    /// The server is in the process of shutting down.
    ///
    /// Corresponds to NBD_REP_ERR_SHUTDOWN (2^31 + 7).
    #[error("Server shutting down (NBD_REP_ERR_SHUTDOWN)")]
    Shutdown = 0x80000007,

    /// The server requires block size information before proceeding.
    ///
    /// Corresponds to NBD_REP_ERR_BLOCK_SIZE_REQD (2^31 + 8).
    #[error("Block size required (NBD_REP_ERR_BLOCK_SIZE_REQD)")]
    BlockSizeRequired = 0x80000008,

    /// The request or reply is too large for the server to process.
    ///
    /// Corresponds to NBD_REP_ERR_TOO_BIG (2^31 + 9).
    #[error("Request too big (NBD_REP_ERR_TOO_BIG)")]
    TooBig = 0x80000009,

    /// The server requires extended headers for the operation.
    ///
    /// Corresponds to NBD_REP_ERR_EXT_HEADER_REQD (2^31 + 10).
    #[error("Extended header required (NBD_REP_ERR_EXT_HEADER_REQD)")]
    ExtendedHeaderRequired = 0x8000000A,
}

impl OptionReplyError {
    /// Bit 31 marks every option reply type that is an error.
    pub(crate) const ERROR_BIT: u32 = 0x80000000;
}

fn describe_option_error(reply_type: u32) -> String {
    match OptionReplyError::try_from(reply_type) {
        Ok(error) => error.to_string(),
        Err(_) => format!("unknown option error {reply_type:#x}"),
    }
}

/// A failure reported by the server in a command reply.
///
/// Constructed exactly once, from the wire error code, and immutable from
/// then on: the message comes from a lookup table, `errno` from the
/// protocol-to-POSIX mapping and `raw_code` is the 32-bit value the server
/// sent, unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
    errno: i32,
    raw_code: u32,
}

impl ProtocolError {
    /// Decodes the error field of a reply header.
    pub fn from_wire(raw: u32) -> Self {
        match ErrorCode::try_from(raw) {
            Ok(code) => code.into(),
            // The protocol asks clients to treat unknown codes as EINVAL
            Err(_) => Self {
                message: format!("Unknown error code {raw} sent by server"),
                errno: libc::EINVAL,
                raw_code: raw,
            },
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn raw_code(&self) -> u32 {
        self.raw_code
    }
}

impl From<ErrorCode> for ProtocolError {
    fn from(code: ErrorCode) -> Self {
        Self {
            message: code.to_string(),
            errno: code.errno(),
            raw_code: code.raw(),
        }
    }
}

/// A request refused by the client before any byte was sent.
///
/// The connection stays usable after a validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request out of bounds: offset {offset} + length {length} is beyond the export size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    #[error("server does not support write operations")]
    ReadOnlyExport,

    #[error("server does not support the FUA flag")]
    FuaUnsupported,

    #[error("server does not support {0} operations")]
    Unsupported(CommandKind),

    #[error("server does not support the fast zero flag")]
    FastZeroUnsupported,

    #[error("flags {flags:#06x} are not valid for a {command} request")]
    InvalidFlags { command: CommandKind, flags: u16 },

    #[error("request length {length} exceeds the maximum payload size {max}")]
    PayloadTooLarge { length: u64, max: u32 },
}

impl ValidationError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::ReadOnlyExport => libc::EPERM,
            Self::PayloadTooLarge { .. } => libc::ERANGE,
            _ => libc::EINVAL,
        }
    }
}

/// Failures of the handshake and option haggling.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("server did not send the NBD handshake magic (got {0:#018x})")]
    UnknownMagic(u64),

    #[error("server does not support fixed newstyle negotiation")]
    Unsupported,

    #[error("export {0:?} not found on server")]
    ExportNotFound(String),

    #[error("malformed export flags: {0}")]
    MalformedFlags(&'static str),

    #[error("server rejected option {option}: {}", describe_option_error(*.reply_type))]
    Rejected { option: u32, reply_type: u32 },

    #[error("malformed option reply: {0}")]
    MalformedReply(String),

    #[error("server ended negotiation without describing the export")]
    MissingExportInfo,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NegotiationError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::ExportNotFound(_) => libc::ENOENT,
            Self::Rejected { reply_type, .. }
                if *reply_type == OptionReplyError::Unsupported as u32 =>
            {
                libc::ENOTSUP
            }
            Self::Rejected { reply_type, .. }
                if *reply_type == OptionReplyError::Policy as u32
                    || *reply_type == OptionReplyError::TLSRequired as u32 =>
            {
                libc::EPERM
            }
            Self::Rejected { reply_type, .. }
                if *reply_type == OptionReplyError::Shutdown as u32 =>
            {
                libc::ESHUTDOWN
            }
            Self::Io(error) => error.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EPROTO,
        }
    }
}

/// Failures of [`crate::connection::Connection::connect`]. No connection
/// object exists when one of these is returned.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("cannot reach {target}: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Negotiation(#[from] NegotiationError),
}

impl ConnectError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Unreachable { source, .. } => {
                source.raw_os_error().unwrap_or(libc::ECONNREFUSED)
            }
            Self::Negotiation(error) => error.errno(),
        }
    }
}

/// Transport level failures. Fatal: the connection is closed afterwards and
/// every later call fails with [`IoError::Closed`].
#[derive(Debug, Error)]
pub enum IoError {
    #[error("connection is closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("server violated the protocol: {0}")]
    Protocol(String),
}

impl IoError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Closed => libc::ENOTCONN,
            Self::Transport(error) => error.raw_os_error().unwrap_or(match error.kind() {
                io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => libc::ENOTCONN,
                _ => libc::EIO,
            }),
            Self::Protocol(_) => libc::EPROTO,
        }
    }
}

/// Every failure the client API can return.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] IoError),
}

impl Error {
    /// Human readable description.
    pub fn string(&self) -> String {
        self.to_string()
    }

    /// POSIX errno of the running platform.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Connect(error) => error.errno(),
            Self::Validation(error) => error.errno(),
            Self::Protocol(error) => error.errno(),
            Self::Io(error) => error.errno(),
        }
    }

    /// Raw protocol error number.
    ///
    /// For server-reported failures this is the code from the reply. For
    /// failures detected locally it is the code a server would have used
    /// for the same errno.
    pub fn errnum(&self) -> u32 {
        match self {
            Self::Protocol(error) => error.raw_code(),
            other => ErrorCode::from_errno(other.errno()).raw(),
        }
    }

    /// Whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Connect(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
