/// NBD Command Request Implementation
///
/// This module defines the commands that can be sent during the NBD transmission phase
/// according to the protocol specification:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// Commands are used to read from, write to, and manage NBD devices after
/// the connection has been established and negotiated.
use std::fmt;

use int_enum::IntEnum;

use crate::errors::ErrorCode;
use crate::flags::CommandFlags;
use crate::io::command_request::CommandRequestRaw;
use crate::magic::NBD_REQUEST_MAGIC;

/// Largest read or write payload, in bytes, either side will handle.
pub const MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

/// Command types used in the NBD transmission phase.
///
/// Values correspond to the command type field in the NBD protocol.
/// Block status and resize exist in the protocol but are not negotiated,
/// so a server receiving them answers `NBD_ENOTSUP`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntEnum)]
pub enum CommandKind {
    /// Read data from device (offset, length)
    Read = 0,

    /// Write data to device (offset, data)
    Write = 1,

    /// Terminate the connection. Sent by `close()`, never answered.
    Disconnect = 2,

    /// Flush data to persistent storage
    Flush = 3,

    /// Discard/punch hole (offset, length)
    Trim = 4,

    /// Request caching of region (offset, length)
    Cache = 5,

    /// Write zeros efficiently (offset, length)
    Zero = 6,
}

impl CommandKind {
    /// Flags that may legally accompany this command.
    pub fn permitted_flags(self) -> CommandFlags {
        match self {
            Self::Write | Self::Trim => CommandFlags::FUA,
            Self::Zero => CommandFlags::FUA | CommandFlags::NO_HOLE | CommandFlags::FAST_ZERO,
            Self::Read | Self::Disconnect | Self::Flush | Self::Cache => CommandFlags::empty(),
        }
    }

    /// Commands that modify the export and are refused on a read-only one.
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::Trim | Self::Zero)
    }

    /// Commands that address a byte range of the export.
    pub fn has_range(self) -> bool {
        !matches!(self, Self::Disconnect | Self::Flush)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Disconnect => "disconnect",
            Self::Flush => "flush",
            Self::Trim => "trim",
            Self::Cache => "cache",
            Self::Zero => "zero",
        })
    }
}

/// NBD command requests for the transmission phase, as seen by a server.
///
/// Each variant contains the data needed for its corresponding command type.
#[derive(Debug)]
pub(crate) enum CommandRequest {
    /// Read from device: (offset, length)
    Read(u64, u32),

    /// Write to device: (offset, data)
    Write(u64, Vec<u8>),

    /// Flush data to persistent storage
    Flush,

    /// Discard/punch hole: (offset, length)
    Trim(u64, u32),

    /// Write zeros efficiently: (offset, length)
    Zero(u64, u32),

    /// Request caching of region: (offset, length)
    Cache(u64, u32),

    /// Terminate the connection
    Disconnect,
}

impl CommandRequest {
    pub(crate) fn kind(&self) -> CommandKind {
        match self {
            Self::Read(..) => CommandKind::Read,
            Self::Write(..) => CommandKind::Write,
            Self::Flush => CommandKind::Flush,
            Self::Trim(..) => CommandKind::Trim,
            Self::Zero(..) => CommandKind::Zero,
            Self::Cache(..) => CommandKind::Cache,
            Self::Disconnect => CommandKind::Disconnect,
        }
    }

    /// The addressed byte range as (offset, length), if any.
    pub(crate) fn range(&self) -> Option<(u64, u64)> {
        match self {
            Self::Read(offset, length)
            | Self::Trim(offset, length)
            | Self::Zero(offset, length)
            | Self::Cache(offset, length) => Some((*offset, u64::from(*length))),
            Self::Write(offset, data) => Some((*offset, data.len() as u64)),
            Self::Flush | Self::Disconnect => None,
        }
    }
}

impl TryFrom<CommandRequestRaw> for CommandRequest {
    type Error = ErrorCode;

    fn try_from(command_raw: CommandRequestRaw) -> Result<Self, Self::Error> {
        if command_raw.magic != NBD_REQUEST_MAGIC {
            return Err(ErrorCode::InvalidArgument);
        }

        let command_type = CommandKind::try_from(command_raw.command_type)
            .map_err(|_| ErrorCode::CommandNotSupported)?;

        let offset = command_raw.offset;
        let length = command_raw.length;

        debug_assert!(command_raw.data.is_empty() || command_type == CommandKind::Write);

        Ok(match command_type {
            CommandKind::Read => Self::Read(offset, length),
            CommandKind::Write => Self::Write(offset, command_raw.data),
            CommandKind::Flush => Self::Flush,
            CommandKind::Trim => Self::Trim(offset, length),
            CommandKind::Zero => Self::Zero(offset, length),
            CommandKind::Disconnect => Self::Disconnect,
            CommandKind::Cache => Self::Cache(offset, length),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(command_type: u16, offset: u64, length: u32, data: Vec<u8>) -> CommandRequestRaw {
        CommandRequestRaw::new(0, command_type, 42, offset, length, data)
    }

    #[test]
    fn test_command_kind_conversion() {
        // Test direct conversions to u16
        assert_eq!(CommandKind::Read as u16, 0);
        assert_eq!(CommandKind::Write as u16, 1);
        assert_eq!(CommandKind::Disconnect as u16, 2);
        assert_eq!(CommandKind::Flush as u16, 3);
        assert_eq!(CommandKind::Trim as u16, 4);
        assert_eq!(CommandKind::Cache as u16, 5);
        assert_eq!(CommandKind::Zero as u16, 6);

        // Test IntEnum conversions from u16
        match CommandKind::try_from(3u16) {
            Ok(kind) => assert!(matches!(kind, CommandKind::Flush)),
            Err(_) => panic!("Failed to convert 3 to CommandKind::Flush"),
        }

        // Block status and resize are not accepted
        assert!(CommandKind::try_from(7u16).is_err());
        assert!(CommandKind::try_from(8u16).is_err());
        assert!(CommandKind::try_from(99u16).is_err());
    }

    #[test]
    fn test_permitted_flags() {
        assert_eq!(CommandKind::Read.permitted_flags(), CommandFlags::empty());
        assert_eq!(CommandKind::Write.permitted_flags(), CommandFlags::FUA);
        assert_eq!(CommandKind::Trim.permitted_flags(), CommandFlags::FUA);
        assert!(CommandKind::Zero
            .permitted_flags()
            .contains(CommandFlags::NO_HOLE | CommandFlags::FAST_ZERO));
        assert_eq!(CommandKind::Cache.permitted_flags(), CommandFlags::empty());
    }

    #[test]
    fn test_try_from_raw_valid_read() {
        let result = CommandRequest::try_from(raw(0, 1024, 512, vec![]));

        if let Ok(CommandRequest::Read(offset, length)) = result {
            assert_eq!(offset, 1024);
            assert_eq!(length, 512);
        } else {
            panic!("Expected CommandRequest::Read variant");
        }
    }

    #[test]
    fn test_try_from_raw_valid_write() {
        let data = vec![1, 2, 3, 4, 5];
        let request = CommandRequest::try_from(raw(1, 2048, 5, data.clone())).unwrap();

        assert_eq!(request.kind(), CommandKind::Write);
        assert_eq!(request.range(), Some((2048, 5)));
        if let CommandRequest::Write(offset, payload) = request {
            assert_eq!(offset, 2048);
            assert_eq!(payload, data);
        } else {
            panic!("Expected CommandRequest::Write variant");
        }
    }

    #[test]
    fn test_try_from_raw_flush_has_no_range() {
        let request = CommandRequest::try_from(raw(3, 0, 0, vec![])).unwrap();
        assert!(matches!(request, CommandRequest::Flush));
        assert_eq!(request.range(), None);
    }

    #[test]
    fn test_try_from_raw_invalid_magic() {
        let mut request = raw(0, 1024, 512, vec![]);
        request.magic = 0x12345678;

        let result = CommandRequest::try_from(request);
        assert_eq!(result.unwrap_err(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_try_from_raw_unsupported_command() {
        let result = CommandRequest::try_from(raw(7, 1024, 512, vec![]));
        assert_eq!(result.unwrap_err(), ErrorCode::CommandNotSupported);
    }

    #[test]
    fn test_try_from_raw_zero_and_cache() {
        let request = CommandRequest::try_from(raw(6, 8192, 2048, vec![])).unwrap();
        assert_eq!(request.kind(), CommandKind::Zero);
        assert_eq!(request.range(), Some((8192, 2048)));

        let request = CommandRequest::try_from(raw(5, 16384, 4096, vec![])).unwrap();
        assert_eq!(request.kind(), CommandKind::Cache);
        assert_eq!(request.range(), Some((16384, 4096)));
    }

    #[test]
    fn test_display_names() {
        assert_eq!(CommandKind::Zero.to_string(), "zero");
        assert_eq!(CommandKind::Flush.to_string(), "flush");
    }
}
