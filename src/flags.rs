//! Flag definitions for the NBD (Network Block Device) protocol.
//!
//! This module contains the various flag types used in the Network Block Device protocol:
//!
//! - [`CommandFlags`]: Sent with command requests to modify their behavior
//! - [`HandlerFlags`]: What a [`crate::plugin::Plugin`] handler is actually told
//! - `TransmissionFlags`, `HandshakeFlags`, `ClientFlags`, `CapabilityModes`:
//!   negotiation-phase bitfields, internal to the crate
//!
//! All flags are implemented using the [`bitflags`](https://docs.rs/bitflags) crate.
//!
//! # Examples
//!
//! ```
//! use nbd_core::flags::CommandFlags;
//!
//! // Create a flags value with multiple flags set
//! let cmd_flags = CommandFlags::FUA | CommandFlags::NO_HOLE;
//!
//! // Testing if a flag is set
//! if cmd_flags.contains(CommandFlags::FUA) {
//!     println!("Force Unit Access flag is set");
//! }
//!
//! // Bits outside the known set are refused
//! assert!(CommandFlags::try_from(0b1000_0000u16).is_err());
//! ```

/// Bit values of the transmission flags field.
///
/// The documentation here provides detailed explanations for each flag used in the NBD protocol.
mod flag_bits {
    /// MUST always be 1 in valid NBD protocol communications.
    pub(crate) const HAS_FLAGS: u16 = 0b00000001;

    /// Indicates the export is read-only. If set, the server MUST error on write operations.
    pub(crate) const READ_ONLY: u16 = 0b00000010;

    /// Exposes support for `NBD_CMD_FLUSH`.
    pub(crate) const SEND_FLUSH: u16 = 0b00000100;

    /// Exposes support for `NBD_CMD_FLAG_FUA` (Force Unit Access).
    pub(crate) const SEND_FUA: u16 = 0b00001000;

    /// Indicates the export has characteristics of a rotational medium.
    /// The client MAY schedule I/O accesses accordingly.
    pub(crate) const ROTATIONAL: u16 = 0b00010000;

    /// Exposes support for `NBD_CMD_TRIM`.
    pub(crate) const SEND_TRIM: u16 = 0b00100000;

    /// Exposes support for `NBD_CMD_WRITE_ZEROES` and `NBD_CMD_FLAG_NO_HOLE`.
    pub(crate) const SEND_WRITE_ZEROES: u16 = 0b01000000;

    /// Do not fragment a structured reply. Never advertised here.
    pub(crate) const SEND_DF: u16 = 0b10000000;

    /// Indicates that the server operates without cache or with a shared cache,
    /// making `FLUSH` and `FUA` operations visible across all connections.
    /// Without this flag, clients SHOULD NOT multiplex commands over multiple connections.
    pub(crate) const CAN_MULTI_CONN: u16 = 0b00000001_00000000;

    /// Exposes support for the experimental RESIZE extension. Never advertised here.
    pub(crate) const SEND_RESIZE: u16 = 0b00000010_00000000;

    /// Documents that the server understands `NBD_CMD_CACHE`.
    pub(crate) const SEND_CACHE: u16 = 0b00000100_00000000;

    /// Allows clients to detect if `NBD_CMD_WRITE_ZEROES` is faster than
    /// a corresponding write via the `NBD_CMD_FLAG_FAST_ZERO` request flag.
    pub(crate) const SEND_FAST_ZERO: u16 = 0b00001000_00000000;
}

bitflags::bitflags! {
    /// Handshake flags used during the initial NBD protocol negotiation.
    ///
    /// This 16-bit field is sent by the server right after the two magic numbers.
    ///
    /// According to the NBD protocol specification:
    /// - The server MUST NOT set any flags other than those defined here
    /// - The server SHOULD NOT change behavior unless the client responds with a corresponding flag
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HandshakeFlags: u16 {
        /// MUST be set by servers that support the fixed newstyle protocol.
        const FIXED_NEWSTYLE = 0b00000001;

        /// If set, and if the client replies with `NBD_FLAG_C_NO_ZEROES` in the client flags field,
        /// the server MUST NOT send the 124 bytes of zero when the client ends negotiation with
        /// `NBD_OPT_EXPORT_NAME`.
        const NO_ZEROES = 0b00000010;
    }
}

impl Default for HandshakeFlags {
    fn default() -> Self {
        Self::FIXED_NEWSTYLE | Self::NO_ZEROES
    }
}

bitflags::bitflags! {
    /// Client flags, the 32-bit answer to the server's handshake flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ClientFlags: u32 {
        const FIXED_NEWSTYLE = 0b00000001;
        const NO_ZEROES = 0b00000010;
    }
}

impl From<HandshakeFlags> for ClientFlags {
    /// The client acknowledges exactly the subset of features the server offered.
    fn from(offered: HandshakeFlags) -> Self {
        Self::from_bits_truncate(u32::from(offered.bits()))
    }
}

bitflags::bitflags! {
    /// Command flags sent with NBD command requests to modify their behavior.
    ///
    /// Only the flags this crate can validate are defined. Any other bit is
    /// rejected instead of being silently ignored: the client refuses to send
    /// it and the server answers `NBD_EINVAL`.
    ///
    /// Available flags:
    /// - `CommandFlags::FUA` (0x0001): Force Unit Access - ensures data is written to stable storage before reply.
    /// - `CommandFlags::NO_HOLE` (0x0002): Only on write zeroes. The zeroed range must stay allocated;
    ///   when clear the server may punch a hole instead.
    /// - `CommandFlags::FAST_ZERO` (0x0010): Only on write zeroes. The client would prefer the server to fail
    ///   the request rather than perform a time-consuming write of zeroes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CommandFlags: u16 {
        /// Force Unit Access (FUA) - ensures data is written to stable storage before reply.
        const FUA = 0b00000001;

        /// When set on a write zeroes command, the server must not deallocate the range.
        /// If clear, the server may punch a hole or write zeroes as it sees fit.
        const NO_HOLE = 0b00000010;

        /// Fast Zero - indicates that the client would prefer the server to fail
        /// the request rather than perform a time-consuming write of zeroes.
        const FAST_ZERO = 0b00010000;
    }
}

impl TryFrom<u16> for CommandFlags {
    type Error = u16;

    /// Attempts to convert a raw u16 value into CommandFlags.
    ///
    /// # Returns
    /// - `Ok(CommandFlags)` if all bits in the value represent valid flags
    /// - `Err(value)` if any bits in the value don't correspond to defined flags
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match Self::from_bits(value) {
            Some(flags) => Ok(flags),
            None => Err(value),
        }
    }
}

bitflags::bitflags! {
    /// Transmission flags sent by the server at the end of option haggling.
    ///
    /// This 16-bit field includes both administrative flags (like HAS_FLAGS and READ_ONLY)
    /// and feature flags that describe the export's capabilities.
    ///
    /// See `flag_bits` module for detailed documentation of each flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct TransmissionFlags: u16 {
        const HAS_FLAGS = flag_bits::HAS_FLAGS;
        const READ_ONLY = flag_bits::READ_ONLY;
        const SEND_FLUSH = flag_bits::SEND_FLUSH;
        const SEND_FUA = flag_bits::SEND_FUA;
        const ROTATIONAL = flag_bits::ROTATIONAL;
        const SEND_TRIM = flag_bits::SEND_TRIM;
        const SEND_WRITE_ZEROES = flag_bits::SEND_WRITE_ZEROES;
        const SEND_DF = flag_bits::SEND_DF;
        const CAN_MULTI_CONN = flag_bits::CAN_MULTI_CONN;
        const SEND_RESIZE = flag_bits::SEND_RESIZE;
        const SEND_CACHE = flag_bits::SEND_CACHE;
        const SEND_FAST_ZERO = flag_bits::SEND_FAST_ZERO;
    }
}

bitflags::bitflags! {
    /// Payload of the `NBD_INFO_CAPABILITY_MODES` information reply.
    ///
    /// The standard transmission flags only say whether FUA and cache are
    /// usable. These bits additionally say how the server provides them.
    /// At most one bit per capability may be set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct CapabilityModes: u16 {
        const FUA_EMULATE = 0b00000001;
        const FUA_NATIVE = 0b00000010;
        const CACHE_EMULATE = 0b00000100;
        const CACHE_NATIVE = 0b00001000;
    }
}

bitflags::bitflags! {
    /// Flags delivered to plugin handlers.
    ///
    /// These are not the wire flags. The dispatcher translates them:
    /// - `MAY_TRIM` is set on zero requests that arrived *without* `NO_HOLE`
    /// - `FUA` is only delivered when the plugin declared native FUA support;
    ///   emulated FUA is turned into a flush by the dispatcher
    /// - `FAST_ZERO` is passed through on zero requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandlerFlags: u32 {
        const MAY_TRIM = 0b00000001;
        const FUA = 0b00000010;
        const FAST_ZERO = 0b00001000;
    }
}
