//! Export capabilities and the descriptor produced by negotiation.
//!
//! Most capabilities are plain booleans that map one-to-one onto a
//! transmission flag bit. FUA and cache are tri-state: a server may not
//! support them at all, emulate them, or support them natively. The wire
//! carries the "supported" bit in the transmission flags and the
//! emulate/native distinction in an `NBD_INFO_CAPABILITY_MODES` reply.
//!
//! # Examples
//!
//! ```
//! use nbd_core::capability::{Capability, CapabilitySet, ExportDescriptor};
//!
//! let flags = CapabilitySet {
//!     supports_flush: true,
//!     supports_fua: Capability::Emulate,
//!     ..Default::default()
//! };
//! let export = ExportDescriptor::new(512, flags);
//!
//! assert_eq!(export.size(), 512);
//! assert!(export.flags().supports_fua.is_supported());
//! assert!(!export.flags().supports_cache.is_supported());
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::NegotiationError;
use crate::flags::{CapabilityModes, TransmissionFlags};

/// How a server provides FUA or cache support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Not supported. Requests using it are refused.
    #[default]
    None,

    /// Supported by the server on behalf of the plugin (an implicit flush
    /// for FUA, a read of the range for cache).
    Emulate,

    /// Supported by the plugin itself.
    Native,
}

impl Capability {
    /// True for both `Emulate` and `Native`.
    pub fn is_supported(self) -> bool {
        self != Self::None
    }

    fn from_mode_bits(emulate: bool, native: bool) -> Result<Self, NegotiationError> {
        match (emulate, native) {
            (false, false) => Ok(Self::None),
            (true, false) => Ok(Self::Emulate),
            (false, true) => Ok(Self::Native),
            (true, true) => Err(NegotiationError::MalformedFlags(
                "both emulate and native mode bits set",
            )),
        }
    }
}

/// The capabilities of an export, as negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    pub read_only: bool,
    pub supports_flush: bool,
    pub supports_trim: bool,
    pub supports_zero: bool,
    pub supports_fast_zero: bool,
    pub supports_cache: Capability,
    pub supports_fua: Capability,
    pub is_rotational: bool,
    pub can_multi_conn: bool,
    /// Block status is never negotiated, so this is always false after a
    /// handshake.
    pub can_extents: bool,
}

impl CapabilitySet {
    /// Packs the set into transmission flags and the capability modes field.
    pub(crate) fn to_wire(&self) -> (TransmissionFlags, CapabilityModes) {
        let mut flags = TransmissionFlags::HAS_FLAGS;
        flags.set(TransmissionFlags::READ_ONLY, self.read_only);
        flags.set(TransmissionFlags::SEND_FLUSH, self.supports_flush);
        flags.set(TransmissionFlags::SEND_FUA, self.supports_fua.is_supported());
        flags.set(TransmissionFlags::ROTATIONAL, self.is_rotational);
        flags.set(TransmissionFlags::SEND_TRIM, self.supports_trim);
        flags.set(TransmissionFlags::SEND_WRITE_ZEROES, self.supports_zero);
        flags.set(TransmissionFlags::CAN_MULTI_CONN, self.can_multi_conn);
        flags.set(TransmissionFlags::SEND_CACHE, self.supports_cache.is_supported());
        flags.set(TransmissionFlags::SEND_FAST_ZERO, self.supports_fast_zero);

        let mut modes = CapabilityModes::empty();
        modes.set(
            CapabilityModes::FUA_EMULATE,
            self.supports_fua == Capability::Emulate,
        );
        modes.set(
            CapabilityModes::FUA_NATIVE,
            self.supports_fua == Capability::Native,
        );
        modes.set(
            CapabilityModes::CACHE_EMULATE,
            self.supports_cache == Capability::Emulate,
        );
        modes.set(
            CapabilityModes::CACHE_NATIVE,
            self.supports_cache == Capability::Native,
        );

        (flags, modes)
    }

    /// Unpacks transmission flags plus the optional capability modes field.
    ///
    /// Without a modes field a supported FUA or cache is reported as native,
    /// which is what a standard server means by the bit.
    pub(crate) fn from_wire(
        flags: TransmissionFlags,
        modes: Option<CapabilityModes>,
    ) -> Result<Self, NegotiationError> {
        if !flags.contains(TransmissionFlags::HAS_FLAGS) {
            return Err(NegotiationError::MalformedFlags(
                "transmission flags without HAS_FLAGS",
            ));
        }

        let fua_advertised = flags.contains(TransmissionFlags::SEND_FUA);
        let cache_advertised = flags.contains(TransmissionFlags::SEND_CACHE);

        let (supports_fua, supports_cache) = match modes {
            None => (
                Self::native_if(fua_advertised),
                Self::native_if(cache_advertised),
            ),
            Some(modes) => {
                let fua = Capability::from_mode_bits(
                    modes.contains(CapabilityModes::FUA_EMULATE),
                    modes.contains(CapabilityModes::FUA_NATIVE),
                )?;
                let cache = Capability::from_mode_bits(
                    modes.contains(CapabilityModes::CACHE_EMULATE),
                    modes.contains(CapabilityModes::CACHE_NATIVE),
                )?;
                if fua.is_supported() != fua_advertised {
                    return Err(NegotiationError::MalformedFlags(
                        "FUA mode disagrees with the SEND_FUA flag",
                    ));
                }
                if cache.is_supported() != cache_advertised {
                    return Err(NegotiationError::MalformedFlags(
                        "cache mode disagrees with the SEND_CACHE flag",
                    ));
                }
                (fua, cache)
            }
        };

        Ok(Self {
            read_only: flags.contains(TransmissionFlags::READ_ONLY),
            supports_flush: flags.contains(TransmissionFlags::SEND_FLUSH),
            supports_trim: flags.contains(TransmissionFlags::SEND_TRIM),
            supports_zero: flags.contains(TransmissionFlags::SEND_WRITE_ZEROES),
            supports_fast_zero: flags.contains(TransmissionFlags::SEND_FAST_ZERO),
            supports_cache,
            supports_fua,
            is_rotational: flags.contains(TransmissionFlags::ROTATIONAL),
            can_multi_conn: flags.contains(TransmissionFlags::CAN_MULTI_CONN),
            can_extents: false,
        })
    }

    fn native_if(advertised: bool) -> Capability {
        if advertised {
            Capability::Native
        } else {
            Capability::None
        }
    }
}

/// Size and capabilities of the export selected during negotiation.
///
/// Immutable: there are no setters, and a [`crate::connection::Connection`]
/// only hands out shared references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    size: u64,
    flags: CapabilitySet,
}

impl ExportDescriptor {
    pub fn new(size: u64, flags: CapabilitySet) -> Self {
        Self { size, flags }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn flags(&self) -> &CapabilitySet {
        &self.flags
    }
}
