/// NBD Protocol Magic Numbers
///
/// This module contains the magic numbers defined in the NBD protocol specification:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// Magic numbers identify the different message kinds on the wire. A peer that
/// sends anything else at these positions is not speaking fixed newstyle NBD.

/// Initial handshake identifier (ASCII "NBDMAGIC")
pub(crate) const NBD_MAGIC: u64 = 0x4e42444d41474943;

/// Newstyle negotiation magic (ASCII "IHAVEOPT")
pub(crate) const NBD_IHAVEOPT: u64 = 0x49484156454F5054;

/// Oldstyle negotiation magic, sent in place of IHAVEOPT by legacy servers
pub(crate) const NBD_OLDSTYLE_MAGIC: u64 = 0x00420281861253;

/// Option reply magic (fixed value from protocol)
pub(crate) const NBD_REPLY_MAGIC: u64 = 0x3e889045565a9;

/// NBD Request Magic value from protocol specification
pub(crate) const NBD_REQUEST_MAGIC: u32 = 0x25609513;

/// Simple reply magic, the only reply form used when structured replies
/// are not negotiated
pub(crate) const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

/// Structured reply magic. Never negotiated here, but recognised so that a
/// misbehaving server produces a precise error.
pub(crate) const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;
