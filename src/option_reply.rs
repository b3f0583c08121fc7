/// Typed NBD option replies.
///
/// Servers build [`OptionReply`] values and turn them into raw replies;
/// clients parse raw replies back. Error replies (bit 31 set) are kept as
/// their raw type so the caller can decide what each one means.
use int_enum::IntEnum;

use crate::errors::{NegotiationError, OptionReplyError};
use crate::flags::{CapabilityModes, TransmissionFlags};
use crate::info::InformationRequest;
use crate::io::option_reply::OptionReplyRaw;
use crate::magic::NBD_REPLY_MAGIC;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub(crate) enum OptionReplyType {
    /// NBD_REP_ACK
    Ack = 1,
    /// NBD_REP_SERVER
    Server = 2,
    /// NBD_REP_INFO
    Info = 3,
}

/// Payload of an `NBD_REP_INFO` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InfoPayload {
    /// NBD_INFO_EXPORT: (size, transmission flags)
    Export(u64, TransmissionFlags),

    /// NBD_INFO_NAME
    Name(String),

    /// NBD_INFO_CAPABILITY_MODES
    CapabilityModes(CapabilityModes),

    /// An information type this crate does not know
    Unknown(u16),
}

impl InfoPayload {
    fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::new();
        match self {
            Self::Export(size, flags) => {
                data.extend_from_slice(&(InformationRequest::Export as u16).to_be_bytes());
                data.extend_from_slice(&size.to_be_bytes());
                data.extend_from_slice(&flags.bits().to_be_bytes());
            }
            Self::Name(name) => {
                data.extend_from_slice(&(InformationRequest::Name as u16).to_be_bytes());
                data.extend_from_slice(name.as_bytes());
            }
            Self::CapabilityModes(modes) => {
                data.extend_from_slice(
                    &(InformationRequest::CapabilityModes as u16).to_be_bytes(),
                );
                data.extend_from_slice(&modes.bits().to_be_bytes());
            }
            Self::Unknown(info_type) => data.extend_from_slice(&info_type.to_be_bytes()),
        }
        data
    }

    fn parse(data: &[u8]) -> Result<Self, NegotiationError> {
        let malformed = |what: &str| NegotiationError::MalformedReply(format!("short {what} info"));

        let (type_bytes, rest) = data
            .split_first_chunk::<2>()
            .ok_or_else(|| malformed("information"))?;
        let info_type = u16::from_be_bytes(*type_bytes);

        Ok(match InformationRequest::try_from(info_type) {
            Ok(InformationRequest::Export) => {
                if rest.len() != 10 {
                    return Err(malformed("export"));
                }
                let mut size = [0; 8];
                size.copy_from_slice(&rest[..8]);
                let flags = u16::from_be_bytes([rest[8], rest[9]]);
                Self::Export(
                    u64::from_be_bytes(size),
                    TransmissionFlags::from_bits_truncate(flags),
                )
            }
            Ok(InformationRequest::Name) => Self::Name(String::from_utf8_lossy(rest).into_owned()),
            Ok(InformationRequest::CapabilityModes) => {
                let modes = rest
                    .first_chunk::<2>()
                    .filter(|_| rest.len() == 2)
                    .ok_or_else(|| malformed("capability modes"))?;
                let bits = u16::from_be_bytes(*modes);
                Self::CapabilityModes(CapabilityModes::from_bits(bits).ok_or(
                    NegotiationError::MalformedFlags("unknown capability mode bits"),
                )?)
            }
            Ok(_) | Err(_) => Self::Unknown(info_type),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OptionReply {
    Ack,
    Server(String),
    Info(InfoPayload),
    /// Any reply type with bit 31 set
    Rejected(u32),
}

impl OptionReply {
    pub(crate) fn get_reply_type(&self) -> u32 {
        match self {
            Self::Ack => OptionReplyType::Ack.into(),
            Self::Server(_) => OptionReplyType::Server.into(),
            Self::Info(_) => OptionReplyType::Info.into(),
            Self::Rejected(reply_type) => *reply_type,
        }
    }

    pub(crate) fn get_data(&self) -> Vec<u8> {
        match self {
            Self::Ack => vec![],
            Self::Server(name) => {
                let mut data = Vec::with_capacity(4 + name.len());
                data.extend_from_slice(&(name.len() as u32).to_be_bytes());
                data.extend_from_slice(name.as_bytes());
                data
            }
            Self::Info(payload) => payload.to_bytes(),
            // Error replies may carry a message; OptionReplyError's text is used
            Self::Rejected(reply_type) => OptionReplyError::try_from(*reply_type)
                .map(|e| e.to_string().into_bytes())
                .unwrap_or_default(),
        }
    }

    pub(crate) fn to_raw(&self, option: u32) -> OptionReplyRaw {
        OptionReplyRaw::new(option, self.get_reply_type(), self.get_data())
    }
}

impl From<OptionReplyError> for OptionReply {
    fn from(error: OptionReplyError) -> Self {
        Self::Rejected(error.into())
    }
}

impl TryFrom<&OptionReplyRaw> for OptionReply {
    type Error = NegotiationError;

    fn try_from(raw: &OptionReplyRaw) -> Result<Self, NegotiationError> {
        if raw.magic != NBD_REPLY_MAGIC {
            return Err(NegotiationError::MalformedReply(format!(
                "bad option reply magic {:#x}",
                raw.magic
            )));
        }

        if raw.reply_type & OptionReplyError::ERROR_BIT != 0 {
            return Ok(Self::Rejected(raw.reply_type));
        }

        match OptionReplyType::try_from(raw.reply_type) {
            Ok(OptionReplyType::Ack) => Ok(Self::Ack),
            Ok(OptionReplyType::Server) => {
                let (len_bytes, rest) = raw.data.split_first_chunk::<4>().ok_or_else(|| {
                    NegotiationError::MalformedReply("short server reply".to_string())
                })?;
                let name_len = u32::from_be_bytes(*len_bytes) as usize;
                let name = rest.get(..name_len).ok_or_else(|| {
                    NegotiationError::MalformedReply("server reply name overruns".to_string())
                })?;
                Ok(Self::Server(String::from_utf8_lossy(name).into_owned()))
            }
            Ok(OptionReplyType::Info) => Ok(Self::Info(InfoPayload::parse(&raw.data)?)),
            Err(_) => Err(NegotiationError::MalformedReply(format!(
                "unknown option reply type {}",
                raw.reply_type
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reparse(reply: &OptionReply) -> OptionReply {
        OptionReply::try_from(&reply.to_raw(7)).unwrap()
    }

    #[test]
    fn test_export_info_layout() {
        let flags = TransmissionFlags::HAS_FLAGS | TransmissionFlags::SEND_FLUSH;
        let reply = OptionReply::Info(InfoPayload::Export(1 << 20, flags));

        let data = reply.get_data();
        assert_eq!(data.len(), 12);
        assert_eq!(&data[..2], &[0, 0]);
        assert_eq!(&data[10..], &flags.bits().to_be_bytes());
        assert_eq!(reparse(&reply), reply);
    }

    #[test]
    fn test_capability_modes_info() {
        let reply = OptionReply::Info(InfoPayload::CapabilityModes(
            CapabilityModes::FUA_EMULATE | CapabilityModes::CACHE_NATIVE,
        ));
        assert_eq!(reparse(&reply), reply);
    }

    #[test]
    fn test_unknown_mode_bits_are_malformed() {
        let raw = OptionReplyRaw::new(7, 3, vec![0x4e, 0x42, 0x00, 0x10]);
        assert!(matches!(
            OptionReply::try_from(&raw),
            Err(NegotiationError::MalformedFlags(_))
        ));
    }

    #[test]
    fn test_unknown_info_is_tolerated() {
        // NBD_INFO_BLOCK_SIZE
        let raw = OptionReplyRaw::new(7, 3, vec![0, 3, 0, 0, 0, 1, 0, 0, 16, 0, 0, 0, 16, 0]);
        assert_eq!(
            OptionReply::try_from(&raw).unwrap(),
            OptionReply::Info(InfoPayload::Unknown(3))
        );
    }

    #[test]
    fn test_server_reply() {
        let reply = OptionReply::Server("disk".to_string());
        assert_eq!(reply.get_data(), vec![0, 0, 0, 4, b'd', b'i', b's', b'k']);
        assert_eq!(reparse(&reply), reply);
    }

    #[test]
    fn test_error_reply_carries_text() {
        let reply = OptionReply::from(OptionReplyError::Unknown);
        assert_eq!(reply.get_reply_type(), 0x80000006);
        assert!(!reply.get_data().is_empty());
        assert_eq!(reparse(&reply), reply);
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = OptionReply::Ack.to_raw(7);
        raw.magic = 0;
        assert!(matches!(
            OptionReply::try_from(&raw),
            Err(NegotiationError::MalformedReply(_))
        ));
    }
}
