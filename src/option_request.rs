/// Typed NBD option requests.
///
/// Only the options needed to select an export are understood. Everything
/// else (TLS, structured replies, meta contexts) is answered with
/// `NBD_REP_ERR_UNSUP` and negotiation continues.
use int_enum::IntEnum;

use crate::errors::OptionReplyError;
use crate::info::InformationRequest;
use crate::io::option_request::OptionRequestRaw;
use crate::magic::NBD_IHAVEOPT;

/// Longest export name accepted, as recommended by the protocol.
pub(crate) const MAX_NAME_LENGTH: usize = 4096;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub(crate) enum OptionType {
    ExportName = 1,
    Abort = 2,
    List = 3,
    Info = 6,
    Go = 7,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OptionRequest {
    /// Select an export and end negotiation without any reply
    ExportName(String),

    /// The client gives up
    Abort,

    /// Ask for the list of exports
    List,

    /// Describe an export: (name, requested information)
    Info(String, Vec<InformationRequest>),

    /// Describe and select an export: (name, requested information)
    Go(String, Vec<InformationRequest>),
}

impl OptionRequest {
    pub(crate) fn option_type(&self) -> OptionType {
        match self {
            Self::ExportName(_) => OptionType::ExportName,
            Self::Abort => OptionType::Abort,
            Self::List => OptionType::List,
            Self::Info(..) => OptionType::Info,
            Self::Go(..) => OptionType::Go,
        }
    }

    pub(crate) fn to_raw(&self) -> OptionRequestRaw {
        let data = match self {
            Self::ExportName(name) => name.as_bytes().to_vec(),
            Self::Abort | Self::List => vec![],
            Self::Info(name, requests) | Self::Go(name, requests) => {
                // C: 32 bits, length of name (unsigned); MUST be no larger than the
                //    option data length - 6
                // C: String: name of the export
                // C: 16 bits, number of information requests
                // C: 16 bits x n - list of `NBD_INFO` information requests
                let mut data = Vec::with_capacity(4 + name.len() + 2 + 2 * requests.len());
                data.extend_from_slice(&(name.len() as u32).to_be_bytes());
                data.extend_from_slice(name.as_bytes());
                data.extend_from_slice(&(requests.len() as u16).to_be_bytes());
                for request in requests {
                    data.extend_from_slice(&(*request as u16).to_be_bytes());
                }
                data
            }
        };
        OptionRequestRaw::new(self.option_type().into(), data)
    }

    fn parse_name(bytes: &[u8]) -> Result<String, OptionReplyError> {
        if bytes.len() > MAX_NAME_LENGTH {
            return Err(OptionReplyError::TooBig);
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| OptionReplyError::Invalid)
    }

    fn parse_info(data: &[u8]) -> Result<(String, Vec<InformationRequest>), OptionReplyError> {
        let (len_bytes, rest) = data
            .split_first_chunk::<4>()
            .ok_or(OptionReplyError::Invalid)?;
        let name_len = u32::from_be_bytes(*len_bytes) as usize;
        if rest.len() < name_len.saturating_add(2) {
            return Err(OptionReplyError::Invalid);
        }
        let (name, rest) = rest.split_at(name_len);
        let (count_bytes, rest) = rest
            .split_first_chunk::<2>()
            .ok_or(OptionReplyError::Invalid)?;
        let count = u16::from_be_bytes(*count_bytes) as usize;
        if rest.len() != count * 2 {
            return Err(OptionReplyError::Invalid);
        }

        // Unknown information types are ignored
        let requests = rest
            .chunks_exact(2)
            .filter_map(|chunk| InformationRequest::try_from(u16::from_be_bytes([chunk[0], chunk[1]])).ok())
            .collect();

        Ok((Self::parse_name(name)?, requests))
    }
}

impl TryFrom<&OptionRequestRaw> for OptionRequest {
    type Error = OptionReplyError;

    fn try_from(raw: &OptionRequestRaw) -> Result<Self, Self::Error> {
        if raw.magic != NBD_IHAVEOPT {
            return Err(OptionReplyError::Invalid);
        }

        let option = OptionType::try_from(raw.option).map_err(|_| OptionReplyError::Unsupported)?;

        Ok(match option {
            OptionType::ExportName => Self::ExportName(Self::parse_name(&raw.data)?),
            OptionType::Abort | OptionType::List if !raw.data.is_empty() => {
                return Err(OptionReplyError::Invalid)
            }
            OptionType::Abort => Self::Abort,
            OptionType::List => Self::List,
            OptionType::Info => {
                let (name, requests) = Self::parse_info(&raw.data)?;
                Self::Info(name, requests)
            }
            OptionType::Go => {
                let (name, requests) = Self::parse_info(&raw.data)?;
                Self::Go(name, requests)
            }
        })
    }
}
