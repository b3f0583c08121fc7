//! Client side of the handshake and option haggling.
//!
//! The sequence is fixed: server greeting, client flags, then options until
//! an export is selected. `NBD_OPT_GO` is tried first; a server that does
//! not know it gets the older `NBD_OPT_EXPORT_NAME`.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

use crate::capability::{CapabilitySet, ExportDescriptor};
use crate::errors::{NegotiationError, OptionReplyError};
use crate::flags::{ClientFlags, HandshakeFlags, TransmissionFlags};
use crate::info::InformationRequest;
use crate::io::option_reply::OptionReplyRaw;
use crate::magic::{NBD_IHAVEOPT, NBD_MAGIC, NBD_OLDSTYLE_MAGIC};
use crate::option_reply::{InfoPayload, OptionReply};
use crate::option_request::{OptionRequest, OptionType, MAX_NAME_LENGTH};
use crate::transport::Transport;

/// Padding after the `NBD_OPT_EXPORT_NAME` reply unless `NO_ZEROES` was agreed.
const EXPORT_NAME_PADDING: usize = 124;

/// The outcome of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedExport {
    pub descriptor: ExportDescriptor,
    /// The canonical name if the server sent one, otherwise the requested name.
    pub name: String,
}

/// Drives one negotiation over a borrowed transport.
pub struct Negotiator<'a> {
    transport: &'a mut Transport,
}

impl<'a> Negotiator<'a> {
    pub fn new(transport: &'a mut Transport) -> Self {
        Self { transport }
    }

    /// Runs the whole handshake and selects `export_name`.
    pub async fn negotiate(mut self, export_name: &str) -> Result<NegotiatedExport, NegotiationError> {
        if export_name.len() > MAX_NAME_LENGTH {
            return Err(NegotiationError::ExportNotFound(export_name.to_string()));
        }

        let agreed = self.handshake().await?;

        match self.go(export_name).await? {
            Some(export) => Ok(export),
            None => self.export_name(export_name, agreed).await,
        }
    }

    /// Runs the handshake, asks for the export list and aborts negotiation.
    pub async fn list_exports(mut self) -> Result<Vec<String>, NegotiationError> {
        self.handshake().await?;
        self.send(&OptionRequest::List).await?;

        let mut names = Vec::new();
        loop {
            match self.receive(OptionType::List).await? {
                OptionReply::Server(name) => names.push(name),
                OptionReply::Ack => break,
                OptionReply::Rejected(reply_type) => {
                    return Err(NegotiationError::Rejected {
                        option: OptionType::List.into(),
                        reply_type,
                    })
                }
                other => {
                    return Err(NegotiationError::MalformedReply(format!(
                        "unexpected {other:?} in export list"
                    )))
                }
            }
        }

        // The server may acknowledge the abort or simply hang up
        self.send(&OptionRequest::Abort).await?;
        if let Err(error) = self.receive(OptionType::Abort).await {
            trace!(%error, "no acknowledgement for abort");
        }

        Ok(names)
    }

    async fn handshake(&mut self) -> Result<HandshakeFlags, NegotiationError> {
        // S: 64 bits, 0x4e42444d41474943 (ASCII 'NBDMAGIC')
        // S: 64 bits, 0x49484156454F5054 (ASCII 'IHAVEOPT')
        // S: 16 bits, handshake flags
        // C: 32 bits, client flags
        let magic = self.transport.read_u64().await?;
        if magic != NBD_MAGIC {
            return Err(NegotiationError::UnknownMagic(magic));
        }

        let magic = self.transport.read_u64().await?;
        if magic != NBD_IHAVEOPT {
            if magic == NBD_OLDSTYLE_MAGIC {
                debug!("server only speaks oldstyle negotiation");
            }
            return Err(NegotiationError::UnknownMagic(magic));
        }

        let offered = HandshakeFlags::from_bits_truncate(self.transport.read_u16().await?);
        if !offered.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            return Err(NegotiationError::Unsupported);
        }

        let client_flags = ClientFlags::from(offered);
        self.transport.write_u32(client_flags.bits()).await?;
        AsyncWriteExt::flush(&mut *self.transport).await?;

        debug!(?offered, "handshake complete");
        Ok(offered)
    }

    /// `Ok(None)` means the server does not know `NBD_OPT_GO`.
    async fn go(&mut self, export_name: &str) -> Result<Option<NegotiatedExport>, NegotiationError> {
        let request = OptionRequest::Go(
            export_name.to_string(),
            vec![
                InformationRequest::Export,
                InformationRequest::Name,
                InformationRequest::CapabilityModes,
            ],
        );
        self.send(&request).await?;

        let mut export = None;
        let mut modes = None;
        let mut canonical_name = None;

        loop {
            match self.receive(OptionType::Go).await? {
                OptionReply::Info(InfoPayload::Export(size, flags)) => export = Some((size, flags)),
                OptionReply::Info(InfoPayload::Name(name)) => canonical_name = Some(name),
                OptionReply::Info(InfoPayload::CapabilityModes(bits)) => modes = Some(bits),
                OptionReply::Info(InfoPayload::Unknown(info_type)) => {
                    trace!(info_type, "ignoring unknown information reply");
                }
                OptionReply::Ack => break,
                OptionReply::Rejected(reply_type)
                    if reply_type == u32::from(OptionReplyError::Unsupported) =>
                {
                    debug!("server does not support NBD_OPT_GO, falling back to NBD_OPT_EXPORT_NAME");
                    return Ok(None);
                }
                OptionReply::Rejected(reply_type)
                    if reply_type == u32::from(OptionReplyError::Unknown) =>
                {
                    return Err(NegotiationError::ExportNotFound(export_name.to_string()));
                }
                OptionReply::Rejected(reply_type) => {
                    return Err(NegotiationError::Rejected {
                        option: OptionType::Go.into(),
                        reply_type,
                    });
                }
                OptionReply::Server(_) => {
                    return Err(NegotiationError::MalformedReply(
                        "server reply in answer to NBD_OPT_GO".to_string(),
                    ));
                }
            }
        }

        let (size, flags) = export.ok_or(NegotiationError::MissingExportInfo)?;
        let capabilities = CapabilitySet::from_wire(flags, modes)?;

        debug!(size, ?capabilities, "export selected");
        Ok(Some(NegotiatedExport {
            descriptor: ExportDescriptor::new(size, capabilities),
            name: canonical_name.unwrap_or_else(|| export_name.to_string()),
        }))
    }

    async fn export_name(
        &mut self,
        export_name: &str,
        agreed: HandshakeFlags,
    ) -> Result<NegotiatedExport, NegotiationError> {
        self.send(&OptionRequest::ExportName(export_name.to_string()))
            .await?;

        // There is no error reply to NBD_OPT_EXPORT_NAME, the server hangs up
        let not_found = |error: io::Error| match error.kind() {
            io::ErrorKind::UnexpectedEof => NegotiationError::ExportNotFound(export_name.to_string()),
            _ => NegotiationError::Io(error),
        };

        let size = self.transport.read_u64().await.map_err(not_found)?;
        let flags = self.transport.read_u16().await.map_err(not_found)?;
        if !agreed.contains(HandshakeFlags::NO_ZEROES) {
            let mut padding = [0; EXPORT_NAME_PADDING];
            AsyncReadExt::read_exact(&mut *self.transport, &mut padding).await?;
        }

        let capabilities =
            CapabilitySet::from_wire(TransmissionFlags::from_bits_truncate(flags), None)?;

        debug!(size, ?capabilities, "export selected");
        Ok(NegotiatedExport {
            descriptor: ExportDescriptor::new(size, capabilities),
            name: export_name.to_string(),
        })
    }

    async fn send(&mut self, request: &OptionRequest) -> Result<(), NegotiationError> {
        trace!(?request, "sending option");
        request.to_raw().write(&mut *self.transport).await?;
        AsyncWriteExt::flush(&mut *self.transport).await?;
        Ok(())
    }

    async fn receive(&mut self, option: OptionType) -> Result<OptionReply, NegotiationError> {
        let raw = OptionReplyRaw::read(&mut *self.transport).await?;
        let reply = OptionReply::try_from(&raw)?;
        if raw.option != u32::from(option) {
            return Err(NegotiationError::MalformedReply(format!(
                "reply to option {} while waiting for option {}",
                raw.option,
                u32::from(option)
            )));
        }
        trace!(?reply, "received option reply");
        Ok(reply)
    }
}
