//! Network Block Device (NBD) server: negotiation and request dispatch.
//!
//! [`NbdServer`] speaks the server side of the protocol over any pair of
//! async reader/writer halves and forwards requests to a [`Plugin`].
//!
//! The NBD protocol consists of two phases:
//!
//! 1. **Handshake and negotiation phase**: the server and client establish
//!    capabilities and select an export.
//! 2. **Transmission phase**: requests are validated against the export's
//!    capabilities and handed to the plugin.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use nbd_core::config::PluginConfig;
//! use nbd_core::memory::MemoryPlugin;
//! use nbd_core::server::NbdServer;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PluginConfig::from_json(r#"{"size": 1048576, "can_flush": true}"#)?;
//!     let server = NbdServer::new(Arc::new(MemoryPlugin::new(config)?));
//!
//!     let listener = TcpListener::bind("127.0.0.1:10809").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let server = server.clone();
//!         tokio::spawn(async move {
//!             let (reader, writer) = stream.into_split();
//!             server.serve(reader, writer).await
//!         });
//!     }
//! }
//! ```
//!
//! # Security Considerations
//!
//! NBD does not provide built-in authentication or encryption. For secure deployments:
//!
//! - Use on trusted networks only
//! - Use firewall rules to restrict access

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, trace, warn};

use crate::capability::{Capability, ExportDescriptor};
use crate::command_request::{CommandRequest, MAX_PAYLOAD_SIZE};
use crate::errors::{ErrorCode, OptionReplyError};
use crate::flags::{ClientFlags, CommandFlags, HandlerFlags, HandshakeFlags};
use crate::info::InformationRequest;
use crate::io::command_reply::SimpleReplyRaw;
use crate::io::command_request::CommandRequestRaw;
use crate::io::option_request::OptionRequestRaw;
use crate::magic::{NBD_IHAVEOPT, NBD_MAGIC};
use crate::option_reply::{InfoPayload, OptionReply};
use crate::option_request::OptionRequest;
use crate::plugin::Plugin;

/// Size of the reads used to emulate a cache request.
const CACHE_EMULATION_CHUNK: u32 = 1024 * 1024;

/// Padding after the `NBD_OPT_EXPORT_NAME` reply unless `NO_ZEROES` was agreed.
const EXPORT_NAME_PADDING: [u8; 124] = [0; 124];

/// Internal enum to control flow during option negotiation.
enum OptionReplyFinalize {
    /// The client sent `NBD_OPT_ABORT`
    Abort,

    /// Wait for more options
    Continue,

    /// End the negotiation and proceed to transmission phase
    End(ExportDescriptor),
}

/// The main NBD server implementation.
///
/// Cloning is cheap: clones share the plugin.
pub struct NbdServer<P>
where
    P: Plugin,
{
    plugin: Arc<P>,
    /// The only name accepted. `None` accepts any name, like nbdkit does.
    export_name: Option<String>,
}

impl<P> Clone for NbdServer<P>
where
    P: Plugin,
{
    fn clone(&self) -> Self {
        Self {
            plugin: Arc::clone(&self.plugin),
            export_name: self.export_name.clone(),
        }
    }
}

impl<P> NbdServer<P>
where
    P: Plugin,
{
    pub fn new(plugin: Arc<P>) -> Self {
        Self {
            plugin,
            export_name: None,
        }
    }

    /// Only accept clients asking for `name`. Other names get
    /// `NBD_REP_ERR_UNKNOWN`.
    pub fn with_export_name(mut self, name: impl Into<String>) -> Self {
        self.export_name = Some(name.into());
        self
    }

    pub fn plugin(&self) -> &Arc<P> {
        &self.plugin
    }

    fn accepts(&self, name: &str) -> bool {
        self.export_name.as_deref().map_or(true, |only| only == name)
    }

    fn describe_export(&self) -> ExportDescriptor {
        let capabilities = self.plugin.capabilities();
        ExportDescriptor::new(capabilities.size, capabilities.advertised())
    }

    /// Serves one client until it disconnects.
    ///
    /// # Returns
    /// - `Ok(())`: the client disconnected, aborted negotiation, or a handler
    ///   reported `ErrorCode::ServerShuttingDown`
    /// - `Err(io::Error)`: the stream failed or the client broke the protocol
    ///   in a way that cannot be answered
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        debug!("starting handshake");
        let client_flags = self.handle_handshake(&mut reader, &mut writer).await?;

        debug!("starting option negotiation");
        let Some(export) = self
            .handle_options(&mut reader, &mut writer, client_flags)
            .await?
        else {
            info!("client aborted negotiation");
            return Ok(());
        };

        debug!(size = export.size(), flags = ?export.flags(), "starting transmission");
        self.handle_commands(&export, &mut reader, &mut writer).await
    }

    /// Handles the initial NBD handshake.
    ///
    /// The server sends:
    /// 1. The NBD magic number
    /// 2. The IHAVEOPT magic number (indicating support for option negotiation)
    /// 3. Handshake flags (FIXED_NEWSTYLE and NO_ZEROES)
    ///
    /// The client responds with its own flags, which must include
    /// FIXED_NEWSTYLE. NO_ZEROES is optional.
    async fn handle_handshake<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<ClientFlags>
    where
        R: AsyncReadExt + Unpin,
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&NBD_MAGIC.to_be_bytes()).await?;
        writer.write_all(&NBD_IHAVEOPT.to_be_bytes()).await?;
        writer
            .write_all(&HandshakeFlags::default().bits().to_be_bytes())
            .await?;
        writer.flush().await?;

        let client_flags = reader.read_u32().await?;

        let client_flags = ClientFlags::from_bits(client_flags).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown client flags {client_flags:#x}"),
            )
        })?;

        if !client_flags.contains(ClientFlags::FIXED_NEWSTYLE) {
            warn!("client did not send FIXED_NEWSTYLE flag, which is required");
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "client did not send FIXED_NEWSTYLE flag, which is required",
            ));
        }

        Ok(client_flags)
    }

    /// Processes an option request from the client.
    ///
    /// Returns the replies to send back and how to proceed afterwards.
    fn handle_option_request(
        &self,
        request: &OptionRequest,
    ) -> Result<(Vec<OptionReply>, OptionReplyFinalize), OptionReplyError> {
        let mut responses: Vec<OptionReply> = Vec::new();

        match request {
            OptionRequest::Abort => {
                responses.push(OptionReply::Ack);
                return Ok((responses, OptionReplyFinalize::Abort));
            }
            OptionRequest::List => {
                responses.push(OptionReply::Server(
                    self.export_name.clone().unwrap_or_default(),
                ));
                responses.push(OptionReply::Ack);
            }
            OptionRequest::Info(name, info_requests) | OptionRequest::Go(name, info_requests) => {
                if !self.accepts(name) {
                    return Err(OptionReplyError::Unknown);
                }

                let export = self.describe_export();
                let (flags, modes) = export.flags().to_wire();

                responses.push(OptionReply::Info(InfoPayload::Export(export.size(), flags)));
                if info_requests.contains(&InformationRequest::Name) {
                    responses.push(OptionReply::Info(InfoPayload::Name(name.clone())));
                }
                // Sent unrequested as well; clients ignore info types they don't know
                responses.push(OptionReply::Info(InfoPayload::CapabilityModes(modes)));
                responses.push(OptionReply::Ack);

                if matches!(request, OptionRequest::Go(..)) {
                    return Ok((responses, OptionReplyFinalize::End(export)));
                }
            }
            OptionRequest::ExportName(_) => {
                // Answered without option replies, see handle_options
                return Err(OptionReplyError::Invalid);
            }
        }
        Ok((responses, OptionReplyFinalize::Continue))
    }

    /// Handles the option negotiation phase of the NBD protocol.
    ///
    /// Returns `None` when the client aborts.
    async fn handle_options<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        client_flags: ClientFlags,
    ) -> io::Result<Option<ExportDescriptor>>
    where
        R: AsyncReadExt + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let request_raw = OptionRequestRaw::read(reader).await?;
            let option = request_raw.option;

            let request = match OptionRequest::try_from(&request_raw) {
                Err(e) => {
                    debug!(option, error = %e, "refusing option");
                    OptionReply::from(e).to_raw(option).write(writer).await?;
                    writer.flush().await?;
                    continue;
                }
                Ok(req) => req,
            };

            trace!(?request, "parsed option request");

            // NBD_OPT_EXPORT_NAME has no error reply: an unknown name ends the session
            if let OptionRequest::ExportName(name) = &request {
                if !self.accepts(name) {
                    warn!(name = %name, "client asked for an unknown export");
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("unknown export {name:?}"),
                    ));
                }
                let export = self.describe_export();
                let (flags, _) = export.flags().to_wire();
                writer.write_u64(export.size()).await?;
                writer.write_u16(flags.bits()).await?;
                if !client_flags.contains(ClientFlags::NO_ZEROES) {
                    writer.write_all(&EXPORT_NAME_PADDING).await?;
                }
                writer.flush().await?;
                return Ok(Some(export));
            }

            match self.handle_option_request(&request) {
                Err(e) => {
                    debug!(option, error = %e, "option failed");
                    OptionReply::from(e).to_raw(option).write(writer).await?;
                    writer.flush().await?;
                }
                Ok((responses, finalize)) => {
                    for response in responses {
                        trace!(?response, "writing option reply");
                        response.to_raw(option).write(writer).await?;
                    }
                    writer.flush().await?;

                    match finalize {
                        OptionReplyFinalize::Abort => return Ok(None),
                        OptionReplyFinalize::Continue => {}
                        OptionReplyFinalize::End(export) => return Ok(Some(export)),
                    }
                }
            }
        }
    }

    /// Handles NBD commands during the transmission phase.
    ///
    /// For each command:
    /// 1. Read the raw command request
    /// 2. Validate it against the export (see [`NbdServer::validate`])
    /// 3. Execute it through the plugin
    /// 4. Send the reply back to the client
    async fn handle_commands<R, W>(
        &self,
        export: &ExportDescriptor,
        reader: &mut R,
        writer: &mut W,
    ) -> io::Result<()>
    where
        R: AsyncReadExt + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let command_raw = match CommandRequestRaw::read(reader).await {
                Ok(command_raw) => command_raw,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("client hung up without NBD_CMD_DISC");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            // should be before the conversion due to the move
            let cookie = command_raw.cookie;
            let raw_flags = command_raw.flags;
            trace!(?command_raw, "received command");

            let result = match CommandRequest::try_from(command_raw) {
                Ok(CommandRequest::Disconnect) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Ok(command) => match Self::validate(export, &command, raw_flags) {
                    Ok(flags) => self.execute(export, command, flags).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            let reply = match result {
                Ok(data) => SimpleReplyRaw::new(0, cookie, data),
                Err(e) => {
                    debug!(cookie, error = %e, "command failed");
                    SimpleReplyRaw::new(e.raw(), cookie, vec![])
                }
            };

            reply.write(writer).await?;
            // Flush so the client gets the reply before we wait for the next command
            writer.flush().await?;

            if reply.error == ErrorCode::ServerShuttingDown.raw() {
                warn!("plugin is shutting down, ending the session");
                return Ok(());
            }
        }
    }

    /// Checks a request against the export before any handler runs.
    ///
    /// The order of the checks decides which error a request breaking
    /// several rules gets.
    fn validate(
        export: &ExportDescriptor,
        command: &CommandRequest,
        raw_flags: u16,
    ) -> Result<CommandFlags, ErrorCode> {
        let capabilities = export.flags();
        let kind = command.kind();

        let flags = CommandFlags::try_from(raw_flags).map_err(|_| ErrorCode::InvalidArgument)?;
        if !kind.permitted_flags().contains(flags) {
            return Err(ErrorCode::InvalidArgument);
        }

        if kind.is_write() && capabilities.read_only {
            return Err(ErrorCode::CommandNotPermitted);
        }

        let declared = match command {
            CommandRequest::Flush => capabilities.supports_flush,
            CommandRequest::Trim(..) => capabilities.supports_trim,
            CommandRequest::Zero(..) => capabilities.supports_zero,
            CommandRequest::Cache(..) => capabilities.supports_cache.is_supported(),
            _ => true,
        };
        if !declared {
            return Err(ErrorCode::InvalidArgument);
        }

        if flags.contains(CommandFlags::FUA) && !capabilities.supports_fua.is_supported() {
            return Err(ErrorCode::InvalidArgument);
        }
        if flags.contains(CommandFlags::FAST_ZERO) && !capabilities.supports_fast_zero {
            return Err(ErrorCode::InvalidArgument);
        }

        if let CommandRequest::Read(_, length) = command {
            if *length > MAX_PAYLOAD_SIZE {
                return Err(ErrorCode::OutOfMemory);
            }
        }

        if let Some((offset, length)) = command.range() {
            let in_range = offset
                .checked_add(length)
                .is_some_and(|end| end <= export.size());
            if !in_range {
                return Err(ErrorCode::InvalidArgument);
            }
        }

        Ok(flags)
    }

    /// Runs a validated command through the plugin.
    async fn execute(
        &self,
        export: &ExportDescriptor,
        command: CommandRequest,
        flags: CommandFlags,
    ) -> Result<Vec<u8>, ErrorCode> {
        let fua = flags.contains(CommandFlags::FUA);
        let fua_mode = export.flags().supports_fua;

        let mut handler_flags = HandlerFlags::empty();
        handler_flags.set(HandlerFlags::FUA, fua && fua_mode == Capability::Native);

        let data = match command {
            CommandRequest::Read(offset, length) => {
                let data = self.plugin.on_read(offset, length).await?;
                if data.len() != length as usize {
                    warn!(offset, length, returned = data.len(), "plugin returned a short read");
                    return Err(ErrorCode::IO);
                }
                data
            }
            CommandRequest::Write(offset, data) => {
                self.plugin.on_write(offset, data, handler_flags).await?;
                vec![]
            }
            CommandRequest::Flush => {
                self.plugin.on_flush().await?;
                vec![]
            }
            CommandRequest::Trim(offset, length) => {
                self.plugin.on_trim(offset, length, handler_flags).await?;
                vec![]
            }
            CommandRequest::Zero(offset, length) => {
                handler_flags.set(HandlerFlags::MAY_TRIM, !flags.contains(CommandFlags::NO_HOLE));
                handler_flags.set(HandlerFlags::FAST_ZERO, flags.contains(CommandFlags::FAST_ZERO));
                self.plugin.on_zero(offset, length, handler_flags).await?;
                vec![]
            }
            CommandRequest::Cache(offset, length) => {
                match export.flags().supports_cache {
                    Capability::Native => self.plugin.on_cache(offset, length).await?,
                    Capability::Emulate => self.emulate_cache(offset, length).await?,
                    Capability::None => return Err(ErrorCode::InvalidArgument),
                }
                vec![]
            }
            CommandRequest::Disconnect => vec![],
        };

        if fua && fua_mode == Capability::Emulate {
            trace!("emulating FUA with a flush");
            self.plugin.on_flush().await?;
        }

        Ok(data)
    }

    /// Reads the range through the plugin and throws the data away.
    async fn emulate_cache(&self, offset: u64, length: u32) -> Result<(), ErrorCode> {
        let end = offset + u64::from(length);
        let mut position = offset;
        while position < end {
            let chunk = (end - position).min(u64::from(CACHE_EMULATION_CHUNK)) as u32;
            self.plugin.on_read(position, chunk).await?;
            position += u64::from(chunk);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::command_request::CommandKind;
    use crate::config::PluginConfig;
    use crate::flags::TransmissionFlags;
    use crate::io::option_reply::OptionReplyRaw;
    use crate::memory::MemoryPlugin;
    use crate::option_request::OptionType;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    /// A hand-driven client that can send what a well behaved client never would.
    struct RawClient {
        stream: DuplexStream,
        server: JoinHandle<io::Result<()>>,
        plugin: Arc<MemoryPlugin>,
    }

    impl RawClient {
        async fn start(json: &str, no_zeroes: bool) -> Self {
            let plugin = Arc::new(MemoryPlugin::new(PluginConfig::from_json(json).unwrap()).unwrap());
            let server = NbdServer::new(Arc::clone(&plugin));
            let (client, server_end) = tokio::io::duplex(1 << 16);
            let server = tokio::spawn(async move {
                let (reader, writer) = tokio::io::split(server_end);
                server.serve(reader, writer).await
            });

            let mut stream = client;
            assert_eq!(stream.read_u64().await.unwrap(), NBD_MAGIC);
            assert_eq!(stream.read_u64().await.unwrap(), NBD_IHAVEOPT);
            assert_eq!(stream.read_u16().await.unwrap(), 0b11);
            let flags = if no_zeroes { 0b11 } else { 0b01 };
            stream.write_u32(flags).await.unwrap();

            Self { stream, server, plugin }
        }

        async fn option(&mut self, request: OptionRequest) -> Vec<OptionReply> {
            request.to_raw().write(&mut self.stream).await.unwrap();
            let mut replies = Vec::new();
            loop {
                let raw = OptionReplyRaw::read(&mut self.stream).await.unwrap();
                assert_eq!(raw.option, u32::from(request.option_type()));
                let reply = OptionReply::try_from(&raw).unwrap();
                let done = matches!(reply, OptionReply::Ack | OptionReply::Rejected(_));
                replies.push(reply);
                if done {
                    return replies;
                }
            }
        }

        async fn go(json: &str) -> Self {
            let mut client = Self::start(json, true).await;
            let replies = client
                .option(OptionRequest::Go(String::new(), vec![]))
                .await;
            assert_eq!(replies.last(), Some(&OptionReply::Ack));
            client
        }

        async fn command(&mut self, kind: u16, flags: u16, offset: u64, length: u32) -> u32 {
            let data = if kind == CommandKind::Write as u16 {
                vec![0xaa; length as usize]
            } else {
                vec![]
            };
            CommandRequestRaw::new(flags, kind, 77, offset, length, data)
                .write(&mut self.stream)
                .await
                .unwrap();
            let mut reply = SimpleReplyRaw::read_header(&mut self.stream).await.unwrap();
            assert_eq!(reply.cookie, 77);
            if reply.error == 0 && kind == CommandKind::Read as u16 {
                reply
                    .read_data(&mut self.stream, length as usize)
                    .await
                    .unwrap();
            }
            reply.error
        }

        async fn disconnect(mut self) {
            CommandRequestRaw::new(0, CommandKind::Disconnect as u16, 0, 0, 0, vec![])
                .write(&mut self.stream)
                .await
                .unwrap();
            assert!(self.server.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_go_describes_export() {
        let mut client = RawClient::start(
            r#"{"size": 512, "can_flush": true, "can_fua": "emulate", "can_cache": "native"}"#,
            true,
        )
        .await;

        let replies = client
            .option(OptionRequest::Go(
                "disk".to_string(),
                vec![InformationRequest::Name],
            ))
            .await;

        let expected_flags = TransmissionFlags::HAS_FLAGS
            | TransmissionFlags::SEND_FLUSH
            | TransmissionFlags::SEND_FUA
            | TransmissionFlags::SEND_WRITE_ZEROES
            | TransmissionFlags::SEND_CACHE;
        assert_eq!(
            replies[0],
            OptionReply::Info(InfoPayload::Export(512, expected_flags))
        );
        assert_eq!(
            replies[1],
            OptionReply::Info(InfoPayload::Name("disk".to_string()))
        );
        assert!(matches!(
            replies[2],
            OptionReply::Info(InfoPayload::CapabilityModes(_))
        ));
        assert_eq!(replies[3], OptionReply::Ack);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_unknown_option_is_unsupported() {
        let mut client = RawClient::start("{}", true).await;

        // NBD_OPT_STRUCTURED_REPLY
        OptionRequestRaw::new(8, vec![])
            .write(&mut client.stream)
            .await
            .unwrap();
        let raw = OptionReplyRaw::read(&mut client.stream).await.unwrap();
        assert_eq!(raw.reply_type, u32::from(OptionReplyError::Unsupported));

        // Negotiation continues afterwards
        let replies = client.option(OptionRequest::List).await;
        assert_eq!(
            replies,
            vec![OptionReply::Server(String::new()), OptionReply::Ack]
        );
    }

    #[tokio::test]
    async fn test_abort_ends_session() {
        let mut client = RawClient::start("{}", true).await;
        let replies = client.option(OptionRequest::Abort).await;
        assert_eq!(replies, vec![OptionReply::Ack]);
        assert!(client.server.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_restricted_export_name() {
        let plugin = Arc::new(MemoryPlugin::new(PluginConfig::default()).unwrap());
        let server = NbdServer::new(plugin).with_export_name("disk");
        assert!(server.accepts("disk"));
        assert!(!server.accepts(""));

        let request = OptionRequest::Info("other".to_string(), vec![]);
        assert!(matches!(
            server.handle_option_request(&request),
            Err(OptionReplyError::Unknown)
        ));
    }

    #[tokio::test]
    async fn test_export_name_with_padding() {
        let mut client = RawClient::start(r#"{"size": 4096}"#, false).await;
        OptionRequest::ExportName(String::new())
            .to_raw()
            .write(&mut client.stream)
            .await
            .unwrap();

        assert_eq!(client.stream.read_u64().await.unwrap(), 4096);
        let flags = client.stream.read_u16().await.unwrap();
        assert_ne!(flags & TransmissionFlags::HAS_FLAGS.bits(), 0);
        let mut padding = [1; 124];
        client.stream.read_exact(&mut padding).await.unwrap();
        assert_eq!(padding, [0; 124]);

        assert_eq!(client.command(CommandKind::Read as u16, 0, 0, 512).await, 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_rejects_unknown_command_and_flags() {
        let mut client = RawClient::go(r#"{"size": 512}"#).await;

        // NBD_CMD_BLOCK_STATUS
        assert_eq!(client.command(7, 0, 0, 512).await, 95);
        // Unknown flag bit
        assert_eq!(client.command(0, 0x80, 0, 512).await, 22);
        // NO_HOLE outside zero
        assert_eq!(client.command(1, 2, 0, 16).await, 22);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_refuses_undeclared_capabilities() {
        let mut client = RawClient::go(r#"{"size": 512, "can_zero": false}"#).await;

        assert_eq!(client.command(CommandKind::Flush as u16, 0, 0, 0).await, 22);
        assert_eq!(client.command(CommandKind::Trim as u16, 0, 0, 16).await, 22);
        assert_eq!(client.command(CommandKind::Zero as u16, 0, 0, 16).await, 22);
        assert_eq!(client.command(CommandKind::Cache as u16, 0, 0, 16).await, 22);
        // FUA with can_fua = none
        assert_eq!(client.command(CommandKind::Write as u16, 1, 0, 16).await, 22);

        // No handler ran
        assert!(client.plugin.delivered_flags().is_empty());
        assert_eq!(client.plugin.flush_count(), 0);
        assert_eq!(client.plugin.read_count(), 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_read_only_export() {
        let mut client = RawClient::go(r#"{"size": 512, "can_write": false}"#).await;

        assert_eq!(client.command(CommandKind::Write as u16, 0, 0, 16).await, 1);
        assert_eq!(client.command(CommandKind::Zero as u16, 0, 0, 16).await, 1);
        assert_eq!(client.command(CommandKind::Read as u16, 0, 0, 16).await, 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_out_of_range() {
        let mut client = RawClient::go(r#"{"size": 512}"#).await;

        assert_eq!(client.command(CommandKind::Read as u16, 0, 256, 512).await, 22);
        assert_eq!(client.command(CommandKind::Write as u16, 0, 512, 1).await, 22);
        assert_eq!(client.command(CommandKind::Zero as u16, 0, u64::MAX, 1).await, 22);
        assert_eq!(client.command(CommandKind::Read as u16, 0, 512, 0).await, 0);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_fast_zero_without_capability() {
        let mut client = RawClient::go(r#"{"size": 512, "can_fast_zero": false}"#).await;
        assert_eq!(
            client
                .command(CommandKind::Zero as u16, CommandFlags::FAST_ZERO.bits(), 0, 16)
                .await,
            22
        );
        assert!(client.plugin.delivered_flags().is_empty());
        assert_eq!(client.plugin.flush_count(), 0);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_emulates_fua_with_one_flush() {
        let mut client = RawClient::go(
            r#"{"size": 512, "can_fua": "emulate", "can_trim": true, "pwrite_expect_fua": false}"#,
        )
        .await;

        assert_eq!(client.command(CommandKind::Write as u16, 1, 0, 16).await, 0);
        assert_eq!(client.plugin.flush_count(), 1);
        assert_eq!(client.command(CommandKind::Trim as u16, 1, 0, 16).await, 0);
        assert_eq!(client.plugin.flush_count(), 2);
        assert_eq!(client.command(CommandKind::Write as u16, 0, 0, 16).await, 0);
        assert_eq!(client.plugin.flush_count(), 2);

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_passes_native_fua() {
        let mut client = RawClient::go(
            r#"{"size": 512, "can_fua": "native", "zero_expect_fua": true, "zero_expect_may_trim": false}"#,
        )
        .await;

        let flags = CommandFlags::FUA | CommandFlags::NO_HOLE;
        assert_eq!(
            client
                .command(CommandKind::Zero as u16, flags.bits(), 0, 16)
                .await,
            0
        );
        assert_eq!(client.plugin.flush_count(), 0);
        assert_eq!(
            client.plugin.delivered_flags(),
            vec![(CommandKind::Zero, HandlerFlags::FUA)]
        );

        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_emulated_cache_reads_through_plugin() {
        let mut client = RawClient::go(r#"{"size": 512, "can_cache": "emulate"}"#).await;
        assert_eq!(client.command(CommandKind::Cache as u16, 0, 0, 512).await, 0);
        assert_eq!(client.plugin.read_count(), 1);
        assert!(client.plugin.delivered_flags().is_empty());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn test_client_hangup_is_not_an_error() {
        let client = RawClient::go(r#"{"size": 512}"#).await;
        drop(client.stream);
        assert!(client.server.await.unwrap().is_ok());
    }

    #[test]
    fn test_capability_none_is_default() {
        let plugin = MemoryPlugin::new(PluginConfig::default()).unwrap();
        let server = NbdServer::new(Arc::new(plugin));
        let export = server.describe_export();
        assert_eq!(export.flags().supports_fua, Capability::None);
        assert_eq!(export.flags().supports_cache, Capability::None);
        assert_eq!(u32::from(OptionType::Go), 7);
    }
}
