//! Client side of the transmission phase.
//!
//! A [`Connection`] owns a negotiated [`Transport`] and issues one request at
//! a time: every call validates its arguments against the
//! [`ExportDescriptor`], sends the request, and waits for the reply with the
//! same handle before returning.
//!
//! ```rust,no_run
//! use nbd_core::connection::Connection;
//! use nbd_core::flags::CommandFlags;
//! use nbd_core::transport::Target;
//!
//! # async fn example() -> nbd_core::errors::Result<()> {
//! let connection = Connection::connect(&Target::Tcp("127.0.0.1:10809".into())).await?;
//! if !connection.is_read_only() {
//!     connection.write(0, &[1; 512], CommandFlags::empty()).await?;
//! }
//! let data = connection.read(0, 512).await?;
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use int_enum::IntEnum;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::capability::ExportDescriptor;
use crate::command_request::{CommandKind, MAX_PAYLOAD_SIZE};
use crate::errors::{ConnectError, IoError, ProtocolError, Result, ValidationError};
use crate::flags::CommandFlags;
use crate::io::command_reply::SimpleReplyRaw;
use crate::io::command_request::CommandRequestRaw;
use crate::magic::{NBD_SIMPLE_REPLY_MAGIC, NBD_STRUCTURED_REPLY_MAGIC};
use crate::negotiate::Negotiator;
use crate::transport::{Target, Transport};

/// Lifecycle of a [`Connection`]. There is no way out of `Closed`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntEnum)]
pub enum ConnectionState {
    Created = 0,
    Negotiating = 1,
    Ready = 2,
    Closed = 3,
}

#[derive(Debug)]
struct Inner {
    transport: Transport,
    /// Requests sent and not answered yet: handle -> (command, length)
    in_flight: HashMap<u64, (CommandKind, u32)>,
}

#[derive(Debug)]
pub struct Connection {
    export: ExportDescriptor,
    name: String,
    inner: Mutex<Inner>,
    state: AtomicU8,
    next_handle: AtomicU64,
    shutdown: CancellationToken,
}

impl Connection {
    /// Connects to `target` and selects the default export (`""`).
    pub async fn connect(target: &Target) -> Result<Self> {
        Self::connect_export(target, "").await
    }

    pub async fn connect_export(target: &Target, export_name: &str) -> Result<Self> {
        let transport = Transport::connect(target).await?;
        Self::from_transport(transport, export_name).await
    }

    /// Negotiates over an already open transport.
    ///
    /// The transport is closed if negotiation fails.
    pub async fn from_transport(mut transport: Transport, export_name: &str) -> Result<Self> {
        debug!(state = ?ConnectionState::Created, "connection created");
        debug!(state = ?ConnectionState::Negotiating, export = export_name, "negotiating");

        let negotiated = match Negotiator::new(&mut transport).negotiate(export_name).await {
            Ok(negotiated) => negotiated,
            Err(error) => {
                debug!(%error, "negotiation failed");
                transport.close().await;
                return Err(ConnectError::from(error).into());
            }
        };

        debug!(
            state = ?ConnectionState::Ready,
            size = negotiated.descriptor.size(),
            name = %negotiated.name,
            "connection ready"
        );

        Ok(Self {
            export: negotiated.descriptor,
            name: negotiated.name,
            inner: Mutex::new(Inner {
                transport,
                in_flight: HashMap::new(),
            }),
            state: AtomicU8::new(ConnectionState::Ready.into()),
            next_handle: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::SeqCst))
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn export(&self) -> &ExportDescriptor {
        &self.export
    }

    /// The canonical export name if the server sent one, otherwise the name
    /// that was asked for.
    pub fn export_name(&self) -> &str {
        &self.name
    }

    pub fn get_size(&self) -> u64 {
        self.export.size()
    }

    pub fn is_rotational(&self) -> bool {
        self.export.flags().is_rotational
    }

    pub fn can_multi_conn(&self) -> bool {
        self.export.flags().can_multi_conn
    }

    pub fn is_read_only(&self) -> bool {
        self.export.flags().read_only
    }

    pub fn can_flush(&self) -> bool {
        self.export.flags().supports_flush
    }

    pub fn can_trim(&self) -> bool {
        self.export.flags().supports_trim
    }

    pub fn can_zero(&self) -> bool {
        self.export.flags().supports_zero
    }

    pub fn can_fast_zero(&self) -> bool {
        self.export.flags().supports_fast_zero
    }

    /// True when FUA is emulated or native.
    pub fn can_fua(&self) -> bool {
        self.export.flags().supports_fua.is_supported()
    }

    /// True when cache is emulated or native.
    pub fn can_cache(&self) -> bool {
        self.export.flags().supports_cache.is_supported()
    }

    pub async fn read(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let flags = CommandFlags::empty();
        self.validate(CommandKind::Read, offset, u64::from(length), flags)?;
        self.execute(CommandKind::Read, flags, offset, length, vec![])
            .await
    }

    pub async fn write(&self, offset: u64, data: &[u8], flags: CommandFlags) -> Result<()> {
        self.validate(CommandKind::Write, offset, data.len() as u64, flags)?;
        // Fits, validate() checked it against MAX_PAYLOAD_SIZE
        let length = data.len() as u32;
        self.execute(CommandKind::Write, flags, offset, length, data.to_vec())
            .await?;
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        let flags = CommandFlags::empty();
        self.validate(CommandKind::Flush, 0, 0, flags)?;
        self.execute(CommandKind::Flush, flags, 0, 0, vec![]).await?;
        Ok(())
    }

    pub async fn trim(&self, offset: u64, length: u32, flags: CommandFlags) -> Result<()> {
        self.validate(CommandKind::Trim, offset, u64::from(length), flags)?;
        self.execute(CommandKind::Trim, flags, offset, length, vec![])
            .await?;
        Ok(())
    }

    /// Zeroes a range. Without `NO_HOLE` the server may punch a hole instead
    /// of writing zeroes.
    pub async fn zero(&self, offset: u64, length: u32, flags: CommandFlags) -> Result<()> {
        self.validate(CommandKind::Zero, offset, u64::from(length), flags)?;
        self.execute(CommandKind::Zero, flags, offset, length, vec![])
            .await?;
        Ok(())
    }

    pub async fn cache(&self, offset: u64, length: u32) -> Result<()> {
        let flags = CommandFlags::empty();
        self.validate(CommandKind::Cache, offset, u64::from(length), flags)?;
        self.execute(CommandKind::Cache, flags, offset, length, vec![])
            .await?;
        Ok(())
    }

    /// Disconnects and releases the transport.
    ///
    /// A request still waiting for its reply fails with `IoError::Closed`.
    /// Calling `close` again does nothing.
    pub async fn close(&self) {
        let previous = self
            .state
            .swap(ConnectionState::Closed.into(), Ordering::SeqCst);
        self.shutdown.cancel();

        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        if previous == u8::from(ConnectionState::Ready)
            && inner.in_flight.is_empty()
            && !inner.transport.is_closed()
        {
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            let request = CommandRequestRaw::new(
                0,
                CommandKind::Disconnect.into(),
                handle,
                0,
                0,
                vec![],
            );
            let sent = match request.write(&mut inner.transport).await {
                Ok(()) => AsyncWriteExt::flush(&mut inner.transport).await,
                Err(error) => Err(error),
            };
            if let Err(error) = sent {
                debug!(%error, "sending NBD_CMD_DISC");
            }
        }

        inner.in_flight.clear();
        inner.transport.close().await;

        if previous != u8::from(ConnectionState::Closed) {
            debug!(state = ?ConnectionState::Closed, "connection closed");
        }
    }

    fn ensure_open(&self) -> std::result::Result<(), IoError> {
        match self.state() {
            ConnectionState::Closed => Err(IoError::Closed),
            _ => Ok(()),
        }
    }

    /// Checks a request against the export. Nothing is sent when this fails.
    fn validate(
        &self,
        kind: CommandKind,
        offset: u64,
        length: u64,
        flags: CommandFlags,
    ) -> Result<()> {
        self.ensure_open()?;

        let capabilities = self.export.flags();

        if kind.is_write() && capabilities.read_only {
            return Err(ValidationError::ReadOnlyExport.into());
        }

        let supported = match kind {
            CommandKind::Flush => capabilities.supports_flush,
            CommandKind::Trim => capabilities.supports_trim,
            CommandKind::Zero => capabilities.supports_zero,
            CommandKind::Cache => capabilities.supports_cache.is_supported(),
            CommandKind::Read | CommandKind::Write | CommandKind::Disconnect => true,
        };
        if !supported {
            return Err(ValidationError::Unsupported(kind).into());
        }

        if !kind.permitted_flags().contains(flags) {
            return Err(ValidationError::InvalidFlags {
                command: kind,
                flags: flags.bits(),
            }
            .into());
        }
        if flags.contains(CommandFlags::FUA) && !capabilities.supports_fua.is_supported() {
            return Err(ValidationError::FuaUnsupported.into());
        }
        if flags.contains(CommandFlags::FAST_ZERO) && !capabilities.supports_fast_zero {
            return Err(ValidationError::FastZeroUnsupported.into());
        }

        if matches!(kind, CommandKind::Read | CommandKind::Write) && length > u64::from(MAX_PAYLOAD_SIZE) {
            return Err(ValidationError::PayloadTooLarge {
                length,
                max: MAX_PAYLOAD_SIZE,
            }
            .into());
        }

        if kind.has_range() {
            let size = self.export.size();
            let in_range = offset.checked_add(length).is_some_and(|end| end <= size);
            if !in_range {
                return Err(ValidationError::OutOfRange {
                    offset,
                    length,
                    size,
                }
                .into());
            }
        }

        Ok(())
    }

    async fn execute(
        &self,
        kind: CommandKind,
        flags: CommandFlags,
        offset: u64,
        length: u32,
        data: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let request = CommandRequestRaw::new(flags.bits(), kind.into(), handle, offset, length, data);

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(IoError::Closed.into()),
            result = self.round_trip(kind, request) => result,
        }
    }

    async fn round_trip(&self, kind: CommandKind, request: CommandRequestRaw) -> Result<Vec<u8>> {
        let inner = self.inner.lock().await;
        if self.state() == ConnectionState::Closed || inner.transport.is_closed() {
            return Err(IoError::Closed.into());
        }

        let mut pending = PendingReply {
            connection: self,
            inner,
            settled: false,
        };

        trace!(?request, "sending request");
        pending
            .inner
            .in_flight
            .insert(request.cookie, (kind, request.length));

        match Self::exchange(&mut pending.inner, request).await {
            Ok(Ok(data)) => {
                pending.settled = true;
                Ok(data)
            }
            Ok(Err(error)) => {
                pending.settled = true;
                debug!(%kind, %error, "server reported an error");
                Err(error.into())
            }
            Err(error) => {
                warn!(%kind, %error, "transport failed, closing connection");
                self.fail(&mut pending.inner).await;
                pending.settled = true;
                Err(error.into())
            }
        }
    }

    /// Sends one request and reads its reply.
    ///
    /// The outer error is fatal to the connection, the inner one is a
    /// failure reported by the server.
    async fn exchange(
        inner: &mut Inner,
        request: CommandRequestRaw,
    ) -> std::result::Result<std::result::Result<Vec<u8>, ProtocolError>, IoError> {
        let handle = request.cookie;
        request.write(&mut inner.transport).await?;
        AsyncWriteExt::flush(&mut inner.transport).await?;

        let mut reply = SimpleReplyRaw::read_header(&mut inner.transport).await?;
        trace!(?reply, "received reply");

        match reply.magic {
            NBD_SIMPLE_REPLY_MAGIC => {}
            NBD_STRUCTURED_REPLY_MAGIC => {
                return Err(IoError::Protocol(
                    "structured reply received but structured replies were not negotiated"
                        .to_string(),
                ))
            }
            magic => return Err(IoError::Protocol(format!("bad reply magic {magic:#010x}"))),
        }

        // Exactly one request is outstanding
        if reply.cookie != handle {
            return Err(IoError::Protocol(format!(
                "reply for handle {} while waiting for handle {handle}",
                reply.cookie
            )));
        }
        let (kind, length) = inner.in_flight.remove(&handle).ok_or_else(|| {
            IoError::Protocol(format!("reply for unknown handle {handle}"))
        })?;

        if reply.error != 0 {
            return Ok(Err(ProtocolError::from_wire(reply.error)));
        }

        if kind == CommandKind::Read {
            reply
                .read_data(&mut inner.transport, length as usize)
                .await?;
        }
        Ok(Ok(reply.data))
    }

    /// Moves to `Closed` after a transport failure.
    async fn fail(&self, inner: &mut Inner) {
        self.state
            .store(ConnectionState::Closed.into(), Ordering::SeqCst);
        inner.in_flight.clear();
        inner.transport.close().await;
        // Last, so that the select in execute() cannot drop us half way
        self.shutdown.cancel();
        debug!(state = ?ConnectionState::Closed, "connection closed");
    }
}

/// The lock held for one round trip.
///
/// Dropped before the reply was read (a caller timed out, or `close()`
/// woke it) the position in the reply stream is unknown, so the
/// connection moves to `Closed` and the transport is poisoned.
struct PendingReply<'a> {
    connection: &'a Connection,
    inner: MutexGuard<'a, Inner>,
    settled: bool,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let previous = self
            .connection
            .state
            .swap(ConnectionState::Closed.into(), Ordering::SeqCst);
        self.inner.in_flight.clear();
        self.inner.transport.poison();
        self.connection.shutdown.cancel();

        if previous != u8::from(ConnectionState::Closed) {
            warn!("request abandoned before its reply, closing connection");
        }
    }
}

/// Lists the exports a server offers, without selecting one.
pub async fn list_exports(target: &Target) -> Result<Vec<String>> {
    let mut transport = Transport::connect(target).await?;
    let result = Negotiator::new(&mut transport).list_exports().await;
    transport.close().await;
    result.map_err(|error| ConnectError::from(error).into())
}
