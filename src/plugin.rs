//! The plugin interface of the server.
//!
//! A [`Plugin`] supplies the data behind an export. The server validates
//! every request against the plugin's declared capabilities before a handler
//! runs, so handlers never see out-of-range requests or commands the plugin
//! did not declare.
//!
//! # Flags
//!
//! Handlers receive [`HandlerFlags`], not wire flags:
//!
//! - `HandlerFlags::FUA` only reaches a handler when the plugin declares
//!   `can_fua` as [`Capability::Native`](crate::capability::Capability::Native).
//!   With `Emulate`, the server calls [`Plugin::on_flush`] after the handler instead.
//! - `HandlerFlags::MAY_TRIM` tells `on_zero` that the client did not set
//!   `NO_HOLE`, so the range may be deallocated instead of written.
//! - `HandlerFlags::FAST_ZERO` tells `on_zero` to fail with
//!   `ErrorCode::CommandNotSupported` rather than zero slowly.
//!
//! # Example Implementation
//!
//! ```rust
//! use nbd_core::config::PluginCapabilities;
//! use nbd_core::errors::ErrorCode;
//! use nbd_core::flags::HandlerFlags;
//! use nbd_core::plugin::Plugin;
//!
//! /// An export full of 0xff
//! struct Ones;
//!
//! impl Plugin for Ones {
//!     fn capabilities(&self) -> PluginCapabilities {
//!         PluginCapabilities {
//!             size: 4096,
//!             can_write: false,
//!             ..Default::default()
//!         }
//!     }
//!
//!     async fn on_read(&self, _offset: u64, length: u32) -> Result<Vec<u8>, ErrorCode> {
//!         Ok(vec![0xff; length as usize])
//!     }
//!
//!     async fn on_write(
//!         &self,
//!         _offset: u64,
//!         _data: Vec<u8>,
//!         _flags: HandlerFlags,
//!     ) -> Result<(), ErrorCode> {
//!         Err(ErrorCode::CommandNotPermitted)
//!     }
//! }
//! ```

use std::future::Future;

use crate::config::PluginCapabilities;
use crate::errors::ErrorCode;
use crate::flags::HandlerFlags;

pub trait Plugin: Send + Sync + 'static {
    /// Declared capabilities. Read once per client, when it selects the export.
    fn capabilities(&self) -> PluginCapabilities;

    /// Reads `length` bytes at `offset`. Must return exactly `length` bytes.
    fn on_read(
        &self,
        offset: u64,
        length: u32,
    ) -> impl Future<Output = Result<Vec<u8>, ErrorCode>> + Send;

    /// Writes `data` at `offset`.
    fn on_write(
        &self,
        offset: u64,
        data: Vec<u8>,
        flags: HandlerFlags,
    ) -> impl Future<Output = Result<(), ErrorCode>> + Send;

    /// Makes all completed writes durable.
    ///
    /// Also used by the server to emulate FUA, so a plugin declaring
    /// `can_fua = "emulate"` should implement it.
    fn on_flush(&self) -> impl Future<Output = Result<(), ErrorCode>> + Send {
        async move { Err(ErrorCode::CommandNotSupported) }
    }

    /// Discards a range. Reading it back afterwards may return anything.
    fn on_trim(
        &self,
        _offset: u64,
        _length: u32,
        _flags: HandlerFlags,
    ) -> impl Future<Output = Result<(), ErrorCode>> + Send {
        async move { Err(ErrorCode::CommandNotSupported) }
    }

    /// Makes a range read back as zeroes.
    fn on_zero(
        &self,
        _offset: u64,
        _length: u32,
        _flags: HandlerFlags,
    ) -> impl Future<Output = Result<(), ErrorCode>> + Send {
        async move { Err(ErrorCode::CommandNotSupported) }
    }

    /// Prefetches a range. Only called when `can_cache` is native.
    fn on_cache(
        &self,
        _offset: u64,
        _length: u32,
    ) -> impl Future<Output = Result<(), ErrorCode>> + Send {
        async move { Err(ErrorCode::CommandNotSupported) }
    }
}
