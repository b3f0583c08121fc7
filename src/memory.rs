//! An in-memory plugin for conformance testing.
//!
//! The export is a zero-filled buffer of the configured size. Besides
//! storing data, the plugin records every flag set its handlers receive and
//! checks them against the configured [`HandlerExpectations`]: a handler
//! that sees a flag different from the expectation fails the request with
//! `NBD_EINVAL`, which the client observes as an error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use tracing::error;

use crate::command_request::CommandKind;
use crate::config::{ConfigError, HandlerExpectations, PluginCapabilities, PluginConfig};
use crate::errors::ErrorCode;
use crate::flags::HandlerFlags;
use crate::plugin::Plugin;

/// Largest export the plugin will allocate.
const MAX_MEMORY_SIZE: u64 = 1 << 30;

#[derive(Debug)]
pub struct MemoryPlugin {
    capabilities: PluginCapabilities,
    expectations: HandlerExpectations,
    data: RwLock<Vec<u8>>,
    reads: AtomicUsize,
    flushes: AtomicUsize,
    delivered: Mutex<Vec<(CommandKind, HandlerFlags)>>,
}

impl MemoryPlugin {
    pub fn new(config: PluginConfig) -> Result<Self, ConfigError> {
        let size = config.capabilities.size;
        if size > MAX_MEMORY_SIZE {
            return Err(ConfigError::TooLarge(size));
        }
        Ok(Self {
            data: RwLock::new(vec![0; size as usize]),
            capabilities: config.capabilities,
            expectations: config.expectations,
            reads: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        })
    }

    /// Number of times `on_read` ran, including reads done to emulate cache.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of times `on_flush` ran, including flushes done to emulate FUA.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Every (command, flags) pair a write-family handler received, in order.
    pub fn delivered_flags(&self) -> Vec<(CommandKind, HandlerFlags)> {
        self.delivered
            .lock()
            .map(|delivered| delivered.clone())
            .unwrap_or_default()
    }

    fn record(&self, kind: CommandKind, flags: HandlerFlags) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push((kind, flags));
        }
    }

    fn expect(
        kind: CommandKind,
        name: &str,
        expected: Option<bool>,
        actual: bool,
    ) -> Result<(), ErrorCode> {
        match expected {
            Some(expected) if expected != actual => {
                error!(%kind, flag = name, expected, actual, "handler received unexpected flag");
                Err(ErrorCode::InvalidArgument)
            }
            _ => Ok(()),
        }
    }

    fn range(&self, offset: u64, length: u64) -> Result<std::ops::Range<usize>, ErrorCode> {
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= self.capabilities.size)
            .ok_or(ErrorCode::InvalidArgument)?;
        Ok(offset as usize..end as usize)
    }

    fn fill_zero(&self, offset: u64, length: u32) -> Result<(), ErrorCode> {
        let range = self.range(offset, u64::from(length))?;
        let mut data = self.data.write().map_err(|_| ErrorCode::IO)?;
        data[range].fill(0);
        Ok(())
    }
}

impl Plugin for MemoryPlugin {
    fn capabilities(&self) -> PluginCapabilities {
        self.capabilities.clone()
    }

    async fn on_read(&self, offset: u64, length: u32) -> Result<Vec<u8>, ErrorCode> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let range = self.range(offset, u64::from(length))?;
        let data = self.data.read().map_err(|_| ErrorCode::IO)?;
        Ok(data[range].to_vec())
    }

    async fn on_write(&self, offset: u64, data: Vec<u8>, flags: HandlerFlags) -> Result<(), ErrorCode> {
        self.record(CommandKind::Write, flags);
        Self::expect(
            CommandKind::Write,
            "fua",
            self.expectations.pwrite_expect_fua,
            flags.contains(HandlerFlags::FUA),
        )?;

        let range = self.range(offset, data.len() as u64)?;
        let mut memory = self.data.write().map_err(|_| ErrorCode::IO)?;
        memory[range].copy_from_slice(&data);
        Ok(())
    }

    async fn on_flush(&self) -> Result<(), ErrorCode> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_trim(&self, offset: u64, length: u32, flags: HandlerFlags) -> Result<(), ErrorCode> {
        self.record(CommandKind::Trim, flags);
        Self::expect(
            CommandKind::Trim,
            "fua",
            self.expectations.trim_expect_fua,
            flags.contains(HandlerFlags::FUA),
        )?;
        self.fill_zero(offset, length)
    }

    async fn on_zero(&self, offset: u64, length: u32, flags: HandlerFlags) -> Result<(), ErrorCode> {
        self.record(CommandKind::Zero, flags);
        Self::expect(
            CommandKind::Zero,
            "fua",
            self.expectations.zero_expect_fua,
            flags.contains(HandlerFlags::FUA),
        )?;
        Self::expect(
            CommandKind::Zero,
            "may_trim",
            self.expectations.zero_expect_may_trim,
            flags.contains(HandlerFlags::MAY_TRIM),
        )?;
        Self::expect(
            CommandKind::Zero,
            "fast_zero",
            self.expectations.zero_expect_fast_zero,
            flags.contains(HandlerFlags::FAST_ZERO),
        )?;
        self.fill_zero(offset, length)
    }

    async fn on_cache(&self, offset: u64, length: u32) -> Result<(), ErrorCode> {
        // Everything is already in memory
        self.range(offset, u64::from(length)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(json: &str) -> MemoryPlugin {
        MemoryPlugin::new(PluginConfig::from_json(json).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_read_fresh_export() {
        let plugin = plugin(r#"{"size": 512}"#);
        assert_eq!(plugin.on_read(0, 512).await, Ok(vec![0; 512]));
    }

    #[tokio::test]
    async fn test_write_read() {
        let plugin = plugin(r#"{"size": 1024}"#);

        let write_data = vec![1; 512];
        assert!(plugin
            .on_write(0, write_data.clone(), HandlerFlags::empty())
            .await
            .is_ok());
        assert_eq!(plugin.on_read(0, 512).await, Ok(write_data));
        assert_eq!(plugin.on_read(512, 512).await, Ok(vec![0; 512]));
    }

    #[tokio::test]
    async fn test_out_of_bounds() {
        let plugin = plugin(r#"{"size": 1024}"#);

        assert_eq!(
            plugin.on_read(512, 600).await,
            Err(ErrorCode::InvalidArgument)
        );
        assert_eq!(
            plugin
                .on_write(u64::MAX, vec![1; 10], HandlerFlags::empty())
                .await,
            Err(ErrorCode::InvalidArgument)
        );
    }

    #[tokio::test]
    async fn test_zero_clears_range() {
        let plugin = plugin(r#"{"size": 16}"#);
        plugin
            .on_write(0, vec![9; 16], HandlerFlags::empty())
            .await
            .unwrap();
        plugin
            .on_zero(4, 8, HandlerFlags::MAY_TRIM)
            .await
            .unwrap();

        let mut expected = vec![9; 16];
        expected[4..12].fill(0);
        assert_eq!(plugin.on_read(0, 16).await, Ok(expected));
        assert_eq!(
            plugin.delivered_flags(),
            vec![
                (CommandKind::Write, HandlerFlags::empty()),
                (CommandKind::Zero, HandlerFlags::MAY_TRIM),
            ]
        );
    }

    #[tokio::test]
    async fn test_expectation_mismatch_is_einval() {
        let plugin = plugin(r#"{"size": 512, "zero_expect_may_trim": false}"#);

        assert_eq!(
            plugin.on_zero(0, 512, HandlerFlags::MAY_TRIM).await,
            Err(ErrorCode::InvalidArgument)
        );
        assert_eq!(plugin.on_zero(0, 512, HandlerFlags::empty()).await, Ok(()));
    }

    #[tokio::test]
    async fn test_counts_reads() {
        let plugin = plugin(r#"{"size": 512}"#);
        assert_eq!(plugin.read_count(), 0);
        plugin.on_read(0, 512).await.unwrap();
        assert_eq!(plugin.read_count(), 1);
        assert_eq!(plugin.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_counts_flushes() {
        let plugin = plugin("{}");
        assert_eq!(plugin.flush_count(), 0);
        plugin.on_flush().await.unwrap();
        plugin.on_flush().await.unwrap();
        assert_eq!(plugin.flush_count(), 2);
    }

    #[test]
    fn test_refuses_huge_exports() {
        let config = PluginConfig::from_json(r#"{"size": 1099511627776}"#).unwrap();
        assert!(matches!(
            MemoryPlugin::new(config),
            Err(ConfigError::TooLarge(_))
        ));
    }
}
