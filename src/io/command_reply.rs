/// NBD Command Reply Wire Format Implementation
///
/// This module handles the wire format of NBD simple replies during the
/// transmission phase according to the protocol specification:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// # Wire Format
/// - 32 bits: Magic (0x67446698)
/// - 32 bits: Error (0 for success)
/// - 64 bits: Handle (cookie matching the request)
/// - [Data]: Reply data (only for successful read commands)
///
/// The length of the data is not on the wire: only the peer that sent the
/// request knows it, so reading is split into header and payload.
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::magic::NBD_SIMPLE_REPLY_MAGIC;

/// Raw representation of a simple NBD reply
pub(crate) struct SimpleReplyRaw {
    pub(crate) magic: u32,
    pub(crate) error: u32,
    pub(crate) cookie: u64,
    pub(crate) data: Vec<u8>,
}

impl SimpleReplyRaw {
    pub(crate) fn new(error: u32, cookie: u64, data: Vec<u8>) -> Self {
        Self {
            magic: NBD_SIMPLE_REPLY_MAGIC,
            error,
            cookie,
            data,
        }
    }

    pub(crate) async fn write<W>(&self, writer: &mut W) -> Result<(), std::io::Error>
    where
        W: AsyncWriteExt + Unpin,
    {
        writer.write_u32(self.magic).await?;
        writer.write_u32(self.error).await?;
        writer.write_u64(self.cookie).await?;
        if !self.data.is_empty() {
            writer.write_all(&self.data).await?;
        }
        Ok(())
    }

    /// Reads the 16-byte header. `data` is left empty.
    pub(crate) async fn read_header<R>(reader: &mut R) -> Result<Self, std::io::Error>
    where
        R: AsyncReadExt + Unpin,
    {
        let magic = reader.read_u32().await?;
        let error = reader.read_u32().await?;
        let cookie = reader.read_u64().await?;
        Ok(Self {
            magic,
            error,
            cookie,
            data: vec![],
        })
    }

    pub(crate) async fn read_data<R>(
        &mut self,
        reader: &mut R,
        length: usize,
    ) -> Result<(), std::io::Error>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut data = vec![0; length];
        reader.read_exact(&mut data).await?;
        self.data = data;
        Ok(())
    }
}

// Don't include data in debug output
impl std::fmt::Debug for SimpleReplyRaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        #[derive(Debug)]
        struct SimpleReplyRaw<'a> {
            error: &'a u32,
            cookie: &'a u64,
        }

        let tmp = SimpleReplyRaw {
            error: &self.error,
            cookie: &self.cookie,
        };

        std::fmt::Debug::fmt(&tmp, f)
    }
}
