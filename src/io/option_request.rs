/// NBD Option Request Wire Format Implementation
///
/// This module implements the wire format for NBD option requests
/// according to the protocol specification:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// # Wire Format
/// - 64 bits: 0x49484156454F5054 (ASCII 'IHAVEOPT') magic number
/// - 32 bits: Option identifier
/// - 32 bits: Length of option data
/// - [Data]: Option-specific data of specified length
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::magic::NBD_IHAVEOPT;

/// Largest option payload accepted. Export names are limited to 4096 bytes,
/// so anything bigger is a broken or hostile peer.
pub(crate) const MAX_OPTION_LENGTH: u32 = 64 * 1024;

pub(crate) struct OptionRequestRaw {
    pub(crate) magic: u64,
    pub(crate) option: u32,
    pub(crate) data: Vec<u8>,
}

impl OptionRequestRaw {
    pub(crate) fn new(option: u32, data: Vec<u8>) -> Self {
        Self {
            magic: NBD_IHAVEOPT,
            option,
            data,
        }
    }

    pub(crate) async fn read<R>(reader: &mut R) -> Result<Self, std::io::Error>
    where
        R: AsyncReadExt + Unpin,
    {
        // C: 64 bits, `0x49484156454F5054` (ASCII '`IHAVEOPT`') (note same
        //    newstyle handshake's magic number)
        // C: 32 bits, option
        // C: 32 bits, length of option data (unsigned)
        // C: any data needed for the chosen option, of length as specified above.

        let magic = reader.read_u64().await?;
        let option = reader.read_u32().await?;
        let data_len = reader.read_u32().await?;
        if data_len > MAX_OPTION_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("option {option} carries {data_len} bytes of data"),
            ));
        }
        let mut data = vec![0; data_len as usize];
        reader.read_exact(&mut data).await?;

        Ok(Self {
            magic,
            option,
            data,
        })
    }

    pub(crate) async fn write<W>(&self, writer: &mut W) -> Result<(), std::io::Error>
    where
        W: AsyncWriteExt + Unpin,
    {
        writer.write_u64(self.magic).await?;
        writer.write_u32(self.option).await?;
        writer.write_u32(self.data.len() as u32).await?;
        writer.write_all(&self.data).await?;
        Ok(())
    }
}
