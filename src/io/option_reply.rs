/// NBD Option Reply Wire Format Implementation
///
/// This module implements the wire format for NBD option replies
/// according to the protocol specification:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// # Wire Format
/// - 64 bits: 0x3e889045565a9 (magic number for replies)
/// - 32 bits: Option type from the client request
/// - 32 bits: Reply type (e.g., NBD_REP_ACK)
/// - 32 bits: Data length (may be zero)
/// - [Data]: Optional payload as required by the reply type
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::io::option_request::MAX_OPTION_LENGTH;
use crate::magic::NBD_REPLY_MAGIC;

/// Raw structure representing NBD option reply on the wire.
pub(crate) struct OptionReplyRaw {
    pub(crate) magic: u64,
    pub(crate) option: u32,
    pub(crate) reply_type: u32,
    pub(crate) data: Vec<u8>,
}

impl OptionReplyRaw {
    pub(crate) fn new(option: u32, reply_type: u32, data: Vec<u8>) -> Self {
        Self {
            magic: NBD_REPLY_MAGIC,
            option,
            reply_type,
            data,
        }
    }

    pub(crate) async fn write<W>(&self, writer: &mut W) -> Result<(), std::io::Error>
    where
        W: AsyncWriteExt + Unpin,
    {
        // S: 64 bits, `0x3e889045565a9` (magic number for replies)
        // S: 32 bits, the option as sent by the client to which this is a reply
        // S: 32 bits, reply type (e.g., `NBD_REP_ACK` for successful completion,
        //    or `NBD_REP_ERR_UNSUP` to mark use of an option not known by this
        //    server
        // S: 32 bits, length of the reply. This MAY be zero for some replies, in
        //    which case the next field is not sent
        // S: any data as required by the reply (e.g., an export name in the case
        //    of `NBD_REP_SERVER`)

        writer.write_u64(self.magic).await?;
        writer.write_u32(self.option).await?;
        writer.write_u32(self.reply_type).await?;
        writer.write_u32(self.data.len() as u32).await?;
        writer.write_all(&self.data).await?;
        Ok(())
    }

    pub(crate) async fn read<R>(reader: &mut R) -> Result<Self, std::io::Error>
    where
        R: AsyncReadExt + Unpin,
    {
        let magic = reader.read_u64().await?;
        let option = reader.read_u32().await?;
        let reply_type = reader.read_u32().await?;
        let data_len = reader.read_u32().await?;
        if data_len > MAX_OPTION_LENGTH {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("option reply carries {data_len} bytes of data"),
            ));
        }
        let mut data = vec![0; data_len as usize];
        reader.read_exact(&mut data).await?;

        Ok(Self {
            magic,
            option,
            reply_type,
            data,
        })
    }
}
