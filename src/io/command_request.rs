/// NBD Command Request Wire Format Implementation
///
/// This module handles the wire format of NBD command requests during the
/// transmission phase according to the protocol specification:
/// https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
///
/// # Wire Format
/// - 32 bits: Magic (0x25609513)
/// - 16 bits: Command flags
/// - 16 bits: Command type
/// - 64 bits: Handle (cookie)
/// - 64 bits: Offset
/// - 32 bits: Length
/// - [Data]: Command data (only for write commands)
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::command_request::MAX_PAYLOAD_SIZE;
use crate::magic::NBD_REQUEST_MAGIC;

/// Raw representation of an NBD command request from the wire format
pub(crate) struct CommandRequestRaw {
    pub(crate) magic: u32,
    pub(crate) flags: u16,
    pub(crate) command_type: u16,
    pub(crate) cookie: u64,
    pub(crate) offset: u64,
    pub(crate) length: u32,
    pub(crate) data: Vec<u8>,
}

impl CommandRequestRaw {
    // Only the write command has data.
    const WRITE_COMMAND: u16 = 1;

    pub(crate) fn new(
        flags: u16,
        command_type: u16,
        cookie: u64,
        offset: u64,
        length: u32,
        data: Vec<u8>,
    ) -> Self {
        Self {
            magic: NBD_REQUEST_MAGIC,
            flags,
            command_type,
            cookie,
            offset,
            length,
            data,
        }
    }

    /// Reads one request. A write announcing more than [`MAX_PAYLOAD_SIZE`]
    /// bytes is an error: the payload cannot be skipped safely, so the
    /// stream is out of sync from here on.
    pub(crate) async fn read<R>(reader: &mut R) -> Result<Self, std::io::Error>
    where
        R: AsyncReadExt + Unpin,
    {
        let magic = reader.read_u32().await?;
        let flags = reader.read_u16().await?;
        let command_type = reader.read_u16().await?;
        let cookie = reader.read_u64().await?;
        let offset = reader.read_u64().await?;
        let length = reader.read_u32().await?;

        let data = if command_type == Self::WRITE_COMMAND {
            if length > MAX_PAYLOAD_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("write request of {length} bytes exceeds the maximum payload"),
                ));
            }
            let mut data = vec![0; length as usize];
            reader.read_exact(&mut data).await?;
            data
        } else {
            vec![] // No data for other commands
        };

        Ok(Self {
            magic,
            flags,
            command_type,
            cookie,
            offset,
            length,
            data,
        })
    }

    pub(crate) async fn write<W>(&self, writer: &mut W) -> Result<(), std::io::Error>
    where
        W: AsyncWriteExt + Unpin,
    {
        writer.write_u32(self.magic).await?;
        writer.write_u16(self.flags).await?;
        writer.write_u16(self.command_type).await?;
        writer.write_u64(self.cookie).await?;
        writer.write_u64(self.offset).await?;
        writer.write_u32(self.length).await?;
        if !self.data.is_empty() {
            writer.write_all(&self.data).await?;
        }
        Ok(())
    }
}

// Don't include data in debug output
impl std::fmt::Debug for CommandRequestRaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("CommandRequestRaw")
            .field("flags", &self.flags)
            .field("command_type", &self.command_type)
            .field("cookie", &self.cookie)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_is_28_bytes() {
        let mut buffer = Vec::new();
        CommandRequestRaw::new(0, 0, 9, 4096, 512, vec![])
            .write(&mut buffer)
            .await
            .unwrap();
        assert_eq!(buffer.len(), 28);
        assert_eq!(&buffer[..4], &NBD_REQUEST_MAGIC.to_be_bytes());
    }

    #[tokio::test]
    async fn test_write_payload_follows_header() {
        let mut buffer = Vec::new();
        CommandRequestRaw::new(1, 1, 3, 0, 4, vec![1, 2, 3, 4])
            .write(&mut buffer)
            .await
            .unwrap();
        assert_eq!(buffer.len(), 32);

        let request = CommandRequestRaw::read(&mut buffer.as_slice()).await.unwrap();
        assert_eq!(request.flags, 1);
        assert_eq!(request.cookie, 3);
        assert_eq!(request.data, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_oversized_write_is_fatal() {
        let mut buffer = Vec::new();
        CommandRequestRaw::new(0, 1, 3, 0, MAX_PAYLOAD_SIZE + 1, vec![])
            .write(&mut buffer)
            .await
            .unwrap();

        let result = CommandRequestRaw::read(&mut buffer.as_slice()).await;
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(std::io::ErrorKind::InvalidData)
        );
    }
}
