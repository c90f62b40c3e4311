use crate::{Error, NextState, Packet, VarInt};
#[cfg(test)]
use fake::Dummy;

/// The max length in bytes of the `server_address` field of a handshake.
pub const MAX_SERVER_ADDRESS_LENGTH: VarInt = 32 * 1024;

pub mod serverbound {
    use super::*;
    use crate::{AsyncReadPacket, AsyncWritePacket, ReadPacket, WritePacket};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// The [`HandshakePacket`].
    ///
    /// This packet causes the server to switch into the target state. It should be sent right
    /// after opening the TCP connection to prevent the server from disconnecting.
    ///
    /// [Minecraft Docs](https://minecraft.wiki/w/Java_Edition_protocol#Handshake)
    #[derive(Debug, Clone, Eq, PartialEq)]
    #[cfg_attr(test, derive(Dummy))]
    pub struct HandshakePacket {
        /// The pretended protocol version.
        pub protocol_version: VarInt,
        /// The pretended server address.
        pub server_address: String,
        /// The pretended server port.
        pub server_port: u16,
        /// The protocol state to initiate.
        pub next_state: NextState,
    }

    impl Packet for HandshakePacket {
        const ID: VarInt = 0x00;
    }

    impl WritePacket for HandshakePacket {
        async fn write_to_buffer<S>(&self, buffer: &mut S) -> Result<(), Error>
        where
            S: AsyncWrite + Unpin + Send + Sync,
        {
            buffer.write_varint(self.protocol_version).await?;
            buffer.write_string(&self.server_address).await?;
            buffer.write_u16(self.server_port).await?;
            buffer.write_varint(self.next_state.into()).await?;

            Ok(())
        }
    }

    impl ReadPacket for HandshakePacket {
        async fn read_from_buffer<S>(buffer: &mut S) -> Result<Self, Error>
        where
            S: AsyncRead + Unpin + Send + Sync,
        {
            let protocol_version = buffer.read_varint().await?;
            let server_address = buffer
                .read_string_bounded(MAX_SERVER_ADDRESS_LENGTH)
                .await?;
            let server_port = buffer.read_u16().await?;
            let next_state = buffer.read_varint().await?.try_into()?;

            Ok(Self {
                protocol_version,
                server_address,
                server_port,
                next_state,
            })
        }
    }
}
