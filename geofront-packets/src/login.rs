use crate::{Error, Packet, VarInt};
#[cfg(test)]
use fake::Dummy;

/// The max length in bytes of the `user_name` field of a login start.
pub const MAX_USER_NAME_LENGTH: VarInt = 16 * 1024;

pub mod clientbound {
    use super::*;
    use crate::{AsyncReadPacket, AsyncWritePacket, ReadPacket, WritePacket};
    use tokio::io::{AsyncRead, AsyncWrite};

    /// The [`DisconnectPacket`].
    ///
    /// [Minecraft Docs](https://minecraft.wiki/w/Java_Edition_protocol#Disconnect_(login))
    #[derive(Debug, Clone, Eq, PartialEq)]
    #[cfg_attr(test, derive(Dummy))]
    pub struct DisconnectPacket {
        /// The JSON text component containing the reason of the disconnect.
        pub reason: String,
    }

    impl Packet for DisconnectPacket {
        const ID: VarInt = 0x00;
    }

    impl WritePacket for DisconnectPacket {
        async fn write_to_buffer<S>(&self, buffer: &mut S) -> Result<(), Error>
        where
            S: AsyncWrite + Unpin + Send + Sync,
        {
            buffer.write_string(&self.reason).await?;

            Ok(())
        }
    }

    impl ReadPacket for DisconnectPacket {
        async fn read_from_buffer<S>(buffer: &mut S) -> Result<Self, Error>
        where
            S: AsyncRead + Unpin + Send + Sync,
        {
            let reason = buffer.read_string().await?;

            Ok(Self { reason })
        }
    }
}

pub mod serverbound {
    use super::*;
    use crate::{AsyncReadPacket, AsyncWritePacket, ReadPacket, WritePacket};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    /// The [`LoginStartPacket`].
    ///
    /// Protocol versions after the name field appended further fields (profile UUID, signature
    /// data). Those are retained opaquely in `extra` so the packet round-trips byte-exactly for
    /// every protocol version.
    ///
    /// [Minecraft Docs](https://minecraft.wiki/w/Java_Edition_protocol#Login_Start)
    #[derive(Debug, Clone, Eq, PartialEq)]
    #[cfg_attr(test, derive(Dummy))]
    pub struct LoginStartPacket {
        /// The self-reported name of the connecting player.
        pub user_name: String,
        /// The remaining body bytes after the name, as sent by the client.
        pub extra: Vec<u8>,
    }

    impl Packet for LoginStartPacket {
        const ID: VarInt = 0x00;
    }

    impl WritePacket for LoginStartPacket {
        async fn write_to_buffer<S>(&self, buffer: &mut S) -> Result<(), Error>
        where
            S: AsyncWrite + Unpin + Send + Sync,
        {
            buffer.write_string(&self.user_name).await?;
            buffer.write_all(&self.extra).await?;

            Ok(())
        }
    }

    impl ReadPacket for LoginStartPacket {
        async fn read_from_buffer<S>(buffer: &mut S) -> Result<Self, Error>
        where
            S: AsyncRead + Unpin + Send + Sync,
        {
            let user_name = buffer.read_string_bounded(MAX_USER_NAME_LENGTH).await?;

            let mut extra = Vec::new();
            buffer.read_to_end(&mut extra).await?;

            Ok(Self { user_name, extra })
        }
    }
}
