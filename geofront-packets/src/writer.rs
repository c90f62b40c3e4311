use crate::{AsyncWritePacket, Error, INITIAL_BUFFER_SIZE, RawPacket, VarInt, WritePacket};
use std::fmt::Debug;
use tokio::io::{AsyncWrite, AsyncWriteExt};

impl<W: AsyncWrite + Unpin + Send + Sync> AsyncWritePacket for W {
    async fn write_packet<T: WritePacket + Send + Sync + Debug>(
        &mut self,
        packet: T,
    ) -> Result<(), Error> {
        // create a new buffer (our packets are very small)
        let mut buffer = Vec::with_capacity(INITIAL_BUFFER_SIZE);

        // write the packet id and the respective packet content
        buffer.write_varint(T::ID).await?;
        packet.write_to_buffer(&mut buffer).await?;

        // prepare a final buffer (leaving max 3 bytes for the length prefix)
        let packet_len = buffer.len();
        let mut final_buffer = Vec::with_capacity(packet_len + 3);
        final_buffer.write_varint(packet_len as VarInt).await?;
        final_buffer.extend_from_slice(&buffer);

        // send the final buffer into the stream
        self.write_all(&final_buffer).await?;

        Ok(())
    }

    async fn write_raw_packet(&mut self, packet: &RawPacket) -> Result<(), Error> {
        self.write_all(&packet.frame).await?;

        Ok(())
    }

    async fn write_varint(&mut self, value: VarInt) -> Result<(), Error> {
        let mut value = value;
        let mut buf = [0];
        loop {
            buf[0] = (value & 0b0111_1111) as u8;
            value = (value >> 7) & (i32::MAX >> 6);
            if value != 0 {
                buf[0] |= 0b1000_0000;
            }
            self.write_all(&buf).await?;

            if value == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn write_string(&mut self, string: &str) -> Result<(), Error> {
        self.write_varint(string.len() as VarInt).await?;
        self.write_all(string.as_bytes()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AsyncReadPacket, varint_len};
    use std::io::Cursor;

    #[tokio::test]
    async fn varint_len_matches_written_bytes() {
        for value in [0, 1, 127, 128, 300, 25565, i32::MAX, -1, i32::MIN] {
            let mut buffer: Cursor<Vec<u8>> = Cursor::new(Vec::new());
            buffer.write_varint(value).await.expect("write failed");
            assert_eq!(varint_len(value), buffer.get_ref().len(), "value {value}");
        }
    }

    #[tokio::test]
    async fn string_roundtrip() {
        let mut buffer: Cursor<Vec<u8>> = Cursor::new(Vec::new());
        buffer
            .write_string("mc.example.com")
            .await
            .expect("write failed");

        let mut reader = Cursor::new(buffer.into_inner());
        let read = reader.read_string().await.expect("read failed");
        assert_eq!(read, "mc.example.com");
    }

    #[tokio::test]
    async fn raw_packet_replay_is_byte_exact() {
        let wire = vec![0x03, 0x00, 0xAB, 0xCD];
        let mut reader = Cursor::new(wire.clone());
        let raw = reader.read_raw_packet().await.expect("read failed");

        let mut writer: Cursor<Vec<u8>> = Cursor::new(Vec::new());
        writer.write_raw_packet(&raw).await.expect("write failed");
        assert_eq!(writer.into_inner(), wire);
    }
}
