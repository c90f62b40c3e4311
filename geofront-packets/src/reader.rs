use crate::{
    AsyncReadPacket, Error, INITIAL_BUFFER_SIZE, MAX_PACKET_LENGTH, MAX_STRING_LENGTH, RawPacket,
    ReadPacket, VarInt, varint_len,
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads a single `VarInt`, appending the encoded bytes to `raw` as they are consumed.
async fn read_varint_captured<R>(reader: &mut R, raw: &mut Vec<u8>) -> Result<VarInt, Error>
where
    R: AsyncRead + Unpin + Send + Sync,
{
    let mut buf = [0];
    let mut ans = 0;
    for i in 0..5 {
        reader.read_exact(&mut buf).await?;
        raw.push(buf[0]);
        ans |= ((buf[0] & 0b0111_1111) as i32) << (7 * i);
        if buf[0] & 0b1000_0000 == 0 {
            return Ok(ans);
        }
    }
    Err(Error::InvalidVarInt)
}

impl<R: AsyncRead + Unpin + Send + Sync> AsyncReadPacket for R {
    async fn read_packet<T: ReadPacket + Send + Sync>(&mut self) -> Result<T, Error> {
        // extract the length of the packet and check for any following content
        let length = self.read_varint().await?;
        if length <= 0 || length > MAX_PACKET_LENGTH {
            return Err(Error::IllegalPacketLength);
        }

        // extract the encoded packet id and validate if it is expected
        let packet_id = self.read_varint().await?;
        if packet_id != T::ID {
            return Err(Error::IllegalPacketId {
                expected: T::ID,
                actual: packet_id,
            });
        }

        // split a separate reader from the stream covering only this frame
        let Some(body_len) = (length as u64).checked_sub(varint_len(packet_id) as u64) else {
            return Err(Error::IllegalPacketLength);
        };
        let mut take = self.take(body_len);

        // convert the received buffer into our expected packet
        let packet = T::read_from_buffer(&mut take).await?;

        // drain body bytes the packet model does not carry, keeping the stream aligned
        let mut rest = Vec::new();
        take.read_to_end(&mut rest).await?;

        Ok(packet)
    }

    async fn read_raw_packet(&mut self) -> Result<RawPacket, Error> {
        let mut frame = Vec::with_capacity(INITIAL_BUFFER_SIZE);

        let length = read_varint_captured(self, &mut frame).await?;
        if length <= 0 || length > MAX_PACKET_LENGTH {
            return Err(Error::IllegalPacketLength);
        }

        let id = read_varint_captured(self, &mut frame).await?;
        let Some(body_len) = (length as usize).checked_sub(varint_len(id)) else {
            return Err(Error::IllegalPacketLength);
        };

        let mut body = vec![0; body_len];
        self.read_exact(&mut body).await?;
        frame.extend_from_slice(&body);

        Ok(RawPacket { id, body, frame })
    }

    async fn read_varint(&mut self) -> Result<VarInt, Error> {
        let mut buf = [0];
        let mut ans = 0;
        for i in 0..5 {
            self.read_exact(&mut buf).await?;
            ans |= ((buf[0] & 0b0111_1111) as i32) << (7 * i);
            if buf[0] & 0b1000_0000 == 0 {
                return Ok(ans);
            }
        }
        Err(Error::InvalidVarInt)
    }

    async fn read_string_bounded(&mut self, limit: VarInt) -> Result<String, Error> {
        let length = self.read_varint().await?;
        if length < 0 || length > limit {
            return Err(Error::IllegalStringLength { length, limit });
        }

        let mut buffer = vec![0; length as usize];
        self.read_exact(&mut buffer).await?;

        String::from_utf8(buffer).map_err(|_| Error::InvalidEncoding)
    }

    async fn read_string(&mut self) -> Result<String, Error> {
        self.read_string_bounded(MAX_STRING_LENGTH).await
    }
}
