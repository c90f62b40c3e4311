#![forbid(unsafe_code)]

#[cfg(test)]
use fake::Dummy;
use std::fmt::Debug;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod handshake;
pub mod login;
pub mod reader;
pub mod status;
pub mod writer;

const INITIAL_BUFFER_SIZE: usize = 48;

/// The max packet length in bytes accepted from a peer. Larger frames are rejected.
pub const MAX_PACKET_LENGTH: VarInt = 65_536;

/// The max length in bytes of a string field without an explicit bound.
pub const MAX_STRING_LENGTH: VarInt = 32 * 1024;

pub type VarInt = i32;

/// The internal error type for all errors related to the protocol communication.
///
/// This includes errors with the expected packets, packet contents or encoding of the exchanged
/// fields. Errors of the underlying data layer (for byte exchange) are wrapped from the underlying
/// IO errors.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred while reading or writing to the underlying byte stream.
    #[error("error reading or writing data: {0}")]
    Io(#[from] std::io::Error),

    /// The received packet is of an invalid length that we cannot process.
    #[error("illegal packet length")]
    IllegalPacketLength,

    /// The received string field exceeds the bound of its context.
    #[error("illegal string length: {length} (limit {limit})")]
    IllegalStringLength {
        /// The length that was announced by the peer.
        length: VarInt,
        /// The limit that applies in this context.
        limit: VarInt,
    },

    /// The received `VarInt` had a continuation bit after its maximum width.
    #[error("invalid VarInt data")]
    InvalidVarInt,

    /// The received value index cannot be mapped to an existing enum.
    #[error("illegal enum value index for {kind}: {value}")]
    IllegalEnumValue {
        /// The enum kind which was parsed.
        kind: &'static str,
        /// The value that was received.
        value: VarInt,
    },

    /// The received packet ID is not mapped to an expected packet.
    #[error("illegal packet ID: {actual} (expected {expected})")]
    IllegalPacketId {
        /// The expected value that should be present.
        expected: VarInt,
        /// The actual value that was observed.
        actual: VarInt,
    },

    /// The body of a packet is incorrectly encoded (not UTF-8).
    #[error("invalid packet body (invalid encoding)")]
    InvalidEncoding,
}

impl Error {
    pub fn is_connection_closed(&self) -> bool {
        let Error::Io(err) = self else {
            return false;
        };
        err.kind() == ErrorKind::UnexpectedEof
            || err.kind() == ErrorKind::ConnectionReset
            || err.kind() == ErrorKind::ConnectionAborted
            || err.kind() == ErrorKind::BrokenPipe
    }
}

/// `NextState` is the desired state that the connection should be in after the initial handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(Dummy))]
pub enum NextState {
    /// Query the server information without connecting.
    Status,
    /// Log into the Minecraft server, establishing a connection.
    Login,
}

impl From<NextState> for VarInt {
    fn from(state: NextState) -> Self {
        match state {
            NextState::Status => 1,
            NextState::Login => 2,
        }
    }
}

impl TryFrom<VarInt> for NextState {
    type Error = Error;

    fn try_from(value: VarInt) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NextState::Status),
            2 => Ok(NextState::Login),
            _ => Err(Error::IllegalEnumValue {
                kind: "NextState",
                value,
            }),
        }
    }
}

/// A single length-framed packet captured without interpreting its body.
///
/// The original frame bytes (length prefix, packet id and body) are retained so the packet can be
/// replayed to another peer byte-exactly, even when the body carries fields this crate does not
/// model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// The decoded packet id.
    pub id: VarInt,
    /// The body bytes following the packet id.
    pub body: Vec<u8>,
    /// The full frame as it appeared on the wire.
    pub frame: Vec<u8>,
}

/// Packets are network packets that are part of the protocol definition and identified by a
/// context and ID.
pub trait Packet {
    /// The defined ID of this network packet.
    const ID: VarInt;
}

/// `WritePacket`s are packets that can be written to a buffer.
pub trait WritePacket: Packet {
    /// Writes the data from this packet into the supplied [`S`].
    fn write_to_buffer<S>(&self, buffer: &mut S) -> impl Future<Output = Result<(), Error>>
    where
        S: AsyncWrite + Unpin + Send + Sync;
}

/// `ReadPacket`s are packets that can be read from a buffer.
pub trait ReadPacket: Packet + Sized {
    /// Creates a new instance of this packet with the data from the buffer.
    fn read_from_buffer<S>(buffer: &mut S) -> impl Future<Output = Result<Self, Error>>
    where
        S: AsyncRead + Unpin + Send + Sync;
}

/// `AsyncWritePacket` allows writing a specific [`WritePacket`] to an [`AsyncWrite`].
///
/// Only [`WritePacket`s](WritePacket) can be written as only those packets are sent. There are
/// additional methods to write the data that is encoded in a Minecraft-specific manner. Their
/// implementation is analogous to the [read implementation](AsyncReadPacket).
pub trait AsyncWritePacket {
    /// Writes a [`WritePacket`] onto this object as described in the official
    /// [protocol documentation][protocol-doc].
    ///
    /// [protocol-doc]: https://minecraft.wiki/w/Minecraft_Wiki:Projects/wiki.vg_merge/Protocol#Packet_format
    fn write_packet<T: WritePacket + Send + Sync + Debug>(
        &mut self,
        packet: T,
    ) -> impl Future<Output = Result<(), Error>>;

    /// Replays a previously captured [`RawPacket`] with its original frame bytes.
    fn write_raw_packet(&mut self, packet: &RawPacket) -> impl Future<Output = Result<(), Error>>;

    /// Writes a [`VarInt`] onto this object as described in the official
    /// [protocol documentation][protocol-doc].
    ///
    /// [protocol-doc]: https://minecraft.wiki/w/Minecraft_Wiki:Projects/wiki.vg_merge/Protocol#VarInt_and_VarLong
    fn write_varint(&mut self, int: VarInt) -> impl Future<Output = Result<(), Error>>;

    /// Writes a `String` onto this object as described in the official
    /// [protocol documentation][protocol-doc].
    ///
    /// [protocol-doc]: https://minecraft.wiki/w/Minecraft_Wiki:Projects/wiki.vg_merge/Protocol#Type:String
    fn write_string(&mut self, string: &str) -> impl Future<Output = Result<(), Error>>;
}

/// `AsyncReadPacket` allows reading a specific [`ReadPacket`] from an [`AsyncRead`].
///
/// Only [`ReadPacket`s](ReadPacket) can be read as only those packets are received. There are
/// additional methods to read the data that is encoded in a Minecraft-specific manner. Their
/// implementation is analogous to the [write implementation](AsyncWritePacket).
pub trait AsyncReadPacket {
    /// Reads the supplied [`ReadPacket`] type from this object as described in the official
    /// [protocol documentation][protocol-doc].
    ///
    /// [protocol-doc]: https://minecraft.wiki/w/Minecraft_Wiki:Projects/wiki.vg_merge/Protocol#Packet_format
    fn read_packet<T: ReadPacket + Send + Sync>(
        &mut self,
    ) -> impl Future<Output = Result<T, Error>>;

    /// Reads one length-framed packet without interpreting its body, retaining the original frame
    /// bytes for byte-exact replay.
    fn read_raw_packet(&mut self) -> impl Future<Output = Result<RawPacket, Error>>;

    /// Reads a [`VarInt`] from this object as described in the official
    /// [protocol documentation][protocol-doc].
    ///
    /// [protocol-doc]: https://minecraft.wiki/w/Minecraft_Wiki:Projects/wiki.vg_merge/Protocol#VarInt_and_VarLong
    fn read_varint(&mut self) -> impl Future<Output = Result<VarInt, Error>>;

    /// Reads a `String` of at most `limit` bytes from this object as described in the official
    /// [protocol documentation][protocol-doc].
    ///
    /// [protocol-doc]: https://minecraft.wiki/w/Minecraft_Wiki:Projects/wiki.vg_merge/Protocol#Type:String
    fn read_string_bounded(&mut self, limit: VarInt) -> impl Future<Output = Result<String, Error>>;

    /// Reads a `String` bounded by [`MAX_STRING_LENGTH`].
    fn read_string(&mut self) -> impl Future<Output = Result<String, Error>>;
}

/// Returns the number of bytes the `VarInt` encoding of `value` occupies.
pub fn varint_len(value: VarInt) -> usize {
    let mut value = value;
    let mut len = 1;
    loop {
        value = (value >> 7) & (i32::MAX >> 6);
        if value == 0 {
            break;
        }
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use crate::{ReadPacket, VarInt, WritePacket};
    use fake::{Dummy, Fake, Faker};
    use std::fmt::Debug;
    use std::io::Cursor;

    pub async fn assert_packet<T>(packet_id: VarInt)
    where
        T: PartialEq + Eq + Dummy<Faker> + ReadPacket + WritePacket + Send + Sync + Debug + Clone,
    {
        // generate data
        let expected: T = Faker.fake();

        // write packet
        let mut writer: Cursor<Vec<u8>> = Cursor::new(Vec::new());
        expected
            .write_to_buffer(&mut writer)
            .await
            .expect("failed to write packet");

        // read packet
        let mut reader: Cursor<Vec<u8>> = Cursor::new(writer.into_inner());
        let actual = T::read_from_buffer(&mut reader)
            .await
            .expect("failed to read packet");

        assert_eq!(T::ID, packet_id, "mismatching packet id");
        assert_eq!(expected, actual);
        assert_eq!(
            reader.position() as usize,
            reader.get_ref().len(),
            "there are remaining bytes in the buffer"
        );
    }
}
