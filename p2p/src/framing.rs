//! Length-prefixed message framing over byte streams.
//!
//! Stream-level messages travel as `uleb128(len) || proto_bytes`. The
//! helpers here work over any async byte stream, so the same code frames
//! the cleartext handshake messages and the packets riding the encrypted
//! stream.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// A uleb128 value is at most 10 bytes for a 64-bit range.
pub const MAX_ULEB128_BYTES: usize = 10;

/// Read an unsigned LEB128 value, one byte at a time until the MSB clears.
///
/// Fails if no terminator appears within ten bytes or if the tenth byte
/// carries bits beyond the 64-bit range.
pub async fn read_uleb128<R>(io: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0u64;
    for i in 0..MAX_ULEB128_BYTES {
        let byte = io.read_u8().await?;
        let bits = u64::from(byte & 0x7f);
        if i == MAX_ULEB128_BYTES - 1 && bits > 1 {
            return Err(Error::protocol("uleb128 value overflows 64 bits"));
        }
        value |= bits << (i * 7);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::protocol("uleb128 prefix longer than 10 bytes"))
}

/// Append an unsigned LEB128 encoding of `value` (1..=10 bytes).
pub fn write_uleb128(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            return;
        }
    }
}

/// Read one length-delimited protobuf message, rejecting lengths above
/// `max_size`.
pub async fn read_msg<M, R>(io: &mut R, max_size: usize) -> Result<M>
where
    M: Message + Default,
    R: AsyncRead + Unpin,
{
    let len = read_uleb128(io).await?;
    if len > max_size as u64 {
        return Err(Error::Protocol(format!(
            "message of {} bytes exceeds limit of {}",
            len, max_size
        )));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_exact(&mut buf).await?;
    M::decode(buf.as_slice()).map_err(Error::from)
}

/// Write one length-delimited protobuf message and flush it.
pub async fn write_msg<M, W>(io: &mut W, msg: &M) -> Result<()>
where
    M: Message,
    W: AsyncWrite + Unpin,
{
    let buf = encode_msg(msg);
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Serialize a message with its uleb128 length prefix.
pub fn encode_msg<M: Message>(msg: &M) -> Vec<u8> {
    let mut buf = Vec::with_capacity(stele_proto::length_delimited_len(msg));
    msg.encode_length_delimited(&mut buf)
        .expect("Vec<u8> has unlimited capacity");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use stele_proto::p2p::{packet, Packet, PacketMsg};

    #[test]
    fn uleb128_lengths() {
        for (value, expected) in [
            (0u64, 1usize),
            (0x7f, 1),
            (0x80, 2),
            (0x3fff, 2),
            (0x4000, 3),
            (u64::MAX, 10),
        ] {
            let mut buf = Vec::new();
            write_uleb128(&mut buf, value);
            assert_eq!(buf.len(), expected, "value {:#x}", value);
        }
    }

    #[tokio::test]
    async fn uleb128_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            write_uleb128(&mut buf, value);
            let got = read_uleb128(&mut buf.as_slice()).await.unwrap();
            assert_eq!(got, value);
        }
    }

    #[tokio::test]
    async fn uleb128_rejects_unterminated_prefix() {
        let bytes = [0x80u8; 11];
        let res = read_uleb128(&mut &bytes[..]).await;
        assert!(matches!(res, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn uleb128_rejects_65_bit_value() {
        // Nine continuation bytes then a terminator carrying two high bits.
        let mut bytes = vec![0xffu8; 9];
        bytes.push(0x02);
        let res = read_uleb128(&mut bytes.as_slice()).await;
        assert!(matches!(res, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn message_round_trip() {
        let packet = Packet {
            sum: Some(packet::Sum::PacketMsg(PacketMsg {
                channel_id: 0x20,
                eof: true,
                data: vec![7; 512],
            })),
        };

        let mut wire = Vec::new();
        write_msg(&mut wire, &packet).await.unwrap();
        let got: Packet = read_msg(&mut wire.as_slice(), 1024).await.unwrap();
        assert_eq!(got, packet);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let packet = Packet {
            sum: Some(packet::Sum::PacketMsg(PacketMsg {
                channel_id: 1,
                eof: false,
                data: vec![0; 2048],
            })),
        };
        let mut wire = Vec::new();
        write_msg(&mut wire, &packet).await.unwrap();
        let res: Result<Packet> = read_msg(&mut wire.as_slice(), 1024).await;
        assert!(matches!(res, Err(Error::Protocol(_))));
    }
}
