//! Transport packet framing.
//!
//! Every unit written to a client connection is a packet: one kind byte, a
//! three byte big-endian body length, then the body.
//!
//! ```text
//! +------+-----------------+----------------+
//! | kind | length (u24 BE) | body           |
//! +------+-----------------+----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the packet header in bytes.
pub const HEADER_LEN: usize = 4;

/// Bodies must be strictly smaller than this.
pub const MAX_PACKET_SIZE: usize = 1 << 24;

/// Kind of a transport packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    /// Client hello / server capabilities.
    Handshake = 0x01,
    /// Client acknowledgement of the handshake response.
    HandshakeAck = 0x02,
    /// Liveness probe, empty body.
    Heartbeat = 0x03,
    /// Carries an encoded message envelope.
    Data = 0x04,
    /// Server-initiated disconnect.
    Kick = 0x05,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Handshake),
            0x02 => Ok(Self::HandshakeAck),
            0x03 => Ok(Self::Heartbeat),
            0x04 => Ok(Self::Data),
            0x05 => Ok(Self::Kick),
            other => Err(PacketError::WrongPacketKind(other)),
        }
    }
}

/// A decoded packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Packet kind.
    pub kind: PacketKind,
    /// Raw body.
    pub body: Bytes,
}

/// Packet framing failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Kind byte outside the known range.
    #[error("wrong packet kind: {0:#04x}")]
    WrongPacketKind(u8),
    /// Body does not fit in the 24-bit length field.
    #[error("packet body of {0} bytes exceeds the maximum packet size")]
    PacketTooLarge(usize),
}

/// Encodes and incrementally decodes transport packets.
pub trait PacketCodec: Send + Sync {
    /// Frame `body` as a packet of the given kind.
    fn encode(&self, kind: PacketKind, body: &[u8]) -> Result<Bytes, PacketError>;

    /// Pull the next complete packet out of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds less than one full frame;
    /// consumed bytes are removed from `buf`.
    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Packet>, PacketError>;
}

/// The default length-prefixed codec.
#[derive(Clone, Copy, Debug, Default)]
pub struct PomeloPacketCodec;

impl PacketCodec for PomeloPacketCodec {
    fn encode(&self, kind: PacketKind, body: &[u8]) -> Result<Bytes, PacketError> {
        if body.len() >= MAX_PACKET_SIZE {
            return Err(PacketError::PacketTooLarge(body.len()));
        }

        let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
        out.put_u8(kind as u8);
        #[allow(clippy::cast_possible_truncation)]
        {
            let len = body.len() as u32;
            out.put_u8((len >> 16) as u8);
            out.put_u8((len >> 8) as u8);
            out.put_u8(len as u8);
        }
        out.put_slice(body);
        Ok(out.freeze())
    }

    fn decode(&self, buf: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        // Validate the kind before waiting on the body so garbage is rejected early.
        let kind = PacketKind::try_from(buf[0])?;
        let len = (usize::from(buf[1]) << 16) | (usize::from(buf[2]) << 8) | usize::from(buf[3]);
        if buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let body = buf.split_to(len).freeze();
        Ok(Some(Packet { kind, body }))
    }
}
