//! The packet layer carried inside frame plaintext.
//!
//! Packets are:
//!
//! ```text
//! uint8_t  type    packetTypePayload (0x00)
//! uint16_t length  Length of the payload (big endian)
//! uint8_t[] payload Data payload
//! uint8_t[] padding Padding (zero filled, ignored on receive)
//! ```
//!
//! Unrecognised packet types are skipped so that new types can be introduced
//! without breaking older peers.

use crate::crypto::drbg;
use crate::error::{Error, Result};
use crate::framing;

/// Length of the packet header (type plus payload length).
pub const PACKET_OVERHEAD: usize = 2 + 1;

/// Maximum payload carried by a single packet.
pub const MAX_PACKET_PAYLOAD_LENGTH: usize = framing::MAX_FRAME_PAYLOAD_LENGTH - PACKET_OVERHEAD;

/// Maximum padding carried by a single packet.
pub const MAX_PACKET_PADDING_LENGTH: usize = MAX_PACKET_PAYLOAD_LENGTH;

/// Payload length of a PRNG seed packet.
pub const SEED_PACKET_PAYLOAD_LENGTH: usize = drbg::SEED_LENGTH;

/// The type tag of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// Application payload (possibly zero length, padding only).
    Payload,
    /// A 32-byte length-distribution seed from the server.
    PrngSeed,
    /// An unrecognised type; ignored for forward compatibility.
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0 => PacketType::Payload,
            1 => PacketType::PrngSeed,
            other => PacketType::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> u8 {
        match value {
            PacketType::Payload => 0,
            PacketType::PrngSeed => 1,
            PacketType::Unknown(other) => other,
        }
    }
}

/// Build one packet's worth of frame plaintext.
///
/// # Panics
///
/// Panics if `data.len() + pad_len` exceeds
/// [`MAX_PACKET_PAYLOAD_LENGTH`]; callers size their chunks to fit.
pub fn make_packet(packet_type: PacketType, data: &[u8], pad_len: usize) -> Vec<u8> {
    assert!(
        data.len() + pad_len <= MAX_PACKET_PAYLOAD_LENGTH,
        "make_packet: data + padding exceeds packet payload: {} + {}",
        data.len(),
        pad_len
    );

    let mut pkt = Vec::with_capacity(PACKET_OVERHEAD + data.len() + pad_len);
    pkt.push(packet_type.into());
    pkt.extend_from_slice(&(data.len() as u16).to_be_bytes());
    pkt.extend_from_slice(data);
    pkt.resize(pkt.len() + pad_len, 0);
    pkt
}

/// A decoded packet, borrowing the payload from the frame plaintext.
#[derive(Debug)]
pub struct Packet<'a> {
    /// The packet's type tag.
    pub packet_type: PacketType,
    /// The declared payload, excluding any trailing padding.
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse one frame's plaintext as a packet.
    pub fn parse(plaintext: &'a [u8]) -> Result<Self> {
        if plaintext.len() < PACKET_OVERHEAD {
            return Err(Error::InvalidPacketLength(plaintext.len()));
        }

        let packet_type = PacketType::from(plaintext[0]);
        let payload_len = u16::from_be_bytes([plaintext[1], plaintext[2]]) as usize;
        if payload_len > plaintext.len() - PACKET_OVERHEAD {
            return Err(Error::InvalidPayloadLength(payload_len));
        }

        Ok(Self {
            packet_type,
            payload: &plaintext[PACKET_OVERHEAD..PACKET_OVERHEAD + payload_len],
        })
    }
}
