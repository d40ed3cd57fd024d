//! Wire format shared by senders and receivers.
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬────────────────┐
//! │ type (u32)   │ seqNum (u32) │ length (u32) │ checksum (u32) │
//! └──────────────┴──────────────┴──────────────┴────────────────┘
//! ```
//!
//! Fields are written in native byte order, so both ends must run on
//! architectures with the same endianness. A DATA packet travels as two
//! datagrams: the 16-byte header, then exactly `length` payload bytes.

use bytes::{Buf, BufMut, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::checksum::{checksum, checksum_parts};
use crate::error::DecodeError;

/// Size of an encoded [`PacketHeader`] in bytes.
pub const HEADER_SIZE: usize = 16;

/// Offset of the checksum field. Control packets are checksummed over the
/// bytes in front of it.
pub const CHECKSUM_OFFSET: usize = 12;

/// Largest datagram either side will emit, header included.
pub const DEFAULT_MAX_DATAGRAM: usize = 1472;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum PacketType {
    Start = 0,
    End = 1,
    Data = 2,
    Ack = 3,
}

impl PacketType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PacketType {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Start),
            1 => Ok(PacketType::End),
            2 => Ok(PacketType::Data),
            3 => Ok(PacketType::Ack),
            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

/// Identifier shared by a transfer's START and END packets and by their ACKs.
///
/// It travels in the `seqNum` field but lives outside the DATA sequence space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControlId(u32);

impl ControlId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ControlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    /// DATA: position in the transfer. ACK: acknowledged value. START/END: control id.
    pub seq_num: u32,
    /// Payload bytes that follow the header; zero for everything but DATA.
    pub length: u32,
    pub checksum: u32,
}

impl PacketHeader {
    /// Header with a zero checksum. Use [`PacketHeader::sealed`] for anything sent.
    pub fn new(packet_type: PacketType, seq_num: u32, length: u32) -> Self {
        Self {
            packet_type,
            seq_num,
            length,
            checksum: 0,
        }
    }

    /// Header with `length` and `checksum` filled in for `payload`.
    pub fn sealed(packet_type: PacketType, seq_num: u32, payload: &[u8]) -> Self {
        let mut header = Self::new(packet_type, seq_num, payload.len() as u32);
        header.checksum = header.compute_checksum(payload);
        header
    }

    pub fn ack(seq_num: u32) -> Self {
        Self::sealed(PacketType::Ack, seq_num, &[])
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }

    pub fn is_ack(&self) -> bool {
        self.packet_type == PacketType::Ack
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_ne(self.packet_type.as_u32());
        buf.put_u32_ne(self.seq_num);
        buf.put_u32_ne(self.length);
        buf.put_u32_ne(self.checksum);
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        self.encode_into(&mut &mut raw[..]);
        raw
    }

    /// Header-only datagram.
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.to_bytes())
    }

    /// Split a received buffer into its header and whatever bytes trail it.
    ///
    /// The trailing slice is not checked against `length`; callers must do so
    /// before trusting it as payload.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated { len: buf.len() });
        }
        let (mut raw, rest) = buf.split_at(HEADER_SIZE);
        let packet_type = PacketType::try_from(raw.get_u32_ne())?;
        let header = Self {
            packet_type,
            seq_num: raw.get_u32_ne(),
            length: raw.get_u32_ne(),
            checksum: raw.get_u32_ne(),
        };
        Ok((header, rest))
    }

    /// Bytes covered by the checksum. The checksum field itself is never part of it.
    pub fn checksum_span(&self, payload: &[u8]) -> Vec<u8> {
        let zeroed = Self {
            checksum: 0,
            ..*self
        };
        let mut span = Vec::with_capacity(HEADER_SIZE + payload.len());
        zeroed.encode_into(&mut span);
        match self.packet_type {
            PacketType::Data => span.extend_from_slice(payload),
            _ => span.truncate(CHECKSUM_OFFSET),
        }
        span
    }

    /// Same value as `checksum(&self.checksum_span(payload))`, computed without
    /// building the span.
    pub fn compute_checksum(&self, payload: &[u8]) -> u32 {
        let zeroed = Self {
            checksum: 0,
            ..*self
        }
        .to_bytes();
        match self.packet_type {
            PacketType::Data => checksum_parts(&[&zeroed, payload]),
            _ => checksum(&zeroed[..CHECKSUM_OFFSET]),
        }
    }

    pub fn verify(&self, payload: &[u8]) -> bool {
        self.compute_checksum(payload) == self.checksum
    }
}

/// Audit-log rendering: `type seqNum length checksum`.
impl fmt::Display for PacketHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.packet_type.as_u32(),
            self.seq_num,
            self.length,
            self.checksum
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn data(seq_num: u32, payload: Bytes) -> Self {
        Self {
            header: PacketHeader::sealed(PacketType::Data, seq_num, &payload),
            payload,
        }
    }

    /// START or END carrying the transfer's control id.
    pub fn control(packet_type: PacketType, id: ControlId) -> Self {
        Self {
            header: PacketHeader::sealed(packet_type, id.get(), &[]),
            payload: Bytes::new(),
        }
    }

    pub fn ack(seq_num: u32) -> Self {
        Self {
            header: PacketHeader::ack(seq_num),
            payload: Bytes::new(),
        }
    }

    /// Decode a packet whose payload (if any) shares the header's datagram.
    pub fn decode(datagram: &[u8]) -> Result<Self, DecodeError> {
        let (header, rest) = PacketHeader::decode(datagram)?;
        let expected = match header.packet_type {
            PacketType::Data => header.payload_len(),
            _ => 0,
        };
        if rest.len() < expected {
            return Err(DecodeError::LengthMismatch {
                expected,
                actual: rest.len(),
            });
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&rest[..expected]),
        })
    }

    /// Datagrams that carry this packet on the wire, in sending order.
    pub fn datagrams(&self) -> Vec<Bytes> {
        let mut out = vec![self.header.encode()];
        if self.header.packet_type == PacketType::Data && !self.payload.is_empty() {
            out.push(self.payload.clone());
        }
        out
    }

    pub fn is_intact(&self) -> bool {
        self.header.verify(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_survives_encode_decode() {
        let header = PacketHeader::sealed(PacketType::Data, 7, b"abc");
        let raw = header.encode();
        assert_eq!(raw.len(), HEADER_SIZE);
        let (decoded, rest) = PacketHeader::decode(&raw).unwrap();
        assert_eq!(decoded, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn fields_use_native_byte_order() {
        let header = PacketHeader::new(PacketType::Ack, 0x0102_0304, 0);
        let raw = header.to_bytes();
        assert_eq!(&raw[0..4], &3u32.to_ne_bytes());
        assert_eq!(&raw[4..8], &0x0102_0304u32.to_ne_bytes());
    }

    #[test]
    fn decode_rejects_short_buffers_and_unknown_types() {
        assert_eq!(
            PacketHeader::decode(&[0u8; 15]).unwrap_err(),
            DecodeError::Truncated { len: 15 }
        );
        let mut raw = PacketHeader::ack(1).to_bytes();
        raw[..4].copy_from_slice(&9u32.to_ne_bytes());
        assert_eq!(
            PacketHeader::decode(&raw).unwrap_err(),
            DecodeError::UnknownType(9)
        );
    }

    #[test]
    fn control_span_excludes_checksum_field() {
        let header = PacketHeader::sealed(PacketType::Start, 4242, &[]);
        let span = header.checksum_span(&[]);
        assert_eq!(span.len(), CHECKSUM_OFFSET);
        assert_eq!(header.checksum, checksum(&span));
    }

    #[test]
    fn data_span_is_zeroed_header_plus_payload() {
        let header = PacketHeader::sealed(PacketType::Data, 3, b"payload");
        let span = header.checksum_span(b"payload");
        assert_eq!(span.len(), HEADER_SIZE + 7);
        assert_eq!(&span[CHECKSUM_OFFSET..HEADER_SIZE], &[0, 0, 0, 0]);
        assert_eq!(&span[HEADER_SIZE..], b"payload");
        assert_eq!(header.checksum, checksum(&span));
    }

    #[test]
    fn any_covered_bit_flip_fails_verification() {
        let payload = b"some file bytes".to_vec();
        let header = PacketHeader::sealed(PacketType::Data, 11, &payload);

        for byte in 0..payload.len() {
            let mut corrupt = payload.clone();
            corrupt[byte] ^= 0x10;
            assert!(!header.verify(&corrupt));
        }

        let raw = header.to_bytes();
        for byte in 4..CHECKSUM_OFFSET {
            let mut corrupt = raw;
            corrupt[byte] ^= 0x01;
            let (decoded, _) = PacketHeader::decode(&corrupt).unwrap();
            assert!(!decoded.verify(&payload), "byte {byte}");
        }
    }

    #[test]
    fn checksum_is_not_self_covering() {
        let mut header = PacketHeader::sealed(PacketType::End, 99, &[]);
        let before = header.compute_checksum(&[]);
        header.checksum = 0xDEAD_BEEF;
        assert_eq!(header.compute_checksum(&[]), before);
    }

    #[test]
    fn audit_line_format() {
        let header = PacketHeader {
            packet_type: PacketType::Data,
            seq_num: 5,
            length: 100,
            checksum: 12345,
        };
        assert_eq!(header.to_string(), "2 5 100 12345");
    }

    #[test]
    fn data_packet_travels_as_two_datagrams() {
        let packet = Packet::data(0, Bytes::from_static(b"hello"));
        let datagrams = packet.datagrams();
        assert_eq!(datagrams.len(), 2);
        assert_eq!(datagrams[0].len(), HEADER_SIZE);
        assert_eq!(&datagrams[1][..], b"hello");

        let end = Packet::control(PacketType::End, ControlId::new(17));
        assert_eq!(end.datagrams().len(), 1);
    }

    #[test]
    fn single_buffer_decode_checks_length() {
        let packet = Packet::data(2, Bytes::from_static(b"xyz"));
        let mut joined = packet.header.to_bytes().to_vec();
        joined.extend_from_slice(b"xy");
        assert_eq!(
            Packet::decode(&joined).unwrap_err(),
            DecodeError::LengthMismatch {
                expected: 3,
                actual: 2
            }
        );
        joined.push(b'z');
        let decoded = Packet::decode(&joined).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.is_intact());
    }
}
