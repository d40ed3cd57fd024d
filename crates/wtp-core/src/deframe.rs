//! Pairs DATA headers with the payload datagram that carries their bytes.
//!
//! Senders emit a DATA packet as a header datagram followed by a datagram of
//! exactly `length` payload bytes. On a reordering channel the two can arrive
//! in either order with other packets in between, and full-size payloads all
//! share one length, so a pairing only counts when the DATA checksum over
//! header and payload verifies. The deframer keeps a bounded set of headers
//! waiting for their payload and a bounded set of unclaimed datagrams that may
//! be a payload whose header has not arrived yet. A header whose own datagram
//! already carries the payload is accepted too.

use bytes::Bytes;
use std::collections::VecDeque;
use tracing::debug;
use wtp_abstract::{DecodeError, Packet, PacketHeader, PacketType};

/// Floor on how many headers and unclaimed datagrams are tracked.
pub const MIN_PENDING: usize = 4;
/// Ceiling, whatever the window.
pub const MAX_PENDING: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// A header datagram arrived. The packet is `Some` when nothing more is
    /// needed to complete it.
    Header(PacketHeader, Option<Packet>),
    /// The datagram was the payload of a waiting DATA header.
    Payload(Packet),
    /// Neither a header nor a payload anything was waiting for.
    Invalid(DecodeError),
}

#[derive(Debug)]
pub struct Deframer {
    capacity: usize,
    headers: VecDeque<PacketHeader>,
    unclaimed: VecDeque<Bytes>,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::with_capacity(MIN_PENDING)
    }
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track up to `capacity` waiting headers and as many unclaimed datagrams,
    /// oldest evicted first. A receive window's size is a good fit.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.clamp(MIN_PENDING, MAX_PENDING),
            headers: VecDeque::new(),
            unclaimed: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// DATA headers still waiting for their payload, oldest first.
    pub fn waiting(&self) -> impl Iterator<Item = &PacketHeader> {
        self.headers.iter()
    }

    pub fn unclaimed(&self) -> usize {
        self.unclaimed.len()
    }

    pub fn push(&mut self, datagram: &[u8]) -> Step {
        if let Some(header) = self.claim_header(datagram) {
            return Step::Payload(Packet::new(header, Bytes::copy_from_slice(datagram)));
        }

        let (header, rest) = match PacketHeader::decode(datagram) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.remember(datagram);
                return Step::Invalid(err);
            }
        };

        if header.packet_type != PacketType::Data {
            // Payload bytes can look like a control header.
            if !header.verify(&[]) {
                self.remember(datagram);
            }
            return Step::Header(header, Some(Packet::new(header, Bytes::new())));
        }

        if !rest.is_empty() || header.length == 0 {
            return match Packet::decode(datagram) {
                Ok(packet) => {
                    if !packet.is_intact() {
                        self.remember(datagram);
                    }
                    Step::Header(header, Some(packet))
                }
                Err(err) => {
                    debug!(seq = header.seq_num, %err, "DATA datagram with a partial payload");
                    self.remember(datagram);
                    Step::Header(header, None)
                }
            };
        }

        if let Some(payload) = self.claim_unclaimed(&header) {
            return Step::Header(header, Some(Packet::new(header, payload)));
        }
        self.wait_for_payload(header);
        Step::Header(header, None)
    }

    fn claim_header(&mut self, datagram: &[u8]) -> Option<PacketHeader> {
        let pos = self
            .headers
            .iter()
            .position(|h| h.payload_len() == datagram.len() && h.verify(datagram))?;
        self.headers.remove(pos)
    }

    fn claim_unclaimed(&mut self, header: &PacketHeader) -> Option<Bytes> {
        let pos = self
            .unclaimed
            .iter()
            .position(|d| d.len() == header.payload_len() && header.verify(d))?;
        self.unclaimed.remove(pos)
    }

    fn wait_for_payload(&mut self, header: PacketHeader) {
        // A resent header replaces the copy already waiting.
        self.headers.retain(|held| held.seq_num != header.seq_num);
        if self.headers.len() == self.capacity
            && let Some(stale) = self.headers.pop_front()
        {
            debug!(seq = stale.seq_num, "evicting DATA header whose payload never came");
        }
        self.headers.push_back(header);
    }

    fn remember(&mut self, datagram: &[u8]) {
        if self.unclaimed.len() == self.capacity {
            self.unclaimed.pop_front();
        }
        self.unclaimed.push_back(Bytes::copy_from_slice(datagram));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u32, payload: &'static [u8]) -> Packet {
        Packet::data(seq, Bytes::from_static(payload))
    }

    #[test]
    fn pairs_header_with_following_payload() {
        let packet = data(4, b"four");
        let datagrams = packet.datagrams();
        let mut deframer = Deframer::new();

        assert_eq!(
            deframer.push(&datagrams[0]),
            Step::Header(packet.header, None)
        );
        assert_eq!(deframer.waiting().collect::<Vec<_>>(), vec![&packet.header]);
        assert_eq!(deframer.push(&datagrams[1]), Step::Payload(packet));
        assert_eq!(deframer.waiting().count(), 0);
    }

    #[test]
    fn accepts_payload_in_the_header_datagram() {
        let packet = data(1, b"inline");
        let mut joined = packet.header.to_bytes().to_vec();
        joined.extend_from_slice(b"inline");

        let mut deframer = Deframer::new();
        assert_eq!(
            deframer.push(&joined),
            Step::Header(packet.header, Some(packet))
        );
        assert_eq!(deframer.waiting().count(), 0);
    }

    #[test]
    fn control_packets_complete_immediately() {
        let ack = Packet::ack(3);
        let mut deframer = Deframer::new();
        assert_eq!(
            deframer.push(&ack.header.encode()),
            Step::Header(ack.header, Some(ack))
        );
        assert_eq!(deframer.unclaimed(), 0);
    }

    #[test]
    fn lost_payload_does_not_block_later_packets() {
        let first = data(0, b"lost payload");
        let second = data(1, b"ok");
        let mut deframer = Deframer::new();

        deframer.push(&first.datagrams()[0]);
        assert_eq!(
            deframer.push(&second.datagrams()[0]),
            Step::Header(second.header, None)
        );
        assert_eq!(deframer.push(&second.datagrams()[1]), Step::Payload(second));
        assert_eq!(deframer.waiting().collect::<Vec<_>>(), vec![&first.header]);
    }

    #[test]
    fn same_length_payloads_pair_by_checksum() {
        let packets = [data(0, b"aaaa"), data(1, b"bbbb"), data(2, b"cccc")];
        let mut deframer = Deframer::new();
        for packet in &packets {
            deframer.push(&packet.datagrams()[0]);
        }

        for index in [2, 0, 1] {
            let packet = &packets[index];
            assert_eq!(
                deframer.push(&packet.datagrams()[1]),
                Step::Payload(packet.clone())
            );
        }
        assert_eq!(deframer.waiting().count(), 0);
    }

    #[test]
    fn payload_ahead_of_its_header_is_claimed_later() {
        let packet = data(7, b"early bytes");
        let mut deframer = Deframer::new();

        assert!(matches!(
            deframer.push(&packet.datagrams()[1]),
            Step::Invalid(DecodeError::Truncated { len: 11 })
        ));
        assert_eq!(deframer.unclaimed(), 1);
        assert_eq!(
            deframer.push(&packet.datagrams()[0]),
            Step::Header(packet.header, Some(packet))
        );
        assert_eq!(deframer.unclaimed(), 0);
        assert_eq!(deframer.waiting().count(), 0);
    }

    #[test]
    fn corrupt_payload_pairs_with_nothing() {
        let packet = data(0, b"payload");
        let mut deframer = Deframer::new();
        deframer.push(&packet.datagrams()[0]);

        assert!(matches!(
            deframer.push(b"pAyload"),
            Step::Invalid(DecodeError::Truncated { len: 7 })
        ));
        assert_eq!(deframer.waiting().count(), 1);
        assert_eq!(deframer.push(b"payload"), Step::Payload(packet));
    }

    #[test]
    fn resent_header_replaces_the_waiting_copy() {
        let packet = data(3, b"again");
        let mut deframer = Deframer::new();
        deframer.push(&packet.datagrams()[0]);
        deframer.push(&packet.datagrams()[0]);

        assert_eq!(deframer.waiting().count(), 1);
        assert_eq!(deframer.push(&packet.datagrams()[1]), Step::Payload(packet));
    }

    #[test]
    fn oldest_waiting_header_is_evicted_at_capacity() {
        let mut deframer = Deframer::with_capacity(1);
        assert_eq!(deframer.capacity(), MIN_PENDING);

        let packets: Vec<Packet> = (0..5).map(|seq| data(seq, b"xyz")).collect();
        for packet in &packets {
            deframer.push(&packet.datagrams()[0]);
        }
        let seqs: Vec<u32> = deframer.waiting().map(|h| h.seq_num).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        // Payload of the evicted header is kept as unclaimed instead.
        assert!(matches!(
            deframer.push(&packets[0].datagrams()[1]),
            Step::Invalid(_)
        ));
        assert_eq!(deframer.unclaimed(), 1);
    }
}
