//! Send side of both protocol variants.
//!
//! A transfer is START, then DATA `0..N` through a sliding window, then END.
//! The sender is driven one inbound datagram or one timeout at a time; after
//! either it applies its retransmission policy, slides the window and refills
//! it.

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, warn};
use wtp_abstract::{
    ConfigError, ControlId, Endpoint, Packet, PacketHeader, PacketType, SenderConfig,
    SystemContext, Variant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingStartAck,
    WindowedTransfer,
    Done,
}

#[derive(Debug, Clone)]
pub struct TrackedPacket {
    pub packet: Packet,
    pub sent_at: Option<u64>,
    pub acked: bool,
}

impl TrackedPacket {
    fn new(packet: Packet) -> Self {
        Self {
            packet,
            sent_at: None,
            acked: false,
        }
    }
}

/// Split `data` into DATA packets of at most `capacity` payload bytes each.
pub fn segment(data: &Bytes, capacity: usize) -> Result<Vec<Packet>, ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::DatagramTooSmall(capacity));
    }
    let count = data.len().div_ceil(capacity);
    // The control id must fit above every DATA sequence number.
    if count >= u32::MAX as usize {
        return Err(ConfigError::TooManyChunks(count));
    }

    let mut packets = Vec::with_capacity(count);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + capacity).min(data.len());
        packets.push(Packet::data(packets.len() as u32, data.slice(offset..end)));
        offset = end;
    }
    Ok(packets)
}

pub struct Sender {
    config: SenderConfig,
    control_id: ControlId,
    start: TrackedPacket,
    /// DATA packets followed by END.
    packets: Vec<TrackedPacket>,
    base: usize,
    next: usize,
    phase: Phase,
    end_timeouts: u32,
    transmissions: u32,
    retransmissions: u32,
}

impl Sender {
    /// Build a sender with a control id drawn at random above every DATA
    /// sequence number.
    pub fn new(config: SenderConfig, data: impl Into<Bytes>) -> Result<Self, ConfigError> {
        Self::with_rng(config, data, &mut rand::rng())
    }

    /// Like [`Sender::new`], drawing the control id from `rng`.
    pub fn with_rng<R: Rng + ?Sized>(
        config: SenderConfig,
        data: impl Into<Bytes>,
        rng: &mut R,
    ) -> Result<Self, ConfigError> {
        let data = data.into();
        config.validate()?;
        let chunks = segment(&data, config.payload_capacity())?;
        let floor = chunks.len() as u32 + 1;
        let control_id = ControlId::new(rng.random_range(floor..=u32::MAX));
        Ok(Self::assemble(config, chunks, control_id))
    }

    pub fn with_control_id(
        config: SenderConfig,
        data: impl Into<Bytes>,
        control_id: ControlId,
    ) -> Result<Self, ConfigError> {
        let data = data.into();
        config.validate()?;
        let chunks = segment(&data, config.payload_capacity())?;
        if control_id.get() as usize <= chunks.len() {
            return Err(ConfigError::ControlIdInDataRange {
                id: control_id.get(),
                data_packets: chunks.len() as u32,
            });
        }
        Ok(Self::assemble(config, chunks, control_id))
    }

    fn assemble(config: SenderConfig, chunks: Vec<Packet>, control_id: ControlId) -> Self {
        let mut packets: Vec<TrackedPacket> = chunks.into_iter().map(TrackedPacket::new).collect();
        packets.push(TrackedPacket::new(Packet::control(
            PacketType::End,
            control_id,
        )));
        Self {
            config,
            control_id,
            start: TrackedPacket::new(Packet::control(PacketType::Start, control_id)),
            packets,
            base: 0,
            next: 0,
            phase: Phase::AwaitingStartAck,
            end_timeouts: 0,
            transmissions: 0,
            retransmissions: 0,
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn control_id(&self) -> ControlId {
        self.control_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn start_acked(&self) -> bool {
        self.start.acked
    }

    /// Number of DATA packets.
    pub fn data_packets(&self) -> usize {
        self.packets.len() - 1
    }

    pub fn packets(&self) -> &[TrackedPacket] {
        &self.packets
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn next(&self) -> usize {
        self.next
    }

    /// Packet transmissions so far, START included, first sends and resends.
    pub fn transmissions(&self) -> u32 {
        self.transmissions
    }

    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    fn end_index(&self) -> usize {
        self.packets.len() - 1
    }

    fn end_sent(&self) -> bool {
        self.packets[self.end_index()].sent_at.is_some()
    }

    fn window_end(&self) -> usize {
        self.base.saturating_add(self.config.window_size as usize)
    }

    fn emit(ctx: &mut dyn SystemContext, tracked: &mut TrackedPacket) {
        for datagram in tracked.packet.datagrams() {
            ctx.send_datagram(datagram);
        }
        ctx.audit(&tracked.packet.header);
        tracked.sent_at = Some(ctx.now());
    }

    fn transmit(&mut self, ctx: &mut dyn SystemContext, index: usize) {
        let tracked = &mut self.packets[index];
        if tracked.sent_at.is_some() {
            self.retransmissions += 1;
            debug!(
                index,
                seq = tracked.packet.header.seq_num,
                "retransmitting"
            );
        }
        self.transmissions += 1;
        Self::emit(ctx, tracked);
    }

    fn send_start(&mut self, ctx: &mut dyn SystemContext) {
        if self.start.sent_at.is_some() {
            self.retransmissions += 1;
        }
        self.transmissions += 1;
        Self::emit(ctx, &mut self.start);
    }

    fn enter_transfer(&mut self, ctx: &mut dyn SystemContext) {
        self.phase = Phase::WindowedTransfer;
        self.fill_window(ctx);
    }

    /// Send every unsent packet inside `[base, base + window)`. END is held
    /// back until all DATA is acknowledged.
    fn fill_window(&mut self, ctx: &mut dyn SystemContext) {
        let end_index = self.end_index();
        while self.next < self.packets.len() && self.next < self.window_end() {
            if self.next == end_index && self.base < end_index {
                break;
            }
            if !self.packets[self.next].acked {
                self.transmit(ctx, self.next);
            }
            self.next += 1;
        }
    }

    /// START and END share the control id, so once END is out a delayed
    /// duplicate of the START ACK is indistinguishable from END's ACK and is
    /// taken as one.
    fn apply_ack(&mut self, ctx: &mut dyn SystemContext, ack: u32) {
        if ack == self.control_id.get() {
            if self.end_sent() {
                let end_index = self.end_index();
                self.packets[end_index].acked = true;
            } else if !self.start.acked {
                self.start.acked = true;
                ctx.log("late START acknowledgment");
            }
            return;
        }

        let data_packets = self.data_packets();
        match self.config.variant {
            Variant::Baseline => {
                let upto = (ack as usize).min(data_packets);
                for tracked in &mut self.packets[self.base.min(upto)..upto] {
                    tracked.acked = true;
                }
            }
            Variant::Optimized => {
                if let Some(tracked) = self.packets[..data_packets].get_mut(ack as usize) {
                    tracked.acked = true;
                } else {
                    debug!(ack, "ACK outside the DATA range, ignoring");
                }
            }
        }
    }

    /// Per-packet timer sweep of the optimized variant.
    fn retransmit_expired(&mut self, ctx: &mut dyn SystemContext) {
        let now = ctx.now();
        let timeout = self.config.timeout_ms;
        for index in self.base..self.next {
            let tracked = &self.packets[index];
            let expired = tracked
                .sent_at
                .is_none_or(|sent| now.saturating_sub(sent) >= timeout);
            if !tracked.acked && expired {
                self.transmit(ctx, index);
            }
        }
    }

    /// Go-Back-N resend of everything unacknowledged in the window.
    fn retransmit_window(&mut self, ctx: &mut dyn SystemContext) {
        for index in self.base..self.next {
            if !self.packets[index].acked {
                self.transmit(ctx, index);
            }
        }
    }

    fn finish_iteration(&mut self, ctx: &mut dyn SystemContext) {
        if self.config.variant == Variant::Optimized {
            self.retransmit_expired(ctx);
        }
        while self.base < self.packets.len() && self.packets[self.base].acked {
            self.base += 1;
        }
        if self.base == self.packets.len() {
            self.finish(ctx, "transfer acknowledged");
        } else {
            self.fill_window(ctx);
        }
    }

    fn finish(&mut self, ctx: &mut dyn SystemContext, reason: &str) {
        self.phase = Phase::Done;
        ctx.log(&format!(
            "{reason}: {} DATA packets, {} transmissions, {} retransmissions",
            self.data_packets(),
            self.transmissions,
            self.retransmissions
        ));
        info!(
            control_id = self.control_id.get(),
            transmissions = self.transmissions,
            retransmissions = self.retransmissions,
            "sender done"
        );
    }

    /// True when END has been sent and is the only packet left.
    fn lingering_on_end(&self) -> bool {
        self.base == self.end_index() && self.end_sent()
    }
}

impl Endpoint for Sender {
    fn init(&mut self, ctx: &mut dyn SystemContext) {
        ctx.log(&format!(
            "{:?} sender: {} DATA packets, window {}, control id {}",
            self.config.variant,
            self.data_packets(),
            self.config.window_size,
            self.control_id
        ));
        self.send_start(ctx);
    }

    fn on_datagram(&mut self, ctx: &mut dyn SystemContext, datagram: &[u8]) {
        if self.phase == Phase::Done {
            return;
        }
        let ack = match PacketHeader::decode(datagram) {
            Ok((header, _)) => {
                ctx.audit(&header);
                if header.packet_type == PacketType::Ack && header.verify(&[]) {
                    Some(header.seq_num)
                } else {
                    debug!(%header, "ignoring inbound packet that is not a valid ACK");
                    None
                }
            }
            Err(err) => {
                debug!(%err, "dropping undecodable datagram");
                None
            }
        };

        match self.phase {
            Phase::AwaitingStartAck => {
                if ack == Some(self.control_id.get()) {
                    self.start.acked = true;
                    ctx.log("START acknowledged");
                }
                self.enter_transfer(ctx);
            }
            Phase::WindowedTransfer => {
                if let Some(ack) = ack {
                    self.apply_ack(ctx, ack);
                }
                self.finish_iteration(ctx);
            }
            Phase::Done => {}
        }
    }

    fn on_timeout(&mut self, ctx: &mut dyn SystemContext) {
        match self.phase {
            Phase::AwaitingStartAck => {
                if self.config.variant == Variant::Baseline {
                    ctx.log("START timed out, retransmitting once");
                    self.send_start(ctx);
                } else {
                    ctx.log("START timed out, proceeding unconfirmed");
                }
                self.enter_transfer(ctx);
            }
            Phase::WindowedTransfer => {
                if self.lingering_on_end() {
                    self.end_timeouts += 1;
                    if let Some(limit) = self.config.end_retry_limit
                        && self.end_timeouts >= limit
                    {
                        warn!(
                            control_id = self.control_id.get(),
                            timeouts = self.end_timeouts,
                            "no ACK for END, finishing with all DATA acknowledged"
                        );
                        self.finish(ctx, "END unacknowledged");
                        return;
                    }
                }
                if self.config.variant == Variant::Baseline {
                    self.retransmit_window(ctx);
                }
                self.finish_iteration(ctx);
            }
            Phase::Done => {}
        }
    }

    fn wait_timeout(&self) -> Option<u64> {
        match self.phase {
            Phase::Done => None,
            _ => Some(self.config.timeout_ms),
        }
    }

    fn is_finished(&self) -> bool {
        self.phase == Phase::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::Receiver;
    use wtp_abstract::{Outbox, ReceiverConfig, ReorderPolicy};

    const CONTROL: u32 = 4_000_000;

    fn config(variant: Variant, window_size: u32) -> SenderConfig {
        SenderConfig {
            variant,
            window_size,
            timeout_ms: 500,
            max_datagram: 16 + 4,
            end_retry_limit: Some(3),
        }
    }

    fn sender(variant: Variant, window_size: u32, data: &'static [u8]) -> Sender {
        Sender::with_control_id(
            config(variant, window_size),
            Bytes::from_static(data),
            ControlId::new(CONTROL),
        )
        .unwrap()
    }

    fn sent(out: &Outbox) -> Vec<(PacketType, u32)> {
        out.sent_headers()
            .iter()
            .map(|h| (h.packet_type, h.seq_num))
            .collect()
    }

    fn ack(tx: &mut Sender, seq: u32, now: u64) -> Outbox {
        let mut out = Outbox::new(now);
        tx.on_datagram(&mut out, &PacketHeader::ack(seq).encode());
        out
    }

    fn timeout(tx: &mut Sender, now: u64) -> Outbox {
        let mut out = Outbox::new(now);
        tx.on_timeout(&mut out);
        out
    }

    /// Sender through START with the window filled.
    fn started(variant: Variant, window_size: u32, data: &'static [u8]) -> (Sender, Outbox) {
        let mut tx = sender(variant, window_size, data);
        tx.init(&mut Outbox::new(0));
        let out = ack(&mut tx, CONTROL, 10);
        (tx, out)
    }

    #[test]
    fn segments_into_maximal_chunks() {
        let data = Bytes::from(vec![7u8; 3000]);
        let lens: Vec<usize> = segment(&data, 1450)
            .unwrap()
            .iter()
            .map(|p| p.payload.len())
            .collect();
        assert_eq!(lens, vec![1450, 1450, 100]);

        let seqs: Vec<u32> = segment(&Bytes::from(vec![0u8; 8]), 4)
            .unwrap()
            .iter()
            .map(|p| p.header.seq_num)
            .collect();
        assert_eq!(seqs, vec![0, 1]);
        assert!(segment(&Bytes::new(), 1456).unwrap().is_empty());
    }

    #[test]
    fn rejects_zero_window_and_colliding_control_id() {
        let err = Sender::new(config(Variant::Baseline, 0), Bytes::new()).err();
        assert_eq!(err, Some(ConfigError::ZeroWindow));

        let err = Sender::with_control_id(
            config(Variant::Baseline, 4),
            Bytes::from_static(b"abcdefgh"),
            ControlId::new(2),
        )
        .err();
        assert_eq!(
            err,
            Some(ConfigError::ControlIdInDataRange {
                id: 2,
                data_packets: 2
            })
        );
    }

    #[test]
    fn random_control_id_sits_above_data_sequence_numbers() {
        for _ in 0..32 {
            let tx = Sender::new(config(Variant::Optimized, 4), Bytes::from(vec![1u8; 40])).unwrap();
            assert_eq!(tx.data_packets(), 10);
            assert!(tx.control_id().get() > 10);
        }
    }

    #[test]
    fn init_sends_and_audits_start() {
        let mut tx = sender(Variant::Baseline, 4, b"abcd");
        let mut out = Outbox::new(0);
        tx.init(&mut out);
        assert_eq!(sent(&out), vec![(PacketType::Start, CONTROL)]);
        assert_eq!(out.audits.len(), 1);
        assert_eq!(tx.phase(), Phase::AwaitingStartAck);
        assert_eq!(tx.wait_timeout(), Some(500));
    }

    #[test]
    fn start_ack_opens_the_window() {
        let (tx, out) = started(Variant::Baseline, 2, b"aaaabbbbcccc");
        assert!(tx.start_acked());
        assert_eq!(tx.phase(), Phase::WindowedTransfer);
        assert_eq!(
            sent(&out),
            vec![(PacketType::Data, 0), (PacketType::Data, 1)]
        );
        // Header then payload datagram per DATA packet.
        assert_eq!(out.datagrams.len(), 4);
        // Inbound ACK plus two outbound DATA.
        assert_eq!(out.audits.len(), 3);
    }

    #[test]
    fn baseline_retransmits_start_once_then_proceeds() {
        let mut tx = sender(Variant::Baseline, 4, b"abcd");
        tx.init(&mut Outbox::new(0));
        let out = timeout(&mut tx, 500);
        assert_eq!(
            sent(&out),
            vec![(PacketType::Start, CONTROL), (PacketType::Data, 0)]
        );
        assert!(!tx.start_acked());
        assert_eq!(tx.phase(), Phase::WindowedTransfer);
    }

    #[test]
    fn optimized_proceeds_without_start_retransmission() {
        let mut tx = sender(Variant::Optimized, 4, b"abcd");
        tx.init(&mut Outbox::new(0));
        let out = timeout(&mut tx, 500);
        assert_eq!(sent(&out), vec![(PacketType::Data, 0)]);
    }

    #[test]
    fn any_datagram_ends_the_start_wait() {
        let mut tx = sender(Variant::Baseline, 4, b"abcd");
        tx.init(&mut Outbox::new(0));
        let out = ack(&mut tx, 99, 20);
        assert!(!tx.start_acked());
        assert_eq!(sent(&out), vec![(PacketType::Data, 0)]);
    }

    #[test]
    fn baseline_cumulative_ack_slides_window() {
        let (mut tx, _) = started(Variant::Baseline, 2, b"aaaabbbbcccc");
        let out = ack(&mut tx, 2, 20);
        assert_eq!(tx.base(), 2);
        assert_eq!(sent(&out), vec![(PacketType::Data, 2)]);

        // A stale cumulative ACK changes nothing.
        let out = ack(&mut tx, 1, 30);
        assert_eq!(tx.base(), 2);
        assert!(out.sent_headers().is_empty());
    }

    #[test]
    fn baseline_timeout_resends_whole_window() {
        let (mut tx, _) = started(Variant::Baseline, 3, b"aaaabbbbcccc");
        ack(&mut tx, 1, 20);
        let out = timeout(&mut tx, 520);
        assert_eq!(
            sent(&out),
            vec![(PacketType::Data, 1), (PacketType::Data, 2)]
        );
        assert_eq!(tx.retransmissions(), 2);
    }

    #[test]
    fn optimized_resends_only_expired_packets() {
        let (mut tx, _) = started(Variant::Optimized, 3, b"aaaabbbbcccc");
        // DATA 1 is acknowledged out of order; DATA 0 still blocks the base.
        let out = ack(&mut tx, 1, 100);
        assert!(out.sent_headers().is_empty());
        assert_eq!(tx.base(), 0);

        let out = timeout(&mut tx, 600);
        assert_eq!(
            sent(&out),
            vec![(PacketType::Data, 0), (PacketType::Data, 2)]
        );

        // Fresh timers: nothing expires 100 ms later.
        let out = ack(&mut tx, 7, 700);
        assert!(out.sent_headers().is_empty());
    }

    #[test]
    fn end_waits_for_every_data_ack() {
        let (mut tx, out) = started(Variant::Optimized, 8, b"aaaabbbb");
        assert_eq!(
            sent(&out),
            vec![(PacketType::Data, 0), (PacketType::Data, 1)]
        );
        let out = ack(&mut tx, 1, 20);
        assert!(out.sent_headers().is_empty());
        let out = ack(&mut tx, 0, 30);
        assert_eq!(sent(&out), vec![(PacketType::End, CONTROL)]);

        ack(&mut tx, CONTROL, 40);
        assert!(tx.is_finished());
        assert_eq!(tx.wait_timeout(), None);
    }

    #[test]
    fn empty_input_sends_start_then_end() {
        let (mut tx, out) = started(Variant::Baseline, 4, b"");
        assert_eq!(sent(&out), vec![(PacketType::End, CONTROL)]);
        ack(&mut tx, CONTROL, 20);
        assert!(tx.is_finished());
    }

    #[test]
    fn control_ack_before_end_only_confirms_start() {
        let mut tx = sender(Variant::Baseline, 4, b"abcd");
        tx.init(&mut Outbox::new(0));
        timeout(&mut tx, 500);
        ack(&mut tx, CONTROL, 520);
        assert!(tx.start_acked());
        assert!(!tx.packets()[1].acked);
        assert_eq!(tx.base(), 0);
    }

    #[test]
    fn corrupt_ack_is_audited_but_ignored() {
        let (mut tx, _) = started(Variant::Baseline, 4, b"abcd");
        let mut header = PacketHeader::ack(1);
        header.checksum ^= 1;
        let mut out = Outbox::new(20);
        tx.on_datagram(&mut out, &header.encode());
        assert_eq!(out.audits, vec![header]);
        assert_eq!(tx.base(), 0);
    }

    #[test]
    fn gives_up_on_end_after_retry_limit() {
        let (mut tx, _) = started(Variant::Baseline, 4, b"abcd");
        ack(&mut tx, 1, 20);
        for round in 1..3u64 {
            let out = timeout(&mut tx, 20 + round * 500);
            assert_eq!(sent(&out), vec![(PacketType::End, CONTROL)]);
        }
        let out = timeout(&mut tx, 1520);
        assert!(out.sent_headers().is_empty());
        assert!(tx.is_finished());
    }

    #[test]
    fn linger_bound_can_be_disabled() {
        let mut cfg = config(Variant::Baseline, 4);
        cfg.end_retry_limit = None;
        let mut tx =
            Sender::with_control_id(cfg, Bytes::from_static(b"abcd"), ControlId::new(CONTROL))
                .unwrap();
        tx.init(&mut Outbox::new(0));
        ack(&mut tx, CONTROL, 10);
        ack(&mut tx, 1, 20);
        for round in 1..20u64 {
            timeout(&mut tx, round * 500);
        }
        assert!(!tx.is_finished());
    }

    /// Lossless in-process exchange between a sender and a receiver.
    fn transfer(variant: Variant, window_size: u32, input: &[u8]) -> Vec<u8> {
        let mut tx = Sender::new(
            SenderConfig {
                variant,
                window_size,
                ..SenderConfig::default()
            },
            Bytes::copy_from_slice(input),
        )
        .unwrap();
        let mut rx = Receiver::new(ReceiverConfig {
            variant,
            window_size,
            reorder: ReorderPolicy::Buffer,
        });

        let mut outbound = Outbox::new(0);
        tx.init(&mut outbound);
        let mut files = Vec::new();
        while !tx.is_finished() {
            let mut replies = Outbox::new(0);
            for datagram in &outbound.datagrams {
                rx.on_datagram(&mut replies, datagram);
            }
            files.append(&mut replies.files);
            assert!(!replies.datagrams.is_empty(), "stalled without ACKs");

            outbound = Outbox::new(0);
            for datagram in &replies.datagrams {
                tx.on_datagram(&mut outbound, datagram);
            }
        }
        assert_eq!(files.len(), 1);
        files.remove(0).data
    }

    #[test]
    fn lossless_transfer_reassembles_input() {
        let input: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
        for variant in [Variant::Baseline, Variant::Optimized] {
            for window in [1, 3, 16] {
                assert_eq!(transfer(variant, window, &input), input, "{variant:?} w={window}");
            }
        }
    }
}
