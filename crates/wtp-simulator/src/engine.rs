use crate::trace::{FileSummary, SimulationReport};
use bytes::Bytes;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::{debug, info};
use wtp_abstract::{DeliveredFile, Endpoint, Outbox, PacketHeader, PacketType, SimConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeId {
    Sender,
    Receiver,
}

impl NodeId {
    pub fn peer(&self) -> Self {
        match self {
            NodeId::Sender => NodeId::Receiver,
            NodeId::Receiver => NodeId::Sender,
        }
    }

    fn index(self) -> usize {
        match self {
            NodeId::Sender => 0,
            NodeId::Receiver => 1,
        }
    }
}

#[derive(Debug)]
pub enum EventType {
    DatagramArrival { to: NodeId, datagram: Bytes },
    /// The node's bounded wait for a datagram ran out.
    WaitExpiry { node: NodeId, generation: u64 },
}

#[derive(Debug)]
struct Event {
    time: u64,
    event_type: EventType,
    id: u64,
}

// Min-heap on (time, id).
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// A compact textual summary of one link-layer event.
#[derive(Debug, Clone, Serialize)]
pub struct LinkEventSummary {
    pub time: u64,
    pub description: String,
}

/// One-shot deterministic faults, each consumed by the first datagram it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedDrop {
    /// Sender header of this type and seq; a DATA header takes its payload with it.
    SenderPacket(PacketType, u32),
    SenderPayload(u32),
    ReceiverAck(u32),
}

/// What a datagram carries, as far as the channel can tell.
#[derive(Debug, Clone, Copy)]
enum Frame {
    Header(PacketHeader),
    Payload(PacketHeader),
    Opaque,
}

impl Frame {
    fn describe(&self) -> String {
        match self {
            Frame::Header(h) => format!("type={} seq={}", h.packet_type.as_u32(), h.seq_num),
            Frame::Payload(h) => format!("payload seq={} len={}", h.seq_num, h.length),
            Frame::Opaque => "opaque".to_string(),
        }
    }
}

/// Label each datagram of one callback's output. A DATA header without an
/// inline payload claims the next datagram of exactly `length` bytes.
fn classify(datagrams: &[Bytes]) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(datagrams.len());
    let mut awaiting: Option<PacketHeader> = None;
    for datagram in datagrams {
        if let Some(header) = awaiting.take()
            && datagram.len() == header.payload_len()
        {
            frames.push(Frame::Payload(header));
            continue;
        }
        match PacketHeader::decode(datagram) {
            Ok((header, rest)) => {
                if header.packet_type == PacketType::Data && rest.is_empty() && header.length > 0 {
                    awaiting = Some(header);
                }
                frames.push(Frame::Header(header));
            }
            Err(_) => frames.push(Frame::Opaque),
        }
    }
    frames
}

pub struct Simulator {
    time: u64,
    event_queue: BinaryHeap<Event>,
    event_id_counter: u64,

    config: SimConfig,
    rng: rand::rngs::StdRng,

    pub sender: Box<dyn Endpoint>,
    pub receiver: Box<dyn Endpoint>,

    pub delivered_files: Vec<DeliveredFile>,
    pub sender_datagram_count: u32,
    pub receiver_datagram_count: u32,
    /// Rendered audit lines, indexed by [`NodeId`].
    audits: [Vec<String>; 2],

    planned_drops: Vec<PlannedDrop>,

    pub link_events: Vec<LinkEventSummary>,

    /// Bumped on every callback so a wait that was interrupted never fires.
    wait_generations: [u64; 2],
}

impl Simulator {
    pub fn new(config: SimConfig, sender: Box<dyn Endpoint>, receiver: Box<dyn Endpoint>) -> Self {
        let rng = rand::rngs::StdRng::seed_from_u64(config.seed);

        Self {
            time: 0,
            event_queue: BinaryHeap::new(),
            event_id_counter: 0,
            config,
            rng,
            sender,
            receiver,
            delivered_files: Vec::new(),
            sender_datagram_count: 0,
            receiver_datagram_count: 0,
            audits: [Vec::new(), Vec::new()],
            planned_drops: Vec::new(),
            link_events: Vec::new(),
            wait_generations: [0, 0],
        }
    }

    pub fn add_planned_drop(&mut self, drop: PlannedDrop) {
        self.planned_drops.push(drop);
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn current_time(&self) -> u64 {
        self.time
    }

    pub fn remaining_events(&self) -> usize {
        self.event_queue.len()
    }

    pub fn sender_finished(&self) -> bool {
        self.sender.is_finished()
    }

    pub fn audit_lines(&self, node: NodeId) -> &[String] {
        &self.audits[node.index()]
    }

    fn push_event(&mut self, time: u64, event_type: EventType) {
        self.event_queue.push(Event {
            time,
            event_type,
            id: self.event_id_counter,
        });
        self.event_id_counter += 1;
    }

    fn record(&mut self, description: String) {
        self.link_events.push(LinkEventSummary {
            time: self.time,
            description,
        });
    }

    fn endpoint(&mut self, node: NodeId) -> &mut dyn Endpoint {
        match node {
            NodeId::Sender => self.sender.as_mut(),
            NodeId::Receiver => self.receiver.as_mut(),
        }
    }

    pub fn init(&mut self) {
        for node in [NodeId::Sender, NodeId::Receiver] {
            let mut outbox = Outbox::new(self.time);
            self.endpoint(node).init(&mut outbox);
            self.process_actions(node, outbox);
        }
    }

    /// Process the next event. Returns false once the queue is empty.
    pub fn step(&mut self) -> bool {
        let event = match self.event_queue.pop() {
            Some(e) => e,
            None => return false,
        };

        self.time = event.time;

        match event.event_type {
            EventType::DatagramArrival { to, datagram } => {
                if self.endpoint(to).is_finished() {
                    debug!("[{:?}] finished, discarding {} byte datagram", to, datagram.len());
                    return true;
                }
                let mut outbox = Outbox::new(self.time);
                self.endpoint(to).on_datagram(&mut outbox, &datagram);
                self.process_actions(to, outbox);
            }
            EventType::WaitExpiry { node, generation } => {
                if self.wait_generations[node.index()] != generation {
                    return true;
                }
                debug!("[{:?}] wait expired at {}", node, self.time);
                let mut outbox = Outbox::new(self.time);
                self.endpoint(node).on_timeout(&mut outbox);
                self.process_actions(node, outbox);
            }
        }
        true
    }

    /// Step until the queue drains or the clock passes `deadline`. Returns
    /// true if the queue drained.
    pub fn run_until(&mut self, deadline: u64) -> bool {
        while let Some(next) = self.event_queue.peek() {
            if next.time > deadline {
                return false;
            }
            self.step();
        }
        true
    }

    pub fn export_report(&self) -> SimulationReport {
        SimulationReport {
            config: self.config.clone(),
            duration_ms: self.time,
            sender_finished: self.sender.is_finished(),
            delivered_files: self
                .delivered_files
                .iter()
                .map(|f| FileSummary {
                    index: f.index,
                    name: f.file_name(),
                    bytes: f.data.len(),
                })
                .collect(),
            sender_datagram_count: self.sender_datagram_count,
            receiver_datagram_count: self.receiver_datagram_count,
            sender_audit: self.audits[NodeId::Sender.index()].clone(),
            receiver_audit: self.audits[NodeId::Receiver.index()].clone(),
            link_events: self.link_events.clone(),
        }
    }

    /// Take a planned drop matching this frame, if any.
    fn take_planned_drop(&mut self, source: NodeId, frame: &Frame) -> Option<PlannedDrop> {
        let pos = self.planned_drops.iter().position(|drop| match (source, drop, frame) {
            (NodeId::Sender, PlannedDrop::SenderPacket(ty, seq), Frame::Header(h)) => {
                h.packet_type == *ty && h.seq_num == *seq
            }
            (NodeId::Sender, PlannedDrop::SenderPayload(seq), Frame::Payload(h)) => {
                h.seq_num == *seq
            }
            (NodeId::Receiver, PlannedDrop::ReceiverAck(seq), Frame::Header(h)) => {
                h.is_ack() && h.seq_num == *seq
            }
            _ => false,
        })?;
        Some(self.planned_drops.remove(pos))
    }

    fn process_actions(&mut self, source_node: NodeId, outbox: Outbox) {
        for log in &outbox.logs {
            info!("[{:?}] {}", source_node, log);
        }

        for header in &outbox.audits {
            self.audits[source_node.index()].push(header.to_string());
        }

        for file in outbox.files {
            info!(
                "[{:?}] DELIVERED {}: {} bytes",
                source_node,
                file.file_name(),
                file.data.len()
            );
            self.record(format!(
                "[{:?}] DELIVERED {} ({} bytes)",
                source_node,
                file.file_name(),
                file.data.len()
            ));
            self.delivered_files.push(file);
        }

        let frames = classify(&outbox.datagrams);
        // Set when a planned drop took a DATA header; its payload goes too.
        let mut drop_payload_of: Option<u32> = None;

        for (datagram, frame) in outbox.datagrams.into_iter().zip(frames) {
            match source_node {
                NodeId::Sender => self.sender_datagram_count += 1,
                NodeId::Receiver => self.receiver_datagram_count += 1,
            }
            let target_node = source_node.peer();
            let label = frame.describe();

            if let Frame::Payload(h) = frame
                && drop_payload_of.take() == Some(h.seq_num)
            {
                self.record(format!(
                    "[{:?}->{:?}] DROP (deterministic, with header) {}",
                    source_node, target_node, label
                ));
                continue;
            }

            if let Some(drop) = self.take_planned_drop(source_node, &frame) {
                if let (PlannedDrop::SenderPacket(PacketType::Data, seq), Frame::Header(h)) =
                    (drop, frame)
                    && h.length > 0
                {
                    drop_payload_of = Some(seq);
                }
                debug!("Deterministically dropping {:?}", drop);
                self.record(format!(
                    "[{:?}->{:?}] DROP (deterministic) {}",
                    source_node, target_node, label
                ));
                continue;
            }

            // 1. Loss
            if self.rng.random::<f64>() < self.config.loss_rate {
                self.record(format!(
                    "[{:?}->{:?}] DROP (random loss) {}",
                    source_node, target_node, label
                ));
                continue;
            }

            // 2. Corruption: flip one bit anywhere in the datagram.
            let datagram = if !datagram.is_empty()
                && self.rng.random::<f64>() < self.config.corrupt_rate
            {
                let mut bytes = datagram.to_vec();
                let bit = self.rng.random_range(0..bytes.len() * 8);
                bytes[bit / 8] ^= 1 << (bit % 8);
                self.record(format!(
                    "[{:?}->{:?}] CORRUPT bit {} {}",
                    source_node, target_node, bit, label
                ));
                Bytes::from(bytes)
            } else {
                datagram
            };

            // 3. Duplication
            let copies = if self.rng.random::<f64>() < self.config.duplicate_rate {
                self.record(format!(
                    "[{:?}->{:?}] DUPLICATE {}",
                    source_node, target_node, label
                ));
                2
            } else {
                1
            };

            // 4. Latency, drawn per copy so copies can overtake each other.
            for _ in 0..copies {
                let latency = self.latency();
                self.record(format!(
                    "[{:?}->{:?}] SEND {} (latency={}ms)",
                    source_node, target_node, label, latency
                ));
                self.push_event(
                    self.time + latency,
                    EventType::DatagramArrival {
                        to: target_node,
                        datagram: datagram.clone(),
                    },
                );
            }
        }

        self.rearm_wait(source_node);
    }

    fn latency(&mut self) -> u64 {
        let min = self.config.min_latency;
        let max = self.config.max_latency.max(min);
        self.rng.random_range(min..=max)
    }

    fn rearm_wait(&mut self, node: NodeId) {
        let generation = {
            let slot = &mut self.wait_generations[node.index()];
            *slot += 1;
            *slot
        };
        let endpoint = self.endpoint(node);
        if endpoint.is_finished() {
            return;
        }
        if let Some(ms) = endpoint.wait_timeout() {
            self.push_event(self.time + ms, EventType::WaitExpiry { node, generation });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wtp_abstract::{Packet, SystemContext};

    /// Sends one datagram on init and counts expiries until it has seen three.
    struct Ticker {
        timeouts: u32,
        received: u32,
    }

    impl Endpoint for Ticker {
        fn init(&mut self, ctx: &mut dyn SystemContext) {
            ctx.send_datagram(Packet::ack(1).header.encode());
        }

        fn on_datagram(&mut self, _ctx: &mut dyn SystemContext, _datagram: &[u8]) {
            self.received += 1;
        }

        fn on_timeout(&mut self, _ctx: &mut dyn SystemContext) {
            self.timeouts += 1;
        }

        fn wait_timeout(&self) -> Option<u64> {
            Some(1_000)
        }

        fn is_finished(&self) -> bool {
            self.timeouts >= 3
        }
    }

    struct Sink;

    impl Endpoint for Sink {
        fn on_datagram(&mut self, ctx: &mut dyn SystemContext, datagram: &[u8]) {
            ctx.send_datagram(Bytes::copy_from_slice(datagram));
        }
    }

    #[test]
    fn arrivals_cancel_pending_waits() {
        let config = SimConfig {
            min_latency: 10,
            max_latency: 10,
            ..SimConfig::default()
        };
        let mut sim = Simulator::new(
            config,
            Box::new(Ticker {
                timeouts: 0,
                received: 0,
            }),
            Box::new(Sink),
        );
        sim.init();
        assert!(sim.run_until(10_000));

        // Echo lands at 20 ms, so waits expire at 1020, 2020 and 3020.
        assert_eq!(sim.current_time(), 3_020);
        assert!(sim.sender_finished());
        assert_eq!(sim.sender_datagram_count, 1);
        assert_eq!(sim.receiver_datagram_count, 1);
    }

    #[test]
    fn classify_pairs_headers_with_payloads() {
        let data = Packet::data(3, Bytes::from_static(b"0123456789abcdefXYZ"));
        let mut datagrams = data.datagrams();
        datagrams.push(Packet::ack(9).header.encode());
        let frames = classify(&datagrams);
        assert!(matches!(frames[0], Frame::Header(h) if h.seq_num == 3));
        assert!(matches!(frames[1], Frame::Payload(h) if h.seq_num == 3));
        assert!(matches!(frames[2], Frame::Header(h) if h.is_ack()));
    }

    #[test]
    fn planned_drop_takes_header_and_payload() {
        let config = SimConfig {
            min_latency: 5,
            max_latency: 5,
            ..SimConfig::default()
        };
        struct Burst;
        impl Endpoint for Burst {
            fn init(&mut self, ctx: &mut dyn SystemContext) {
                for seq in 0..2 {
                    for d in Packet::data(seq, Bytes::from_static(b"abc")).datagrams() {
                        ctx.send_datagram(d);
                    }
                }
            }
            fn on_datagram(&mut self, _ctx: &mut dyn SystemContext, _datagram: &[u8]) {}
        }
        struct Count(std::rc::Rc<std::cell::Cell<u32>>);
        impl Endpoint for Count {
            fn on_datagram(&mut self, _ctx: &mut dyn SystemContext, _datagram: &[u8]) {
                self.0.set(self.0.get() + 1);
            }
        }

        let seen = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut sim = Simulator::new(config, Box::new(Burst), Box::new(Count(seen.clone())));
        sim.add_planned_drop(PlannedDrop::SenderPacket(PacketType::Data, 0));
        sim.init();
        assert!(sim.run_until(1_000));
        assert_eq!(seen.get(), 2);
        assert_eq!(sim.sender_datagram_count, 4);
    }
}
