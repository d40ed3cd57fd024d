//! Receive side of both protocol variants.
//!
//! The receiver is `IDLE` until a START arrives, assembles DATA payloads while
//! `ACTIVE`, and hands the assembled bytes to storage when END arrives. Every
//! datagram is audited as soon as its header decodes; a packet that fails its
//! checksum is dropped without any acknowledgment.
//!
//! | variant   | DATA accepted when                        | ACK carries           |
//! |-----------|-------------------------------------------|-----------------------|
//! | baseline  | `seq == expected`                         | next expected seq     |
//! | optimized | `base <= seq < base + window`             | the packet's own seq  |

use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::debug;
use wtp_abstract::{
    Endpoint, Packet, PacketHeader, PacketType, ReceiverConfig, ReorderPolicy, SystemContext,
    Variant,
};

use crate::deframe::{Deframer, Step};

/// State of the one connection a receiver can hold at a time.
#[derive(Debug)]
pub struct ConnectionState {
    control_id: u32,
    /// `expectedSeq` for the baseline, `windowBase` for the optimized variant.
    next_seq: u32,
    assembly: Vec<u8>,
    /// In-window payloads that arrived ahead of `next_seq`.
    pending: BTreeMap<u32, Bytes>,
}

impl ConnectionState {
    fn new(control_id: u32) -> Self {
        Self {
            control_id,
            next_seq: 0,
            assembly: Vec::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn control_id(&self) -> u32 {
        self.control_id
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn assembled(&self) -> &[u8] {
        &self.assembly
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn append(&mut self, payload: &[u8]) {
        self.assembly.extend_from_slice(payload);
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    fn drain_contiguous(&mut self) {
        while let Some(payload) = self.pending.remove(&self.next_seq) {
            self.append(&payload);
        }
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    connection: Option<ConnectionState>,
    deframer: Deframer,
    files_written: u32,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        let deframer = Deframer::with_capacity(config.window_size as usize);
        Self {
            config,
            connection: None,
            deframer,
            files_written: 0,
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection(&self) -> Option<&ConnectionState> {
        self.connection.as_ref()
    }

    pub fn files_written(&self) -> u32 {
        self.files_written
    }

    fn on_packet(&mut self, ctx: &mut dyn SystemContext, packet: Packet) {
        let header = packet.header;
        if !packet.is_intact() {
            ctx.log(&format!(
                "checksum mismatch on type {} seq {}, dropping",
                header.packet_type.as_u32(),
                header.seq_num
            ));
            return;
        }

        match header.packet_type {
            PacketType::Start => self.on_start(ctx, header.seq_num),
            PacketType::Data => self.on_data(ctx, header.seq_num, packet.payload),
            PacketType::End => self.on_end(ctx, header.seq_num),
            PacketType::Ack => debug!(seq = header.seq_num, "ignoring ACK sent to receiver"),
        }
    }

    fn on_start(&mut self, ctx: &mut dyn SystemContext, control_id: u32) {
        if let Some(conn) = &self.connection {
            ctx.log(&format!(
                "START {control_id} while connection {} is active, ignoring",
                conn.control_id
            ));
            return;
        }
        ctx.log(&format!("connection {control_id} opened"));
        self.connection = Some(ConnectionState::new(control_id));
        send_ack(ctx, control_id);
    }

    fn on_data(&mut self, ctx: &mut dyn SystemContext, seq: u32, payload: Bytes) {
        let Some(conn) = self.connection.as_mut() else {
            debug!(seq, "DATA without an active connection, dropping");
            return;
        };

        match self.config.variant {
            Variant::Baseline => {
                if seq == conn.next_seq {
                    conn.append(&payload);
                } else {
                    debug!(seq, expected = conn.next_seq, "out-of-order DATA discarded");
                }
                send_ack(ctx, conn.next_seq);
            }
            Variant::Optimized => {
                let base = conn.next_seq;
                if seq < base {
                    match self.config.reorder {
                        ReorderPolicy::Buffer => {
                            debug!(seq, base, "re-acknowledging delivered DATA");
                            send_ack(ctx, seq);
                        }
                        ReorderPolicy::Discard => {
                            debug!(seq, base, "DATA below window, dropping");
                        }
                    }
                    return;
                }
                if u64::from(seq) >= u64::from(base) + u64::from(self.config.window_size) {
                    debug!(seq, base, "DATA beyond window, dropping");
                    return;
                }

                if seq == base {
                    conn.append(&payload);
                    if self.config.reorder == ReorderPolicy::Buffer {
                        conn.drain_contiguous();
                    }
                } else if self.config.reorder == ReorderPolicy::Buffer {
                    conn.pending.entry(seq).or_insert(payload);
                } else {
                    debug!(seq, base, "out-of-order DATA acknowledged without buffering");
                }
                send_ack(ctx, seq);
            }
        }
    }

    fn on_end(&mut self, ctx: &mut dyn SystemContext, control_id: u32) {
        let Some(conn) = self.connection.take() else {
            debug!(control_id, "END without an active connection, dropping");
            return;
        };
        send_ack(ctx, control_id);

        if conn.control_id != control_id {
            ctx.log(&format!(
                "END {control_id} closes connection opened by START {}",
                conn.control_id
            ));
        }
        if !conn.pending.is_empty() {
            ctx.log(&format!(
                "closing with {} out-of-order payloads never filled in",
                conn.pending.len()
            ));
        }
        ctx.log(&format!(
            "connection {} closed, {} bytes assembled",
            conn.control_id,
            conn.assembly.len()
        ));
        ctx.deliver_file(self.files_written, conn.assembly);
        self.files_written += 1;
    }
}

fn send_ack(ctx: &mut dyn SystemContext, seq: u32) {
    let header = PacketHeader::ack(seq);
    ctx.send_datagram(header.encode());
    ctx.audit(&header);
}

impl Endpoint for Receiver {
    fn init(&mut self, ctx: &mut dyn SystemContext) {
        ctx.log(&format!(
            "{:?} receiver ready (window {})",
            self.config.variant, self.config.window_size
        ));
    }

    fn on_datagram(&mut self, ctx: &mut dyn SystemContext, datagram: &[u8]) {
        match self.deframer.push(datagram) {
            Step::Header(header, packet) => {
                ctx.audit(&header);
                if let Some(packet) = packet {
                    self.on_packet(ctx, packet);
                }
            }
            Step::Payload(packet) => self.on_packet(ctx, packet),
            Step::Invalid(err) => debug!(%err, "dropping undecodable datagram"),
        }
    }
}
