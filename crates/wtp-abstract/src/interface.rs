use bytes::Bytes;
use serde::Serialize;

use crate::packet::{PacketHeader, PacketType};

/// The capabilities a driver (UDP runtime or simulator) lends to an endpoint
/// for the duration of one callback.
pub trait SystemContext {
    /// Hand one datagram to the unreliable channel, addressed to the peer.
    fn send_datagram(&mut self, datagram: Bytes);

    /// Append a packet to the audit record (`type seqNum length checksum`).
    fn audit(&mut self, header: &PacketHeader);

    /// Hand a completed transfer to storage.
    fn deliver_file(&mut self, index: u32, data: Vec<u8>);

    /// Free-form narration for the driver's log output.
    fn log(&mut self, message: &str);

    /// Milliseconds since the driver started.
    fn now(&self) -> u64;
}

/// A protocol state machine. Drivers call `init` once, then alternate between
/// waiting for one datagram and calling `on_datagram`, or `on_timeout` when the
/// wait bound by [`Endpoint::wait_timeout`] passes first.
pub trait Endpoint {
    fn init(&mut self, _ctx: &mut dyn SystemContext) {}

    fn on_datagram(&mut self, ctx: &mut dyn SystemContext, datagram: &[u8]);

    fn on_timeout(&mut self, _ctx: &mut dyn SystemContext) {}

    /// Longest the driver may block for the next datagram; `None` blocks forever.
    fn wait_timeout(&self) -> Option<u64> {
        None
    }

    /// Once true the driver stops calling into the endpoint.
    fn is_finished(&self) -> bool {
        false
    }
}

/// A transfer handed to storage at END.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredFile {
    pub index: u32,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl DeliveredFile {
    /// Name of the artifact in the output directory.
    pub fn file_name(&self) -> String {
        file_name(self.index)
    }
}

pub fn file_name(index: u32) -> String {
    format!("FILE-{index}.out")
}

/// Effects buffered during one endpoint callback; the driver applies them
/// once the callback returns.
#[derive(Debug, Default)]
pub struct Outbox {
    pub now: u64,
    pub datagrams: Vec<Bytes>,
    pub audits: Vec<PacketHeader>,
    pub logs: Vec<String>,
    pub files: Vec<DeliveredFile>,
}

impl Outbox {
    pub fn new(now: u64) -> Self {
        Self {
            now,
            ..Default::default()
        }
    }

    /// Headers of the header datagrams sent, skipping payload datagrams.
    pub fn sent_headers(&self) -> Vec<PacketHeader> {
        let mut headers = Vec::new();
        let mut payload_due = 0usize;
        for datagram in &self.datagrams {
            if payload_due > 0 && datagram.len() == payload_due {
                payload_due = 0;
                continue;
            }
            if let Ok((header, rest)) = PacketHeader::decode(datagram) {
                if header.packet_type == PacketType::Data && rest.is_empty() {
                    payload_due = header.payload_len();
                }
                headers.push(header);
            }
        }
        headers
    }
}

impl SystemContext for Outbox {
    fn send_datagram(&mut self, datagram: Bytes) {
        self.datagrams.push(datagram);
    }

    fn audit(&mut self, header: &PacketHeader) {
        self.audits.push(*header);
    }

    fn deliver_file(&mut self, index: u32, data: Vec<u8>) {
        self.files.push(DeliveredFile { index, data });
    }

    fn log(&mut self, message: &str) {
        self.logs.push(message.to_string());
    }

    fn now(&self) -> u64 {
        self.now
    }
}
