use serde::Deserialize;

use crate::config::{ReceiverConfig, ReorderPolicy, SenderConfig, SimConfig, Variant};
use crate::packet::PacketType;

#[derive(Deserialize, Debug, Clone)]
pub struct TestScenario {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub protocol: ProtocolOverride,
    #[serde(default)]
    pub config: SimConfigOverride,
    pub input: ScenarioInput,
    #[serde(default)]
    pub actions: Vec<TestAction>,
    #[serde(default)]
    pub assertions: Vec<TestAssertion>,
}

/// Protocol settings shared by both ends of a simulated transfer.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ProtocolOverride {
    pub variant: Option<Variant>,
    pub window_size: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub max_datagram: Option<usize>,
    pub reorder: Option<ReorderPolicy>,
    pub end_retry_limit: Option<u32>,
    /// Fixes the START/END control id; otherwise the runner derives one from the seed.
    pub control_id: Option<u32>,
}

impl ProtocolOverride {
    pub fn sender_config(&self) -> SenderConfig {
        let mut config = SenderConfig::default();
        if let Some(v) = self.variant {
            config.variant = v;
        }
        if let Some(v) = self.window_size {
            config.window_size = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.max_datagram {
            config.max_datagram = v;
        }
        if let Some(v) = self.end_retry_limit {
            config.end_retry_limit = Some(v);
        }
        config
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        let mut config = ReceiverConfig::default();
        if let Some(v) = self.variant {
            config.variant = v;
        }
        if let Some(v) = self.window_size {
            config.window_size = v;
        }
        if let Some(v) = self.reorder {
            config.reorder = v;
        }
        config
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct SimConfigOverride {
    pub loss_rate: Option<f64>,
    pub corrupt_rate: Option<f64>,
    pub duplicate_rate: Option<f64>,
    pub min_latency: Option<u64>,
    pub max_latency: Option<u64>,
    pub seed: Option<u64>,
}

impl SimConfigOverride {
    pub fn apply_to(&self, config: &mut SimConfig) {
        if let Some(v) = self.loss_rate {
            config.loss_rate = v;
        }
        if let Some(v) = self.corrupt_rate {
            config.corrupt_rate = v;
        }
        if let Some(v) = self.duplicate_rate {
            config.duplicate_rate = v;
        }
        if let Some(v) = self.min_latency {
            config.min_latency = v;
        }
        if let Some(v) = self.max_latency {
            config.max_latency = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
    }
}

/// The file handed to the sender.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScenarioInput {
    Text { text: String },
    /// `len` bytes of a deterministic repeating pattern.
    Generated { len: usize },
}

impl ScenarioInput {
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            ScenarioInput::Text { text } => text.as_bytes().to_vec(),
            ScenarioInput::Generated { len } => generated_bytes(*len),
        }
    }
}

/// Deterministic filler; 251 is prime so chunk boundaries never line up with the pattern.
pub fn generated_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAction {
    /// Drop the first sender packet of this type and sequence number. For DATA
    /// both the header and the payload datagram are lost.
    DropSenderPacket { packet_type: PacketType, seq: u32 },
    /// Drop only the payload datagram of the first transmission of DATA `seq`.
    DropSenderPayload { seq: u32 },
    /// Drop the first ACK sent by the receiver with this sequence number.
    DropReceiverAck { seq: u32 },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TestAssertion {
    /// The artifact with this index equals the scenario input byte for byte.
    FileDelivered { index: u32 },
    /// Exactly this many artifacts were written.
    FileCount { count: usize },
    /// Number of datagrams emitted by the sender.
    SenderDatagramCount { min: u32, max: Option<u32> },
    /// The sender reached DONE.
    SenderFinished,
    /// Simulated time bound for the whole run.
    MaxDuration { ms: u64 },
}
