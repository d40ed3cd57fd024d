use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::packet::{DEFAULT_MAX_DATAGRAM, HEADER_SIZE};

pub const DEFAULT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_WINDOW_SIZE: u32 = 10;
pub const DEFAULT_END_RETRY_LIMIT: u32 = 8;

/// Which of the two protocol flavours an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Go-Back-N: cumulative ACKs, burst retransmit of the whole window.
    #[default]
    Baseline,
    /// Selective ACKs, per-packet retransmission timers.
    Optimized,
}

impl FromStr for Variant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" | "gbn" => Ok(Variant::Baseline),
            "optimized" | "opt" => Ok(Variant::Optimized),
            other => Err(ConfigError::UnknownValue {
                kind: "variant",
                value: other.to_string(),
            }),
        }
    }
}

/// What the optimized receiver does with an in-window packet that arrives
/// ahead of the window base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReorderPolicy {
    /// Hold it until the gap before it fills, then append. Already-delivered
    /// packets below the window are re-acknowledged.
    #[default]
    Buffer,
    /// ACK it but throw the payload away; below-window packets get no ACK.
    /// The output is only complete if nothing arrives out of order.
    Discard,
}

impl FromStr for ReorderPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buffer" => Ok(ReorderPolicy::Buffer),
            "discard" => Ok(ReorderPolicy::Discard),
            other => Err(ConfigError::UnknownValue {
                kind: "reorder policy",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderConfig {
    pub variant: Variant,
    pub window_size: u32,
    /// Fixed wait for one inbound datagram, and the optimized per-packet timer.
    pub timeout_ms: u64,
    /// Largest datagram on the wire, header included.
    pub max_datagram: usize,
    /// Consecutive timeouts with only END outstanding before the sender gives
    /// up waiting for its ACK. `None` waits forever.
    pub end_retry_limit: Option<u32>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            variant: Variant::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_datagram: DEFAULT_MAX_DATAGRAM,
            end_retry_limit: Some(DEFAULT_END_RETRY_LIMIT),
        }
    }
}

impl SenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.max_datagram <= HEADER_SIZE {
            return Err(ConfigError::DatagramTooSmall(self.max_datagram));
        }
        Ok(())
    }

    /// Payload bytes that fit in one DATA datagram.
    pub fn payload_capacity(&self) -> usize {
        self.max_datagram.saturating_sub(HEADER_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverConfig {
    pub variant: Variant,
    /// Only the optimized receiver uses the window.
    pub window_size: u32,
    pub reorder: ReorderPolicy,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            variant: Variant::default(),
            window_size: DEFAULT_WINDOW_SIZE,
            reorder: ReorderPolicy::default(),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(())
    }
}

/// Fault model of the simulated channel. Probabilities are in `[0.0, 1.0]`,
/// latencies in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub loss_rate: f64,
    pub corrupt_rate: f64,
    pub duplicate_rate: f64,
    pub min_latency: u64,
    pub max_latency: u64,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            duplicate_rate: 0.0,
            min_latency: 10,
            max_latency: 100,
            seed: 0,
        }
    }
}
