use thiserror::Error;

use crate::packet::HEADER_SIZE;

/// Reasons an inbound datagram cannot be turned into a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram of {len} bytes is shorter than the {header}-byte header", header = HEADER_SIZE)]
    Truncated { len: usize },

    #[error("unknown packet type {0}")]
    UnknownType(u32),

    #[error("header announces {expected} payload bytes but {actual} are available")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Invalid protocol settings, rejected before any datagram is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("window size must be at least 1")]
    ZeroWindow,

    #[error(
        "maximum datagram size {0} leaves no room for payload after the {header}-byte header",
        header = HEADER_SIZE
    )]
    DatagramTooSmall(usize),

    #[error("input needs {0} DATA packets, more than the 32-bit sequence space allows")]
    TooManyChunks(usize),

    #[error("control id {id} collides with the DATA acknowledgment range 0..={data_packets}")]
    ControlIdInDataRange { id: u32, data_packets: u32 },

    #[error("unknown {kind} '{value}'")]
    UnknownValue { kind: &'static str, value: String },
}
