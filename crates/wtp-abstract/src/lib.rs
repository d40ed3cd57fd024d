pub mod checksum;
pub mod config;
pub mod error;
pub mod interface;
pub mod packet;
pub mod scenario;

pub use checksum::checksum;
pub use config::{ReceiverConfig, ReorderPolicy, SenderConfig, SimConfig, Variant};
pub use error::{ConfigError, DecodeError};
pub use interface::{DeliveredFile, Endpoint, Outbox, SystemContext};
pub use packet::{ControlId, HEADER_SIZE, Packet, PacketHeader, PacketType};
pub use scenario::{
    ProtocolOverride, ScenarioInput, SimConfigOverride, TestAction, TestAssertion, TestScenario,
};
