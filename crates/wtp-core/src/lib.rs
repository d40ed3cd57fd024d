pub mod audit;
pub mod deframe;
pub mod net;
pub mod receiver;
pub mod sender;
pub mod storage;

pub use audit::AuditLog;
pub use deframe::{Deframer, Step};
pub use net::{RunSummary, run_receiver, run_sender};
pub use receiver::{ConnectionState, Receiver};
pub use sender::{Phase, Sender, TrackedPacket, segment};
pub use storage::OutputDir;
