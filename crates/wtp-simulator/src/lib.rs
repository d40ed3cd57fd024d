pub mod engine;
pub mod scenario_runner;
pub mod trace;

pub use engine::{LinkEventSummary, NodeId, PlannedDrop, Simulator};
pub use scenario_runner::{build_simulator, load_scenario, run_scenario, run_simulation};
pub use trace::{FileSummary, SimulationReport};
