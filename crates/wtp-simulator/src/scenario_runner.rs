use anyhow::{Context, anyhow, bail};
use rand::SeedableRng;
use std::fs;
use std::path::Path;
use tracing::info;
use wtp_abstract::{
    ControlId, ReceiverConfig, SenderConfig, SimConfig, TestAction, TestAssertion, TestScenario,
};
use wtp_core::{Receiver, Sender};

use crate::engine::{PlannedDrop, Simulator};
use crate::trace::SimulationReport;

/// Virtual time budget when a scenario sets no `max_duration`.
pub const DEFAULT_MAX_DURATION_MS: u64 = 60_000;

pub fn load_scenario(path: &Path) -> anyhow::Result<TestScenario> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse scenario {}", path.display()))
}

/// Build the simulator for `scenario` with both endpoints and all planned
/// faults in place, not yet initialised.
pub fn build_simulator(
    scenario: &TestScenario,
    sender_config: SenderConfig,
    receiver_config: ReceiverConfig,
    sim_config: SimConfig,
) -> anyhow::Result<Simulator> {
    sender_config
        .validate()
        .context("Invalid sender configuration")?;
    receiver_config
        .validate()
        .context("Invalid receiver configuration")?;

    let input = scenario.input.bytes();
    let sender = match scenario.protocol.control_id {
        Some(id) => Sender::with_control_id(sender_config, input, ControlId::new(id)),
        None => {
            let mut rng = rand::rngs::StdRng::seed_from_u64(sim_config.seed);
            Sender::with_rng(sender_config, input, &mut rng)
        }
    }
    .context("Failed to build sender")?;
    let receiver = Receiver::new(receiver_config);

    let mut sim = Simulator::new(sim_config, Box::new(sender), Box::new(receiver));
    for action in &scenario.actions {
        sim.add_planned_drop(match *action {
            TestAction::DropSenderPacket { packet_type, seq } => {
                PlannedDrop::SenderPacket(packet_type, seq)
            }
            TestAction::DropSenderPayload { seq } => PlannedDrop::SenderPayload(seq),
            TestAction::DropReceiverAck { seq } => PlannedDrop::ReceiverAck(seq),
        });
    }
    Ok(sim)
}

fn max_duration(scenario: &TestScenario) -> u64 {
    scenario
        .assertions
        .iter()
        .find_map(|a| {
            if let TestAssertion::MaxDuration { ms } = a {
                Some(*ms)
            } else {
                None
            }
        })
        .unwrap_or(DEFAULT_MAX_DURATION_MS)
}

/// Run a built simulator to completion and check the scenario's assertions.
pub fn run_simulation(
    scenario: &TestScenario,
    sim: &mut Simulator,
) -> anyhow::Result<SimulationReport> {
    let max_duration = max_duration(scenario);
    sim.init();
    if !sim.run_until(max_duration) {
        bail!("Test timed out after {} ms", max_duration);
    }
    check_assertions(scenario, sim)?;
    Ok(sim.export_report())
}

/// Run `scenario` with its own protocol and channel settings.
pub fn run_scenario(scenario: &TestScenario) -> anyhow::Result<SimulationReport> {
    info!("Running Scenario: {}", scenario.name);
    info!("Description: {}", scenario.description);

    let mut sim_config = SimConfig::default();
    scenario.config.apply_to(&mut sim_config);
    let mut sim = build_simulator(
        scenario,
        scenario.protocol.sender_config(),
        scenario.protocol.receiver_config(),
        sim_config,
    )?;
    let report = run_simulation(scenario, &mut sim)?;
    info!("Test Scenario Passed!");
    Ok(report)
}

pub fn check_assertions(scenario: &TestScenario, sim: &Simulator) -> anyhow::Result<()> {
    let input = scenario.input.bytes();
    for assertion in &scenario.assertions {
        match assertion {
            TestAssertion::FileDelivered { index } => {
                let file = sim
                    .delivered_files
                    .iter()
                    .find(|f| f.index == *index)
                    .ok_or_else(|| anyhow!("Assertion Failed: FILE-{index}.out was not written"))?;
                if file.data != input {
                    return Err(anyhow!(
                        "Assertion Failed: {} has {} bytes, differs from the {} byte input",
                        file.file_name(),
                        file.data.len(),
                        input.len()
                    ));
                }
            }
            TestAssertion::FileCount { count } => {
                if sim.delivered_files.len() != *count {
                    return Err(anyhow!(
                        "Assertion Failed: {} files written, expected {}",
                        sim.delivered_files.len(),
                        count
                    ));
                }
            }
            TestAssertion::SenderDatagramCount { min, max } => {
                let sent = sim.sender_datagram_count;
                if sent < *min {
                    return Err(anyhow!(
                        "Assertion Failed: Sender sent {} datagrams, expected min {}",
                        sent,
                        min
                    ));
                }
                if let Some(max) = max
                    && sent > *max
                {
                    return Err(anyhow!(
                        "Assertion Failed: Sender sent {} datagrams, expected max {}",
                        sent,
                        max
                    ));
                }
            }
            TestAssertion::SenderFinished => {
                if !sim.sender_finished() {
                    return Err(anyhow!("Assertion Failed: Sender never finished"));
                }
            }
            TestAssertion::MaxDuration { .. } => {}
        }
    }
    Ok(())
}
