use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wtp_abstract::{
    ProtocolOverride, ReorderPolicy, ScenarioInput, SimConfigOverride, TestAssertion,
    TestScenario, Variant,
};
use wtp_simulator::{SimulationReport, load_scenario, run_scenario};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a WTP transfer over a simulated lossy channel")]
struct Args {
    /// Load a scenario from disk.
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Write a JSON trace of the finished simulation.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    #[arg(long)]
    variant: Option<Variant>,
    #[arg(long)]
    window_size: Option<u32>,
    #[arg(long)]
    reorder: Option<ReorderPolicy>,
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    loss_rate: Option<f64>,
    #[arg(long)]
    corrupt_rate: Option<f64>,
    #[arg(long)]
    duplicate_rate: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,

    /// Generated input size when no scenario is given.
    #[arg(long, default_value_t = 10_000)]
    input_len: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    info!("wtp-sim starting…");

    let scenario = match &args.scenario {
        Some(path) => load_scenario(path)?,
        None => default_scenario(args.input_len),
    };
    let scenario = args.apply_overrides(scenario);
    let report = run_scenario(&scenario)?;

    info!(
        duration_ms = report.duration_ms,
        files = report.delivered_files.len(),
        sender_datagrams = report.sender_datagram_count,
        receiver_datagrams = report.receiver_datagram_count,
        "simulation complete"
    );

    if let Some(trace_path) = &args.trace_out {
        write_trace(trace_path, &report)?;
    }

    Ok(())
}

impl Args {
    fn apply_overrides(&self, mut scenario: TestScenario) -> TestScenario {
        let protocol = &mut scenario.protocol;
        protocol.variant = self.variant.or(protocol.variant);
        protocol.window_size = self.window_size.or(protocol.window_size);
        protocol.reorder = self.reorder.or(protocol.reorder);
        protocol.timeout_ms = self.timeout_ms.or(protocol.timeout_ms);

        let config = &mut scenario.config;
        config.loss_rate = self.loss_rate.or(config.loss_rate);
        config.corrupt_rate = self.corrupt_rate.or(config.corrupt_rate);
        config.duplicate_rate = self.duplicate_rate.or(config.duplicate_rate);
        config.seed = self.seed.or(config.seed);
        scenario
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn default_scenario(input_len: usize) -> TestScenario {
    TestScenario {
        name: "default".to_string(),
        description: "Generated input over a channel with 10% loss".to_string(),
        protocol: ProtocolOverride::default(),
        config: SimConfigOverride {
            loss_rate: Some(0.1),
            seed: Some(42),
            ..Default::default()
        },
        input: ScenarioInput::Generated { len: input_len },
        actions: Vec::new(),
        assertions: vec![
            TestAssertion::FileDelivered { index: 0 },
            TestAssertion::SenderFinished,
        ],
    }
}

fn write_trace(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
