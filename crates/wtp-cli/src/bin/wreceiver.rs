use clap::Parser;
use tracing::info;
use wtp_cli::{ReceiverArgs, init_logging, run_receiver};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = ReceiverArgs::parse();
    init_logging();
    let summary = run_receiver(&args).await?;
    info!(files = summary.files.len(), "receiver exiting");
    Ok(())
}
