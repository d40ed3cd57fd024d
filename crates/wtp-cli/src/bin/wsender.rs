use clap::Parser;
use wtp_cli::{SenderArgs, init_logging, run_sender};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = SenderArgs::parse();
    init_logging();
    run_sender(&args).await?;
    Ok(())
}
