//! Command-line front ends for the sender and receiver.

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::UdpSocket;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wtp_abstract::config::{DEFAULT_END_RETRY_LIMIT, DEFAULT_TIMEOUT_MS, DEFAULT_WINDOW_SIZE};
use wtp_abstract::packet::DEFAULT_MAX_DATAGRAM;
use wtp_abstract::{ReceiverConfig, ReorderPolicy, SenderConfig, Variant};
use wtp_core::{AuditLog, OutputDir, Receiver, RunSummary, Sender};

/// Send one file to a waiting receiver.
#[derive(Parser, Debug)]
#[command(author, version, about, disable_help_flag = true)]
pub struct SenderArgs {
    /// Receiver host name or address.
    #[arg(short = 'h', long)]
    pub hostname: String,

    #[arg(short, long)]
    pub port: u16,

    #[arg(short = 'w', long = "window-size", default_value_t = DEFAULT_WINDOW_SIZE)]
    pub window_size: u32,

    /// File to send.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Packet audit log.
    #[arg(short = 'o', long = "log")]
    pub log: PathBuf,

    #[arg(long, default_value = "baseline")]
    pub variant: Variant,

    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    pub timeout_ms: u64,

    /// Largest datagram on the wire, header included.
    #[arg(long, default_value_t = DEFAULT_MAX_DATAGRAM)]
    pub max_datagram: usize,

    /// Timeouts to wait for the END acknowledgment once all DATA is through;
    /// 0 waits forever.
    #[arg(long, default_value_t = DEFAULT_END_RETRY_LIMIT)]
    pub end_retry_limit: u32,

    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

impl SenderArgs {
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            variant: self.variant,
            window_size: self.window_size,
            timeout_ms: self.timeout_ms,
            max_datagram: self.max_datagram,
            end_retry_limit: (self.end_retry_limit > 0).then_some(self.end_retry_limit),
        }
    }
}

/// Receive files and store each as `FILE-<n>.out`.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct ReceiverArgs {
    #[arg(short, long)]
    pub port: u16,

    #[arg(short = 'w', long = "window-size", default_value_t = DEFAULT_WINDOW_SIZE)]
    pub window_size: u32,

    /// Output directory, created if missing.
    #[arg(short = 'd', long = "output-dir")]
    pub output_dir: PathBuf,

    /// Packet audit log.
    #[arg(short = 'o', long = "log")]
    pub log: PathBuf,

    #[arg(long, default_value = "baseline")]
    pub variant: Variant,

    /// Handling of out-of-order DATA in the optimized variant.
    #[arg(long, default_value = "buffer")]
    pub reorder: ReorderPolicy,

    /// Exit after storing this many files.
    #[arg(long)]
    pub max_files: Option<usize>,
}

impl ReceiverArgs {
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            variant: self.variant,
            window_size: self.window_size,
            reorder: self.reorder,
        }
    }
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("No address found for {host}:{port}"))
}

pub async fn run_sender(args: &SenderArgs) -> Result<RunSummary> {
    let config = args.sender_config();
    if let Err(err) = config.validate() {
        bail!("Invalid sender configuration: {err}");
    }

    let data = fs::read(&args.input)
        .with_context(|| format!("Failed to read input file {}", args.input.display()))?;
    let mut audit = AuditLog::create(&args.log)?;
    let peer = resolve(&args.hostname, args.port).await?;

    let local: SocketAddr = if peer.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(local)
        .await
        .context("Failed to bind sender socket")?;

    let mut sender = Sender::new(config, data).context("Failed to prepare transfer")?;
    info!(
        %peer,
        packets = sender.data_packets(),
        control_id = sender.control_id().get(),
        "sending {}",
        args.input.display()
    );
    wtp_core::run_sender(&socket, peer, &mut sender, &mut audit).await
}

pub async fn run_receiver(args: &ReceiverArgs) -> Result<RunSummary> {
    let config = args.receiver_config();
    if let Err(err) = config.validate() {
        bail!("Invalid receiver configuration: {err}");
    }

    let output = OutputDir::create(&args.output_dir)?;
    let mut audit = AuditLog::create(&args.log)?;
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], args.port)))
        .await
        .with_context(|| format!("Failed to bind receiver socket on port {}", args.port))?;

    info!(
        port = args.port,
        variant = ?config.variant,
        dir = %output.root().display(),
        "receiver listening"
    );
    let mut receiver = Receiver::new(config);
    wtp_core::run_receiver(&socket, &mut receiver, &mut audit, &output, args.max_files).await
}
