//! UDP runtime: drives an [`Endpoint`] over a real socket.
//!
//! The only suspension point is the wait for the next datagram, bounded by
//! [`Endpoint::wait_timeout`] when the endpoint asks for one.

use anyhow::{Context, Result};
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use wtp_abstract::{Endpoint, Outbox};

use crate::audit::AuditLog;
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::storage::OutputDir;

const RECV_BUFFER: usize = 65_535;

/// Where outbound datagrams go.
#[derive(Debug, Clone, Copy)]
pub enum Peer {
    Fixed(SocketAddr),
    /// Reply to whoever sent the datagram being answered.
    ReplyToSource,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub timeouts: u64,
    pub files: Vec<PathBuf>,
    pub elapsed: Duration,
}

struct Driver<'a, W: Write> {
    role: &'static str,
    socket: &'a UdpSocket,
    peer: Peer,
    source: Option<SocketAddr>,
    audit: &'a mut AuditLog<W>,
    output: Option<&'a OutputDir>,
    clock: Instant,
    summary: RunSummary,
}

impl<W: Write> Driver<'_, W> {
    fn now(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    fn destination(&self) -> Option<SocketAddr> {
        match self.peer {
            Peer::Fixed(addr) => Some(addr),
            Peer::ReplyToSource => self.source,
        }
    }

    async fn apply(&mut self, outbox: Outbox) -> Result<()> {
        for message in &outbox.logs {
            info!(role = self.role, "{message}");
        }
        for header in &outbox.audits {
            self.audit
                .record(header)
                .context("Failed to append to audit log")?;
        }
        if !outbox.datagrams.is_empty() {
            match self.destination() {
                Some(dest) => {
                    for datagram in &outbox.datagrams {
                        self.socket
                            .send_to(datagram, dest)
                            .await
                            .with_context(|| format!("Failed to send datagram to {dest}"))?;
                        self.summary.datagrams_sent += 1;
                    }
                }
                None => debug!(
                    count = outbox.datagrams.len(),
                    "no peer known yet, dropping outbound datagrams"
                ),
            }
        }
        for file in outbox.files {
            match self.output {
                Some(dir) => {
                    let path = dir.write_file(file.index, &file.data)?;
                    self.summary.files.push(path);
                }
                None => warn!(index = file.index, "no output directory, transfer discarded"),
            }
        }
        Ok(())
    }

    async fn drive<E: Endpoint>(
        mut self,
        endpoint: &mut E,
        file_limit: Option<usize>,
    ) -> Result<RunSummary> {
        let mut outbox = Outbox::new(self.now());
        endpoint.init(&mut outbox);
        self.apply(outbox).await?;

        let mut buf = vec![0u8; RECV_BUFFER];
        while !endpoint.is_finished()
            && file_limit.is_none_or(|limit| self.summary.files.len() < limit)
        {
            let received = match endpoint.wait_timeout() {
                Some(ms) => {
                    timeout(Duration::from_millis(ms), self.socket.recv_from(&mut buf))
                        .await
                        .ok()
                }
                None => Some(self.socket.recv_from(&mut buf).await),
            };

            let mut outbox = Outbox::new(self.now());
            match received {
                Some(Ok((len, from))) => {
                    self.summary.datagrams_received += 1;
                    self.source = Some(from);
                    endpoint.on_datagram(&mut outbox, &buf[..len]);
                }
                Some(Err(err)) if err.kind() == ErrorKind::ConnectionReset => {
                    warn!(role = self.role, %err, "peer unreachable, still waiting");
                    continue;
                }
                Some(Err(err)) => {
                    return Err(err).context("Failed to receive datagram");
                }
                None => {
                    self.summary.timeouts += 1;
                    endpoint.on_timeout(&mut outbox);
                }
            }
            self.apply(outbox).await?;
        }

        self.summary.elapsed = self.clock.elapsed();
        Ok(self.summary)
    }
}

/// Run `sender` against the receiver at `peer` until it is done.
pub async fn run_sender<W: Write>(
    socket: &UdpSocket,
    peer: SocketAddr,
    sender: &mut Sender,
    audit: &mut AuditLog<W>,
) -> Result<RunSummary> {
    let driver = Driver {
        role: "sender",
        socket,
        peer: Peer::Fixed(peer),
        source: None,
        audit,
        output: None,
        clock: Instant::now(),
        summary: RunSummary::default(),
    };
    let summary = driver.drive(sender, None).await?;
    info!(
        sent = summary.datagrams_sent,
        received = summary.datagrams_received,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "sender finished"
    );
    Ok(summary)
}

/// Serve transfers, replying to each datagram's source. Returns after
/// `file_limit` files have been stored; with `None` it serves forever.
pub async fn run_receiver<W: Write>(
    socket: &UdpSocket,
    receiver: &mut Receiver,
    audit: &mut AuditLog<W>,
    output: &OutputDir,
    file_limit: Option<usize>,
) -> Result<RunSummary> {
    let driver = Driver {
        role: "receiver",
        socket,
        peer: Peer::ReplyToSource,
        source: None,
        audit,
        output: Some(output),
        clock: Instant::now(),
        summary: RunSummary::default(),
    };
    driver.drive(receiver, file_limit).await
}
