use serde::Serialize;
use wtp_abstract::SimConfig;

use crate::engine::LinkEventSummary;

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub index: u32,
    pub name: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub config: SimConfig,
    pub duration_ms: u64,
    pub sender_finished: bool,
    pub delivered_files: Vec<FileSummary>,
    pub sender_datagram_count: u32,
    pub receiver_datagram_count: u32,
    pub sender_audit: Vec<String>,
    pub receiver_audit: Vec<String>,
    pub link_events: Vec<LinkEventSummary>,
}
