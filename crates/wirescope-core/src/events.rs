//! Packet events flowing from input streams to stream handlers
//!
//! Input streams publish decoded packet summaries on a broadcast bus. A
//! handler subscribes either to its input stream's bus or, when chained,
//! to the output bus of its upstream handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default capacity of an event bus
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Transport protocol of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Other,
}

/// Direction relative to the capturing host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToHost,
    FromHost,
    Unknown,
}

/// Summary of a DNS message carried by a packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSummary {
    /// Query name
    pub qname: String,
    /// Query type (A, AAAA, ...)
    pub qtype: String,
    /// Whether this is a response
    pub is_response: bool,
    /// Response code, only meaningful for responses
    pub rcode: u8,
}

/// A decoded packet summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketEvent {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub direction: Direction,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
    /// Length on the wire, in bytes
    pub length: u32,
    pub dns: Option<DnsSummary>,
}

/// Sending side of an event bus. Cloning it is how a consumer gets attached.
pub type EventSender = broadcast::Sender<Arc<PacketEvent>>;

/// Receiving side of an event bus
pub type EventReceiver = broadcast::Receiver<Arc<PacketEvent>>;

/// Create a fresh event bus
pub fn event_bus() -> EventSender {
    let (tx, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
    tx
}
