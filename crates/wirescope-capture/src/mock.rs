//! Mock input stream
//!
//! Generates synthetic packet traffic for testing handlers, policies and the
//! control API without a capture device. Traffic is deterministic: the same
//! sequence of web, DNS query and DNS reply packets repeats every cycle.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use wirescope_core::{
    event_bus, BackgroundTask, CoreError, CoreResult, Direction, DnsSummary, EventSender,
    InputFactory, InputStream, Module, ModuleConfig, PacketEvent, Protocol,
};

use crate::filter::PacketFilter;

pub const INPUT_TYPE: &str = "mock";

const LOCAL_ADDR: &str = "192.168.1.100";
const RESOLVER_ADDR: &str = "8.8.8.8";

/// (qname, qtype, rcode) of the DNS exchanges generated each cycle
const DNS_EXCHANGES: &[(&str, &str, u8)] = &[
    ("www.google.com", "A", 0),
    ("mail.google.com", "AAAA", 0),
    ("slack.com", "A", 0),
    ("nonexistent.example.org", "A", 3),
];

/// Settings read from the mock input's configuration
#[derive(Debug, Clone)]
pub struct MockSettings {
    /// Interval between traffic cycles in milliseconds
    pub interval_ms: u64,

    /// Number of cycles to generate (0 = infinite)
    pub cycle_count: u64,

    /// Interface name reported in the stream info
    pub iface: String,

    /// Fail `start()` with a runtime error
    pub except_on_start: bool,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            cycle_count: 0,
            iface: "mock0".to_string(),
            except_on_start: false,
        }
    }
}

impl MockSettings {
    pub fn from_config(config: &ModuleConfig) -> CoreResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            interval_ms: config
                .try_get("interval_ms")?
                .unwrap_or(defaults.interval_ms),
            cycle_count: config
                .try_get("cycle_count")?
                .unwrap_or(defaults.cycle_count),
            iface: config.try_get("iface")?.unwrap_or(defaults.iface),
            except_on_start: config
                .try_get("except_on_start")?
                .unwrap_or(defaults.except_on_start),
        })
    }
}

/// The packets generated in traffic cycle `cycle`
pub fn generate_cycle(cycle: u64) -> Vec<PacketEvent> {
    let now = Utc::now();
    let port = 40000 + (cycle % 20000) as u16;
    let (qname, qtype, rcode) = DNS_EXCHANGES[(cycle % DNS_EXCHANGES.len() as u64) as usize];

    let dns = |is_response: bool| DnsSummary {
        qname: qname.to_string(),
        qtype: qtype.to_string(),
        is_response,
        rcode: if is_response { rcode } else { 0 },
    };

    vec![
        PacketEvent {
            timestamp: now,
            protocol: Protocol::Udp,
            direction: Direction::FromHost,
            src_addr: LOCAL_ADDR.to_string(),
            src_port: port,
            dst_addr: RESOLVER_ADDR.to_string(),
            dst_port: 53,
            length: 60 + qname.len() as u32,
            dns: Some(dns(false)),
        },
        PacketEvent {
            timestamp: now,
            protocol: Protocol::Udp,
            direction: Direction::ToHost,
            src_addr: RESOLVER_ADDR.to_string(),
            src_port: 53,
            dst_addr: LOCAL_ADDR.to_string(),
            dst_port: port,
            length: 76 + qname.len() as u32,
            dns: Some(dns(true)),
        },
        PacketEvent {
            timestamp: now,
            protocol: Protocol::Tcp,
            direction: Direction::FromHost,
            src_addr: LOCAL_ADDR.to_string(),
            src_port: port,
            dst_addr: "104.18.7.192".to_string(),
            dst_port: 443,
            length: 517,
            dns: None,
        },
        PacketEvent {
            timestamp: now,
            protocol: Protocol::Tcp,
            direction: Direction::ToHost,
            src_addr: "104.18.7.192".to_string(),
            src_port: 443,
            dst_addr: LOCAL_ADDR.to_string(),
            dst_port: port,
            length: 1460,
            dns: None,
        },
    ]
}

/// Synthetic traffic input stream
pub struct MockInputStream {
    name: String,
    config: ModuleConfig,
    settings: MockSettings,
    filter: PacketFilter,
    events: EventSender,
    packets: Arc<AtomicU64>,
    task: Option<BackgroundTask>,
}

impl MockInputStream {
    pub fn new(name: &str, config: &ModuleConfig) -> CoreResult<Self> {
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            settings: MockSettings::from_config(config)?,
            filter: PacketFilter::from_config(config)?,
            events: event_bus(),
            packets: Arc::new(AtomicU64::new(0)),
            task: None,
        })
    }

    /// Packets published so far
    pub fn packets_published(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Module for MockInputStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema_key(&self) -> &str {
        INPUT_TYPE
    }

    fn running(&self) -> bool {
        self.task.is_some()
    }

    fn config(&self) -> &ModuleConfig {
        &self.config
    }

    async fn start(&mut self) -> CoreResult<()> {
        if self.task.is_some() {
            return Ok(());
        }
        if self.settings.except_on_start {
            return Err(CoreError::RuntimeStartFailure(
                "mock error on start".to_string(),
            ));
        }

        info!(input = %self.name, iface = %self.settings.iface, "Starting mock input stream");

        let settings = self.settings.clone();
        let filter = self.filter.clone();
        let events = self.events.clone();
        let packets = self.packets.clone();
        let name = self.name.clone();

        self.task = Some(BackgroundTask::spawn(move |mut shutdown| async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(settings.interval_ms.max(1)));
            let mut cycle = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if settings.cycle_count > 0 && cycle >= settings.cycle_count {
                            continue;
                        }
                        for packet in generate_cycle(cycle) {
                            if !filter.should_capture(&packet) {
                                continue;
                            }
                            // No subscribers yet is not an error
                            let _ = events.send(Arc::new(packet));
                            packets.fetch_add(1, Ordering::Relaxed);
                        }
                        cycle += 1;
                    }
                }
            }
            debug!(input = %name, cycles = cycle, "Mock input loop exited");
        }));
        Ok(())
    }

    async fn stop(&mut self) -> CoreResult<()> {
        if let Some(task) = self.task.take() {
            info!(input = %self.name, "Stopping mock input stream");
            task.shutdown().await;
        }
        Ok(())
    }

    fn info_json(&self) -> Value {
        json!({
            "name": self.name,
            "type": INPUT_TYPE,
            "running": self.running(),
            "iface": self.settings.iface,
            "config": self.config.to_json(),
            "packets_published": self.packets_published(),
        })
    }
}

impl InputStream for MockInputStream {
    fn events(&self) -> EventSender {
        self.events.clone()
    }
}

/// Factory for `mock` input streams
pub struct MockInputFactory;

impl InputFactory for MockInputFactory {
    fn input_type(&self) -> &str {
        INPUT_TYPE
    }

    fn description(&self) -> &str {
        "Generates synthetic DNS and TCP traffic"
    }

    fn instantiate(&self, name: &str, config: &ModuleConfig) -> CoreResult<Box<dyn InputStream>> {
        Ok(Box::new(MockInputStream::new(name, config)?))
    }
}
