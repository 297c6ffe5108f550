//! Network traffic handler
//!
//! Counts packets and bytes by protocol and direction, and keeps
//! deep-sampled top talkers by remote address.

use serde_json::{json, Value};
use std::collections::HashMap;
use wirescope_core::plugins::check_upstream;
use wirescope_core::{
    CoreResult, Direction, HandlerFactory, InputAttachment, MetricsBucket, ModuleConfig,
    PacketEvent, PrometheusText, Protocol, StreamHandler, UpstreamHandler, WindowedMetrics,
};

use crate::windowed::{merge_counts, top_n, PacketProcessor, WindowedHandler, TOP_N};

pub const HANDLER_TYPE: &str = "net";

/// Upstream handler types a net handler can be chained behind
const ACCEPTED_UPSTREAM: &[&str] = &["dns"];

#[derive(Debug, Default, Clone)]
pub struct NetBucket {
    pub packets: u64,
    pub bytes: u64,
    pub tcp: u64,
    pub udp: u64,
    pub other: u64,
    pub inbound: u64,
    pub outbound: u64,
    pub unknown_direction: u64,
    pub deep_samples: u64,
    pub talkers: HashMap<String, u64>,
}

impl MetricsBucket for NetBucket {
    fn merge(&mut self, other: &Self) {
        self.packets += other.packets;
        self.bytes += other.bytes;
        self.tcp += other.tcp;
        self.udp += other.udp;
        self.other += other.other;
        self.inbound += other.inbound;
        self.outbound += other.outbound;
        self.unknown_direction += other.unknown_direction;
        self.deep_samples += other.deep_samples;
        merge_counts(&mut self.talkers, &other.talkers);
    }

    fn to_json(&self) -> Value {
        json!({
            "packets": {
                "total": self.packets,
                "tcp": self.tcp,
                "udp": self.udp,
                "other": self.other,
                "in": self.inbound,
                "out": self.outbound,
                "unknown_dir": self.unknown_direction,
                "deep_samples": self.deep_samples,
            },
            "bytes": self.bytes,
            "top_talkers": top_n(&self.talkers, TOP_N),
        })
    }

    fn to_prometheus(&self, out: &mut PrometheusText, labels: &[(&str, &str)]) {
        let packets = "wirescope_net_packets_total";
        let help = "Packets seen by protocol and direction";
        let with = |key: &'static str, value: &'static str| {
            let mut all = labels.to_vec();
            all.push((key, value));
            all
        };
        out.counter(packets, help, labels, self.packets);
        out.counter(packets, help, &with("protocol", "tcp"), self.tcp);
        out.counter(packets, help, &with("protocol", "udp"), self.udp);
        out.counter(packets, help, &with("protocol", "other"), self.other);
        out.counter(packets, help, &with("direction", "in"), self.inbound);
        out.counter(packets, help, &with("direction", "out"), self.outbound);
        out.counter(packets, help, &with("direction", "unknown"), self.unknown_direction);
        out.counter("wirescope_net_bytes_total", "Bytes seen", labels, self.bytes);
        out.counter(
            "wirescope_net_deep_samples_total",
            "Packets that got deep analysis",
            labels,
            self.deep_samples,
        );
    }
}

pub struct NetProcessor;

impl PacketProcessor for NetProcessor {
    type Bucket = NetBucket;

    fn process(&self, event: &PacketEvent, window: &mut WindowedMetrics<NetBucket>) -> bool {
        let deep = window.should_deep_sample();
        let bucket = window.live();
        bucket.packets += 1;
        bucket.bytes += u64::from(event.length);
        match event.protocol {
            Protocol::Tcp => bucket.tcp += 1,
            Protocol::Udp => bucket.udp += 1,
            Protocol::Other => bucket.other += 1,
        }
        let remote = match event.direction {
            Direction::ToHost => {
                bucket.inbound += 1;
                Some(&event.src_addr)
            }
            Direction::FromHost => {
                bucket.outbound += 1;
                Some(&event.dst_addr)
            }
            Direction::Unknown => {
                bucket.unknown_direction += 1;
                None
            }
        };
        if deep {
            bucket.deep_samples += 1;
            if let Some(remote) = remote {
                *bucket.talkers.entry(remote.clone()).or_default() += 1;
            }
        }
        true
    }
}

pub type NetStreamHandler = WindowedHandler<NetProcessor>;

/// Factory for `net` handlers
pub struct NetHandlerFactory;

impl HandlerFactory for NetHandlerFactory {
    fn handler_type(&self) -> &str {
        HANDLER_TYPE
    }

    fn description(&self) -> &str {
        "Packet and byte counters by protocol and direction"
    }

    fn instantiate(
        &self,
        name: &str,
        input: &InputAttachment,
        config: &ModuleConfig,
        upstream: Option<&UpstreamHandler>,
    ) -> CoreResult<Box<dyn StreamHandler>> {
        check_upstream("NetStreamHandler", ACCEPTED_UPSTREAM, upstream)?;
        let source = upstream
            .map(|up| up.output.clone())
            .unwrap_or_else(|| input.events.clone());
        Ok(Box::new(NetStreamHandler::new(
            name,
            HANDLER_TYPE,
            config,
            NetProcessor,
            source,
            upstream.map(|up| up.name.clone()),
        )?))
    }
}
