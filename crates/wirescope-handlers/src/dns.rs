//! DNS handler
//!
//! Counts queries, replies and response codes, keeps deep-sampled top query
//! names, and passes matching DNS packets on to chained handlers. Packets
//! without a DNS summary are ignored.
//!
//! Filters:
//! - `only_qname_suffix`: list of suffixes; the query name must end in one
//! - `only_rcode`: only replies with this response code

use serde_json::{json, Value};
use std::collections::HashMap;
use wirescope_core::plugins::check_upstream;
use wirescope_core::{
    CoreError, CoreResult, DnsSummary, HandlerFactory, InputAttachment, MetricsBucket,
    ModuleConfig, PacketEvent, PrometheusText, StreamHandler, UpstreamHandler, WindowedMetrics,
};

use crate::windowed::{merge_counts, top_n, PacketProcessor, WindowedHandler, TOP_N};

pub const HANDLER_TYPE: &str = "dns";

pub fn rcode_name(rcode: u8) -> String {
    match rcode {
        0 => "NOERROR".to_string(),
        1 => "FORMERR".to_string(),
        2 => "SERVFAIL".to_string(),
        3 => "NXDOMAIN".to_string(),
        4 => "NOTIMP".to_string(),
        5 => "REFUSED".to_string(),
        other => format!("RCODE{}", other),
    }
}

#[derive(Debug, Default, Clone)]
pub struct DnsBucket {
    pub queries: u64,
    pub replies: u64,
    pub filtered: u64,
    pub rcodes: HashMap<String, u64>,
    pub qtypes: HashMap<String, u64>,
    pub qnames: HashMap<String, u64>,
}

impl MetricsBucket for DnsBucket {
    fn merge(&mut self, other: &Self) {
        self.queries += other.queries;
        self.replies += other.replies;
        self.filtered += other.filtered;
        merge_counts(&mut self.rcodes, &other.rcodes);
        merge_counts(&mut self.qtypes, &other.qtypes);
        merge_counts(&mut self.qnames, &other.qnames);
    }

    fn to_json(&self) -> Value {
        json!({
            "wire_packets": {
                "queries": self.queries,
                "replies": self.replies,
                "filtered": self.filtered,
            },
            "rcodes": self.rcodes,
            "qtypes": self.qtypes,
            "top_qname": top_n(&self.qnames, TOP_N),
        })
    }

    fn to_prometheus(&self, out: &mut PrometheusText, labels: &[(&str, &str)]) {
        let wire = "wirescope_dns_wire_packets_total";
        let help = "DNS packets by kind";
        for (kind, count) in [
            ("query", self.queries),
            ("reply", self.replies),
            ("filtered", self.filtered),
        ] {
            let mut all: Vec<(&str, &str)> = labels.to_vec();
            all.push(("kind", kind));
            out.counter(wire, help, &all, count);
        }

        let mut rcodes: Vec<_> = self.rcodes.iter().collect();
        rcodes.sort();
        for (rcode, count) in rcodes {
            let mut all: Vec<(&str, &str)> = labels.to_vec();
            all.push(("rcode", rcode.as_str()));
            out.counter("wirescope_dns_rcode_total", "DNS replies by response code", &all, *count);
        }

        let mut qtypes: Vec<_> = self.qtypes.iter().collect();
        qtypes.sort();
        for (qtype, count) in qtypes {
            let mut all: Vec<(&str, &str)> = labels.to_vec();
            all.push(("qtype", qtype.as_str()));
            out.counter("wirescope_dns_qtype_total", "DNS queries by type", &all, *count);
        }
    }
}

/// Which DNS packets a handler counts
#[derive(Debug, Clone, Default)]
pub struct DnsFilter {
    pub qname_suffixes: Vec<String>,
    pub rcode: Option<u8>,
}

impl DnsFilter {
    pub fn from_config(config: &ModuleConfig) -> CoreResult<Self> {
        let qname_suffixes = config
            .try_get::<Vec<String>>("only_qname_suffix")?
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        let rcode = config.try_get::<u8>("only_rcode")?;
        if let Some(rcode) = rcode {
            if rcode > 15 {
                return Err(CoreError::InvalidConfig(
                    "invalid value for key: only_rcode".to_string(),
                ));
            }
        }
        Ok(Self {
            qname_suffixes,
            rcode,
        })
    }

    pub fn matches(&self, dns: &DnsSummary) -> bool {
        if !self.qname_suffixes.is_empty() {
            let qname = dns.qname.to_lowercase();
            if !self.qname_suffixes.iter().any(|s| qname.ends_with(s.as_str())) {
                return false;
            }
        }
        match self.rcode {
            Some(rcode) => dns.is_response && dns.rcode == rcode,
            None => true,
        }
    }
}

pub struct DnsProcessor {
    filter: DnsFilter,
}

impl DnsProcessor {
    pub fn new(filter: DnsFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &DnsFilter {
        &self.filter
    }
}

impl PacketProcessor for DnsProcessor {
    type Bucket = DnsBucket;

    fn process(&self, event: &PacketEvent, window: &mut WindowedMetrics<DnsBucket>) -> bool {
        let Some(dns) = &event.dns else {
            return false;
        };
        if !self.filter.matches(dns) {
            window.live().filtered += 1;
            return false;
        }

        let deep = window.should_deep_sample();
        let bucket = window.live();
        if dns.is_response {
            bucket.replies += 1;
            *bucket.rcodes.entry(rcode_name(dns.rcode)).or_default() += 1;
        } else {
            bucket.queries += 1;
            *bucket.qtypes.entry(dns.qtype.clone()).or_default() += 1;
        }
        if deep {
            *bucket.qnames.entry(dns.qname.to_lowercase()).or_default() += 1;
        }
        true
    }
}

pub type DnsStreamHandler = WindowedHandler<DnsProcessor>;

/// Factory for `dns` handlers
pub struct DnsHandlerFactory;

impl HandlerFactory for DnsHandlerFactory {
    fn handler_type(&self) -> &str {
        HANDLER_TYPE
    }

    fn description(&self) -> &str {
        "DNS query, reply and response code metrics"
    }

    fn instantiate(
        &self,
        name: &str,
        input: &InputAttachment,
        config: &ModuleConfig,
        upstream: Option<&UpstreamHandler>,
    ) -> CoreResult<Box<dyn StreamHandler>> {
        check_upstream("DnsStreamHandler", &[], upstream)?;
        let filter = DnsFilter::from_config(config)?;
        Ok(Box::new(DnsStreamHandler::new(
            name,
            HANDLER_TYPE,
            config,
            DnsProcessor::new(filter),
            input.events.clone(),
            None,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wirescope_core::{Direction, Protocol, WindowConfig};

    fn dns_packet(qname: &str, is_response: bool, rcode: u8) -> PacketEvent {
        PacketEvent {
            timestamp: Utc::now(),
            protocol: Protocol::Udp,
            direction: Direction::ToHost,
            src_addr: "8.8.8.8".to_string(),
            src_port: 53,
            dst_addr: "192.168.1.100".to_string(),
            dst_port: 40000,
            length: 90,
            dns: Some(DnsSummary {
                qname: qname.to_string(),
                qtype: "A".to_string(),
                is_response,
                rcode,
            }),
        }
    }

    fn config(value: Value) -> ModuleConfig {
        ModuleConfig::from_value(&value, "x").unwrap()
    }

    #[test]
    fn test_counts_queries_and_replies() {
        let processor = DnsProcessor::new(DnsFilter::default());
        let mut window = WindowedMetrics::new(WindowConfig::default());

        assert!(processor.process(&dns_packet("www.google.com", false, 0), &mut window));
        assert!(processor.process(&dns_packet("www.google.com", true, 0), &mut window));
        assert!(processor.process(&dns_packet("bad.example.org", true, 3), &mut window));

        let mut plain = dns_packet("x", false, 0);
        plain.dns = None;
        assert!(!processor.process(&plain, &mut window));

        let bucket = window.live();
        assert_eq!(bucket.queries, 1);
        assert_eq!(bucket.replies, 2);
        assert_eq!(bucket.rcodes["NOERROR"], 1);
        assert_eq!(bucket.rcodes["NXDOMAIN"], 1);
        assert_eq!(bucket.qnames["www.google.com"], 2);
    }

    #[test]
    fn test_prometheus_samples() {
        let processor = DnsProcessor::new(DnsFilter::default());
        let mut window = WindowedMetrics::new(WindowConfig::default());
        processor.process(&dns_packet("www.google.com", false, 0), &mut window);
        processor.process(&dns_packet("bad.example.org", true, 3), &mut window);

        let mut out = PrometheusText::new();
        window.live().to_prometheus(&mut out, &[("policy", "p")]);
        let text = out.render();
        assert!(text.contains("# TYPE wirescope_dns_wire_packets_total counter\n"));
        assert!(text.contains("wirescope_dns_wire_packets_total{policy=\"p\",kind=\"query\"} 1\n"));
        assert!(text.contains("wirescope_dns_wire_packets_total{policy=\"p\",kind=\"reply\"} 1\n"));
        assert!(text.contains("wirescope_dns_rcode_total{policy=\"p\",rcode=\"NXDOMAIN\"} 1\n"));
    }

    #[test]
    fn test_qname_suffix_filter() {
        let filter = DnsFilter::from_config(&config(json!({
            "only_qname_suffix": [".google.com", ".GitHub.com"]
        })))
        .unwrap();
        assert!(filter.matches(dns_packet("mail.google.com", false, 0).dns.as_ref().unwrap()));
        assert!(filter.matches(dns_packet("api.github.com", false, 0).dns.as_ref().unwrap()));
        assert!(!filter.matches(dns_packet("slack.com", false, 0).dns.as_ref().unwrap()));

        let processor = DnsProcessor::new(filter);
        let mut window = WindowedMetrics::new(WindowConfig::default());
        assert!(!processor.process(&dns_packet("slack.com", false, 0), &mut window));
        assert_eq!(window.live().filtered, 1);
        assert_eq!(window.live().queries, 0);
    }

    #[test]
    fn test_rcode_filter() {
        let filter = DnsFilter::from_config(&config(json!({"only_rcode": 3}))).unwrap();
        assert!(filter.matches(dns_packet("a.org", true, 3).dns.as_ref().unwrap()));
        assert!(!filter.matches(dns_packet("a.org", true, 0).dns.as_ref().unwrap()));
        assert!(!filter.matches(dns_packet("a.org", false, 0).dns.as_ref().unwrap()));

        assert!(DnsFilter::from_config(&config(json!({"only_rcode": 99}))).is_err());
        assert!(DnsFilter::from_config(&config(json!({"only_qname_suffix": "x"}))).is_err());
    }

    #[test]
    fn test_accepts_no_upstream() {
        let input = InputAttachment {
            name: "anycast-0123456789abcdef".to_string(),
            input_type: "mock".to_string(),
            events: wirescope_core::event_bus(),
        };
        let upstream = UpstreamHandler {
            name: "default_view-default_net".to_string(),
            handler_type: "net".to_string(),
            output: wirescope_core::event_bus(),
        };
        let err = DnsHandlerFactory
            .instantiate("default_view-default_dns", &input, &ModuleConfig::new(), Some(&upstream))
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "DnsStreamHandler: unsupported upstream chained stream handler default_view-default_net"
        );
        assert!(DnsHandlerFactory
            .instantiate("default_view-default_dns", &input, &ModuleConfig::new(), None)
            .is_ok());
    }
}
