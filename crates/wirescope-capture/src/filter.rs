//! Packet filtering applied by input streams before publishing

use wirescope_core::{CoreError, CoreResult, ModuleConfig, PacketEvent, Protocol};

/// Filter configuration, read from the `protocols` and `ports` input keys
#[derive(Debug, Clone, Default)]
pub struct PacketFilter {
    /// Protocols to include (empty = all)
    pub protocols: Vec<Protocol>,

    /// Ports to include, matched on either end (empty = all)
    pub ports: Vec<u16>,
}

impl PacketFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ModuleConfig) -> CoreResult<Self> {
        let mut filter = Self::new();
        if let Some(protocols) = config.try_get::<Vec<String>>("protocols")? {
            for protocol in protocols {
                let protocol = match protocol.to_lowercase().as_str() {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    _ => {
                        return Err(CoreError::InvalidConfig(format!(
                            "unknown protocol in filter: {}",
                            protocol
                        )))
                    }
                };
                filter.protocols.push(protocol);
            }
        }
        if let Some(ports) = config.try_get::<Vec<u16>>("ports")? {
            filter.ports = ports;
        }
        Ok(filter)
    }

    /// Check if a packet should be published
    pub fn should_capture(&self, event: &PacketEvent) -> bool {
        if !self.protocols.is_empty() && !self.protocols.contains(&event.protocol) {
            return false;
        }
        if !self.ports.is_empty()
            && !self.ports.contains(&event.src_port)
            && !self.ports.contains(&event.dst_port)
        {
            return false;
        }
        true
    }

    /// Add a protocol to include
    pub fn include_protocol(mut self, protocol: Protocol) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Add a port to include
    pub fn include_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use wirescope_core::Direction;

    fn packet(protocol: Protocol, dst_port: u16) -> PacketEvent {
        PacketEvent {
            timestamp: Utc::now(),
            protocol,
            direction: Direction::FromHost,
            src_addr: "192.168.1.100".to_string(),
            src_port: 54321,
            dst_addr: "8.8.8.8".to_string(),
            dst_port,
            length: 80,
            dns: None,
        }
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = PacketFilter::new();
        assert!(filter.should_capture(&packet(Protocol::Tcp, 443)));
        assert!(filter.should_capture(&packet(Protocol::Other, 0)));
    }

    #[test]
    fn test_protocol_and_port() {
        let filter = PacketFilter::new()
            .include_protocol(Protocol::Udp)
            .include_port(53);
        assert!(filter.should_capture(&packet(Protocol::Udp, 53)));
        assert!(!filter.should_capture(&packet(Protocol::Tcp, 53)));
        assert!(!filter.should_capture(&packet(Protocol::Udp, 123)));
    }

    #[test]
    fn test_from_config() {
        let config = ModuleConfig::from_value(&json!({"protocols": ["UDP"], "ports": [53]}), "x").unwrap();
        let filter = PacketFilter::from_config(&config).unwrap();
        assert_eq!(filter.protocols, vec![Protocol::Udp]);
        assert_eq!(filter.ports, vec![53]);

        let config = ModuleConfig::from_value(&json!({"protocols": ["icmp"]}), "x").unwrap();
        assert!(PacketFilter::from_config(&config).is_err());
    }
}
