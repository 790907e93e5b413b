//! Address leak rules.
//!
//! Compare what the client reports about its own network with the address
//! the server saw on the request.

use super::{AnomalyKind, AnomalyRule, DetectionContext};

/// Peer-connection addresses that differ from the request address.
pub struct PeerAddressLeakRule;

impl AnomalyRule for PeerAddressLeakRule {
    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<String> {
        ctx.telemetry
            .network
            .peer_ips
            .iter()
            .map(|ip| ip.trim())
            .filter(|ip| !ip.is_empty() && ctx.differs_from_server(ip))
            .map(|ip| {
                AnomalyKind::AddressLeak
                    .tag_with(format!("peer {} != server {}", ip, ctx.server_address))
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "peer_address_leak"
    }
}

/// Secondary network stack (IPv6) exiting elsewhere.
pub struct SecondaryStackRule;

impl AnomalyRule for SecondaryStackRule {
    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<String> {
        match ctx.telemetry.network.secondary_address.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() && ctx.differs_from_server(addr) => {
                vec![AnomalyKind::SecondaryStackLeak.tag_with(addr)]
            }
            _ => vec![],
        }
    }

    fn name(&self) -> &'static str {
        "secondary_stack_leak"
    }
}

/// Gateway or LAN hosts found by the client-side network scan.
pub struct LocalTopologyRule;

impl AnomalyRule for LocalTopologyRule {
    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<String> {
        let network = &ctx.telemetry.network;
        let mut tags = Vec::new();

        if let Some(gateway) = network.gateway.as_deref().map(str::trim) {
            if !gateway.is_empty() {
                tags.push(
                    AnomalyKind::LocalTopologyDisclosure.tag_with(format!("gateway {}", gateway)),
                );
            }
        }

        for host in network.lan_hosts.iter().map(|h| h.trim()) {
            if !host.is_empty() {
                tags.push(AnomalyKind::LocalTopologyDisclosure.tag_with(format!("host {}", host)));
            }
        }

        tags
    }

    fn name(&self) -> &'static str {
        "local_topology"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Telemetry;
    use serde_json::json;
    use std::collections::HashMap;

    fn evaluate(rule: &dyn AnomalyRule, server: &str, telemetry: serde_json::Value) -> Vec<String> {
        let telemetry = Telemetry::from_value(telemetry);
        let headers = HashMap::new();
        let ctx = DetectionContext {
            server_address: server,
            headers: &headers,
            telemetry: &telemetry,
        };
        rule.evaluate(&ctx)
    }

    #[test]
    fn test_peer_address_leak() {
        let tags = evaluate(
            &PeerAddressLeakRule,
            "1.2.3.4",
            json!({"network": {"peerIPs": ["9.9.9.9"]}}),
        );
        assert_eq!(tags, vec!["address-leak: peer 9.9.9.9 != server 1.2.3.4"]);
    }

    #[test]
    fn test_peer_matching_server_is_clean() {
        let tags = evaluate(
            &PeerAddressLeakRule,
            "1.2.3.4",
            json!({"network": {"peerIPs": ["1.2.3.4", " "]}}),
        );
        assert!(tags.is_empty());
    }

    #[test]
    fn test_address_pairs() {
        let pairs = [
            ("10.0.0.1", "10.0.0.1", false),
            ("10.0.0.1", "10.0.0.2", true),
            ("2001:db8::1", "2001:db8:0::1", false),
            ("2001:db8::1", "1.2.3.4", true),
            ("203.0.113.9", "198.51.100.7", true),
        ];
        for (peer, server, leaks) in pairs {
            let tags = evaluate(
                &PeerAddressLeakRule,
                server,
                json!({"network": {"webrtcIPs": [peer]}}),
            );
            assert_eq!(!tags.is_empty(), leaks, "peer={} server={}", peer, server);
            if leaks {
                assert!(tags[0].contains(peer) && tags[0].contains(server));
            }
        }
    }

    #[test]
    fn test_secondary_stack_leak() {
        let tags = evaluate(
            &SecondaryStackRule,
            "1.2.3.4",
            json!({"network": {"ipv6": "2001:db8::7"}}),
        );
        assert_eq!(tags, vec!["secondary-stack-leak: 2001:db8::7"]);

        let tags = evaluate(
            &SecondaryStackRule,
            "2001:db8::7",
            json!({"network": {"ipv6": "2001:db8::7"}}),
        );
        assert!(tags.is_empty());

        assert!(evaluate(&SecondaryStackRule, "1.2.3.4", json!({})).is_empty());
    }

    #[test]
    fn test_local_topology() {
        let tags = evaluate(
            &LocalTopologyRule,
            "1.2.3.4",
            json!({"network": {"gateway": "192.168.1.1", "lanHosts": ["192.168.1.20"]}}),
        );
        assert_eq!(
            tags,
            vec![
                "local-topology-disclosure: gateway 192.168.1.1",
                "local-topology-disclosure: host 192.168.1.20",
            ]
        );
    }
}
