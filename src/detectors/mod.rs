//! Anomaly detection rules.
//!
//! Each rule looks at one aspect of the combined request signals and emits
//! tags. Rules never see each other's output, and the result is an ordered
//! set, so the outcome does not depend on the order rules run in.

pub mod environment;
pub mod headers;
pub mod network;

pub use environment::{PrivateModeRule, SoftwareRendererRule};
pub use headers::HeaderForensics;
pub use network::{LocalTopologyRule, PeerAddressLeakRule, SecondaryStackRule};

use crate::config::DetectionConfig;
use crate::telemetry::Telemetry;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

/// Anomaly taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    /// Headers a real browser would send are missing or inconsistent
    HeaderForgery,
    /// A peer-connection address differs from the HTTP address
    AddressLeak,
    /// The secondary network stack exits somewhere else
    SecondaryStackLeak,
    /// Automation tooling markers
    AutomationIndicator,
    /// Software rendering typical of virtual machines
    VirtualizationIndicator,
    /// The client disclosed hosts on its local network
    LocalTopologyDisclosure,
    /// The client reports private browsing
    PrivacyMode,
}

impl AnomalyKind {
    /// Returns the tag prefix for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::HeaderForgery => "header-forgery",
            AnomalyKind::AddressLeak => "address-leak",
            AnomalyKind::SecondaryStackLeak => "secondary-stack-leak",
            AnomalyKind::AutomationIndicator => "automation-indicator",
            AnomalyKind::VirtualizationIndicator => "virtualization-indicator",
            AnomalyKind::LocalTopologyDisclosure => "local-topology-disclosure",
            AnomalyKind::PrivacyMode => "privacy-mode",
        }
    }

    /// Bare tag.
    pub fn tag(&self) -> String {
        self.as_str().to_string()
    }

    /// Tag with a detail suffix, e.g. `address-leak: peer 9.9.9.9 …`.
    pub fn tag_with(&self, detail: impl AsRef<str>) -> String {
        format!("{}: {}", self.as_str(), detail.as_ref())
    }
}

/// Deduplicated, ordered set of anomaly tags.
///
/// Deduplication is by exact string only; near-identical tags are kept apart.
pub type AnomalySet = BTreeSet<String>;

/// Signals available to the rules for one request.
#[derive(Debug, Clone)]
pub struct DetectionContext<'a> {
    /// Address the server observed for the request
    pub server_address: &'a str,
    /// Request headers (lowercase keys)
    pub headers: &'a HashMap<String, Vec<String>>,
    /// Client telemetry
    pub telemetry: &'a Telemetry,
}

impl DetectionContext<'_> {
    /// Get a single header value (first if multiple).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// Get the User-Agent header.
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Whether `address` names a different host than the server observed.
    pub fn differs_from_server(&self, address: &str) -> bool {
        !same_address(address, self.server_address)
    }
}

/// Compare two addresses, as IPs when both parse and as text otherwise.
pub fn same_address(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.eq_ignore_ascii_case(b),
    }
}

/// Trait for anomaly rules.
pub trait AnomalyRule: Send + Sync {
    /// Evaluate the rule and return the tags it raises.
    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<String>;

    /// Get the rule name.
    fn name(&self) -> &'static str;
}

/// Runs every enabled rule and merges client self-reported anomalies.
pub struct AnomalyDetector {
    rules: Vec<Box<dyn AnomalyRule>>,
    accept_client_anomalies: bool,
}

impl AnomalyDetector {
    /// Build the rule set from configuration.
    pub fn new(config: &DetectionConfig) -> Self {
        let mut rules: Vec<Box<dyn AnomalyRule>> = Vec::new();

        if config.header_forensics {
            rules.push(Box::new(HeaderForensics::new()));
        }
        if config.network_leaks {
            rules.push(Box::new(PeerAddressLeakRule));
            rules.push(Box::new(SecondaryStackRule));
            rules.push(Box::new(LocalTopologyRule));
        }
        if config.environment {
            rules.push(Box::new(SoftwareRendererRule::new(&config.software_renderers)));
            rules.push(Box::new(PrivateModeRule));
        }

        Self::with_rules(rules, config.accept_client_anomalies)
    }

    /// Build from an explicit rule list.
    pub fn with_rules(rules: Vec<Box<dyn AnomalyRule>>, accept_client_anomalies: bool) -> Self {
        Self {
            rules,
            accept_client_anomalies,
        }
    }

    /// Names of the active rules.
    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Compute the anomaly set for one request.
    pub fn detect(
        &self,
        server_address: &str,
        telemetry: &Telemetry,
        headers: &HashMap<String, Vec<String>>,
    ) -> AnomalySet {
        let ctx = DetectionContext {
            server_address,
            headers,
            telemetry,
        };

        let mut anomalies: AnomalySet = self
            .rules
            .iter()
            .flat_map(|rule| rule.evaluate(&ctx))
            .collect();

        if self.accept_client_anomalies {
            anomalies.extend(
                telemetry
                    .anomalies
                    .iter()
                    .filter(|a| !a.trim().is_empty())
                    .cloned(),
            );
        }

        anomalies
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new(&DetectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn browser_headers() -> HashMap<String, Vec<String>> {
        let mut headers = HashMap::new();
        headers.insert(
            "user-agent".to_string(),
            vec![
                "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0".to_string(),
            ],
        );
        headers.insert("accept-language".to_string(), vec!["en-US,en;q=0.5".to_string()]);
        headers
    }

    #[test]
    fn test_anomaly_kind_as_str() {
        assert_eq!(AnomalyKind::HeaderForgery.as_str(), "header-forgery");
        assert_eq!(AnomalyKind::AddressLeak.as_str(), "address-leak");
        assert_eq!(AnomalyKind::SecondaryStackLeak.as_str(), "secondary-stack-leak");
        assert_eq!(AnomalyKind::AutomationIndicator.as_str(), "automation-indicator");
        assert_eq!(AnomalyKind::VirtualizationIndicator.as_str(), "virtualization-indicator");
        assert_eq!(AnomalyKind::LocalTopologyDisclosure.as_str(), "local-topology-disclosure");
        assert_eq!(AnomalyKind::PrivacyMode.as_str(), "privacy-mode");
        assert_eq!(AnomalyKind::AddressLeak.tag_with("x"), "address-leak: x");
    }

    #[test]
    fn test_same_address() {
        assert!(same_address("1.2.3.4", " 1.2.3.4 "));
        assert!(same_address("2001:db8::1", "2001:0db8:0:0:0:0:0:1"));
        assert!(!same_address("1.2.3.4", "1.2.3.5"));
        assert!(same_address("unknown", "UNKNOWN"));
    }

    #[test]
    fn test_empty_telemetry_clean_request() {
        let detector = AnomalyDetector::default();
        let telemetry = Telemetry::from_value(json!({}));
        let anomalies = detector.detect("1.2.3.4", &telemetry, &browser_headers());
        assert!(anomalies.is_empty(), "unexpected: {:?}", anomalies);
    }

    #[test]
    fn test_client_anomalies_merged_exactly() {
        let detector = AnomalyDetector::default();
        let telemetry = Telemetry::from_value(json!({
            "system": {"incognito": true},
            "anomalies": ["privacy-mode", "Privacy-Mode", "tz-mismatch", "tz-mismatch", ""]
        }));
        let anomalies = detector.detect("1.2.3.4", &telemetry, &browser_headers());

        let expected: AnomalySet = ["Privacy-Mode", "privacy-mode", "tz-mismatch"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(anomalies, expected);
    }

    #[test]
    fn test_client_anomalies_can_be_ignored() {
        let detector = AnomalyDetector::with_rules(vec![], false);
        let telemetry = Telemetry::from_value(json!({"anomalies": ["whatever"]}));
        assert!(detector.detect("1.2.3.4", &telemetry, &HashMap::new()).is_empty());
    }

    #[test]
    fn test_rule_order_does_not_matter() {
        let telemetry = Telemetry::from_value(json!({
            "fingerprint": {"webgl_renderer": "Google SwiftShader"},
            "system": {"privateMode": true},
            "network": {
                "peerIPs": ["9.9.9.9", "1.2.3.4"],
                "ipv6": "2001:db8::2",
                "gateway": "192.168.0.1"
            },
            "anomalies": ["client-flag"]
        }));
        let headers = HashMap::new();

        let forward = AnomalyDetector::with_rules(
            vec![
                Box::new(HeaderForensics::new()),
                Box::new(PeerAddressLeakRule),
                Box::new(SecondaryStackRule),
                Box::new(LocalTopologyRule),
                Box::new(SoftwareRendererRule::default()),
                Box::new(PrivateModeRule),
            ],
            true,
        );
        let reverse = AnomalyDetector::with_rules(
            vec![
                Box::new(PrivateModeRule),
                Box::new(SoftwareRendererRule::default()),
                Box::new(LocalTopologyRule),
                Box::new(SecondaryStackRule),
                Box::new(PeerAddressLeakRule),
                Box::new(HeaderForensics::new()),
            ],
            true,
        );

        let a = forward.detect("1.2.3.4", &telemetry, &headers);
        let b = reverse.detect("1.2.3.4", &telemetry, &headers);
        assert_eq!(a, b);
        assert_eq!(a, forward.detect("1.2.3.4", &telemetry, &headers));
        assert!(a.contains("privacy-mode"));
        assert!(a.contains("header-forgery"));
        assert!(a.contains("client-flag"));
    }

    #[test]
    fn test_disabled_rule_groups() {
        let config = DetectionConfig {
            header_forensics: false,
            network_leaks: false,
            environment: false,
            ..Default::default()
        };
        let detector = AnomalyDetector::new(&config);
        assert!(detector.rule_names().is_empty());
    }
}
