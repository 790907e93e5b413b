//! Visitor intelligence engine.
//!
//! Owns every component and exposes one entry point per inbound channel. The
//! request-path methods are synchronous apart from the visitor ledger, never
//! wait on the sink, and never fail the caller.

use crate::cloak::{CloakClassifier, CloakDecision};
use crate::config::{ContentVariant, VisitorIntelConfig};
use crate::detectors::{AnomalyDetector, AnomalyKind, AnomalySet};
use crate::dispatch::{EventDispatcher, ReportSink};
use crate::error::ConfigError;
use crate::identity::{IdentityResolver, VisitorIdentity, VisitorLedger, VisitorRecord};
use crate::report::Report;
use crate::sessions::{SessionCorrelator, SessionRecord};
use crate::telemetry::Telemetry;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Trigger used for side-channel reports.
pub const DNS_TRIGGER: &str = "DNS Side Channel";

/// Address reported when neither the socket nor a proxy header gives one.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// One telemetry submission.
#[derive(Debug, Clone)]
pub struct CollectRequest<'a> {
    /// Address observed for the request
    pub address: &'a str,
    /// Request headers (lowercase keys)
    pub headers: &'a HashMap<String, Vec<String>>,
    /// Raw request body
    pub body: &'a [u8],
    /// Visitor token from the caching validator, if the client sent one
    pub validator: Option<&'a str>,
}

/// What a telemetry submission produced.
#[derive(Debug, Clone)]
pub struct CollectOutcome {
    pub trigger: String,
    pub anomalies: AnomalySet,
    pub session_id: Option<String>,
    /// Visitor token attached to the report
    pub visitor: String,
    /// Whether the token came from the client
    pub returning: bool,
    /// Whether the report made it onto the dispatch queue
    pub dispatched: bool,
}

/// Visitor intelligence engine.
pub struct VisitorIntelEngine {
    /// Configuration
    config: VisitorIntelConfig,
    /// Visitor token issuer
    identity: IdentityResolver,
    /// Visitor sightings
    ledger: VisitorLedger,
    /// HTTP/DNS session correlation
    sessions: SessionCorrelator,
    /// Anomaly rules
    detector: AnomalyDetector,
    /// Crawler classifier
    cloak: CloakClassifier,
    /// Report delivery
    dispatcher: EventDispatcher,
    /// Peers allowed to set X-Forwarded-For
    trusted_proxies: Vec<IpNet>,
}

impl VisitorIntelEngine {
    /// Create a new engine, loading crawler signatures from `signatures_path`.
    pub async fn new(config: VisitorIntelConfig, signatures_path: &Path) -> anyhow::Result<Self> {
        let cloak = CloakClassifier::load(signatures_path)?;
        let dispatcher = EventDispatcher::from_config(&config.dispatch)?;
        Self::assemble(config, cloak, dispatcher)
    }

    /// Create with default configuration and built-in signatures.
    pub async fn with_defaults() -> anyhow::Result<Self> {
        let config = VisitorIntelConfig::default();
        let dispatcher = EventDispatcher::from_config(&config.dispatch)?;
        Self::assemble(config, CloakClassifier::default(), dispatcher)
    }

    /// Create with an explicit report sink.
    pub async fn with_sink(
        config: VisitorIntelConfig,
        cloak: CloakClassifier,
        sink: Arc<dyn ReportSink>,
    ) -> anyhow::Result<Self> {
        let dispatcher = EventDispatcher::new(
            sink,
            config.dispatch.workers,
            config.dispatch.queue_capacity,
            Duration::from_millis(config.dispatch.timeout_ms),
        );
        Self::assemble(config, cloak, dispatcher)
    }

    fn assemble(
        config: VisitorIntelConfig,
        cloak: CloakClassifier,
        dispatcher: EventDispatcher,
    ) -> anyhow::Result<Self> {
        let trusted_proxies = config
            .server
            .trusted_proxies
            .iter()
            .map(|r| r.parse().map_err(|_| ConfigError::InvalidCidr(r.clone())))
            .collect::<Result<Vec<IpNet>, _>>()?;

        let identity = IdentityResolver::new(
            &config.identity.token_secret,
            config.identity.max_age_seconds,
        );

        let ledger = VisitorLedger::new(
            config.identity.ledger_capacity,
            Duration::from_secs(config.identity.ledger_ttl_seconds),
        );

        let sessions = SessionCorrelator::new(
            config.sessions.max_sessions,
            Duration::from_secs(config.sessions.session_ttl_seconds),
            config.sessions.sweep_interval,
        );

        let detector = AnomalyDetector::new(&config.detection);

        info!(
            rules = ?detector.rule_names(),
            sink = dispatcher.sink_name(),
            signatures = cloak.version(),
            "Visitor intelligence engine ready"
        );

        Ok(Self {
            config,
            identity,
            ledger,
            sessions,
            detector,
            cloak,
            dispatcher,
            trusted_proxies,
        })
    }

    /// Work out the requester's address from the socket peer and, when the
    /// peer is a trusted proxy, the first `X-Forwarded-For` entry.
    pub fn client_address(
        &self,
        peer: Option<SocketAddr>,
        headers: &HashMap<String, Vec<String>>,
    ) -> String {
        let peer_ip = peer.map(|p| p.ip());
        let trusted = match peer_ip {
            Some(ip) => self.is_trusted_proxy(ip),
            None => true,
        };

        if trusted {
            let forwarded = headers
                .get("x-forwarded-for")
                .and_then(|v| v.first())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return addr.to_string();
            }
        }

        peer_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
    }

    fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.trusted_proxies.iter().any(|net| net.contains(&ip))
    }

    /// Resolve the visitor token and record the sighting.
    pub async fn identify(&self, validator: Option<&str>) -> (VisitorIdentity, VisitorRecord) {
        let identity = self.identity.resolve(validator);
        let record = self.ledger.observe(&identity.token).await;

        debug!(
            returning = identity.returning,
            authentic = self.identity.is_authentic(&identity.token),
            hits = record.hits,
            "Visitor identified"
        );
        (identity, record)
    }

    /// Report a pixel fetch from an embedded document.
    pub fn pixel_event(
        &self,
        source: &str,
        uid: Option<&str>,
        address: &str,
        user_agent: &str,
        visitor: &str,
    ) {
        let details = serde_json::json!({
            "source": source,
            "uid": uid,
            "visitor_authentic": self.identity.is_authentic(visitor),
        });
        let report = Report::new(format!("Pixel ({})", source), address, user_agent)
            .with_details(details)
            .with_visitor(visitor);
        self.submit(report);
    }

    /// Register a session against the observed address.
    pub fn register_session(&self, session_id: &str, address: &str) {
        self.sessions.register(session_id, address);
    }

    /// Process a telemetry submission.
    pub async fn collect(&self, request: CollectRequest<'_>) -> CollectOutcome {
        let telemetry = Telemetry::from_slice(request.body);
        let user_agent = request
            .headers
            .get("user-agent")
            .and_then(|v| v.first())
            .map(String::as_str)
            .unwrap_or("");

        let mut anomalies = self
            .detector
            .detect(request.address, &telemetry, request.headers);

        let session_id = telemetry.session_id().map(str::to_string);
        if let Some(id) = session_id.as_deref() {
            match self.sessions.get(id) {
                Some(record) => {
                    if let Some(tag) = resolver_leak_tag(&record) {
                        anomalies.insert(tag);
                    }
                }
                None => self.sessions.register(id, request.address),
            }
        }

        let validator = request
            .validator
            .or(telemetry.meta.visitor_id.as_deref());
        let (identity, _) = self.identify(validator).await;

        let mut report =
            Report::from_telemetry(&telemetry, request.address, user_agent, anomalies.clone())
                .with_visitor(&identity.token);
        if let Some(id) = session_id.as_deref() {
            report = report.with_session(id);
        }

        info!(
            client_ip = %request.address,
            trigger = %report.trigger,
            anomalies = anomalies.len(),
            device = %report.device.model,
            "Telemetry collected"
        );

        let trigger = report.trigger.clone();
        let dispatched = self.submit(report);

        CollectOutcome {
            trigger,
            anomalies,
            session_id,
            visitor: identity.token,
            returning: identity.returning,
            dispatched,
        }
    }

    /// Handle a DNS side-channel observation.
    ///
    /// Returns the merged session; unknown keys and short hostnames are a
    /// silent no-op.
    pub fn dns_observation(&self, hostname: &str, resolver_address: &str) -> Option<SessionRecord> {
        let Some(record) = self.sessions.complete(hostname, resolver_address) else {
            debug!(hostname = %hostname, "Side-channel observation without a session");
            return None;
        };

        if let Some(tag) = resolver_leak_tag(&record) {
            info!(
                session_id = %record.session_id,
                observed = %record.observed_address,
                resolver = %resolver_address,
                "Resolver address differs from HTTP address"
            );
            let details = serde_json::to_value(&record).unwrap_or_default();
            let report = Report::new(DNS_TRIGGER, &record.observed_address, "")
                .with_anomalies([tag])
                .with_details(details)
                .with_session(&record.session_id);
            self.submit(report);
        }

        Some(record)
    }

    /// Classify the requester for the cloak-gated path.
    pub fn classify(&self, user_agent: Option<&str>) -> CloakDecision {
        let decision = self.cloak.classify(user_agent);
        if decision == CloakDecision::Automated {
            debug!(
                signature = ?self.cloak.matched_signature(user_agent),
                "Automated client detected"
            );
        }
        decision
    }

    /// The content variant for a decision.
    pub fn variant(&self, decision: CloakDecision) -> &ContentVariant {
        match decision {
            CloakDecision::Automated => &self.config.cloak.automated,
            CloakDecision::Human => &self.config.cloak.human,
        }
    }

    /// Hand a report to the dispatcher; failures are logged only.
    fn submit(&self, report: Report) -> bool {
        match self.dispatcher.dispatch(report) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Report not dispatched");
                false
            }
        }
    }

    pub fn config(&self) -> &VisitorIntelConfig {
        &self.config
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionCorrelator {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}

fn resolver_leak_tag(record: &SessionRecord) -> Option<String> {
    if !record.resolver_mismatch() {
        return None;
    }
    let resolver = record.resolver_address.as_deref()?;
    Some(AnomalyKind::AddressLeak.tag_with(format!(
        "dns resolver {} != server {}",
        resolver, record.observed_address
    )))
}
