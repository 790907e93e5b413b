//! Report aggregate handed to the dispatcher.

use crate::detectors::AnomalySet;
use crate::device::DeviceProfile;
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Report shipped to the sink.
///
/// Built once per event and moved into the dispatcher; nothing mutates it
/// afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// What caused the report (page load, click, pixel, side channel)
    pub trigger: String,

    /// Address observed for the requester
    pub ip: String,

    /// Declared User-Agent
    pub user_agent: String,

    /// Creation time
    pub timestamp: DateTime<Utc>,

    /// Deduplicated anomaly tags
    pub anomalies: Vec<String>,

    /// Raw client telemetry or event details
    pub details: Value,

    /// Inferred device
    pub device: DeviceProfile,

    /// Visitor token, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visitor_id: Option<String>,

    /// Correlated session, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Report {
    /// Create a report with no anomalies and empty details.
    pub fn new(
        trigger: impl Into<String>,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            trigger: trigger.into(),
            ip: ip.into(),
            user_agent: user_agent.into(),
            timestamp: Utc::now(),
            anomalies: vec![],
            details: Value::Object(Default::default()),
            device: DeviceProfile {
                model: crate::device::UNKNOWN_DEVICE.to_string(),
                os: None,
            },
            visitor_id: None,
            session_id: None,
        }
    }

    /// Create a report for a telemetry submission.
    pub fn from_telemetry(
        telemetry: &Telemetry,
        ip: impl Into<String>,
        user_agent: impl Into<String>,
        anomalies: AnomalySet,
    ) -> Self {
        let user_agent = user_agent.into();
        let device = DeviceProfile::infer(telemetry, &user_agent);
        Self::new(telemetry.trigger(), ip, user_agent)
            .with_anomalies(anomalies)
            .with_details(telemetry.raw.clone())
            .with_device(device)
    }

    /// Set the anomalies.
    pub fn with_anomalies(mut self, anomalies: impl IntoIterator<Item = String>) -> Self {
        self.anomalies = anomalies.into_iter().collect();
        self
    }

    /// Set the details payload.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Set the device profile.
    pub fn with_device(mut self, device: DeviceProfile) -> Self {
        self.device = device;
        self
    }

    /// Attach the visitor token.
    pub fn with_visitor(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = Some(visitor_id.into());
        self
    }

    /// Attach the session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
