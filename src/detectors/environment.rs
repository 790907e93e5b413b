//! Client environment rules: software rendering and private browsing.

use super::{AnomalyKind, AnomalyRule, DetectionContext};
use crate::config::DetectionConfig;
use regex::Regex;

/// Graphics renderer matching a software fallback.
pub struct SoftwareRendererRule {
    /// Compiled signatures with their display names
    signatures: Vec<(Regex, String)>,
}

impl SoftwareRendererRule {
    /// Compile renderer signatures; matching is case-insensitive substring.
    pub fn new(signatures: &[String]) -> Self {
        let signatures = signatures
            .iter()
            .filter(|s| !s.trim().is_empty())
            .filter_map(|s| {
                Regex::new(&format!("(?i){}", regex::escape(s.trim())))
                    .ok()
                    .map(|re| (re, s.trim().to_string()))
            })
            .collect();

        Self { signatures }
    }
}

impl Default for SoftwareRendererRule {
    fn default() -> Self {
        Self::new(&DetectionConfig::default().software_renderers)
    }
}

impl AnomalyRule for SoftwareRendererRule {
    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<String> {
        let Some(renderer) = ctx.telemetry.fingerprint.webgl_renderer.as_deref() else {
            return vec![];
        };

        self.signatures
            .iter()
            .find(|(pattern, _)| pattern.is_match(renderer))
            .map(|(_, name)| vec![AnomalyKind::VirtualizationIndicator.tag_with(name)])
            .unwrap_or_default()
    }

    fn name(&self) -> &'static str {
        "software_renderer"
    }
}

/// Client reports private browsing.
pub struct PrivateModeRule;

impl AnomalyRule for PrivateModeRule {
    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<String> {
        if ctx.telemetry.system.private_mode == Some(true) {
            vec![AnomalyKind::PrivacyMode.tag()]
        } else {
            vec![]
        }
    }

    fn name(&self) -> &'static str {
        "private_mode"
    }
}
