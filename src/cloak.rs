//! Cloak decision: automated client or human visitor.
//!
//! Classification is a case-insensitive substring match against a versioned
//! list of crawler signatures. The first matching signature wins. Anything
//! that does not match, including a missing User-Agent, is treated as human:
//! a crawler slipping through is acceptable, hiding content from a person is
//! not.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloakDecision {
    Automated,
    Human,
}

impl CloakDecision {
    /// Returns the decision as a string for headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            CloakDecision::Automated => "automated",
            CloakDecision::Human => "human",
        }
    }
}

/// Versioned crawler signature list as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureSet {
    /// Data version, logged at startup
    pub version: String,
    /// User-Agent substrings
    pub signatures: Vec<String>,
}

impl Default for SignatureSet {
    fn default() -> Self {
        Self {
            version: "builtin-1".to_string(),
            signatures: [
                // Search engines
                "googlebot",
                "bingbot",
                "yandexbot",
                "baiduspider",
                "duckduckbot",
                "applebot",
                // Link previews
                "facebookexternalhit",
                "twitterbot",
                "slackbot",
                "telegrambot",
                "whatsapp",
                "discordbot",
                "linkedinbot",
                // Security scanners
                "safebrowsing",
                "virustotal",
                "urlscan",
                "phishtank",
                "netcraft",
                "censys",
                "zgrab",
                "nuclei",
                // Generic tooling
                "headlesschrome",
                "python-requests",
                "go-http-client",
                "curl/",
                "wget/",
                "crawler",
                "spider",
                "bot/",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl SignatureSet {
    /// Load a signature set from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// Crawler classifier.
pub struct CloakClassifier {
    /// Lowercased signatures, in priority order
    signatures: Vec<String>,
    /// Data version
    version: String,
}

impl CloakClassifier {
    /// Create a classifier from a signature set.
    pub fn new(set: SignatureSet) -> Self {
        let signatures = set
            .signatures
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            signatures,
            version: set.version,
        }
    }

    /// Load signatures from `path`, falling back to the built-in list when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let set = if path.exists() {
            SignatureSet::from_file(path)?
        } else {
            SignatureSet::default()
        };

        let classifier = Self::new(set);
        info!(
            version = %classifier.version,
            signatures = classifier.signatures.len(),
            "Crawler signatures loaded"
        );
        Ok(classifier)
    }

    /// Classify a User-Agent.
    pub fn classify(&self, user_agent: Option<&str>) -> CloakDecision {
        if self.matched_signature(user_agent).is_some() {
            CloakDecision::Automated
        } else {
            CloakDecision::Human
        }
    }

    /// The first signature contained in the User-Agent, if any.
    pub fn matched_signature(&self, user_agent: Option<&str>) -> Option<&str> {
        let ua_lower = user_agent?.to_lowercase();
        self.signatures
            .iter()
            .find(|signature| ua_lower.contains(signature.as_str()))
            .map(|s| s.as_str())
    }

    /// Signature data version.
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Default for CloakClassifier {
    fn default() -> Self {
        Self::new(SignatureSet::default())
    }
}
