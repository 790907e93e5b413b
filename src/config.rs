//! Configuration types for the visitor intelligence engine.

use serde::{Deserialize, Serialize};

/// Main configuration for the visitor intelligence engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VisitorIntelConfig {
    /// Visitor token settings
    pub identity: IdentityConfig,

    /// Session correlation settings
    pub sessions: SessionConfig,

    /// Anomaly detection settings
    pub detection: DetectionConfig,

    /// Cloak-gated content settings
    pub cloak: CloakConfig,

    /// Report dispatch settings
    pub dispatch: DispatchConfig,

    /// HTTP server settings
    pub server: ServerConfig,

    /// Include debug headers in responses
    pub debug_headers: bool,
}

/// Visitor token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// `max-age` advertised alongside the validator, in seconds
    pub max_age_seconds: u64,

    /// Secret for the HMAC tag embedded in minted tokens
    pub token_secret: String,

    /// Maximum visitor ledger entries
    pub ledger_capacity: u64,

    /// Visitor ledger TTL in seconds
    pub ledger_ttl_seconds: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            max_age_seconds: 31_536_000,
            token_secret: "change-me-in-production".to_string(),
            ledger_capacity: 100_000,
            ledger_ttl_seconds: 30 * 24 * 3600,
        }
    }
}

/// Session correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum sessions to track
    pub max_sessions: usize,

    /// Session lifetime in seconds
    pub session_ttl_seconds: u64,

    /// Sweep expired sessions every N operations
    pub sweep_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100_000,
            session_ttl_seconds: 3600,
            sweep_interval: 1000,
        }
    }
}

/// Anomaly detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Enable header forensics
    pub header_forensics: bool,

    /// Enable address leak rules (peer, secondary stack, local topology)
    pub network_leaks: bool,

    /// Enable client environment rules (renderer, private mode)
    pub environment: bool,

    /// Merge client self-reported anomalies into the result
    pub accept_client_anomalies: bool,

    /// Graphics renderer substrings that indicate software rendering
    pub software_renderers: Vec<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            header_forensics: true,
            network_leaks: true,
            environment: true,
            accept_client_anomalies: true,
            software_renderers: vec![
                "SwiftShader".to_string(),
                "llvmpipe".to_string(),
                "softpipe".to_string(),
                "Mesa OffScreen".to_string(),
                "Microsoft Basic Render Driver".to_string(),
                "VMware SVGA".to_string(),
                "VirtualBox".to_string(),
                "Parallels".to_string(),
            ],
        }
    }
}

/// Cloak-gated content settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloakConfig {
    /// Variant served to human visitors
    pub human: ContentVariant,

    /// Variant served to automated clients
    pub automated: ContentVariant,
}

impl Default for CloakConfig {
    fn default() -> Self {
        Self {
            human: ContentVariant {
                content_type: "text/html; charset=utf-8".to_string(),
                body: "<!doctype html><title>Shared files</title><main id=\"files\"></main>"
                    .to_string(),
            },
            automated: ContentVariant {
                content_type: "text/html; charset=utf-8".to_string(),
                body: "<!doctype html><title>File sharing</title><p>Nothing to see here.</p>"
                    .to_string(),
            },
        }
    }
}

/// A static response variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentVariant {
    /// Content-Type header value
    pub content_type: String,

    /// Response body
    pub body: String,
}

/// Report dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Sink endpoint; reports are only logged when unset
    pub sink_url: Option<String>,

    /// Number of delivery workers
    pub workers: usize,

    /// Maximum queued reports before new ones are dropped
    pub queue_capacity: usize,

    /// Per-delivery timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            sink_url: None,
            workers: 4,
            queue_capacity: 1024,
            timeout_ms: 5000,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Peers allowed to set X-Forwarded-For (CIDR notation)
    pub trusted_proxies: Vec<String>,

    /// Maximum accepted request body in bytes
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            trusted_proxies: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            max_body_bytes: 256 * 1024,
        }
    }
}
