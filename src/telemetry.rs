//! Client telemetry document.
//!
//! Every section is optional and parsed on its own, and so is every field in
//! it: a missing, null or mistyped value becomes its default without touching
//! its neighbours. Keys that no section claims are kept in
//! [`Telemetry::extra`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Trigger reported when the client did not name one.
pub const UNKNOWN_TRIGGER: &str = "Unknown";

/// Page/event metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    #[serde(deserialize_with = "lenient")]
    pub trigger: Option<String>,
    #[serde(alias = "sessionId", alias = "sid", deserialize_with = "lenient")]
    pub session_id: Option<String>,
    #[serde(alias = "visitorId", alias = "visitor", deserialize_with = "lenient")]
    pub visitor_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub url: Option<String>,
}

/// Hardware fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fingerprint {
    #[serde(alias = "webglRenderer", deserialize_with = "lenient")]
    pub webgl_renderer: Option<String>,
    #[serde(alias = "webglVendor", deserialize_with = "lenient")]
    pub webgl_vendor: Option<String>,
    /// `WIDTHxHEIGHT` in CSS pixels
    #[serde(deserialize_with = "lenient")]
    pub screen: Option<String>,
    #[serde(alias = "pixelRatio", deserialize_with = "lenient")]
    pub pixel_ratio: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub cores: Option<u32>,
    /// Approximate device memory in GB
    #[serde(deserialize_with = "lenient")]
    pub memory: Option<f64>,
}

/// Operating environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    #[serde(deserialize_with = "lenient")]
    pub platform: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub timezone: Option<String>,
    #[serde(deserialize_with = "string_list")]
    pub languages: Vec<String>,
    pub battery: Option<Value>,
    #[serde(deserialize_with = "lenient")]
    pub touch: Option<bool>,
    /// Client-side private browsing heuristic
    #[serde(alias = "privateMode", alias = "incognito", deserialize_with = "lenient")]
    pub private_mode: Option<bool>,
}

/// Network observations made by the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInfo {
    /// Host candidate addresses
    #[serde(alias = "localIPs", deserialize_with = "string_list")]
    pub local_ips: Vec<String>,
    /// Addresses seen through peer connections (reflexive candidates)
    #[serde(
        alias = "peerIPs",
        alias = "webrtcIPs",
        alias = "publicIPs",
        deserialize_with = "string_list"
    )]
    pub peer_ips: Vec<String>,
    /// Address reached over the secondary network stack
    #[serde(alias = "ipv6", alias = "secondaryIP", deserialize_with = "lenient")]
    pub secondary_address: Option<String>,
    /// Gateway found by the local network scan
    #[serde(deserialize_with = "lenient")]
    pub gateway: Option<String>,
    /// Other hosts found by the local network scan
    #[serde(alias = "lanHosts", deserialize_with = "string_list")]
    pub lan_hosts: Vec<String>,
}

/// User-Agent client hints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientHints {
    #[serde(deserialize_with = "lenient")]
    pub model: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub platform: Option<String>,
    #[serde(alias = "version", alias = "platformVersion", deserialize_with = "lenient")]
    pub platform_version: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub mobile: Option<bool>,
}

/// Field deserializer that turns a null or mistyped value into the default.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Field deserializer for address and name lists: keeps the string entries,
/// accepts a bare string, and yields an empty list for anything else.
fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(strings)
}

fn strings(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        Value::String(s) => vec![s],
        _ => vec![],
    }
}

/// Parsed telemetry document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub meta: Meta,
    pub fingerprint: Fingerprint,
    pub system: SystemInfo,
    pub network: NetworkInfo,
    pub fonts: Vec<String>,
    pub client_hints: ClientHints,
    /// Anomalies the client already detected on its own
    pub anomalies: Vec<String>,
    /// Unclaimed top-level keys
    pub extra: BTreeMap<String, Value>,
    /// The document as received
    pub raw: Value,
}

impl Telemetry {
    /// Parse a request body. Anything that is not a JSON object yields an
    /// empty document.
    pub fn from_slice(body: &[u8]) -> Self {
        if body.is_empty() {
            return Self::from_value(Value::Object(Map::new()));
        }
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                debug!(error = %e, "Telemetry body is not JSON, using empty document");
                Self::from_value(Value::Object(Map::new()))
            }
        }
    }

    /// Build from an already parsed JSON value.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut map) = value else {
            return Self {
                raw: Value::Object(Map::new()),
                ..Default::default()
            };
        };
        let raw = Value::Object(map.clone());

        let meta = section(&mut map, &["meta"]);
        let fingerprint = section(&mut map, &["fingerprint"]);
        let system = section(&mut map, &["system"]);
        let network = section(&mut map, &["network"]);
        let fonts = take(&mut map, &["fonts"]).map(strings).unwrap_or_default();
        let client_hints = section(&mut map, &["client_hints", "clientHints"]);
        let anomalies = take(&mut map, &["anomalies"])
            .map(strings)
            .unwrap_or_default();

        Self {
            meta,
            fingerprint,
            system,
            network,
            fonts,
            client_hints,
            anomalies,
            extra: map.into_iter().collect(),
            raw,
        }
    }

    /// The client-named trigger, or [`UNKNOWN_TRIGGER`].
    pub fn trigger(&self) -> &str {
        self.meta
            .trigger
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNKNOWN_TRIGGER)
    }

    /// Session id declared by the client, if any.
    pub fn session_id(&self) -> Option<&str> {
        self.meta
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Remove every alias of a section from `map`, keeping the first one present.
fn take(map: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        if let Some(value) = map.remove(*key) {
            found.get_or_insert(value);
        }
    }
    found
}

/// Take a section out of `map` and parse it, defaulting when it is not an
/// object.
fn section<T: DeserializeOwned + Default>(map: &mut Map<String, Value>, keys: &[&str]) -> T {
    take(map, keys)
        .and_then(|value| match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(section = keys[0], error = %e, "Malformed telemetry section ignored");
                None
            }
        })
        .unwrap_or_default()
}
