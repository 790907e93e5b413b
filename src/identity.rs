//! Persistent visitor identity carried on the HTTP caching validator.
//!
//! A visitor token is handed out as the `ETag` of a tiny image. Compliant
//! clients keep the cached image and send the token back in `If-None-Match`
//! on every revalidation, so the token survives cookie clearing. It does not
//! survive an explicit cache purge, and visitors behind a shared cache may
//! collide (the first token observed wins).
//!
//! Minted tokens are `{nonce}.{tag}` where `tag` is a truncated HMAC-SHA256
//! of the nonce. Echoed tokens are always used verbatim; the tag only lets the
//! engine annotate whether it issued the token itself.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use moka::future::Cache;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Hex characters of the HMAC kept in a minted token.
const TAG_HEX_LEN: usize = 16;

/// Minimal 1x1 transparent GIF89a.
pub const PIXEL_GIF: [u8; 42] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x01, 0x44, 0x00, 0x3b,
];

/// Outcome of resolving the inbound validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorIdentity {
    /// Token to echo back as the validator
    pub token: String,
    /// Whether the client presented the token itself
    pub returning: bool,
}

/// Issues and recognizes visitor tokens.
pub struct IdentityResolver {
    /// Secret key for the token tag
    secret: Vec<u8>,
    /// Advertised cache lifetime in seconds
    max_age_seconds: u64,
}

impl IdentityResolver {
    /// Create a new resolver.
    pub fn new(secret: impl Into<String>, max_age_seconds: u64) -> Self {
        Self {
            secret: secret.into().into_bytes(),
            max_age_seconds,
        }
    }

    /// Resolve the visitor from the raw `If-None-Match` value.
    pub fn resolve(&self, validator: Option<&str>) -> VisitorIdentity {
        match validator.map(strip_quotes).filter(|v| !v.is_empty()) {
            Some(token) => VisitorIdentity {
                token: token.to_string(),
                returning: true,
            },
            None => VisitorIdentity {
                token: self.mint(),
                returning: false,
            },
        }
    }

    /// Mint a fresh token.
    pub fn mint(&self) -> String {
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let tag = self.sign(&nonce);
        format!("{}.{}", nonce, tag)
    }

    /// Whether the token carries a tag issued by this resolver.
    pub fn is_authentic(&self, token: &str) -> bool {
        let Some((nonce, tag)) = token.split_once('.') else {
            return false;
        };
        constant_time_eq(tag.as_bytes(), self.sign(nonce).as_bytes())
    }

    /// `ETag` header value for a token.
    pub fn etag(&self, token: &str) -> String {
        format!("\"{}\"", token)
    }

    /// `Cache-Control` header value sent with the validator.
    pub fn cache_control(&self) -> String {
        format!("private, max-age={}", self.max_age_seconds)
    }

    fn sign(&self, data: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data.as_bytes());
        let mut tag = hex::encode(mac.finalize().into_bytes());
        tag.truncate(TAG_HEX_LEN);
        tag
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new("default-secret-change-me", 31_536_000)
    }
}

/// Strip surrounding whitespace, a weak `W/` marker and one pair of wrapping quotes.
fn strip_quotes(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// What the ledger knows about a token.
#[derive(Debug, Clone, Serialize)]
pub struct VisitorRecord {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hits: u64,
}

/// Bounded, expiring record of tokens seen by this process.
pub struct VisitorLedger {
    inner: Cache<String, VisitorRecord>,
}

impl VisitorLedger {
    /// Create a ledger holding at most `capacity` tokens for `ttl`.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_idle(ttl)
            .build();

        Self { inner }
    }

    /// Record a sighting of `token` and return the updated record.
    pub async fn observe(&self, token: &str) -> VisitorRecord {
        let now = Utc::now();
        let record = match self.inner.get(token).await {
            Some(mut record) => {
                record.last_seen = now;
                record.hits += 1;
                record
            }
            None => VisitorRecord {
                first_seen: now,
                last_seen: now,
                hits: 1,
            },
        };
        self.inner.insert(token.to_string(), record.clone()).await;
        record
    }
}
