//! Header forensics.
//!
//! Looks for requests whose headers do not match the browser they claim:
//! - Missing language preference
//! - Chromium User-Agent without client hints
//! - Automation tool markers

use super::{AnomalyKind, AnomalyRule, DetectionContext};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Headers that indicate automation tools.
static AUTOMATION_HEADERS: LazyLock<BTreeSet<&'static str>> = LazyLock::new(|| {
    BTreeSet::from([
        "x-selenium",
        "x-puppeteer",
        "x-playwright",
        "x-automation",
        "x-headless",
    ])
});

/// Headless markers inside the User-Agent.
static HEADLESS_UA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)headless|phantomjs|electron/").expect("valid regex: headless")
});

/// First Chrome release that always sends `sec-ch-ua`.
const MIN_CLIENT_HINTS_CHROME: u32 = 89;

/// Header forensics rule.
pub struct HeaderForensics {
    /// Headers that indicate automation
    automation_headers: BTreeSet<&'static str>,
}

impl HeaderForensics {
    /// Create a new header rule.
    pub fn new() -> Self {
        Self {
            automation_headers: AUTOMATION_HEADERS.clone(),
        }
    }
}

impl Default for HeaderForensics {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyRule for HeaderForensics {
    fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<String> {
        let mut tags = Vec::new();

        // Every mainstream browser sends a language preference
        let has_language = ctx
            .header("accept-language")
            .is_some_and(|v| !v.trim().is_empty());
        if !has_language {
            tags.push(AnomalyKind::HeaderForgery.tag());
        }

        let ua = ctx.user_agent().unwrap_or("");

        // Chrome 89+ sends sec-ch-ua on every request
        let claims_chrome = ua.contains("Chrome/") && !ua.contains("Chromium/");
        if claims_chrome && !ctx.headers.contains_key("sec-ch-ua") {
            if let Some(version) = extract_chrome_version(ua) {
                if version >= MIN_CLIENT_HINTS_CHROME {
                    tags.push(AnomalyKind::AutomationIndicator.tag());
                }
            }
        }

        if HEADLESS_UA.is_match(ua) {
            tags.push(AnomalyKind::AutomationIndicator.tag_with("headless user-agent"));
        }

        for header in &self.automation_headers {
            if ctx.headers.contains_key(*header) {
                tags.push(AnomalyKind::AutomationIndicator.tag_with(*header));
            }
        }

        tags
    }

    fn name(&self) -> &'static str {
        "header_forensics"
    }
}

/// Extract Chrome version from User-Agent string.
fn extract_chrome_version(ua: &str) -> Option<u32> {
    let chrome_idx = ua.find("Chrome/")?;
    let version_start = chrome_idx + 7;
    let rest = &ua[version_start..];
    let version_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..version_end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Telemetry;
    use std::collections::HashMap;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn evaluate(headers: Vec<(&str, &str)>) -> Vec<String> {
        let mut h = HashMap::new();
        for (k, v) in headers {
            h.entry(k.to_lowercase())
                .or_insert_with(Vec::new)
                .push(v.to_string());
        }
        let telemetry = Telemetry::default();
        let ctx = DetectionContext {
            server_address: "1.2.3.4",
            headers: &h,
            telemetry: &telemetry,
        };
        HeaderForensics::new().evaluate(&ctx)
    }

    #[test]
    fn test_full_chrome_headers_clean() {
        let tags = evaluate(vec![
            ("user-agent", CHROME_UA),
            ("accept-language", "en-US,en;q=0.9"),
            ("sec-ch-ua", "\"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\""),
        ]);
        assert!(tags.is_empty(), "unexpected: {:?}", tags);
    }

    #[test]
    fn test_chrome_without_client_hints() {
        let tags = evaluate(vec![
            ("user-agent", CHROME_UA),
            ("accept-language", "en-US"),
        ]);
        assert_eq!(tags, vec!["automation-indicator"]);
    }

    #[test]
    fn test_old_chrome_without_client_hints() {
        let tags = evaluate(vec![
            ("user-agent", "Mozilla/5.0 Chrome/80.0.3987.0 Safari/537.36"),
            ("accept-language", "en-US"),
        ]);
        assert!(tags.is_empty());
    }

    #[test]
    fn test_firefox_needs_no_client_hints() {
        let tags = evaluate(vec![
            (
                "user-agent",
                "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
            ),
            ("accept-language", "de-DE"),
        ]);
        assert!(tags.is_empty());
    }

    #[test]
    fn test_missing_language_is_forgery() {
        let tags = evaluate(vec![("user-agent", "curl/8.4.0")]);
        assert_eq!(tags, vec!["header-forgery"]);

        let tags = evaluate(vec![("user-agent", "curl/8.4.0"), ("accept-language", " ")]);
        assert_eq!(tags, vec!["header-forgery"]);
    }

    #[test]
    fn test_automation_markers() {
        let tags = evaluate(vec![
            ("user-agent", "Mozilla/5.0 HeadlessChrome/120.0.0.0"),
            ("accept-language", "en"),
            ("x-selenium", "1"),
        ]);
        assert!(tags.contains(&"automation-indicator: headless user-agent".to_string()));
        assert!(tags.contains(&"automation-indicator: x-selenium".to_string()));
    }

    #[test]
    fn test_chrome_version_extraction() {
        assert_eq!(extract_chrome_version("Mozilla/5.0 Chrome/120.0.0.0"), Some(120));
        assert_eq!(extract_chrome_version("Mozilla/5.0 Chrome/89"), Some(89));
        assert_eq!(extract_chrome_version("Mozilla/5.0 Firefox/120"), None);
    }
}
