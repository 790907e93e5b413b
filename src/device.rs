//! Best-effort device model and OS inference for reports.

use crate::telemetry::Telemetry;
use serde::Serialize;

/// Model reported when nothing better is known.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// iPhone models keyed by `WIDTHxHEIGHT@RATIO`.
const IOS_SCREENS: &[(&str, &str)] = &[
    ("390x844@3", "iPhone 12/13/14"),
    ("428x926@3", "iPhone 12/13/14 Pro Max"),
    ("393x852@3", "iPhone 14/15 Pro"),
    ("430x932@3", "iPhone 14/15 Pro Max"),
    ("375x812@3", "iPhone X/XS/11 Pro"),
    ("414x896@2", "iPhone 11/XR"),
    ("320x568@2", "iPhone SE"),
];

/// Inferred device profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    pub model: String,
    pub os: Option<String>,
}

impl DeviceProfile {
    /// Infer the profile from client hints, then iOS screen geometry, then the
    /// platform string.
    pub fn infer(telemetry: &Telemetry, user_agent: &str) -> Self {
        let hints = &telemetry.client_hints;
        let platform = telemetry.system.platform.as_deref().unwrap_or("");
        let mut model = UNKNOWN_DEVICE.to_string();
        let mut os = telemetry.system.platform.clone();

        if hints.model.is_some() || hints.platform.is_some() {
            if let Some(m) = hints.model.as_deref().filter(|m| !m.is_empty()) {
                model = m.to_string();
            }
            if let Some(p) = hints.platform.as_deref().filter(|p| !p.is_empty()) {
                os = Some(match hints.platform_version.as_deref() {
                    Some(v) if !v.is_empty() => format!("{} {}", p, v),
                    _ => p.to_string(),
                });
            }
        } else if user_agent.contains("iPhone") || user_agent.contains("iPad") {
            model = ios_model(telemetry).unwrap_or("iPhone (Generic)").to_string();
            os = Some("iOS".to_string());
        } else if platform.contains("Win") {
            model = "Windows PC".to_string();
        } else if platform.contains("Mac") {
            model = "Macintosh".to_string();
        } else if platform.contains("Linux") {
            model = "Linux PC".to_string();
        }

        Self { model, os }
    }
}

fn ios_model(telemetry: &Telemetry) -> Option<&'static str> {
    let screen = telemetry.fingerprint.screen.as_deref()?;
    let (w, h) = screen.split_once('x')?;
    let ratio = telemetry.fingerprint.pixel_ratio.unwrap_or(1.0);
    let ratio = if ratio.fract() == 0.0 {
        format!("{:.0}", ratio)
    } else {
        ratio.to_string()
    };
    let key = format!("{}x{}@{}", w.trim(), h.trim(), ratio);
    IOS_SCREENS
        .iter()
        .find(|(screen, _)| *screen == key)
        .map(|(_, model)| *model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const IPHONE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15";

    #[test]
    fn test_client_hints_win() {
        let telemetry = Telemetry::from_value(json!({
            "system": {"platform": "Linux armv8l"},
            "client_hints": {"model": "Pixel 7", "platform": "Android", "platformVersion": "14.0.0"}
        }));
        let profile = DeviceProfile::infer(&telemetry, "Mozilla/5.0 (Linux; Android 10; K)");
        assert_eq!(profile.model, "Pixel 7");
        assert_eq!(profile.os.as_deref(), Some("Android 14.0.0"));
    }

    #[test]
    fn test_iphone_screen_map() {
        let telemetry = Telemetry::from_value(json!({
            "fingerprint": {"screen": "393x852", "pixelRatio": 3}
        }));
        let profile = DeviceProfile::infer(&telemetry, IPHONE_UA);
        assert_eq!(profile.model, "iPhone 14/15 Pro");
        assert_eq!(profile.os.as_deref(), Some("iOS"));
    }

    #[test]
    fn test_unknown_iphone_screen() {
        let telemetry = Telemetry::from_value(json!({
            "fingerprint": {"screen": "999x999", "pixelRatio": 2.5}
        }));
        assert_eq!(DeviceProfile::infer(&telemetry, IPHONE_UA).model, "iPhone (Generic)");

        let telemetry = Telemetry::from_value(json!({}));
        assert_eq!(DeviceProfile::infer(&telemetry, IPHONE_UA).model, "iPhone (Generic)");
    }

    #[test]
    fn test_desktop_fallback() {
        let cases = [
            ("Win32", "Windows PC"),
            ("MacIntel", "Macintosh"),
            ("Linux x86_64", "Linux PC"),
            ("PlayStation", UNKNOWN_DEVICE),
        ];
        for (platform, model) in cases {
            let telemetry = Telemetry::from_value(json!({"system": {"platform": platform}}));
            let profile = DeviceProfile::infer(&telemetry, "Mozilla/5.0");
            assert_eq!(profile.model, model);
            assert_eq!(profile.os.as_deref(), Some(platform));
        }
    }

    #[test]
    fn test_empty_telemetry() {
        let profile = DeviceProfile::infer(&Telemetry::default(), "");
        assert_eq!(profile.model, UNKNOWN_DEVICE);
        assert!(profile.os.is_none());
    }
}
