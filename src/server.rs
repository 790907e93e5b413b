//! HTTP surface.
//!
//! Every handler answers immediately; detection and dispatch outcomes never
//! change the status code of a telemetry or callback request.

use crate::engine::{CollectRequest, VisitorIntelEngine};
use crate::identity::PIXEL_GIF;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH, USER_AGENT, VARY};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Field names accepted for the queried hostname in a side-channel callback.
const HOSTNAME_FIELDS: &[&str] = &["hostname", "host", "domain", "name", "query", "qname"];

/// Field names accepted for the resolver address in a side-channel callback.
const ADDRESS_FIELDS: &[&str] = &[
    "ip",
    "address",
    "remote_addr",
    "resolver",
    "resolver_ip",
    "src_ip",
    "source_ip",
    "client_ip",
];

const X_CLOAK_DECISION: HeaderName = HeaderName::from_static("x-cloak-decision");
const X_ANOMALY_COUNT: HeaderName = HeaderName::from_static("x-anomaly-count");
const X_VISITOR_RETURNING: HeaderName = HeaderName::from_static("x-visitor-returning");

type SharedEngine = Arc<VisitorIntelEngine>;

/// Build the router.
pub fn router(engine: SharedEngine) -> Router {
    let body_limit = engine.config().server.max_body_bytes;

    Router::new()
        .route("/health", get(health))
        .route("/pixel.gif", get(pixel))
        .route("/api/session", post(register_session))
        .route("/api/collect", post(collect))
        .route("/api/dns-callback", post(dns_callback))
        .route("/", get(gated_content))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(engine)
}

/// Serve the router on `listener` until the process stops.
pub async fn serve(listener: TcpListener, engine: SharedEngine) -> anyhow::Result<()> {
    info!(address = %listener.local_addr()?, "HTTP server listening");
    let app = router(engine);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Default, Deserialize)]
struct PixelQuery {
    source: Option<String>,
    uid: Option<String>,
}

async fn pixel(
    State(engine): State<SharedEngine>,
    connect: Option<ConnectInfo<SocketAddr>>,
    query: Option<Query<PixelQuery>>,
    headers: HeaderMap,
) -> Response {
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let (identity, record) = engine.identify(header_str(&headers, IF_NONE_MATCH)).await;

    if let Some(source) = query.source.as_deref().filter(|s| !s.trim().is_empty()) {
        let fields = header_fields(&headers);
        let address = engine.client_address(peer(connect), &fields);
        let user_agent = header_str(&headers, USER_AGENT).unwrap_or("");
        info!(
            client_ip = %address,
            source = %source,
            hits = record.hits,
            "Pixel fetched from embedded source"
        );
        engine.pixel_event(source, query.uid.as_deref(), &address, user_agent, &identity.token);
    }

    let mut response = if identity.returning {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        ([(CONTENT_TYPE, "image/gif")], PIXEL_GIF.to_vec()).into_response()
    };

    let response_headers = response.headers_mut();
    set_validator(&engine, response_headers, &identity.token);
    if engine.config().debug_headers {
        response_headers.insert(
            X_VISITOR_RETURNING,
            HeaderValue::from_static(if identity.returning { "true" } else { "false" }),
        );
    }
    response
}

#[derive(Debug, Default, Deserialize)]
struct SessionRequest {
    #[serde(alias = "sessionId", alias = "sid")]
    session_id: Option<String>,
}

async fn register_session(
    State(engine): State<SharedEngine>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request: SessionRequest = serde_json::from_slice(&body).unwrap_or_default();
    let Some(session_id) = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "error": "missing session_id"})),
        )
            .into_response();
    };

    let fields = header_fields(&headers);
    let address = engine.client_address(peer(connect), &fields);
    engine.register_session(session_id, &address);

    Json(json!({"status": "ok", "session_id": session_id.to_lowercase()})).into_response()
}

async fn collect(
    State(engine): State<SharedEngine>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let fields = header_fields(&headers);
    let address = engine.client_address(peer(connect), &fields);

    let outcome = engine
        .collect(CollectRequest {
            address: &address,
            headers: &fields,
            body: &body,
            validator: header_str(&headers, IF_NONE_MATCH),
        })
        .await;

    let mut response = Json(json!({
        "status": "ok",
        "visitor": outcome.visitor,
        "returning": outcome.returning,
    }))
    .into_response();
    set_validator(&engine, response.headers_mut(), &outcome.visitor);

    if engine.config().debug_headers {
        if let Ok(count) = HeaderValue::from_str(&outcome.anomalies.len().to_string()) {
            response.headers_mut().insert(X_ANOMALY_COUNT, count);
        }
    }
    response
}

async fn dns_callback(
    State(engine): State<SharedEngine>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let fields = callback_fields(&headers, &body);
    let hostname = first_field(&fields, HOSTNAME_FIELDS);
    let address = first_field(&fields, ADDRESS_FIELDS);

    let correlated = match (hostname, address) {
        (Some(hostname), Some(address)) => engine.dns_observation(hostname, address).is_some(),
        _ => {
            debug!(
                fields = ?fields.keys().collect::<Vec<_>>(),
                "Side-channel callback missing fields"
            );
            false
        }
    };

    Json(json!({"status": "ok", "correlated": correlated}))
}

async fn gated_content(State(engine): State<SharedEngine>, headers: HeaderMap) -> Response {
    let decision = engine.classify(header_str(&headers, USER_AGENT));
    let variant = engine.variant(decision);

    let mut response = (
        [
            (CONTENT_TYPE, variant.content_type.clone()),
            (VARY, "User-Agent".to_string()),
            (CACHE_CONTROL, "no-store".to_string()),
        ],
        variant.body.clone(),
    )
        .into_response();

    if engine.config().debug_headers {
        response
            .headers_mut()
            .insert(X_CLOAK_DECISION, HeaderValue::from_static(decision.as_str()));
    }
    response
}

/// Attach the visitor token as `ETag` with its private cache directive.
fn set_validator(engine: &VisitorIntelEngine, headers: &mut HeaderMap, token: &str) {
    if let Ok(etag) = HeaderValue::from_str(&engine.identity().etag(token)) {
        headers.insert(ETAG, etag);
    }
    if let Ok(cache_control) = HeaderValue::from_str(&engine.identity().cache_control()) {
        headers.insert(CACHE_CONTROL, cache_control);
    }
}

fn peer(connect: Option<ConnectInfo<SocketAddr>>) -> Option<SocketAddr> {
    connect.map(|ConnectInfo(addr)| addr)
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Collect headers into lowercase name → values.
fn header_fields(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut fields: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            fields
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    fields
}

/// Flatten a callback body (JSON object or urlencoded form) into lowercase
/// keys and string values.
fn callback_fields(headers: &HeaderMap, body: &[u8]) -> HashMap<String, String> {
    let declared_json = header_str(headers, CONTENT_TYPE).is_some_and(|ct| ct.contains("json"));
    let looks_json = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');

    if declared_json || looks_json {
        let Ok(map) = serde_json::from_slice::<serde_json::Map<String, Value>>(body) else {
            return HashMap::new();
        };
        return map
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key.to_lowercase(), value))
            })
            .collect();
    }

    serde_urlencoded::from_bytes::<Vec<(String, String)>>(body)
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key.to_lowercase(), value))
        .collect()
}

fn first_field<'a>(fields: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|name| fields.get(*name))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers
    }

    #[test]
    fn test_callback_fields_json() {
        let fields = callback_fields(
            &json_headers(),
            br#"{"QName": "abc.x.example.com", "src_ip": "9.9.9.9", "port": 53, "extra": {}}"#,
        );
        assert_eq!(first_field(&fields, HOSTNAME_FIELDS), Some("abc.x.example.com"));
        assert_eq!(first_field(&fields, ADDRESS_FIELDS), Some("9.9.9.9"));
        assert_eq!(fields.get("port").map(String::as_str), Some("53"));
        assert!(!fields.contains_key("extra"));
    }

    #[test]
    fn test_callback_fields_form() {
        let fields = callback_fields(
            &HeaderMap::new(),
            b"domain=abc.x.example.com&resolver=9.9.9.9",
        );
        assert_eq!(first_field(&fields, HOSTNAME_FIELDS), Some("abc.x.example.com"));
        assert_eq!(first_field(&fields, ADDRESS_FIELDS), Some("9.9.9.9"));
    }

    #[test]
    fn test_callback_fields_sniffs_json() {
        let fields = callback_fields(
            &HeaderMap::new(),
            b"  {\"host\": \"a.b.c.d\", \"ip\": \"1.1.1.1\"}",
        );
        assert_eq!(first_field(&fields, HOSTNAME_FIELDS), Some("a.b.c.d"));
    }

    #[test]
    fn test_callback_fields_malformed() {
        assert!(callback_fields(&json_headers(), b"{not json").is_empty());
        assert!(callback_fields(&json_headers(), b"[1, 2]").is_empty());
    }

    #[test]
    fn test_first_field_skips_blank() {
        let mut fields = HashMap::new();
        fields.insert("hostname".to_string(), "  ".to_string());
        fields.insert("host".to_string(), "a.b.c.d".to_string());
        assert_eq!(first_field(&fields, HOSTNAME_FIELDS), Some("a.b.c.d"));
    }

    #[test]
    fn test_header_fields_lowercase() {
        let mut headers = HeaderMap::new();
        headers.append("Accept-Language", HeaderValue::from_static("en"));
        headers.append("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("2.2.2.2"));

        let fields = header_fields(&headers);
        assert_eq!(fields["accept-language"], vec!["en"]);
        assert_eq!(fields["x-forwarded-for"].len(), 2);
    }
}
