use std::fmt;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use serde::Serialize;
use serde_json::{Map, Value};

pub const DEFAULT_RECLAIM_PATH: &str = "/v1/reclaim-scheduled";
pub const DEFAULT_NONCE_HEADER: &str = "x-ibm-nonce";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Body fields every reclaim notification must carry.
pub const RECLAIM_REQUIRED_FIELDS: [&str; 5] = ["id", "serviceName", "event", "timestamp", "link"];

/// Structured notification sent by the hosting infrastructure shortly before
/// it reclaims a transient instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimNotice {
    pub id: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub event: String,
    pub timestamp: String,
    pub link: String,
    pub nonce: String,
}

/// Accepts `{id}` job submissions from schedulers and clients.
#[async_trait]
pub trait JobTrigger: Send + Sync + 'static {
    /// Start (or no-op for already terminal jobs) the job identified by `job_id`.
    async fn trigger(&self, job_id: String) -> Result<String, HandlerError>;
}

/// Handles validated preemption notifications.
#[async_trait]
pub trait PreemptionReceiver: Send + Sync + 'static {
    async fn reclaim(&self, notice: ReclaimNotice) -> Result<String, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct HandlerError {
    pub kind: HandlerErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerErrorKind {
    InvalidRequest,
    NotFound,
    Internal,
}

impl HandlerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::InvalidRequest,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::NotFound,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError {
            kind: HandlerErrorKind::Internal,
            message: message.into(),
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Check that a reclaim callback carries the expected headers and body fields.
///
/// Only presence is checked. The nonce and authorization values are not yet
/// verified against a signature.
// TODO: verify the HMAC-SHA256 signature in `authorization` over the canonical
// request string (method, path, nonce, body digest) using the webhook secret.
pub fn validate_reclaim_request(
    headers: &HeaderMap,
    nonce_header: &str,
    body: &[u8],
) -> Result<ReclaimNotice, HandlerError> {
    debug_assert!(!nonce_header.is_empty());

    let content_type = header_text(headers, header::CONTENT_TYPE.as_str())
        .ok_or_else(|| HandlerError::invalid("Missing Content-Type header"))?;
    if !content_type.starts_with(JSON_CONTENT_TYPE) {
        return Err(HandlerError::invalid(format!(
            "Unsupported Content-Type `{content_type}`; expected {JSON_CONTENT_TYPE}"
        )));
    }
    let nonce = header_text(headers, nonce_header)
        .ok_or_else(|| HandlerError::invalid(format!("Missing {nonce_header} header")))?;
    if header_text(headers, header::AUTHORIZATION.as_str()).is_none() {
        return Err(HandlerError::invalid("Missing Authorization header"));
    }

    let payload: Value = serde_json::from_slice(body)
        .map_err(|err| HandlerError::invalid(format!("Request body is not JSON: {err}")))?;
    let Value::Object(fields) = payload else {
        return Err(HandlerError::invalid("Request body must be a JSON object"));
    };

    let missing: Vec<&str> = RECLAIM_REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|name| field_text(&fields, name).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(HandlerError::invalid(format!(
            "Missing required fields: {}",
            missing.join(", ")
        )));
    }

    Ok(ReclaimNotice {
        id: field_text(&fields, "id").unwrap_or_default(),
        service_name: field_text(&fields, "serviceName").unwrap_or_default(),
        event: field_text(&fields, "event").unwrap_or_default(),
        timestamp: field_text(&fields, "timestamp").unwrap_or_default(),
        link: field_text(&fields, "link").unwrap_or_default(),
        nonce,
    })
}

fn header_text(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn field_text(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn valid_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(DEFAULT_NONCE_HEADER, HeaderValue::from_static("n-123"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("sig"));
        headers
    }

    fn valid_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "1234",
            "serviceName": "compute",
            "event": "reclaim-scheduled",
            "timestamp": 1_700_000_000,
            "link": "https://example.invalid/instances/1234"
        }))
        .expect("serialize body")
    }

    #[test]
    fn accepts_complete_request() {
        let notice = validate_reclaim_request(&valid_headers(), DEFAULT_NONCE_HEADER, &valid_body())
            .expect("valid request");
        assert_eq!(notice.id, "1234");
        assert_eq!(notice.timestamp, "1700000000");
        assert_eq!(notice.nonce, "n-123");
    }

    #[test]
    fn rejects_missing_nonce() {
        let mut headers = valid_headers();
        headers.remove(DEFAULT_NONCE_HEADER);
        let err = validate_reclaim_request(&headers, DEFAULT_NONCE_HEADER, &valid_body())
            .expect_err("nonce required");
        assert_eq!(err.kind, HandlerErrorKind::InvalidRequest);
        assert!(err.message.contains(DEFAULT_NONCE_HEADER));
    }

    #[test]
    fn rejects_wrong_content_type() {
        let mut headers = valid_headers();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let err = validate_reclaim_request(&headers, DEFAULT_NONCE_HEADER, &valid_body())
            .expect_err("json required");
        assert!(err.message.contains("Content-Type"));
    }

    #[test]
    fn lists_every_missing_field() {
        let body = serde_json::to_vec(&json!({ "id": "1234", "event": "" })).expect("body");
        let err = validate_reclaim_request(&valid_headers(), DEFAULT_NONCE_HEADER, &body)
            .expect_err("fields required");
        assert_eq!(
            err.message,
            "Missing required fields: serviceName, event, timestamp, link"
        );
    }

    #[test]
    fn unsigned_authorization_still_passes() {
        let mut headers = valid_headers();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("garbage"));
        assert!(validate_reclaim_request(&headers, DEFAULT_NONCE_HEADER, &valid_body()).is_ok());
    }
}
