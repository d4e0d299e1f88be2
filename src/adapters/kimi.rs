//! Kimi adapter — billing gateway, authenticated with the `kimi-auth` cookie.
//!
//! The cookie is a JWT; its payload carries the device/session ids the
//! gateway expects echoed back as headers.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;

use super::{
    classify, http_client, parse_rfc3339, percent_of, FetchError, Outcome, RateLimitWindow,
    UsageFetcher, UsageSnapshot,
};
use crate::tokens::{ProviderId, Token};

const DEFAULT_BASE_URL: &str = "https://www.kimi.com";
const USAGE_PATH: &str = "/apiv2/kimi.gateway.billing.v1.BillingService/GetUsages";
const CODING_SCOPE: &str = "FEATURE_CODING";

#[derive(Debug, Deserialize)]
struct UsageResponse {
    #[serde(default)]
    usages: Vec<Usage>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    scope: String,
    detail: UsageDetail,
    #[serde(default)]
    limits: Vec<WindowLimit>,
}

#[derive(Debug, Deserialize)]
struct WindowLimit {
    detail: UsageDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageDetail {
    limit: Option<String>,
    used: Option<String>,
    reset_time: Option<String>,
}

impl UsageDetail {
    fn into_window(self) -> RateLimitWindow {
        RateLimitWindow::new(
            percent_of(self.used.as_deref(), self.limit.as_deref()),
            parse_rfc3339(self.reset_time.as_deref()),
        )
    }
}

/// Session identifiers carried in the cookie's JWT payload.
#[derive(Debug, Default, PartialEq, Deserialize)]
struct SessionInfo {
    device_id: Option<String>,
    #[serde(rename = "ssid")]
    session_id: Option<String>,
    #[serde(rename = "sub")]
    traffic_id: Option<String>,
}

fn decode_session(jwt: &str) -> Option<SessionInfo> {
    let mut parts = jwt.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub struct KimiUsage {
    client: reqwest::Client,
    base_url: String,
}

impl KimiUsage {
    pub fn new() -> Self {
        Self::with_endpoint(http_client(), DEFAULT_BASE_URL)
    }

    pub fn with_endpoint(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, token: &Token) -> Result<UsageSnapshot, FetchError> {
        let session = decode_session(&token.secret).unwrap_or_default();

        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, USAGE_PATH))
            .bearer_auth(&token.secret)
            .header("cookie", format!("kimi-auth={}", token.secret))
            .header("origin", "https://www.kimi.com")
            .header("referer", "https://www.kimi.com/code/console")
            .header("connect-protocol-version", "1")
            .header("x-language", "en-US")
            .header("x-msh-platform", "web")
            .json(&serde_json::json!({ "scope": [CODING_SCOPE] }));
        if let Some(device) = &session.device_id {
            req = req.header("x-msh-device-id", device);
        }
        if let Some(ssid) = &session.session_id {
            req = req.header("x-msh-session-id", ssid);
        }
        if let Some(traffic) = &session.traffic_id {
            req = req.header("x-traffic-id", traffic);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        if !(200..300).contains(&status) {
            return Err(status_error(status, &body));
        }
        parse_usage(&body)
    }
}

#[async_trait]
impl UsageFetcher for KimiUsage {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Kimi
    }

    async fn attempt(&self, token: &Token) -> Outcome {
        classify(ProviderId::Kimi, self.fetch(token).await)
    }
}

/// The gateway reports some auth problems with generic statuses.
fn status_error(status: u16, body: &str) -> FetchError {
    match FetchError::from_status(status) {
        FetchError::Status(_) if body.contains("unauthenticated") || body.contains("INVALID_AUTH") => {
            FetchError::InvalidAuth
        }
        other => other,
    }
}

fn parse_usage(body: &str) -> Result<UsageSnapshot, FetchError> {
    let data: UsageResponse = serde_json::from_str(body)?;
    let coding = data
        .usages
        .into_iter()
        .find(|u| u.scope == CODING_SCOPE)
        .ok_or_else(|| FetchError::Parse(format!("{} scope not found", CODING_SCOPE)))?;

    let five_hour = coding
        .limits
        .into_iter()
        .next()
        .map(|limit| limit.detail.into_window());

    Ok(UsageSnapshot::usage(
        ProviderId::Kimi.as_str(),
        five_hour,
        Some(coding.detail.into_window()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coding_scope() {
        let body = r#"{"usages":[
            {"scope":"FEATURE_CHAT","detail":{"limit":"10","used":"10","resetTime":"2026-01-01T00:00:00Z"}},
            {"scope":"FEATURE_CODING",
             "detail":{"limit":"2000","used":"500","remaining":"1500","resetTime":"2026-01-08T00:00:00Z"},
             "limits":[{"window":{"duration":300,"timeUnit":"TIME_UNIT_MINUTE"},
                        "detail":{"limit":"200","used":"50","resetTime":"2026-01-01T05:00:00Z"}}]}
        ]}"#;
        let snapshot = parse_usage(body).unwrap();
        assert_eq!(snapshot.provider, "kimi");
        assert_eq!(snapshot.weekly_limit.as_ref().unwrap().used_percent, 25.0);
        let five = snapshot.five_hour_limit.unwrap();
        assert_eq!(five.used_percent, 25.0);
        assert!(five.resets_at.is_some());
    }

    #[test]
    fn test_missing_coding_scope_is_transient() {
        let err = parse_usage(r#"{"usages":[]}"#).unwrap_err();
        assert!(!err.is_auth());
        assert_eq!(err.to_string(), "FEATURE_CODING scope not found");
    }

    #[test]
    fn test_status_error_detects_auth_bodies() {
        assert!(status_error(400, r#"{"code":"unauthenticated"}"#).is_auth());
        assert!(status_error(500, "INVALID_AUTH").is_auth());
        assert!(status_error(403, "").is_auth());
        assert!(!status_error(500, "boom").is_auth());
    }

    #[test]
    fn test_decode_session() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"device_id":"dev-1","ssid":"s-2","sub":"u-3"}"#);
        let jwt = format!("header.{}.sig", payload);
        let info = decode_session(&jwt).unwrap();
        assert_eq!(info.device_id.as_deref(), Some("dev-1"));
        assert_eq!(info.session_id.as_deref(), Some("s-2"));
        assert_eq!(info.traffic_id.as_deref(), Some("u-3"));

        assert!(decode_session("not-a-jwt").is_none());
        assert!(decode_session("a.b.c.d").is_none());
    }

    async fn attempt_against(status: u16, body: &str) -> (Outcome, String) {
        let (base, request) = crate::adapters::testing::serve_once(status, body).await;
        let adapter = KimiUsage::with_endpoint(crate::adapters::testing::client(), &base);
        let payload = URL_SAFE_NO_PAD.encode(r#"{"device_id":"dev-1","ssid":"s-2","sub":"u-3"}"#);
        let token = Token::new(
            crate::tokens::TokenKind::BrowserCookie,
            format!("hdr.{}.sig", payload),
        );
        let outcome = adapter.attempt(&token).await;
        (outcome, request.await.unwrap())
    }

    #[tokio::test]
    async fn test_attempt_success_sends_cookie_and_session_headers() {
        let body = r#"{"usages":[{"scope":"FEATURE_CODING","detail":{"limit":"100","used":"40"}}]}"#;
        let (outcome, request) = attempt_against(200, body).await;

        match outcome {
            Outcome::Success(s) => assert_eq!(s.weekly_limit.unwrap().used_percent, 40.0),
            other => panic!("expected success, got {:?}", other),
        }
        let lower = request.to_lowercase();
        assert!(lower.starts_with("post /apiv2/kimi.gateway.billing.v1.billingservice/getusages "));
        assert!(lower.contains("cookie: kimi-auth=hdr."));
        assert!(lower.contains("x-msh-device-id: dev-1"));
        assert!(lower.contains("x-msh-session-id: s-2"));
        assert!(lower.contains("x-traffic-id: u-3"));
        assert!(request.contains(r#"{"scope":["FEATURE_CODING"]}"#));
    }

    #[tokio::test]
    async fn test_attempt_maps_statuses() {
        let (outcome, _) = attempt_against(401, "{}").await;
        match outcome {
            Outcome::AuthFailure(s) => assert_eq!(s.error.as_deref(), Some("Token expired")),
            other => panic!("expected auth failure, got {:?}", other),
        }

        let (outcome, _) = attempt_against(400, r#"{"code":"unauthenticated"}"#).await;
        match outcome {
            Outcome::AuthFailure(s) => assert_eq!(s.error.as_deref(), Some("Token invalid")),
            other => panic!("expected auth failure, got {:?}", other),
        }

        let (outcome, _) = attempt_against(503, "busy").await;
        match outcome {
            Outcome::Transient(s) => assert_eq!(s.error.as_deref(), Some("HTTP 503")),
            other => panic!("expected transient, got {:?}", other),
        }
    }
}
