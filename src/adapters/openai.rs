//! OpenAI adapter — ChatGPT usage endpoint used by Codex.

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;

use super::{classify, http_client, FetchError, Outcome, RateLimitWindow, UsageFetcher, UsageSnapshot};
use crate::tokens::{ProviderId, Token};

const DEFAULT_BASE_URL: &str = "https://chatgpt.com";
const USAGE_PATH: &str = "/backend-api/wham/usage";

#[derive(Debug, Deserialize)]
struct UsageResponse {
    rate_limit: Option<RateLimit>,
}

#[derive(Debug, Deserialize)]
struct RateLimit {
    primary_window: Option<Window>,
    secondary_window: Option<Window>,
}

#[derive(Debug, Deserialize)]
struct Window {
    #[serde(default)]
    used_percent: f64,
    /// Unix seconds.
    reset_at: Option<i64>,
}

impl Window {
    fn into_window(self) -> RateLimitWindow {
        RateLimitWindow::new(
            self.used_percent,
            self.reset_at.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        )
    }
}

pub struct OpenAiUsage {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiUsage {
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
        let mut req = self
            .client
            .get(format!("{}{}", self.base_url, USAGE_PATH))
            .bearer_auth(&token.secret)
            .header("accept", "application/json");
        if let Some(account) = &token.account_id {
            req = req.header("ChatGPT-Account-Id", account);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }

        let body = resp.text().await?;
        parse_usage(&body)
    }
}

#[async_trait]
impl UsageFetcher for OpenAiUsage {
    fn provider_id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    async fn attempt(&self, token: &Token) -> Outcome {
        classify(ProviderId::OpenAi, self.fetch(token).await)
    }
}

fn parse_usage(body: &str) -> Result<UsageSnapshot, FetchError> {
    let data: UsageResponse = serde_json::from_str(body)?;
    let (primary, secondary) = match data.rate_limit {
        Some(rl) => (rl.primary_window, rl.secondary_window),
        None => (None, None),
    };
    Ok(UsageSnapshot::usage(
        ProviderId::OpenAi.as_str(),
        primary.map(Window::into_window),
        secondary.map(Window::into_window),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_windows() {
        let body = r#"{
            "plan_type": "plus",
            "rate_limit": {
                "allowed": true,
                "primary_window": {"used_percent": 12, "limit_window_seconds": 18000, "reset_at": 1767225600},
                "secondary_window": {"used_percent": 64.5, "limit_window_seconds": 604800, "reset_at": 1767830400}
            }
        }"#;
        let snapshot = parse_usage(body).unwrap();
        let five = snapshot.five_hour_limit.unwrap();
        assert_eq!(five.used_percent, 12.0);
        assert_eq!(five.resets_at.unwrap().timestamp(), 1_767_225_600);
        assert_eq!(snapshot.weekly_limit.unwrap().used_percent, 64.5);
    }

    #[test]
    fn test_parse_without_rate_limit() {
        let snapshot = parse_usage(r#"{"plan_type":"free"}"#).unwrap();
        assert!(snapshot.authenticated);
        assert!(snapshot.five_hour_limit.is_none());
        assert!(snapshot.weekly_limit.is_none());
    }

    async fn attempt_against(status: u16, body: &str, token: &Token) -> (Outcome, String) {
        let (base, request) = crate::adapters::testing::serve_once(status, body).await;
        let adapter = OpenAiUsage::with_endpoint(crate::adapters::testing::client(), &base);
        let outcome = adapter.attempt(token).await;
        (outcome, request.await.unwrap().to_lowercase())
    }

    #[tokio::test]
    async fn test_attempt_sends_account_header() {
        let token = Token::new(crate::tokens::TokenKind::SessionGrant, "codex-token")
            .with_account(Some("acct-42".into()));
        let (outcome, request) = attempt_against(
            200,
            r#"{"rate_limit":{"primary_window":{"used_percent":3}}}"#,
            &token,
        )
        .await;

        assert!(matches!(outcome, Outcome::Success(_)));
        assert!(request.starts_with("get /backend-api/wham/usage "));
        assert!(request.contains("authorization: bearer codex-token"));
        assert!(request.contains("chatgpt-account-id: acct-42"));
    }

    #[tokio::test]
    async fn test_attempt_maps_statuses() {
        let token = Token::new(crate::tokens::TokenKind::SessionGrant, "codex-token");

        let (outcome, request) = attempt_against(401, "{}", &token).await;
        assert!(matches!(outcome, Outcome::AuthFailure(_)));
        assert!(!request.contains("chatgpt-account-id"));

        let (outcome, _) = attempt_against(429, "{}", &token).await;
        match outcome {
            Outcome::Transient(s) => {
                assert!(s.authenticated);
                assert_eq!(s.error.as_deref(), Some("HTTP 429"));
            }
            other => panic!("expected transient, got {:?}", other),
        }
    }
}
