//! Anthropic adapter — OAuth usage endpoint.

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    classify, http_client, parse_rfc3339, FetchError, Outcome, RateLimitWindow, UsageFetcher,
    UsageSnapshot,
};
use crate::tokens::{ProviderId, Token};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const USAGE_PATH: &str = "/api/oauth/usage";
const BETA_HEADER: &str = "anthropic-beta";
const BETA_VALUE: &str = "oauth-2025-04-20";

#[derive(Debug, Deserialize)]
struct UsageResponse {
    five_hour: Option<UsageWindow>,
    seven_day: Option<UsageWindow>,
}

#[derive(Debug, Deserialize)]
struct UsageWindow {
    utilization: Option<f64>,
    resets_at: Option<String>,
}

impl UsageWindow {
    fn into_window(self) -> RateLimitWindow {
        RateLimitWindow::new(
            self.utilization.unwrap_or(0.0),
            parse_rfc3339(self.resets_at.as_deref()),
        )
    }
}

pub struct AnthropicUsage {
    client: reqwest::Client,
    base_url: String,
}

impl AnthropicUsage {
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
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, USAGE_PATH))
            .bearer_auth(&token.secret)
            .header(BETA_HEADER, BETA_VALUE)
            .header("accept", "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status.as_u16()));
        }

        let body = resp.text().await?;
        parse_usage(&body)
    }
}

#[async_trait]
impl UsageFetcher for AnthropicUsage {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    async fn attempt(&self, token: &Token) -> Outcome {
        classify(ProviderId::Anthropic, self.fetch(token).await)
    }
}

fn parse_usage(body: &str) -> Result<UsageSnapshot, FetchError> {
    let data: UsageResponse = serde_json::from_str(body)?;
    Ok(UsageSnapshot::usage(
        ProviderId::Anthropic.as_str(),
        data.five_hour.map(UsageWindow::into_window),
        data.seven_day.map(UsageWindow::into_window),
    ))
}
