//! Provider usage adapters — one attempt strategy per provider.
//!
//! Every provider (Anthropic, OpenAI, Kimi) implements [`UsageFetcher`].
//! The refresh engine calls adapters; adapters never see the token store
//! or each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::tokens::{ProviderId, Token};

pub mod anthropic;
pub mod kimi;
pub mod openai;

/// Per-request timeout for upstream usage calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = concat!("limitwatch/", env!("CARGO_PKG_VERSION"));

// ── Core Types ──────────────────────────────────────────────────────

/// Usage of one rate-limit window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    /// Always within 0–100.
    pub used_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<DateTime<Utc>>,
}

impl RateLimitWindow {
    pub fn new(used_percent: f64, resets_at: Option<DateTime<Utc>>) -> Self {
        let used_percent = if used_percent.is_finite() {
            used_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self { used_percent, resets_at }
    }
}

/// The latest known usage/auth state of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub provider: String,
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub five_hour_limit: Option<RateLimitWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_limit: Option<RateLimitWindow>,
    pub updated_at: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn usage(
        provider: &str,
        five_hour_limit: Option<RateLimitWindow>,
        weekly_limit: Option<RateLimitWindow>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            authenticated: true,
            error: None,
            five_hour_limit,
            weekly_limit,
            updated_at: Utc::now(),
        }
    }

    /// Authenticated, but the fetch itself went wrong.
    pub fn failed(provider: &str, error: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            error: Some(error.into()),
            ..Self::usage(provider, None, None)
        }
    }

    /// Credential rejected (or absent when `error` is `None`).
    pub fn unauthenticated(provider: &str, error: Option<String>) -> Self {
        Self {
            authenticated: false,
            error,
            ..Self::usage(provider, None, None)
        }
    }
}

/// Result of one attempt with one token.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(UsageSnapshot),
    /// Network, status or parse trouble; the credential may still be good.
    Transient(UsageSnapshot),
    /// The credential was rejected.
    AuthFailure(UsageSnapshot),
}

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Token expired")]
    Unauthorized,
    #[error("Token invalid")]
    InvalidAuth,
    #[error("HTTP {0}")]
    Status(u16),
    #[error("{0}")]
    Transport(#[from] reqwest::Error),
    #[error("{0}")]
    Parse(String),
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Unauthorized | FetchError::InvalidAuth)
    }

    /// Map a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => FetchError::Unauthorized,
            other => FetchError::Status(other),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Parse(e.to_string())
    }
}

/// Turn a fetch result into an [`Outcome`].
pub fn classify(provider: ProviderId, result: Result<UsageSnapshot, FetchError>) -> Outcome {
    match result {
        Ok(snapshot) => Outcome::Success(snapshot),
        Err(e) if e.is_auth() => {
            Outcome::AuthFailure(UsageSnapshot::unauthenticated(provider.as_str(), Some(e.to_string())))
        }
        Err(e) => Outcome::Transient(UsageSnapshot::failed(provider.as_str(), e.to_string())),
    }
}

// ── Adapter Trait ───────────────────────────────────────────────────

/// One usage-API attempt strategy.
///
/// The token is handed in per call; adapters must not store or log it.
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    async fn attempt(&self, token: &Token) -> Outcome;
}

/// The HTTP adapter for a provider.
pub fn adapter_for(provider: ProviderId) -> Box<dyn UsageFetcher> {
    match provider {
        ProviderId::Anthropic => Box::new(anthropic::AnthropicUsage::new()),
        ProviderId::OpenAi => Box::new(openai::OpenAiUsage::new()),
        ProviderId::Kimi => Box::new(kimi::KimiUsage::new()),
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Percentage of `used` out of `limit`, both as decimal strings.
fn percent_of(used: Option<&str>, limit: Option<&str>) -> f64 {
    let used: f64 = used.and_then(|s| s.trim().parse().ok()).unwrap_or(0.0);
    let limit: f64 = limit.and_then(|s| s.trim().parse().ok()).unwrap_or(1.0);
    if limit > 0.0 {
        used / limit * 100.0
    } else {
        0.0
    }
}

fn parse_rfc3339(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
