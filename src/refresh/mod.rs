//! Refresh driver — one consolidated usage view across providers.
//!
//! Each tick reloads credentials, consults the failure tracker, runs the
//! token fallback for every eligible provider, promotes winning tokens,
//! and caches the resulting snapshot list for readers.

pub mod poller;

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::{self, UsageFetcher, UsageSnapshot};
use crate::pool::failure::{FailureTracker, ProviderPhase};
use crate::pool::noise::NoiseLimitedLogger;
use crate::pool::try_with_fallback;
use crate::tokens::{signature, CredentialSupplier, ProviderId, Token, TokenKind};

/// Mutable engine state; held for a whole tick so ticks never overlap.
struct Engine {
    tracker: FailureTracker,
    logger: NoiseLimitedLogger,
}

pub struct Refresher {
    supplier: Arc<dyn CredentialSupplier>,
    fetchers: HashMap<ProviderId, Box<dyn UsageFetcher>>,
    providers: Vec<ProviderId>,
    engine: Mutex<Engine>,
    latest: RwLock<Vec<UsageSnapshot>>,
}

impl Refresher {
    pub fn new(
        supplier: Arc<dyn CredentialSupplier>,
        fetchers: Vec<Box<dyn UsageFetcher>>,
        providers: Vec<ProviderId>,
        fallback_log_window: Duration,
    ) -> Self {
        let fetchers = fetchers
            .into_iter()
            .map(|f| (f.provider_id(), f))
            .collect();

        Self {
            supplier,
            fetchers,
            providers,
            engine: Mutex::new(Engine {
                tracker: FailureTracker::new(),
                logger: NoiseLimitedLogger::new(fallback_log_window),
            }),
            latest: RwLock::new(Vec::new()),
        }
    }

    /// Refresher backed by the real HTTP adapters.
    pub fn with_http_adapters(
        supplier: Arc<dyn CredentialSupplier>,
        providers: Vec<ProviderId>,
        fallback_log_window: Duration,
    ) -> Self {
        let fetchers = providers.iter().map(|p| adapters::adapter_for(*p)).collect();
        Self::new(supplier, fetchers, providers, fallback_log_window)
    }

    /// Snapshots from the most recent tick.
    pub fn latest(&self) -> Vec<UsageSnapshot> {
        match self.latest.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Current failure phase of a provider, if it has been polled.
    #[cfg(test)]
    pub async fn phase(&self, provider: ProviderId) -> Option<ProviderPhase> {
        let engine = self.engine.lock().await;
        engine.tracker.get(provider.as_str()).map(|s| s.phase())
    }

    /// Run one tick over every configured provider.
    ///
    /// Never fails: provider problems end up in the snapshots' `error`.
    pub async fn refresh_all(&self) -> Vec<UsageSnapshot> {
        let mut engine = self.engine.lock().await;
        let token_set = self.supplier.load_tokens();
        let mut results = Vec::with_capacity(self.providers.len());

        for &provider in &self.providers {
            let tokens = token_set.get(provider);
            let snapshot = if tokens.is_empty() {
                if !self.supplier.is_tool_installed(provider) {
                    continue;
                }
                UsageSnapshot::unauthenticated(provider.as_str(), None)
            } else {
                match self.refresh_provider(&mut engine, provider, tokens).await {
                    Some(snapshot) => snapshot,
                    None => continue,
                }
            };

            engine.logger.status(&snapshot);
            results.push(snapshot);
        }

        match self.latest.write() {
            Ok(mut guard) => *guard = results.clone(),
            Err(poisoned) => *poisoned.into_inner() = results.clone(),
        }
        results
    }

    async fn refresh_provider(
        &self,
        engine: &mut Engine,
        provider: ProviderId,
        tokens: &[Token],
    ) -> Option<UsageSnapshot> {
        let Some(fetcher) = self.fetchers.get(&provider) else {
            warn!(provider = %provider, "No adapter registered for provider — skipping");
            return None;
        };

        let id = provider.as_str();
        let Engine { tracker, logger } = engine;
        let state = tracker.get_or_create(id, &signature(tokens));

        if state.phase() == ProviderPhase::Disabled {
            debug!(provider = %provider, "Refresh disabled — not polling");
            return Some(state.disabled_usage(id));
        }

        let fallback = try_with_fallback(id, tokens, fetcher.as_ref(), logger).await;
        let promote = fallback.should_promote();

        match (fallback.result, fallback.winner_token) {
            (Some(usage), winner) => {
                state.record_success(&usage);
                if promote {
                    if let Some(token) = winner {
                        self.promote(provider, &token);
                    }
                }
                Some(usage)
            }
            (None, _) => {
                let usage = state.record_exhaustion(id, tokens.len(), fallback.had_token_failure);
                if state.disabled {
                    warn!(
                        provider = %provider,
                        failures = state.consecutive_failures,
                        "Token rejected repeatedly — refresh disabled until credentials change"
                    );
                }
                Some(usage)
            }
        }
    }

    /// Persist a non-first winner so the next tick tries it first.
    fn promote(&self, provider: ProviderId, token: &Token) {
        match self.supplier.save_token(provider, &token.touched(Utc::now())) {
            Ok(()) => info!(provider = %provider, "Promoted working token to preferred"),
            Err(e) => warn!(provider = %provider, "Failed to persist preferred token: {:#}", e),
        }
    }

    /// Store a user-supplied token and refresh right away.
    pub async fn connect(&self, provider: ProviderId, secret: &str) -> Result<Vec<UsageSnapshot>> {
        let secret = secret.trim();
        if secret.is_empty() {
            anyhow::bail!("Missing provider or token");
        }

        let kind = match provider {
            ProviderId::Kimi => TokenKind::BrowserCookie,
            ProviderId::Anthropic | ProviderId::OpenAi => TokenKind::SessionGrant,
        };
        self.supplier
            .save_token(provider, &Token::new(kind, secret))
            .with_context(|| format!("Failed to save token for {}", provider))?;
        info!(provider = %provider, "Saved token");

        Ok(self.refresh_all().await)
    }
}
