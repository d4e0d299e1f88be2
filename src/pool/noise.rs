//! Noise-limited logging for the refresh loop.
//!
//! Polling every few seconds would otherwise repeat the same failure
//! line forever. Errors are de-duplicated by last value per provider,
//! fallback notices by a fixed time window, and provider status lines
//! are only emitted on change.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::adapters::UsageSnapshot;

pub const DEFAULT_FALLBACK_WINDOW: Duration = Duration::from_secs(60);

/// A provider status transition worth telling the operator about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Failing(String),
    Unauthenticated,
    /// Back to healthy after a previously logged problem.
    Connected,
}

pub struct NoiseLimitedLogger {
    last_error: HashMap<String, String>,
    last_fallback: HashMap<String, Instant>,
    last_status: HashMap<String, String>,
    fallback_window: Duration,
}

impl NoiseLimitedLogger {
    pub fn new(fallback_window: Duration) -> Self {
        Self {
            last_error: HashMap::new(),
            last_fallback: HashMap::new(),
            last_status: HashMap::new(),
            fallback_window,
        }
    }

    /// Log a fetch error unless it repeats the previous one for `provider`.
    pub fn error(&mut self, provider: &str, message: &str) -> bool {
        if self.last_error.get(provider).map(String::as_str) == Some(message) {
            return false;
        }
        self.last_error.insert(provider.to_string(), message.to_string());
        error!(provider = %provider, "Usage fetch failed: {}", message);
        true
    }

    pub fn fallback(&mut self, provider: &str) -> bool {
        self.fallback_at(provider, Instant::now())
    }

    /// Log a "trying next token" notice at most once per window.
    pub fn fallback_at(&mut self, provider: &str, now: Instant) -> bool {
        if let Some(last) = self.last_fallback.get(provider) {
            if now.saturating_duration_since(*last) < self.fallback_window {
                return false;
            }
        }
        self.last_fallback.insert(provider.to_string(), now);
        info!(provider = %provider, "Token failed, trying next...");
        true
    }

    pub fn clear_fallback(&mut self, provider: &str) {
        self.last_fallback.remove(provider);
    }

    /// Log the provider's state if it differs from the last one seen.
    pub fn status(&mut self, snapshot: &UsageSnapshot) -> Option<StatusChange> {
        let current = match (&snapshot.error, snapshot.authenticated) {
            (Some(e), _) => e.clone(),
            (None, true) => "ok".to_string(),
            (None, false) => "not_authenticated".to_string(),
        };

        let previous = self.last_status.insert(snapshot.provider.clone(), current.clone());
        if previous.as_deref() == Some(current.as_str()) {
            return None;
        }

        let provider = snapshot.provider.as_str();
        if let Some(e) = &snapshot.error {
            error!(provider = %provider, "{}", e);
            Some(StatusChange::Failing(e.clone()))
        } else if !snapshot.authenticated {
            warn!(provider = %provider, "Not authenticated");
            Some(StatusChange::Unauthenticated)
        } else if previous.is_some() {
            info!(provider = %provider, "Connected");
            Some(StatusChange::Connected)
        } else {
            None
        }
    }
}

impl Default for NoiseLimitedLogger {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_WINDOW)
    }
}
