//! Per-provider failure tracking — the refresh circuit breaker.
//!
//! A provider whose single token keeps getting rejected is disabled
//! after `MAX_TOKEN_FAILURES` consecutive rejected ticks. The state is
//! keyed by the token-set signature: any credential change resets it.

use std::collections::HashMap;

use crate::adapters::UsageSnapshot;

/// Consecutive rejected ticks tolerated before disabling.
pub const MAX_TOKEN_FAILURES: u32 = 10;

pub const ALL_TOKENS_FAILED: &str = "All tokens expired or invalid";
pub const REFRESH_DISABLED: &str = "Refresh disabled after repeated token failures";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderPhase {
    Active,
    /// Failing, still polled.
    Degraded,
    Disabled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailureState {
    pub disabled: bool,
    pub consecutive_failures: u32,
    pub signature: String,
    pub last_usage: Option<UsageSnapshot>,
}

impl ProviderFailureState {
    fn new(signature: &str) -> Self {
        Self {
            disabled: false,
            consecutive_failures: 0,
            signature: signature.to_string(),
            last_usage: None,
        }
    }

    pub fn phase(&self) -> ProviderPhase {
        if self.disabled {
            ProviderPhase::Disabled
        } else if self.consecutive_failures > 0 {
            ProviderPhase::Degraded
        } else {
            ProviderPhase::Active
        }
    }

    pub fn record_success(&mut self, snapshot: &UsageSnapshot) {
        self.consecutive_failures = 0;
        self.last_usage = Some(snapshot.clone());
    }

    /// Every token failed this tick. Returns the snapshot to publish.
    ///
    /// Only a single-token provider whose token was rejected counts
    /// towards disabling; several tokens never trip the breaker.
    pub fn record_exhaustion(
        &mut self,
        provider: &str,
        token_count: usize,
        had_auth_failure: bool,
    ) -> UsageSnapshot {
        if had_auth_failure && token_count == 1 {
            self.consecutive_failures += 1;
            if self.consecutive_failures > MAX_TOKEN_FAILURES {
                self.disabled = true;
                let usage = disabled_usage(provider);
                self.last_usage = Some(usage.clone());
                return usage;
            }
        }

        let usage = all_tokens_failed_usage(provider);
        self.last_usage = Some(usage.clone());
        usage
    }

    /// What to publish while disabled.
    pub fn disabled_usage(&self, provider: &str) -> UsageSnapshot {
        self.last_usage
            .clone()
            .unwrap_or_else(|| disabled_usage(provider))
    }
}

pub fn all_tokens_failed_usage(provider: &str) -> UsageSnapshot {
    UsageSnapshot::unauthenticated(provider, Some(ALL_TOKENS_FAILED.to_string()))
}

pub fn disabled_usage(provider: &str) -> UsageSnapshot {
    UsageSnapshot::unauthenticated(provider, Some(REFRESH_DISABLED.to_string()))
}

/// Failure state for every provider observed so far.
#[derive(Debug, Default)]
pub struct FailureTracker {
    states: HashMap<String, ProviderFailureState>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the provider's state, resetting it first if the token set
    /// changed since it was last seen.
    pub fn get_or_create(&mut self, provider: &str, signature: &str) -> &mut ProviderFailureState {
        let state = self
            .states
            .entry(provider.to_string())
            .or_insert_with(|| ProviderFailureState::new(signature));

        if state.signature != signature {
            *state = ProviderFailureState::new(signature);
        }
        state
    }

    #[cfg(test)]
    pub fn get(&self, provider: &str) -> Option<&ProviderFailureState> {
        self.states.get(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject_ticks(state: &mut ProviderFailureState, ticks: u32, token_count: usize) -> UsageSnapshot {
        let mut last = None;
        for _ in 0..ticks {
            last = Some(state.record_exhaustion("x", token_count, true));
        }
        last.unwrap()
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut tracker = FailureTracker::new();
        tracker.get_or_create("x", "sig-1").consecutive_failures = 3;
        let first = tracker.get_or_create("x", "sig-1").clone();
        let second = tracker.get_or_create("x", "sig-1").clone();
        assert_eq!(first, second);
        assert_eq!(second.consecutive_failures, 3);
    }

    #[test]
    fn test_signature_change_resets_disabled_state() {
        let mut tracker = FailureTracker::new();
        let state = tracker.get_or_create("x", "sig-1");
        reject_ticks(state, MAX_TOKEN_FAILURES + 1, 1);
        assert_eq!(state.phase(), ProviderPhase::Disabled);

        let state = tracker.get_or_create("x", "sig-2");
        assert!(!state.disabled);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_usage.is_none());
        assert_eq!(state.signature, "sig-2");
        assert_eq!(state.phase(), ProviderPhase::Active);
    }

    #[test]
    fn test_single_token_disables_after_threshold() {
        let mut tracker = FailureTracker::new();
        let state = tracker.get_or_create("x", "sig");

        let tenth = reject_ticks(state, MAX_TOKEN_FAILURES, 1);
        assert_eq!(state.phase(), ProviderPhase::Degraded);
        assert_eq!(tenth.error.as_deref(), Some(ALL_TOKENS_FAILED));

        let eleventh = state.record_exhaustion("x", 1, true);
        assert_eq!(state.phase(), ProviderPhase::Disabled);
        assert_eq!(eleventh.error.as_deref(), Some(REFRESH_DISABLED));
        assert!(!eleventh.authenticated);
        assert_eq!(state.disabled_usage("x").error.as_deref(), Some(REFRESH_DISABLED));
    }

    #[test]
    fn test_multi_token_never_disables() {
        let mut tracker = FailureTracker::new();
        let state = tracker.get_or_create("x", "sig");
        let last = reject_ticks(state, 50, 2);
        assert!(!state.disabled);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(last.error.as_deref(), Some(ALL_TOKENS_FAILED));
    }

    #[test]
    fn test_transient_exhaustion_does_not_count() {
        let mut tracker = FailureTracker::new();
        let state = tracker.get_or_create("x", "sig");
        for _ in 0..20 {
            state.record_exhaustion("x", 1, false);
        }
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.disabled);
        assert_eq!(state.last_usage.as_ref().unwrap().error.as_deref(), Some(ALL_TOKENS_FAILED));
    }

    #[test]
    fn test_success_resets_counter() {
        let mut tracker = FailureTracker::new();
        let state = tracker.get_or_create("x", "sig");
        reject_ticks(state, 7, 1);

        let ok = UsageSnapshot::usage("x", None, None);
        state.record_success(&ok);
        assert_eq!(state.phase(), ProviderPhase::Active);
        assert_eq!(state.last_usage.as_ref(), Some(&ok));

        reject_ticks(state, MAX_TOKEN_FAILURES, 1);
        assert!(!state.disabled);
    }

    #[test]
    fn test_disabled_usage_without_cache() {
        let state = ProviderFailureState::new("sig");
        let usage = state.disabled_usage("x");
        assert_eq!(usage.provider, "x");
        assert_eq!(usage.error.as_deref(), Some(REFRESH_DISABLED));
    }
}
