//! Token pool — fetch with fallback across a provider's tokens.
//!
//! Tokens are tried strictly in priority order until one succeeds.
//! Which token won is reported back so the caller can promote it.

use tracing::debug;

use crate::adapters::{Outcome, UsageFetcher, UsageSnapshot};
use crate::tokens::Token;

pub mod failure;
pub mod noise;

use noise::NoiseLimitedLogger;

/// Outcome of running a provider's whole token list.
#[derive(Debug, Clone, Default)]
pub struct FallbackResult {
    /// The first successful snapshot, if any.
    pub result: Option<UsageSnapshot>,
    /// Snapshot of the last failed attempt.
    pub last_failure: Option<UsageSnapshot>,
    /// At least one token was rejected outright.
    pub had_token_failure: bool,
    pub winner_index: Option<usize>,
    pub winner_token: Option<Token>,
    pub attempts: usize,
}

impl FallbackResult {
    /// A token other than the first one succeeded.
    pub fn should_promote(&self) -> bool {
        matches!(self.winner_index, Some(i) if i > 0)
    }
}

/// Try `tokens` in order with `fetcher` until one succeeds.
pub async fn try_with_fallback(
    provider: &str,
    tokens: &[Token],
    fetcher: &dyn UsageFetcher,
    logger: &mut NoiseLimitedLogger,
) -> FallbackResult {
    let mut outcome = FallbackResult::default();

    for (index, token) in tokens.iter().enumerate() {
        outcome.attempts += 1;

        match fetcher.attempt(token).await {
            Outcome::Success(snapshot) => {
                logger.clear_fallback(provider);
                debug!(provider = %provider, index, "Usage fetched");
                outcome.result = Some(snapshot);
                outcome.winner_index = Some(index);
                outcome.winner_token = Some(token.clone());
                return outcome;
            }
            Outcome::Transient(snapshot) => {
                if let Some(message) = &snapshot.error {
                    logger.error(provider, message);
                }
                outcome.last_failure = Some(snapshot);
            }
            Outcome::AuthFailure(snapshot) => {
                debug!(provider = %provider, index, "Token rejected");
                outcome.had_token_failure = true;
                outcome.last_failure = Some(snapshot);
            }
        }

        if index + 1 < tokens.len() {
            logger.fallback(provider);
        }
    }

    outcome
}


#[cfg(test)]
mod tests {
    use super::testing::{Reply, ScriptedFetcher};
    use super::*;
    use crate::tokens::{ProviderId, TokenKind};

    fn tokens(secrets: &[&str]) -> Vec<Token> {
        secrets
            .iter()
            .map(|s| Token::new(TokenKind::SessionGrant, *s))
            .collect()
    }

    #[tokio::test]
    async fn test_first_success_wins_after_k_plus_one_attempts() {
        let list = tokens(&["t0", "t1", "t2", "t3"]);
        for k in 0..list.len() {
            let mut script: Vec<(&str, Reply)> = Vec::new();
            for (i, t) in list.iter().enumerate() {
                let reply = if i < k {
                    if i % 2 == 0 { Reply::Rejected } else { Reply::Broken }
                } else {
                    Reply::Ok
                };
                script.push((t.secret.as_str(), reply));
            }
            let fetcher = ScriptedFetcher::new(ProviderId::Anthropic, &script);
            let mut logger = NoiseLimitedLogger::default();

            let result = try_with_fallback("anthropic", &list, &fetcher, &mut logger).await;

            assert!(result.result.is_some());
            assert_eq!(result.winner_index, Some(k));
            assert_eq!(result.winner_token.as_ref().unwrap().secret, list[k].secret);
            assert_eq!(fetcher.calls(), k + 1);
            assert_eq!(result.attempts, k + 1);
            assert_eq!(result.should_promote(), k > 0);
        }
    }

    #[tokio::test]
    async fn test_all_rejected() {
        let list = tokens(&["a", "b", "c"]);
        let fetcher = ScriptedFetcher::new(ProviderId::OpenAi, &[]);
        let mut logger = NoiseLimitedLogger::default();

        let result = try_with_fallback("openai", &list, &fetcher, &mut logger).await;

        assert!(result.result.is_none());
        assert!(result.had_token_failure);
        assert!(result.winner_index.is_none());
        assert_eq!(fetcher.seen(), vec!["a", "b", "c"]);
        assert!(!result.last_failure.unwrap().authenticated);
    }

    #[tokio::test]
    async fn test_all_transient_is_not_a_token_failure() {
        let list = tokens(&["a", "b"]);
        let fetcher =
            ScriptedFetcher::new(ProviderId::Kimi, &[("a", Reply::Broken), ("b", Reply::Broken)]);
        let mut logger = NoiseLimitedLogger::default();

        let result = try_with_fallback("kimi", &list, &fetcher, &mut logger).await;

        assert!(result.result.is_none());
        assert!(!result.had_token_failure);
        let last = result.last_failure.unwrap();
        assert!(last.authenticated);
        assert_eq!(last.error.as_deref(), Some("HTTP 500"));
        // The second identical error was swallowed by the logger.
        assert!(!logger.error("kimi", "HTTP 500"));
    }

    #[tokio::test]
    async fn test_fallback_notice_skips_last_token() {
        let list = tokens(&["only"]);
        let fetcher = ScriptedFetcher::new(ProviderId::Kimi, &[]);
        let mut logger = NoiseLimitedLogger::default();

        try_with_fallback("kimi", &list, &fetcher, &mut logger).await;
        // Nothing was logged for a single token, so the window is still open.
        assert!(logger.fallback("kimi"));
    }

    #[tokio::test]
    async fn test_fallback_notice_between_tokens() {
        let list = tokens(&["a", "b"]);
        let fetcher = ScriptedFetcher::new(ProviderId::Kimi, &[]);
        let mut logger = NoiseLimitedLogger::default();

        try_with_fallback("kimi", &list, &fetcher, &mut logger).await;
        assert!(!logger.fallback("kimi"));
    }

    #[tokio::test]
    async fn test_empty_list() {
        let fetcher = ScriptedFetcher::new(ProviderId::Kimi, &[]);
        let mut logger = NoiseLimitedLogger::default();
        let result = try_with_fallback("kimi", &[], &fetcher, &mut logger).await;
        assert_eq!(result.attempts, 0);
        assert!(result.result.is_none());
        assert!(result.last_failure.is_none());
        assert!(!result.had_token_failure);
    }
}
