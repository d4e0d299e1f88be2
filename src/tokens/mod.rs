//! Provider credentials — tokens, token sets, and the supplier seam.
//!
//! Tokens are gathered fresh on every refresh tick from a
//! [`CredentialSupplier`]. The engine never mutates a token list; it
//! only asks the supplier to persist a new preferred token.

pub mod store;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroize;

// ── Providers ───────────────────────────────────────────────────────

/// The fixed set of providers the daemon knows how to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    Kimi,
}

impl ProviderId {
    /// Default display order.
    pub const ALL: [ProviderId; 3] = [ProviderId::Anthropic, ProviderId::Kimi, ProviderId::OpenAi];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Anthropic => "anthropic",
            ProviderId::OpenAi => "openai",
            ProviderId::Kimi => "kimi",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "anthropic" => Ok(ProviderId::Anthropic),
            "openai" => Ok(ProviderId::OpenAi),
            "kimi" => Ok(ProviderId::Kimi),
            other => anyhow::bail!("Unknown provider '{}'", other),
        }
    }
}

// ── Token ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    /// OAuth-style session grant issued to another local tool.
    #[serde(rename = "oauth")]
    SessionGrant,
    #[serde(rename = "api")]
    ApiKey,
    /// Cookie value pasted from a browser session.
    #[serde(rename = "cookie")]
    BrowserCookie,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            TokenKind::SessionGrant => "oauth",
            TokenKind::ApiKey => "api",
            TokenKind::BrowserCookie => "cookie",
        }
    }
}

/// A single credential for one provider.
///
/// The serialized shape is the one kept in the daemon's own token file.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    #[serde(rename = "type")]
    pub kind: TokenKind,
    #[serde(rename = "token")]
    pub secret: String,
    #[serde(
        rename = "expires",
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn new(kind: TokenKind, secret: impl Into<String>) -> Self {
        Self {
            kind,
            secret: secret.into(),
            expires_at: None,
            account_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_account(mut self, account_id: Option<String>) -> Self {
        self.account_id = account_id;
        self
    }

    /// Copy of this token stamped with a new last-updated instant.
    pub fn touched(&self, now: DateTime<Utc>) -> Self {
        let mut token = self.clone();
        token.updated_at = now;
        token
    }

    fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}",
            self.kind.as_str(),
            self.account_id.as_deref().unwrap_or(""),
            self.secret
        )
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("kind", &self.kind)
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("account_id", &self.account_id)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Deterministic fingerprint of an ordered token list.
///
/// Any change in order, kind, account or secret yields a new value. The
/// secrets are hashed so the failure tracker never holds them in clear.
pub fn signature(tokens: &[Token]) -> String {
    let joined = tokens
        .iter()
        .map(Token::fingerprint)
        .collect::<Vec<_>>()
        .join("|");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

// ── Supplier ────────────────────────────────────────────────────────

/// Candidate tokens per provider, highest-trust source first.
#[derive(Debug, Clone, Default)]
pub struct TokenSet {
    tokens: HashMap<ProviderId, Vec<Token>>,
}

impl TokenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate unless the same secret is already listed.
    pub fn push(&mut self, provider: ProviderId, token: Token) {
        let list = self.tokens.entry(provider).or_default();
        if !list.iter().any(|t| t.secret == token.secret) {
            list.push(token);
        }
    }

    pub fn get(&self, provider: ProviderId) -> &[Token] {
        self.tokens.get(&provider).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Source of provider credentials.
///
/// Reading raw credential files and keychains lives behind this seam so
/// the refresh engine can be driven by fakes in tests.
pub trait CredentialSupplier: Send + Sync {
    /// Load every candidate token, ordered by source priority.
    fn load_tokens(&self) -> TokenSet;

    /// Persist `token` as the preferred entry for `provider`.
    fn save_token(&self, provider: ProviderId, token: &Token) -> Result<()>;

    /// Whether the provider's tooling is present even without a token.
    fn is_tool_installed(&self, provider: ProviderId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(secret: &str) -> Token {
        Token::new(TokenKind::SessionGrant, secret)
    }

    #[test]
    fn test_signature_is_deterministic() {
        let a = vec![token("one"), token("two")];
        let b = vec![token("one"), token("two")];
        assert_eq!(signature(&a), signature(&b));
        assert_eq!(signature(&a).len(), 64);
    }

    #[test]
    fn test_signature_tracks_order_and_content() {
        let base = signature(&[token("one"), token("two")]);
        assert_ne!(base, signature(&[token("two"), token("one")]));
        assert_ne!(base, signature(&[token("one")]));
        assert_ne!(
            base,
            signature(&[token("one"), token("two").with_account(Some("acct".into()))])
        );
        assert_ne!(
            signature(&[token("one")]),
            signature(&[Token::new(TokenKind::BrowserCookie, "one")])
        );
    }

    #[test]
    fn test_signature_ignores_timestamps() {
        let t = token("one");
        let later = t.touched(t.updated_at + chrono::Duration::hours(1));
        assert_eq!(signature(&[t]), signature(&[later]));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", token("sk-very-secret"));
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_token_set_dedups_secrets() {
        let mut set = TokenSet::new();
        set.push(ProviderId::Anthropic, token("a"));
        set.push(ProviderId::Anthropic, token("b"));
        set.push(ProviderId::Anthropic, token("a"));
        let secrets: Vec<_> = set
            .get(ProviderId::Anthropic)
            .iter()
            .map(|t| t.secret.as_str())
            .collect();
        assert_eq!(secrets, vec!["a", "b"]);
        assert!(set.get(ProviderId::Kimi).is_empty());
    }

    #[test]
    fn test_provider_id_round_trips_through_str() {
        for id in ProviderId::ALL {
            assert_eq!(id.as_str().parse::<ProviderId>().unwrap(), id);
        }
        assert!("gemini".parse::<ProviderId>().is_err());
    }

    #[test]
    fn test_token_file_shape() {
        let t = Token::new(TokenKind::BrowserCookie, "jwt")
            .with_account(Some("acct-1".into()));
        let value = serde_json::to_value(&t).unwrap();
        assert_eq!(value["type"], "cookie");
        assert_eq!(value["token"], "jwt");
        assert_eq!(value["accountId"], "acct-1");
        assert!(value["updatedAt"].is_i64());
        assert!(value.get("expires").is_none());
    }
}
