//! File-backed credential supplier.
//!
//! Candidate tokens come from, in priority order:
//!
//!   ~/.config/limitwatch/tokens.json   (our own store: promoted / connected)
//!   ANTHROPIC_ACCESS_TOKEN             (env, handy in containers)
//!   ~/.local/share/opencode/auth.json  (OpenCode: anthropic, openai)
//!   ~/.codex/auth.json                 (Codex CLI: openai)
//!   ~/.claude/.credentials.json        (Claude Code: anthropic, or macOS Keychain)
//!
//! Missing or malformed sources are skipped. Only our own store is ever
//! written, atomically and with owner-only permissions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{CredentialSupplier, ProviderId, Token, TokenKind, TokenSet};

const ANTHROPIC_TOKEN_ENV: &str = "ANTHROPIC_ACCESS_TOKEN";

// ── Foreign credential files ────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct OpenCodeAuth {
    anthropic: Option<OpenCodeEntry>,
    openai: Option<OpenCodeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenCodeEntry {
    access: Option<String>,
    expires: Option<i64>,
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CodexAuth {
    tokens: Option<CodexTokens>,
}

#[derive(Debug, Deserialize)]
struct CodexTokens {
    access_token: Option<String>,
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeAuth {
    claude_ai_oauth: Option<ClaudeOauth>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaudeOauth {
    access_token: Option<String>,
    expires_at: Option<i64>,
}

// ── Store ───────────────────────────────────────────────────────────

/// Locations of every credential source.
#[derive(Debug, Clone)]
pub struct CredentialPaths {
    pub store: PathBuf,
    pub opencode: PathBuf,
    pub codex: PathBuf,
    pub claude: PathBuf,
}

impl CredentialPaths {
    pub fn new(home: &Path, data_dir: &Path) -> Self {
        Self {
            store: data_dir.join("tokens.json"),
            opencode: home.join(".local/share/opencode/auth.json"),
            codex: home.join(".codex/auth.json"),
            claude: home.join(".claude/.credentials.json"),
        }
    }
}

pub struct FileCredentialStore {
    paths: CredentialPaths,
    anthropic_env: Option<String>,
    use_keychain: bool,
}

impl FileCredentialStore {
    /// Store reading the real environment and, on macOS, the Keychain.
    pub fn new(paths: CredentialPaths) -> Self {
        Self {
            paths,
            anthropic_env: std::env::var(ANTHROPIC_TOKEN_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty()),
            use_keychain: cfg!(target_os = "macos"),
        }
    }

    /// Store confined to files only (no env, no Keychain).
    #[cfg(test)]
    pub fn files_only(paths: CredentialPaths) -> Self {
        Self {
            paths,
            anthropic_env: None,
            use_keychain: false,
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.paths.store
    }

    /// Names of the credential sources currently present.
    pub fn detected_sources(&self) -> Vec<&'static str> {
        let mut sources = Vec::new();
        if self.anthropic_env.is_some() {
            sources.push("environment");
        }
        if self.paths.opencode.exists() {
            sources.push("OpenCode");
        }
        if self.paths.codex.exists() {
            sources.push("Codex");
        }
        if self.paths.claude.exists() || self.keychain_claude_auth().is_some() {
            sources.push("Claude Code");
        }
        if self.paths.store.exists() {
            sources.push("limitwatch tokens");
        }
        sources
    }

    fn load_own_store(&self, set: &mut TokenSet) {
        let entries: serde_json::Map<String, serde_json::Value> =
            match read_json(&self.paths.store) {
                Some(entries) => entries,
                None => return,
            };

        // Fixed order so the result does not depend on map iteration.
        for provider in ProviderId::ALL {
            let Some(raw) = entries.get(provider.as_str()) else {
                continue;
            };
            match serde_json::from_value::<Token>(raw.clone()) {
                Ok(token) if !token.secret.is_empty() => set.push(provider, token),
                Ok(_) => {}
                Err(e) => debug!(provider = %provider, "Ignoring malformed stored token: {}", e),
            }
        }
    }

    fn load_opencode(&self, set: &mut TokenSet) {
        let Some(auth) = read_json::<OpenCodeAuth>(&self.paths.opencode) else {
            return;
        };
        for (provider, entry) in [
            (ProviderId::Anthropic, auth.anthropic),
            (ProviderId::OpenAi, auth.openai),
        ] {
            let Some(entry) = entry else { continue };
            if let Some(access) = entry.access.filter(|s| !s.is_empty()) {
                let token = Token::new(TokenKind::SessionGrant, access)
                    .with_expiry(entry.expires.and_then(from_millis))
                    .with_account(entry.account_id);
                set.push(provider, token);
            }
        }
    }

    fn load_codex(&self, set: &mut TokenSet) {
        let Some(auth) = read_json::<CodexAuth>(&self.paths.codex) else {
            return;
        };
        if let Some(tokens) = auth.tokens {
            if let Some(access) = tokens.access_token.filter(|s| !s.is_empty()) {
                set.push(
                    ProviderId::OpenAi,
                    Token::new(TokenKind::SessionGrant, access).with_account(tokens.account_id),
                );
            }
        }
    }

    fn load_claude(&self, set: &mut TokenSet) {
        let auth = if self.paths.claude.exists() {
            read_json::<ClaudeAuth>(&self.paths.claude)
        } else {
            self.keychain_claude_auth()
        };
        let Some(oauth) = auth.and_then(|a| a.claude_ai_oauth) else {
            return;
        };
        if let Some(access) = oauth.access_token.filter(|s| !s.is_empty()) {
            set.push(
                ProviderId::Anthropic,
                Token::new(TokenKind::SessionGrant, access)
                    .with_expiry(oauth.expires_at.and_then(from_millis)),
            );
        }
    }

    fn keychain_claude_auth(&self) -> Option<ClaudeAuth> {
        if !self.use_keychain {
            return None;
        }
        let raw = keychain::claude_credentials()?;
        match serde_json::from_str(raw.trim()) {
            Ok(auth) => Some(auth),
            Err(e) => {
                debug!("Claude Code Keychain entry is not valid JSON: {}", e);
                None
            }
        }
    }
}

impl CredentialSupplier for FileCredentialStore {
    fn load_tokens(&self) -> TokenSet {
        let mut set = TokenSet::new();

        self.load_own_store(&mut set);
        if let Some(env_token) = &self.anthropic_env {
            set.push(
                ProviderId::Anthropic,
                Token::new(TokenKind::SessionGrant, env_token.clone()),
            );
        }
        self.load_opencode(&mut set);
        self.load_codex(&mut set);
        self.load_claude(&mut set);

        set
    }

    fn save_token(&self, provider: ProviderId, token: &Token) -> Result<()> {
        let mut entries: serde_json::Map<String, serde_json::Value> =
            read_json(&self.paths.store).unwrap_or_default();
        entries.insert(
            provider.as_str().to_string(),
            serde_json::to_value(token).context("Failed to serialize token")?,
        );
        let body = serde_json::to_string_pretty(&entries)?;
        atomic_write(&self.paths.store, body.as_bytes())
    }

    fn is_tool_installed(&self, provider: ProviderId) -> bool {
        match provider {
            ProviderId::Kimi => which::which("kimi").is_ok(),
            ProviderId::Anthropic | ProviderId::OpenAi => false,
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(path = %path.display(), "Skipping unreadable credential file: {}", e);
            None
        }
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Write `contents` via temp file + rename with 0600 permissions.
fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .context("Failed to create temp token store")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(contents)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path).context("Atomic rename of token store failed")?;
    Ok(())
}

#[cfg(target_os = "macos")]
mod keychain {
    use security_framework::passwords::get_generic_password;

    const CLAUDE_SERVICE: &str = "Claude Code-credentials";

    pub fn claude_credentials() -> Option<String> {
        let account = std::env::var("USER").ok()?;
        let raw = get_generic_password(CLAUDE_SERVICE, &account).ok()?;
        String::from_utf8(raw.to_vec()).ok()
    }
}

#[cfg(not(target_os = "macos"))]
mod keychain {
    pub fn claude_credentials() -> Option<String> {
        None
    }
}
