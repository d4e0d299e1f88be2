//! Unix socket JSON-RPC server.
//!
//! Listens on `~/.config/limitwatch/limitwatch.sock` for newline-delimited
//! JSON-RPC 2.0 requests. Local only: the socket is owner-only (0600) and
//! there is no TCP listener.
//!
//! Methods:
//! - `usage.providers` returns the snapshots from the latest tick
//! - `usage.refresh` runs a tick now and returns its snapshots
//! - `usage.connect {provider, token}` stores a token and refreshes

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::refresh::Refresher;
use crate::tokens::ProviderId;

/// Bound on a single connection's input.
const MAX_REQUEST_BYTES: u64 = 1_048_576;

// ── JSON-RPC Types ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    params: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: Some(result),
            error: None,
            id,
        }
    }
    fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
    fn invalid_params(id: Option<serde_json::Value>, message: impl Into<String>) -> Self {
        Self::error(id, -32602, message.into())
    }
}

// ── Server ──────────────────────────────────────────────────────────

pub struct Server {
    socket_path: PathBuf,
    refresher: Arc<Refresher>,
}

impl Server {
    pub fn new(socket_path: PathBuf, refresher: Arc<Refresher>) -> Self {
        Self { socket_path, refresher }
    }

    pub async fn run(&self) -> Result<()> {
        // Remove stale socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!("Failed to remove stale socket {}", self.socket_path.display())
            })?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(socket = %self.socket_path.display(), "Usage server listening");

        loop {
            let (stream, _) = listener.accept().await?;
            let refresher = Arc::clone(&self.refresher);

            tokio::spawn(async move {
                let (reader, mut writer) = stream.into_split();
                let mut reader = BufReader::new(reader.take(MAX_REQUEST_BYTES));
                let mut line = String::new();

                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => break, // EOF
                        Ok(_) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let response = handle_request(&line, &refresher).await;
                            let resp_json = match serde_json::to_string(&response) {
                                Ok(json) => json,
                                Err(e) => {
                                    warn!("Failed to encode response: {}", e);
                                    break;
                                }
                            };
                            if writer.write_all(resp_json.as_bytes()).await.is_err() {
                                break;
                            }
                            if writer.write_all(b"\n").await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            });
        }
    }
}

// ── Request Handling ────────────────────────────────────────────────

pub async fn handle_request(raw: &str, refresher: &Refresher) -> JsonRpcResponse {
    let req: JsonRpcRequest = match serde_json::from_str(raw) {
        Ok(r) => r,
        Err(e) => return JsonRpcResponse::error(None, -32700, format!("Parse error: {}", e)),
    };
    debug!(method = %req.method, "Request");

    let params = req.params.unwrap_or(serde_json::Value::Null);

    match req.method.as_str() {
        "usage.providers" => snapshots_response(req.id, &refresher.latest()),
        "usage.refresh" => snapshots_response(req.id, &refresher.refresh_all().await),
        "usage.connect" => handle_connect(req.id, params, refresher).await,
        _ => JsonRpcResponse::error(req.id, -32601, format!("Unknown method: {}", req.method)),
    }
}

fn snapshots_response<T: Serialize>(
    id: Option<serde_json::Value>,
    snapshots: &T,
) -> JsonRpcResponse {
    match serde_json::to_value(snapshots) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(id, -32603, e.to_string()),
    }
}

async fn handle_connect(
    id: Option<serde_json::Value>,
    params: serde_json::Value,
    refresher: &Refresher,
) -> JsonRpcResponse {
    let provider = params.get("provider").and_then(|v| v.as_str());
    let token = params
        .get("token")
        .and_then(|v| v.as_str())
        .filter(|t| !t.trim().is_empty());

    let (provider, token) = match (provider, token) {
        (Some(p), Some(t)) => (p, t),
        _ => return JsonRpcResponse::invalid_params(id, "Missing provider or token"),
    };

    let provider: ProviderId = match provider.parse() {
        Ok(p) => p,
        Err(e) => return JsonRpcResponse::invalid_params(id, format!("{}", e)),
    };

    match refresher.connect(provider, token).await {
        Ok(_) => JsonRpcResponse::success(id, serde_json::json!({ "success": true })),
        Err(e) => {
            warn!(provider = %provider, "Connect failed: {:#}", e);
            JsonRpcResponse::error(id, -32000, format!("{:#}", e))
        }
    }
}
