//! mpr-bitcoind
//!
//! Bitcoin Core JSON-RPC snapshot source: one `getrawmempool true` call per
//! run, normalized into an [`mpr_reconcile::Snapshot`].
//!
//! Credentials are passed in by the caller (CLI) and never logged.

mod mempool;

use std::fmt;
use std::time::Duration;

use mpr_reconcile::{Snapshot, SnapshotError, SnapshotSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use mempool::parse_verbose_mempool;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8332;
pub const DEFAULT_USER: &str = "rpcuser";
pub const DEFAULT_PASSWORD: &str = "rpcpassword";

/// Whole-request bound for the snapshot call. A verbose `getrawmempool` on a
/// full mempool is tens of megabytes, so this is generous.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Where and how to reach bitcoind's RPC interface.
#[derive(Clone, PartialEq, Eq)]
pub struct BitcoindEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl Default for BitcoindEndpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

impl BitcoindEndpoint {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for BitcoindEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitcoindEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Snapshot source backed by bitcoind's `getrawmempool` (verbose).
#[derive(Clone)]
pub struct BitcoindSnapshotSource {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    request_timeout: Duration,
}

impl BitcoindSnapshotSource {
    pub fn new(endpoint: &BitcoindEndpoint) -> Self {
        Self::new_with_base_url(
            endpoint.base_url(),
            endpoint.user.clone(),
            endpoint.password.clone(),
        )
    }

    pub fn new_with_base_url(base_url: String, user: String, password: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            user,
            password,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn transport_error(&self, stage: &str, e: reqwest::Error) -> SnapshotError {
        if e.is_timeout() {
            SnapshotError::Transport(format!(
                "bitcoind request timed out after {}ms",
                self.request_timeout.as_millis()
            ))
        } else {
            SnapshotError::Transport(format!("bitcoind {stage} failed: {e}"))
        }
    }

    fn rpc_url(&self) -> String {
        format!("{}/", self.base_url.trim_end_matches('/'))
    }

    /// One JSON-RPC 1.0 call; returns the `result` member.
    async fn call(&self, method: &str, params: Value) -> Result<Value, SnapshotError> {
        let req = RpcRequest {
            jsonrpc: "1.0",
            id: "mpr",
            method,
            params,
        };

        let resp = self
            .http
            .post(self.rpc_url())
            .basic_auth(&self.user, Some(&self.password))
            .json(&req)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error("request", e))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(SnapshotError::Auth {
                status: status.as_u16(),
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|e| self.transport_error("response read", e))?;

        // bitcoind reports RPC errors with a non-2xx status and a JSON body,
        // so the body is decoded before the status is judged.
        let body: RpcResponse = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(SnapshotError::Decode(format!(
                    "bitcoind response json decode failed: {e}"
                )))
            }
            Err(_) => {
                return Err(SnapshotError::Transport(format!(
                    "bitcoind http error status={}",
                    status.as_u16()
                )))
            }
        };

        if let Some(err) = body.error {
            return Err(SnapshotError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        body.result.ok_or_else(|| {
            SnapshotError::Decode("bitcoind response has neither result nor error".to_string())
        })
    }
}

impl fmt::Debug for BitcoindSnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitcoindSnapshotSource")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl SnapshotSource for BitcoindSnapshotSource {
    fn name(&self) -> &'static str {
        "bitcoind"
    }

    async fn fetch_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        debug!(url = %self.rpc_url(), "getrawmempool verbose");
        let result = self.call("getrawmempool", Value::from(vec![true])).await?;
        let fetched_at = chrono::Utc::now().timestamp();
        parse_verbose_mempool(result, fetched_at)
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

// -----------------
// Tests (local mock server only)
// -----------------
