//! Typed view over the merged configuration JSON.
//!
//! Every field has a default, so an empty configuration is valid. Values are
//! checked by [`ReconcileConfig::validate`] before a run starts.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectrumSettings {
    pub host: String,
    /// `None` picks the transport's conventional port (50001 for `t`, 50002 for `s`).
    pub port: Option<u16>,
    /// Transport selector: `t` (TCP) or `s` (TLS).
    pub protocol: String,
}

impl Default for ElectrumSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            protocol: "t".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BitcoindSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// NAME of the env var holding the RPC password.
    pub password_env: String,
    pub request_timeout_secs: u64,
}

impl Default for BitcoindSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8332,
            user: "rpcuser".to_string(),
            password_env: "BITCOIND_RPC_PASSWORD".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub concurrency_limit: usize,
    pub progress_interval_secs: u64,
    pub verify_timeout_secs: Option<u64>,
    /// `tolerate` or `abort`.
    pub on_verify_error: String,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 1000,
            progress_interval_secs: 5,
            verify_timeout_secs: None,
            on_verify_error: "tolerate".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub electrum: ElectrumSettings,
    pub bitcoind: BitcoindSettings,
    pub reconcile: ReconcileSettings,
}

impl ReconcileConfig {
    /// Deserialize and validate. Unknown keys are left to
    /// [`crate::report_unused_keys`].
    pub fn from_config_json(config_json: &Value) -> Result<Self> {
        let cfg: ReconcileConfig = serde_json::from_value(config_json.clone())
            .context("config does not match the reconcile settings schema")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.electrum.host.trim().is_empty() {
            bail!("CONFIG_INVALID electrum.host must not be empty");
        }
        if !matches!(self.electrum.protocol.as_str(), "t" | "s") {
            bail!(
                "CONFIG_INVALID electrum.protocol '{}'. expected one of: t | s",
                self.electrum.protocol
            );
        }
        if self.electrum.port == Some(0) {
            bail!("CONFIG_INVALID electrum.port must be in 1..=65535");
        }
        if self.bitcoind.host.trim().is_empty() {
            bail!("CONFIG_INVALID bitcoind.host must not be empty");
        }
        if self.bitcoind.port == 0 {
            bail!("CONFIG_INVALID bitcoind.port must be in 1..=65535");
        }
        if self.bitcoind.password_env.trim().is_empty() {
            bail!("CONFIG_INVALID bitcoind.password_env must name an env var");
        }
        if self.bitcoind.request_timeout_secs == 0 {
            bail!("CONFIG_INVALID bitcoind.request_timeout_secs must be >= 1");
        }
        if self.reconcile.concurrency_limit == 0 {
            bail!("CONFIG_INVALID reconcile.concurrency_limit must be >= 1");
        }
        if self.reconcile.progress_interval_secs == 0 {
            bail!("CONFIG_INVALID reconcile.progress_interval_secs must be >= 1");
        }
        if self.reconcile.verify_timeout_secs == Some(0) {
            bail!("CONFIG_INVALID reconcile.verify_timeout_secs must be >= 1 when set");
        }
        if !matches!(
            self.reconcile.on_verify_error.as_str(),
            "tolerate" | "abort"
        ) {
            bail!(
                "CONFIG_INVALID reconcile.on_verify_error '{}'. expected one of: tolerate | abort",
                self.reconcile.on_verify_error
            );
        }
        Ok(())
    }
}
