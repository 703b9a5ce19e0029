//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only the env var NAME (`bitcoind.password_env`).
//! - The CLI resolves secrets once at startup and passes the result into
//!   constructors; nothing else reads the environment for credentials.
//! - `Debug` output redacts values.
//!
//! # Precedence
//! 1. `--bitcoin-rpc-password` flag
//! 2. the env var named by `bitcoind.password_env`
//! 3. the stock default `rpcpassword`

use crate::settings::ReconcileConfig;

pub const DEFAULT_BITCOIND_PASSWORD: &str = "rpcpassword";

/// Where a resolved secret came from. Safe to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    CliFlag,
    Env(String),
    Default,
}

/// All runtime-resolved secrets for one run. Values are redacted in `Debug`.
#[derive(Clone)]
pub struct ResolvedSecrets {
    pub bitcoind_password: String,
    pub bitcoind_password_source: SecretSource,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("bitcoind_password", &"<REDACTED>")
            .field("bitcoind_password_source", &self.bitcoind_password_source)
            .finish()
    }
}

/// Resolve a named environment variable. Unset and blank are both `None`.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Resolve secrets against the process environment.
pub fn resolve_secrets(config: &ReconcileConfig, cli_password: Option<&str>) -> ResolvedSecrets {
    resolve_secrets_with(config, cli_password, resolve_env)
}

/// Same as [`resolve_secrets`] with an injectable env lookup.
pub fn resolve_secrets_with<F>(
    config: &ReconcileConfig,
    cli_password: Option<&str>,
    lookup_env: F,
) -> ResolvedSecrets
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(pw) = cli_password {
        return ResolvedSecrets {
            bitcoind_password: pw.to_string(),
            bitcoind_password_source: SecretSource::CliFlag,
        };
    }

    let var = config.bitcoind.password_env.trim();
    match lookup_env(var) {
        Some(pw) => ResolvedSecrets {
            bitcoind_password: pw,
            bitcoind_password_source: SecretSource::Env(var.to_string()),
        },
        None => ResolvedSecrets {
            bitcoind_password: DEFAULT_BITCOIND_PASSWORD.to_string(),
            bitcoind_password_source: SecretSource::Default,
        },
    }
}
