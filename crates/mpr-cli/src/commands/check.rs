//! `mpr check`: one reconciliation run.
//!
//! Precedence for every setting: CLI flag > layered YAML > built-in default.

use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use mpr_bitcoind::{BitcoindEndpoint, BitcoindSnapshotSource};
use mpr_config::secrets::{resolve_secrets, ResolvedSecrets};
use mpr_config::{LoadedConfig, ReconcileConfig};
use mpr_electrum::{ElectrumClient, ElectrumEndpoint, Transport};
use mpr_reconcile::{run_reconciliation, DiscrepancyReport, RunOptions, VerifyErrorPolicy};
use tracing::info;

/// Flags for `mpr check`. No `Debug`: the struct carries the RPC password.
#[derive(Args, Default)]
pub struct CheckArgs {
    /// Layered config paths in merge order
    #[arg(long = "config")]
    pub config_paths: Vec<String>,

    /// Electrum server host
    #[arg(long)]
    pub electrum_host: Option<String>,

    /// Electrum server port (default: 50001 for t, 50002 for s)
    #[arg(long)]
    pub electrum_port: Option<u16>,

    /// Electrum transport: t (TCP) or s (TLS)
    #[arg(long)]
    pub electrum_transport_protocol: Option<String>,

    /// bitcoind RPC host
    #[arg(long)]
    pub bitcoin_rpc_host: Option<String>,

    /// bitcoind RPC port
    #[arg(long)]
    pub bitcoin_rpc_port: Option<u16>,

    /// bitcoind RPC user
    #[arg(long)]
    pub bitcoin_rpc_user: Option<String>,

    /// bitcoind RPC password (prefer the env var named by bitcoind.password_env)
    #[arg(long)]
    pub bitcoin_rpc_password: Option<String>,

    /// Seconds before the mempool snapshot request is abandoned
    #[arg(long)]
    pub bitcoin_rpc_timeout_secs: Option<u64>,

    /// Maximum verification calls in flight
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Seconds between progress lines
    #[arg(long)]
    pub progress_interval_secs: Option<u64>,

    /// Per-call timeout in seconds (default: wait forever)
    #[arg(long)]
    pub verify_timeout_secs: Option<u64>,

    /// What to do when a verification call fails: tolerate | abort
    #[arg(long)]
    pub on_verify_error: Option<String>,
}

/// Merge CLI flags over the loaded configuration and validate the result.
pub fn effective_config(loaded: &LoadedConfig, args: &CheckArgs) -> Result<ReconcileConfig> {
    let mut cfg = loaded.settings()?;

    if let Some(h) = &args.electrum_host {
        cfg.electrum.host = h.clone();
    }
    if let Some(p) = args.electrum_port {
        cfg.electrum.port = Some(p);
    }
    if let Some(t) = &args.electrum_transport_protocol {
        // Normalize through the parser so `tcp`/`tls` spellings are accepted.
        let transport: Transport = t.parse().map_err(|e: String| anyhow!(e))?;
        cfg.electrum.protocol = transport.as_str().to_string();
    }
    if let Some(h) = &args.bitcoin_rpc_host {
        cfg.bitcoind.host = h.clone();
    }
    if let Some(p) = args.bitcoin_rpc_port {
        cfg.bitcoind.port = p;
    }
    if let Some(u) = &args.bitcoin_rpc_user {
        cfg.bitcoind.user = u.clone();
    }
    if let Some(s) = args.bitcoin_rpc_timeout_secs {
        cfg.bitcoind.request_timeout_secs = s;
    }
    if let Some(n) = args.concurrency {
        cfg.reconcile.concurrency_limit = n;
    }
    if let Some(s) = args.progress_interval_secs {
        cfg.reconcile.progress_interval_secs = s;
    }
    if let Some(s) = args.verify_timeout_secs {
        cfg.reconcile.verify_timeout_secs = Some(s);
    }
    if let Some(p) = &args.on_verify_error {
        cfg.reconcile.on_verify_error = p.trim().to_ascii_lowercase();
    }

    cfg.validate()?;
    Ok(cfg)
}

pub fn electrum_endpoint(cfg: &ReconcileConfig) -> Result<ElectrumEndpoint> {
    let transport: Transport = cfg
        .electrum
        .protocol
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    Ok(ElectrumEndpoint::new(
        cfg.electrum.host.clone(),
        cfg.electrum.port,
        transport,
    ))
}

pub fn bitcoind_endpoint(cfg: &ReconcileConfig, secrets: &ResolvedSecrets) -> BitcoindEndpoint {
    BitcoindEndpoint {
        host: cfg.bitcoind.host.clone(),
        port: cfg.bitcoind.port,
        user: cfg.bitcoind.user.clone(),
        password: secrets.bitcoind_password.clone(),
    }
}

pub fn run_options(cfg: &ReconcileConfig) -> Result<RunOptions> {
    let concurrency_limit = NonZeroUsize::new(cfg.reconcile.concurrency_limit)
        .context("reconcile.concurrency_limit must be >= 1")?;
    let on_verify_error: VerifyErrorPolicy = cfg
        .reconcile
        .on_verify_error
        .parse()
        .map_err(|e: String| anyhow!(e))?;
    Ok(RunOptions {
        concurrency_limit,
        progress_interval: Duration::from_secs(cfg.reconcile.progress_interval_secs),
        verify_timeout: cfg.reconcile.verify_timeout_secs.map(Duration::from_secs),
        on_verify_error,
    })
}

/// Missing lines first (oldest first), then unverified lines.
pub fn write_report<W: Write>(report: &DiscrepancyReport, out: &mut W) -> io::Result<()> {
    for line in &report.missing {
        writeln!(out, "{line}")?;
    }
    for line in &report.unverified {
        writeln!(out, "{line}")?;
    }
    out.flush()
}

pub async fn run(args: CheckArgs) -> Result<()> {
    let loaded = super::load_config(&args.config_paths)?;
    let cfg = effective_config(&loaded, &args)?;
    let secrets = resolve_secrets(&cfg, args.bitcoin_rpc_password.as_deref());
    let opts = run_options(&cfg)?;
    let electrum = electrum_endpoint(&cfg)?;
    let bitcoind = bitcoind_endpoint(&cfg, &secrets);

    info!(
        config_hash = %loaded.config_hash,
        electrum = %electrum,
        bitcoind = %bitcoind.base_url(),
        password_source = ?secrets.bitcoind_password_source,
        limit = opts.concurrency_limit.get(),
        "starting mempool reconciliation"
    );

    let source = BitcoindSnapshotSource::new(&bitcoind)
        .with_request_timeout(Duration::from_secs(cfg.bitcoind.request_timeout_secs));
    let client = Arc::new(ElectrumClient::new(electrum));
    let summary = run_reconciliation(&source, client, &opts)
        .await
        .context("reconciliation failed")?;

    let stdout = io::stdout();
    write_report(&summary.report, &mut stdout.lock()).context("write report failed")?;

    info!(
        records = summary.snapshot_len,
        retrieved = summary.counts.retrieved,
        missing = summary.counts.missing,
        unverified = summary.counts.failed,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "done"
    );
    Ok(())
}
