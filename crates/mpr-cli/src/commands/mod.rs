//! Command handler modules for mpr-cli.
//!
//! Shared utilities used by multiple command paths live here.

pub mod check;

use anyhow::{Context, Result};
use mpr_config::{LoadedConfig, UnusedKeyPolicy};
use tracing::warn;

/// Load layered config files in order. No files means all defaults.
pub fn load_config(paths: &[String]) -> Result<LoadedConfig> {
    let loaded = if paths.is_empty() {
        LoadedConfig::empty()?
    } else {
        let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
        mpr_config::load_layered_yaml(&path_refs).context("config load failed")?
    };

    let report = mpr_config::report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    if !report.is_clean() {
        warn!(
            unused = ?report.unused_leaf_pointers,
            "config contains keys nothing reads"
        );
    }
    Ok(loaded)
}
