pub mod collect;
pub mod dispatch;
pub mod reconcile;
pub mod run;
pub mod status;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::cli::RetryArgs;
use crate::pacing::RetryPolicy;

pub const MANIFEST_VERSION: u32 = 1;

pub const COLLECT_MANIFEST_PREFIX: &str = "collect_run_";
pub const DISPATCH_MANIFEST_PREFIX: &str = "dispatch_run_";
pub const RECONCILE_MANIFEST_PREFIX: &str = "reconcile_run_";

pub fn manifest_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("manifests")
}

pub fn manifest_path(output_dir: &Path, prefix: &str, compact_ts: &str) -> PathBuf {
    manifest_dir(output_dir).join(format!("{prefix}{compact_ts}.json"))
}

/// Newest manifest with `prefix`. Names embed a compact UTC timestamp, so
/// lexical order is chronological order.
pub fn latest_manifest_path(output_dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    let dir = manifest_dir(output_dir);
    if !dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<(String, PathBuf)> = None;
    let entries = fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(prefix) || !name.ends_with(".json") {
            continue;
        }
        if latest.as_ref().is_none_or(|(current, _)| name > *current) {
            latest = Some((name, entry.path()));
        }
    }

    Ok(latest.map(|(_, path)| path))
}

pub fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn load_latest_manifest<T: DeserializeOwned>(
    output_dir: &Path,
    prefix: &str,
) -> Result<Option<(PathBuf, T)>> {
    match latest_manifest_path(output_dir, prefix)? {
        Some(path) => {
            let manifest = read_manifest(&path)?;
            Ok(Some((path, manifest)))
        }
        None => Ok(None),
    }
}

pub fn retry_policy(args: &RetryArgs) -> RetryPolicy {
    if args.max_attempts <= 1 {
        return RetryPolicy::no_retry();
    }

    RetryPolicy {
        max_attempts: args.max_attempts,
        initial_backoff: Duration::from_millis(args.initial_backoff_ms),
        max_backoff: Duration::from_millis(args.max_backoff_ms),
        multiplier: args.backoff_multiplier,
    }
}
