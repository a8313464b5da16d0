use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::{
    COLLECT_MANIFEST_PREFIX, DISPATCH_MANIFEST_PREFIX, RECONCILE_MANIFEST_PREFIX,
    load_latest_manifest, manifest_dir,
};
use crate::model::{CollectRunManifest, DispatchRunManifest, ReconcileRunManifest};

pub fn run(args: StatusArgs) -> Result<()> {
    let output_dir = &args.output_dir;
    info!(output_dir = %output_dir.display(), "status requested");

    match load_latest_manifest::<CollectRunManifest>(output_dir, COLLECT_MANIFEST_PREFIX)? {
        Some((path, manifest)) => info!(
            path = %path.display(),
            run_id = %manifest.run_id,
            status = %manifest.status,
            city = %manifest.city,
            source = %manifest.source,
            updated_at = %manifest.updated_at,
            report = %manifest.paths.report_path,
            rows = manifest.report_rows,
            trailing_nodes_dropped = manifest.counts.trailing_nodes_dropped,
            warnings = manifest.warnings.len(),
            "latest collect run"
        ),
        None => warn!(dir = %manifest_dir(output_dir).display(), "no collect manifest"),
    }

    match load_latest_manifest::<DispatchRunManifest>(output_dir, DISPATCH_MANIFEST_PREFIX)? {
        Some((path, manifest)) => info!(
            path = %path.display(),
            run_id = %manifest.run_id,
            status = %manifest.status,
            model = %manifest.model,
            updated_at = %manifest.updated_at,
            judgments_dir = %manifest.judgments_dir,
            windows_completed = manifest.windows.len(),
            windows_total = manifest.window_count,
            failure_reason = %manifest.failure_reason.unwrap_or_default(),
            "latest dispatch run"
        ),
        None => warn!(dir = %manifest_dir(output_dir).display(), "no dispatch manifest"),
    }

    match load_latest_manifest::<ReconcileRunManifest>(output_dir, RECONCILE_MANIFEST_PREFIX)? {
        Some((path, manifest)) => info!(
            path = %path.display(),
            run_id = %manifest.run_id,
            status = %manifest.status,
            model = %manifest.model,
            updated_at = %manifest.updated_at,
            matched = manifest.counts.judgments_matched,
            unmatched = manifest.counts.judgments_unmatched,
            malformed = manifest.counts.judgments_malformed,
            skipped_artifacts = manifest.skipped_artifacts.len(),
            final_path = %manifest.final_path,
            final_sha256 = %manifest.final_sha256.unwrap_or_default(),
            "latest reconcile run"
        ),
        None => warn!(dir = %manifest_dir(output_dir).display(), "no reconcile manifest"),
    }

    Ok(())
}
