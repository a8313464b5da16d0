use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cleaning::ResponseCleaner;
use crate::cli::{DispatchArgs, DispatchOptions};
use crate::commands::{
    COLLECT_MANIFEST_PREFIX, DISPATCH_MANIFEST_PREFIX, MANIFEST_VERSION, load_latest_manifest,
    manifest_path, retry_policy,
};
use crate::dispatch::{ChunkedDispatcher, DispatchReport, DispatchSettings};
use crate::error::DispatchError;
use crate::llm::{CompletionService, LlmClient};
use crate::model::{CollectRunManifest, DispatchRunManifest};
use crate::pacing::{CancelToken, MinIntervalPacer};
use crate::prompts::{WINDOW_TASK_PREAMBLE, load_prompt};
use crate::util::{create_fresh_directory, now_utc_string, utc_compact_string, write_json_pretty};

pub fn run(args: DispatchArgs) -> Result<()> {
    let report_path = match args.report_path.clone() {
        Some(path) => path,
        None => latest_report_path(&args.output_dir)?,
    };
    let client = LlmClient::from_args(&args.llm)?;

    execute(&client, &report_path, &args.output_dir, &args.options)?;
    Ok(())
}

fn latest_report_path(output_dir: &Path) -> Result<PathBuf> {
    let (manifest_path, manifest) =
        load_latest_manifest::<CollectRunManifest>(output_dir, COLLECT_MANIFEST_PREFIX)?
            .with_context(|| {
                format!(
                    "no collect manifest under {}; pass --report-path",
                    output_dir.display()
                )
            })?;
    info!(manifest = %manifest_path.display(), "using report from latest collect run");
    Ok(PathBuf::from(manifest.paths.report_path))
}

/// Dispatches the report at `report_path` and records the run manifest, also
/// when the run fails part way.
pub fn execute<S: CompletionService + ?Sized>(
    service: &S,
    report_path: &Path,
    output_dir: &Path,
    options: &DispatchOptions,
) -> Result<DispatchRunManifest> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("dispatch-{}", utc_compact_string(started_ts));

    let judgments_dir = output_dir.join("judgments").join(&run_id);
    create_fresh_directory(&judgments_dir)?;

    let corpus = fs::read_to_string(report_path)
        .with_context(|| format!("failed to read report: {}", report_path.display()))?;
    let preamble = load_prompt(options.preamble_file.as_deref(), WINDOW_TASK_PREAMBLE)?;
    let cleaner = ResponseCleaner::new()?;

    let cancel = match options.deadline_secs {
        Some(secs) => CancelToken::with_deadline(Instant::now() + Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    let retry = retry_policy(&options.retry);
    let settings = DispatchSettings {
        window_chars: options.window_chars,
        preamble,
        retry: retry.clone(),
        save_structured: options.save_structured,
    };

    info!(
        run_id = %run_id,
        report = %report_path.display(),
        judgments_dir = %judgments_dir.display(),
        "starting dispatch"
    );

    let mut dispatcher = ChunkedDispatcher::new(
        service,
        MinIntervalPacer::new(Duration::from_millis(options.min_interval_ms)),
        &cleaner,
        settings,
        cancel,
    );
    let mut report = DispatchReport::default();
    let result = dispatcher.run(&corpus, &judgments_dir, &mut report);

    let (status, failure_reason) = match &result {
        Ok(()) => ("completed", None),
        Err(err @ DispatchError::Cancelled { .. }) => ("cancelled", Some(err.to_string())),
        Err(err) => ("failed", Some(err.to_string())),
    };

    let manifest = DispatchRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id,
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        model: service.model_id().to_string(),
        report_path: report_path.display().to_string(),
        judgments_dir: judgments_dir.display().to_string(),
        corpus_chars: report.corpus_chars,
        window_chars: options.window_chars,
        window_count: report.window_count,
        min_interval_ms: options.min_interval_ms,
        max_attempts: retry.max_attempts,
        windows: report.windows,
        failure_reason,
        warnings: report.warnings,
    };

    let manifest_path = manifest_path(
        output_dir,
        DISPATCH_MANIFEST_PREFIX,
        &utc_compact_string(started_ts),
    );
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), status, "wrote dispatch manifest");

    if let Err(err) = result {
        warn!(
            completed = manifest.windows.len(),
            total = manifest.window_count,
            "dispatch stopped early"
        );
        return Err(err).with_context(|| format!("dispatch run {} did not complete", manifest.run_id));
    }

    info!(windows = manifest.windows.len(), "dispatch completed");
    Ok(manifest)
}
