use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cleaning::ResponseCleaner;
use crate::cli::{ReconcileArgs, ReconcileOptions};
use crate::commands::{
    DISPATCH_MANIFEST_PREFIX, MANIFEST_VERSION, RECONCILE_MANIFEST_PREFIX, load_latest_manifest,
    manifest_path, retry_policy,
};
use crate::index::CompositeKeyIndex;
use crate::llm::{CompletionService, LlmClient};
use crate::model::{DispatchRunManifest, ReconcileCounts, ReconcileRunManifest};
use crate::pacing::{MinIntervalPacer, RequestPacer, RetryPolicy};
use crate::prompts::{SYNTHESIS_PROMPT, load_prompt};
use crate::reconcile::{discover_artifacts, reconcile, synthesize, write_final_artifact};
use crate::util::{now_utc_string, sha256_file, utc_compact_string, write_json_pretty};

pub const FINAL_ARTIFACT_NAME: &str = "final.txt";

pub fn run(args: ReconcileArgs) -> Result<()> {
    let (report_path, judgments_dir) = match (args.report_path.clone(), args.judgments_dir.clone())
    {
        (Some(report_path), Some(judgments_dir)) => (report_path, judgments_dir),
        (report_path, judgments_dir) => {
            let (manifest_path, manifest) = load_latest_manifest::<DispatchRunManifest>(
                &args.output_dir,
                DISPATCH_MANIFEST_PREFIX,
            )?
            .with_context(|| {
                format!(
                    "no dispatch manifest under {}; pass --report-path and --judgments-dir",
                    args.output_dir.display()
                )
            })?;
            info!(manifest = %manifest_path.display(), "using latest dispatch run");
            (
                report_path.unwrap_or_else(|| PathBuf::from(&manifest.report_path)),
                judgments_dir.unwrap_or_else(|| PathBuf::from(&manifest.judgments_dir)),
            )
        }
    };

    let client = LlmClient::from_args(&args.llm)?;
    let mut pacer = MinIntervalPacer::new(Duration::ZERO);
    let retry = retry_policy(&args.retry);

    execute(
        &client,
        &mut pacer,
        &retry,
        &report_path,
        &judgments_dir,
        &args.output_dir,
        &args.options,
    )?;
    Ok(())
}

/// Joins the judgments in `judgments_dir` with the report, sends the
/// synthesis request and records the run manifest, also on failure.
pub fn execute<S, P>(
    service: &S,
    pacer: &mut P,
    retry: &RetryPolicy,
    report_path: &Path,
    judgments_dir: &Path,
    output_dir: &Path,
    options: &ReconcileOptions,
) -> Result<ReconcileRunManifest>
where
    S: CompletionService + ?Sized,
    P: RequestPacer,
{
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("reconcile-{}", utc_compact_string(started_ts));

    info!(
        run_id = %run_id,
        report = %report_path.display(),
        judgments_dir = %judgments_dir.display(),
        "starting reconcile"
    );

    let index = CompositeKeyIndex::load(report_path)?;
    if index.is_empty() {
        warn!(report = %report_path.display(), "report has no rows; no judgment can match");
    }
    info!(rows = index.len(), collisions = index.collisions().len(), "report indexed");

    let artifacts = discover_artifacts(judgments_dir)?;
    if artifacts.is_empty() {
        warn!(dir = %judgments_dir.display(), "no window artifacts found");
    }

    let cleaner = ResponseCleaner::new()?;
    let outcome = reconcile(&artifacts, &index, &cleaner)?;
    let task = load_prompt(options.synthesis_prompt_file.as_deref(), SYNTHESIS_PROMPT)?;
    let final_path = options
        .final_path
        .clone()
        .unwrap_or_else(|| judgments_dir.join(FINAL_ARTIFACT_NAME));

    let synthesis = synthesize(service, pacer, retry, &outcome.corpus, &task).and_then(|text| {
        write_final_artifact(&final_path, &text)?;
        sha256_file(&final_path)
    });

    let mut warnings = Vec::new();
    if !index.collisions().is_empty() {
        warnings.push(format!(
            "{} duplicate composite key(s) in report",
            index.collisions().len()
        ));
    }
    if outcome.judgments_unmatched > 0 {
        warnings.push(format!(
            "{} judgment(s) did not match a report row",
            outcome.judgments_unmatched
        ));
    }
    if outcome.judgments_malformed > 0 {
        warnings.push(format!(
            "{} malformed judgment record(s) skipped",
            outcome.judgments_malformed
        ));
    }

    let (status, final_sha256) = match &synthesis {
        Ok(digest) => ("completed", Some(digest.clone())),
        Err(err) => {
            warnings.push(format!("synthesis failed: {err:#}"));
            ("failed", None)
        }
    };

    let manifest = ReconcileRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id,
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        model: service.model_id().to_string(),
        report_path: report_path.display().to_string(),
        judgments_dir: judgments_dir.display().to_string(),
        final_path: final_path.display().to_string(),
        final_sha256,
        counts: ReconcileCounts {
            index_rows: index.len(),
            key_collisions: index.collisions().len(),
            artifacts_found: outcome.artifacts_found,
            artifacts_parsed: outcome.artifacts_parsed,
            judgments_total: outcome.judgments_total,
            judgments_matched: outcome.judgments_matched,
            judgments_unmatched: outcome.judgments_unmatched,
            judgments_malformed: outcome.judgments_malformed,
            corpus_chars: outcome.corpus.chars().count(),
        },
        collisions: index.collisions().to_vec(),
        skipped_artifacts: outcome.skipped,
        warnings,
    };

    let manifest_path = manifest_path(
        output_dir,
        RECONCILE_MANIFEST_PREFIX,
        &utc_compact_string(started_ts),
    );
    write_json_pretty(&manifest_path, &manifest)?;
    info!(path = %manifest_path.display(), status, "wrote reconcile manifest");

    synthesis.with_context(|| format!("reconcile run {} did not complete", manifest.run_id))?;
    info!(path = %final_path.display(), "wrote final artifact");

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::commands::dispatch::tests::CannedService;
    use crate::error::ModelError;
    use crate::model::{ReportRow, Tags};
    use crate::report::write_report;

    fn row(id: i64, kind: &str, name: &str) -> ReportRow {
        let mut tags = Tags::new();
        tags.insert("name".to_string(), name.to_string());
        ReportRow {
            id,
            kind: kind.to_string(),
            tags,
            org_count: 0,
            organizations: Vec::new(),
        }
    }

    fn fixture(dir: &TempDir) -> (PathBuf, PathBuf) {
        let report_path = dir.path().join("report.csv");
        write_report(
            &report_path,
            &[row(1, "way", "Mall"), row(2, "relation", "Campus"), row(1, "way", "Mall v2")],
        )
        .expect("write report");

        let judgments_dir = dir.path().join("judgments");
        fs::create_dir_all(&judgments_dir).expect("create judgments dir");
        fs::write(
            judgments_dir.join("window_0000.txt"),
            "```json\n[{\"id\": \"1\", \"type\": \"way\"}, {\"id\": 9, \"type\": \"way\"}]\n```",
        )
        .expect("write window 0");
        fs::write(judgments_dir.join("window_0001.txt"), "Sorry, I cannot help.")
            .expect("write window 1");
        fs::write(
            judgments_dir.join("window_0002.json"),
            "{\"id\": 2, \"type\": \"relation\"}",
        )
        .expect("write window 2");

        (report_path, judgments_dir)
    }

    fn options() -> ReconcileOptions {
        ReconcileOptions {
            synthesis_prompt_file: None,
            final_path: None,
        }
    }

    #[test]
    fn reconcile_writes_final_artifact_and_manifest() {
        let dir = TempDir::new().expect("create temp dir");
        let (report_path, judgments_dir) = fixture(&dir);
        let service = CannedService::new(vec![Ok("1. Mall\n\n2. Campus".to_string())]);
        let mut pacer = MinIntervalPacer::new(Duration::ZERO);

        let manifest = execute(
            &service,
            &mut pacer,
            &RetryPolicy::no_retry(),
            &report_path,
            &judgments_dir,
            dir.path(),
            &options(),
        )
        .expect("reconcile succeeds");

        assert_eq!(manifest.status, "completed");
        assert_eq!(manifest.counts.index_rows, 2);
        assert_eq!(manifest.counts.key_collisions, 1);
        assert_eq!(manifest.counts.artifacts_found, 3);
        assert_eq!(manifest.counts.artifacts_parsed, 2);
        assert_eq!(manifest.counts.judgments_matched, 2);
        assert_eq!(manifest.counts.judgments_unmatched, 1);
        assert_eq!(manifest.skipped_artifacts.len(), 1);

        let prompts = service.prompts.borrow();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("\"Mall v2\""));
        assert!(!prompts[0].contains("\"Mall\""));
        assert!(prompts[0].ends_with(SYNTHESIS_PROMPT));

        let final_path = judgments_dir.join(FINAL_ARTIFACT_NAME);
        let stored = fs::read_to_string(&final_path).expect("final artifact written");
        assert_eq!(stored, "\"1. Mall\\n\\n2. Campus\"");
        assert_eq!(
            manifest.final_sha256,
            Some(sha256_file(&final_path).expect("hash final"))
        );
    }

    #[test]
    fn failed_synthesis_is_recorded_and_returned() {
        let dir = TempDir::new().expect("create temp dir");
        let (report_path, judgments_dir) = fixture(&dir);
        let service = CannedService::new(vec![Err(ModelError::Status {
            status: 400,
            body: "context too long".to_string(),
        })]);
        let mut pacer = MinIntervalPacer::new(Duration::ZERO);

        let err = execute(
            &service,
            &mut pacer,
            &RetryPolicy::no_retry(),
            &report_path,
            &judgments_dir,
            dir.path(),
            &options(),
        )
        .expect_err("synthesis fails");
        assert!(format!("{err:#}").contains("context too long"));
        assert!(!judgments_dir.join(FINAL_ARTIFACT_NAME).exists());

        let (_, manifest) = load_latest_manifest::<ReconcileRunManifest>(
            dir.path(),
            RECONCILE_MANIFEST_PREFIX,
        )
        .expect("scan manifests")
        .expect("manifest written");
        assert_eq!(manifest.status, "failed");
        assert!(manifest.final_sha256.is_none());
    }
}
