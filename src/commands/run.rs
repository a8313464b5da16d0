use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use tracing::info;

use crate::cli::RunArgs;
use crate::commands::{collect, dispatch, reconcile, retry_policy};
use crate::llm::{CompletionService, LlmClient};
use crate::model::ReconcileRunManifest;
use crate::pacing::{MinIntervalPacer, RequestPacer};

pub fn run(args: RunArgs) -> Result<()> {
    let client = LlmClient::from_args(&args.llm)?;
    execute(&client, &args)?;
    Ok(())
}

/// Collect, dispatch and reconcile against one output directory. Each stage
/// writes its own manifest; the first failing stage stops the run.
pub fn execute<S: CompletionService + ?Sized>(
    service: &S,
    args: &RunArgs,
) -> Result<ReconcileRunManifest> {
    let output_dir = &args.collect.output_dir;

    let collected = collect::execute(&args.collect)?;
    if collected.report_rows == 0 {
        bail!(
            "no building with organizations found for {}; nothing to dispatch",
            args.collect.city
        );
    }

    let report_path = PathBuf::from(&collected.paths.report_path);
    let dispatched = dispatch::execute(service, &report_path, output_dir, &args.dispatch)?;

    // The last window just finished, so the synthesis request waits a full
    // interval like any other request.
    let mut pacer = MinIntervalPacer::new(Duration::from_millis(args.dispatch.min_interval_ms));
    pacer.record_completion();
    let retry = retry_policy(&args.dispatch.retry);

    let reconciled = reconcile::execute(
        service,
        &mut pacer,
        &retry,
        &report_path,
        Path::new(&dispatched.judgments_dir),
        output_dir,
        &args.reconcile,
    )?;

    info!(
        city = %args.collect.city,
        buildings = collected.report_rows,
        windows = dispatched.windows.len(),
        matched = reconciled.counts.judgments_matched,
        final_path = %reconciled.final_path,
        "pipeline completed"
    );

    Ok(reconciled)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::cli::{LlmArgs, ReconcileOptions};
    use crate::commands::collect::tests::{SAMPLE_ELEMENTS, offline_args};
    use crate::commands::dispatch::tests::{CannedService, options};

    fn run_args(dir: &TempDir, elements: &str) -> RunArgs {
        RunArgs {
            collect: offline_args(dir, elements),
            dispatch: options(100_000),
            reconcile: ReconcileOptions {
                synthesis_prompt_file: None,
                final_path: None,
            },
            llm: LlmArgs {
                llm_base_url: "http://127.0.0.1:9".to_string(),
                llm_model: "unused".to_string(),
                llm_api_key: None,
                llm_referer: None,
                llm_title: None,
                llm_timeout_secs: 1,
            },
        }
    }

    #[test]
    fn pipeline_runs_from_elements_to_final_artifact() {
        let dir = TempDir::new().expect("create temp dir");
        let args = run_args(&dir, SAMPLE_ELEMENTS);
        let service = CannedService::new(vec![
            Ok("```json\n[{\"id\": 3, \"type\": \"relation\", \"foot_traffic\": 7}]\n```".to_string()),
            Ok("Relation 3: office block, place near the entrance.".to_string()),
        ]);

        let manifest = execute(&service, &args).expect("pipeline succeeds");

        assert_eq!(manifest.status, "completed");
        assert_eq!(manifest.counts.index_rows, 2);
        assert_eq!(manifest.counts.judgments_matched, 1);

        let prompts = service.prompts.borrow();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].starts_with("id,type,info,orgs_count,orgs\n"));
        assert!(prompts[1].starts_with("{\"id\":3,\"type\":\"relation\""));

        let stored = fs::read_to_string(&manifest.final_path).expect("final artifact written");
        assert_eq!(
            serde_json::from_str::<String>(&stored).expect("final artifact is a JSON string"),
            "Relation 3: office block, place near the entrance."
        );
    }

    #[test]
    fn pipeline_stops_before_dispatch_when_report_is_empty() {
        let dir = TempDir::new().expect("create temp dir");
        let args = run_args(&dir, r#"{"elements": [{"type": "way", "id": 1}]}"#);
        let service = CannedService::new(Vec::new());

        let err = execute(&service, &args).expect_err("empty report");

        assert!(err.to_string().contains("nothing to dispatch"));
        assert!(service.prompts.borrow().is_empty());
    }
}
