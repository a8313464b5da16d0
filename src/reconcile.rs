//! Joins model judgments back to report rows and prepares the final
//! synthesis request.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::cleaning::{ParsedJudgments, ResponseCleaner, parse_judgment_document};
use crate::dispatch::{complete_with_retry, parse_window_file_name};
use crate::error::ResponseParseError;
use crate::index::CompositeKeyIndex;
use crate::llm::CompletionService;
use crate::model::{ModelJudgment, SkippedArtifact};
use crate::pacing::{RequestPacer, RetryPolicy};
use crate::prompts::compose_prompt;
use crate::util::{text_preview, write_text_file};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JudgmentArtifact {
    pub window: usize,
    pub path: PathBuf,
    /// Already cleaned and parsed by the dispatcher.
    pub structured: bool,
}

/// Window artifacts in `dir`, one per window index, in window order. A
/// structured `.json` copy wins over the raw `.txt` response.
pub fn discover_artifacts(dir: &Path) -> Result<Vec<JudgmentArtifact>> {
    let mut by_window = BTreeMap::<usize, JudgmentArtifact>::new();

    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some((window, extension)) = parse_window_file_name(name) else {
            continue;
        };

        let structured = match extension {
            "json" => true,
            "txt" => false,
            _ => continue,
        };

        let keep_existing = by_window
            .get(&window)
            .map(|existing| existing.structured && !structured)
            .unwrap_or(false);
        if !keep_existing {
            by_window.insert(
                window,
                JudgmentArtifact {
                    window,
                    path,
                    structured,
                },
            );
        }
    }

    Ok(by_window.into_values().collect())
}

/// Outcome of matching every artifact against the index.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// One compact JSON report row per matched judgment, newline-terminated.
    pub corpus: String,
    pub artifacts_found: usize,
    pub artifacts_parsed: usize,
    pub judgments_total: usize,
    pub judgments_matched: usize,
    pub judgments_unmatched: usize,
    /// Records inside a parsed artifact that are not judgments.
    pub judgments_malformed: usize,
    pub skipped: Vec<SkippedArtifact>,
}

pub fn reconcile(
    artifacts: &[JudgmentArtifact],
    index: &CompositeKeyIndex,
    cleaner: &ResponseCleaner,
) -> Result<Reconciliation> {
    let mut outcome = Reconciliation {
        artifacts_found: artifacts.len(),
        ..Reconciliation::default()
    };

    for artifact in artifacts {
        let parsed = match load_judgments(artifact, cleaner)? {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    path = %err.path.display(),
                    error = %err.source,
                    fragment = %err.fragment,
                    "skipping unparseable judgment artifact"
                );
                outcome.skipped.push(SkippedArtifact {
                    path: err.path.display().to_string(),
                    reason: err.source.to_string(),
                    fragment: err.fragment,
                });
                continue;
            }
        };

        outcome.artifacts_parsed += 1;
        for bad in &parsed.malformed {
            warn!(
                path = %artifact.path.display(),
                position = bad.position,
                reason = %bad.reason,
                "skipping malformed judgment"
            );
        }
        outcome.judgments_malformed += parsed.malformed.len();
        append_matches(&parsed.judgments, index, &mut outcome)?;
    }

    info!(
        artifacts = outcome.artifacts_found,
        skipped = outcome.skipped.len(),
        judgments = outcome.judgments_total,
        matched = outcome.judgments_matched,
        unmatched = outcome.judgments_unmatched,
        malformed = outcome.judgments_malformed,
        "judgments reconciled"
    );

    Ok(outcome)
}

/// The outer error is an I/O failure and aborts; the inner one is a parse
/// failure the caller skips.
fn load_judgments(
    artifact: &JudgmentArtifact,
    cleaner: &ResponseCleaner,
) -> Result<Result<ParsedJudgments, ResponseParseError>> {
    let raw = fs::read_to_string(&artifact.path)
        .with_context(|| format!("failed to read {}", artifact.path.display()))?;

    if !artifact.structured {
        return Ok(cleaner.parse_judgments(&artifact.path, &raw));
    }

    Ok(
        parse_judgment_document(&raw).map_err(|source| ResponseParseError {
            path: artifact.path.clone(),
            fragment: text_preview(raw.trim(), 200),
            source,
        }),
    )
}

fn append_matches(
    judgments: &[ModelJudgment],
    index: &CompositeKeyIndex,
    outcome: &mut Reconciliation,
) -> Result<()> {
    for judgment in judgments {
        outcome.judgments_total += 1;

        let row = judgment.key().and_then(|key| index.get(&key));
        match row {
            Some(row) => {
                let line = serde_json::to_string(row)
                    .with_context(|| format!("failed to serialize report row {}", row.key()))?;
                outcome.corpus.push_str(&line);
                outcome.corpus.push('\n');
                outcome.judgments_matched += 1;
            }
            None => {
                debug!(id = ?judgment.id, kind = %judgment.kind, "judgment has no report row");
                outcome.judgments_unmatched += 1;
            }
        }
    }

    Ok(())
}

/// Sends the combined corpus with the synthesis task in one request. The
/// corpus is not windowed here; an oversized corpus is left to the service
/// to reject.
pub fn synthesize<S, P>(
    service: &S,
    pacer: &mut P,
    retry: &RetryPolicy,
    corpus: &str,
    task: &str,
) -> Result<String>
where
    S: CompletionService + ?Sized,
    P: RequestPacer,
{
    if corpus.trim().is_empty() {
        bail!("no judgment matched a report row; nothing to synthesize");
    }

    let prompt = compose_prompt(corpus, task);
    info!(
        corpus_chars = corpus.chars().count(),
        model = %service.model_id(),
        "sending synthesis request"
    );

    let (text, attempts) = complete_with_retry(service, pacer, retry, 0, &prompt).map_err(
        |(attempts, err)| anyhow!(err).context(format!(
            "synthesis request failed after {attempts} attempt(s)"
        )),
    )?;
    info!(attempts, response_chars = text.chars().count(), "synthesis completed");

    Ok(text)
}

/// The final artifact holds the completion as a single JSON string.
pub fn write_final_artifact(path: &Path, completion: &str) -> Result<()> {
    let encoded =
        serde_json::to_string(completion).context("failed to encode final completion")?;
    write_text_file(path, &encoded)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use super::*;
    use crate::error::ModelError;
    use crate::model::{ReportRow, Tags};
    use crate::pacing::MinIntervalPacer;
    use tempfile::TempDir;

    struct EchoService {
        prompts: RefCell<Vec<String>>,
        fail_with: Option<u16>,
    }

    impl CompletionService for EchoService {
        fn complete(&self, prompt: &str) -> Result<String, ModelError> {
            self.prompts.borrow_mut().push(prompt.to_string());
            match self.fail_with {
                Some(status) => Err(ModelError::Status {
                    status,
                    body: "unavailable".to_string(),
                }),
                None => Ok(format!("ranked {} chars", prompt.chars().count())),
            }
        }

        fn model_id(&self) -> &str {
            "echo"
        }
    }

    fn row(id: i64, kind: &str) -> ReportRow {
        ReportRow {
            id,
            kind: kind.to_string(),
            tags: Tags::from([("name".to_string(), format!("Building {id}"))]),
            org_count: 1,
            organizations: Vec::new(),
        }
    }

    fn index() -> CompositeKeyIndex {
        CompositeKeyIndex::build(vec![row(1, "way"), row(2, "relation"), row(3, "way")])
    }

    fn cleaner() -> ResponseCleaner {
        ResponseCleaner::new().expect("fence regex compiles")
    }

    #[test]
    fn discover_prefers_structured_copy_and_orders_by_window() {
        let dir = TempDir::new().expect("create temp dir");
        for name in [
            "window_0001.txt",
            "window_0000.txt",
            "window_0000.json",
            "notes.txt",
            "window_0002.md",
        ] {
            fs::write(dir.path().join(name), "[]").expect("write artifact");
        }

        let artifacts = discover_artifacts(dir.path()).expect("discover");
        let summary: Vec<(usize, bool)> = artifacts
            .iter()
            .map(|artifact| (artifact.window, artifact.structured))
            .collect();
        assert_eq!(summary, vec![(0, true), (1, false)]);
    }

    #[test]
    fn matched_rows_are_appended_in_judgment_order() {
        let dir = TempDir::new().expect("create temp dir");
        fs::write(
            dir.path().join("window_0000.txt"),
            "```json\n[{\"id\": 3, \"type\": \"way\"}, {\"id\": \"1\", \"type\": \"way\"}]\n```",
        )
        .expect("write artifact");
        fs::write(
            dir.path().join("window_0001.json"),
            r#"[{"id": 2, "type": "relation", "foot_traffic": 7}]"#,
        )
        .expect("write artifact");

        let artifacts = discover_artifacts(dir.path()).expect("discover");
        let outcome = reconcile(&artifacts, &index(), &cleaner()).expect("reconcile");

        let ids: Vec<i64> = outcome
            .corpus
            .lines()
            .map(|line| {
                serde_json::from_str::<ReportRow>(line)
                    .expect("corpus line is a report row")
                    .id
            })
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(outcome.judgments_matched, 3);
        assert_eq!(outcome.judgments_unmatched, 0);
        assert_eq!(outcome.artifacts_parsed, 2);
    }

    #[test]
    fn unmatched_judgments_are_dropped_without_error() {
        let dir = TempDir::new().expect("create temp dir");
        fs::write(
            dir.path().join("window_0000.txt"),
            r#"[{"id": 5, "type": "way"}, {"id": 1, "type": "relation"}, {"id": "n/a", "type": "way"}, {"id": 1, "type": "way"}]"#,
        )
        .expect("write artifact");

        let artifacts = discover_artifacts(dir.path()).expect("discover");
        let outcome = reconcile(&artifacts, &index(), &cleaner()).expect("reconcile");

        assert_eq!(outcome.judgments_total, 4);
        assert_eq!(outcome.judgments_matched, 1);
        assert_eq!(outcome.judgments_unmatched, 3);
        assert_eq!(outcome.corpus.lines().count(), 1);
        assert!(!outcome.corpus.contains("\"id\":5"));
    }

    #[test]
    fn malformed_records_keep_the_rest_of_the_window() {
        let dir = TempDir::new().expect("create temp dir");
        fs::write(
            dir.path().join("window_0000.txt"),
            r#"[{"id":1,"type":"way"},{"id":2,"type":"relation"},{"id":3,"name":"no type"}]"#,
        )
        .expect("write artifact");
        fs::write(
            dir.path().join("window_0001.json"),
            r#"[{"id": 3.0, "type": "way"}, {"id": 9, "kind": "way"}]"#,
        )
        .expect("write artifact");

        let artifacts = discover_artifacts(dir.path()).expect("discover");
        let outcome = reconcile(&artifacts, &index(), &cleaner()).expect("reconcile");

        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.artifacts_parsed, 2);
        assert_eq!(outcome.judgments_matched, 3);
        assert_eq!(outcome.judgments_malformed, 2);
        assert_eq!(outcome.corpus.lines().count(), 3);
    }

    #[test]
    fn unparseable_artifacts_are_skipped_and_recorded() {
        let dir = TempDir::new().expect("create temp dir");
        fs::write(dir.path().join("window_0000.txt"), "I could not decide.").expect("write");
        fs::write(dir.path().join("window_0001.txt"), r#"[{"id": 2, "type": "relation"}]"#)
            .expect("write");

        let artifacts = discover_artifacts(dir.path()).expect("discover");
        let outcome = reconcile(&artifacts, &index(), &cleaner()).expect("reconcile");

        assert_eq!(outcome.artifacts_found, 2);
        assert_eq!(outcome.artifacts_parsed, 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].path.ends_with("window_0000.txt"));
        assert_eq!(outcome.skipped[0].fragment, "I could not decide.");
        assert_eq!(outcome.judgments_matched, 1);
    }

    #[test]
    fn final_artifact_is_a_single_json_string() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("final.txt");
        write_final_artifact(&path, "Line one\n\"Quoted\"").expect("write final");

        let text = fs::read_to_string(&path).expect("read final");
        assert_eq!(text, r#""Line one\n\"Quoted\"""#);
        let decoded: String = serde_json::from_str(&text).expect("valid json string");
        assert_eq!(decoded, "Line one\n\"Quoted\"");
    }

    #[test]
    fn synthesis_sends_corpus_followed_by_task() {
        let service = EchoService {
            prompts: RefCell::new(Vec::new()),
            fail_with: None,
        };
        let mut pacer = MinIntervalPacer::new(Duration::ZERO);

        let text = synthesize(
            &service,
            &mut pacer,
            &RetryPolicy::no_retry(),
            "{\"id\":1}\n",
            "TASK",
        )
        .expect("synthesis succeeds");

        assert_eq!(service.prompts.borrow().as_slice(), ["{\"id\":1}\n\nTASK"]);
        assert!(text.starts_with("ranked"));
    }

    #[test]
    fn synthesis_refuses_empty_corpus_and_reports_service_failure() {
        let service = EchoService {
            prompts: RefCell::new(Vec::new()),
            fail_with: Some(502),
        };
        let mut pacer = MinIntervalPacer::new(Duration::ZERO);

        let empty = synthesize(&service, &mut pacer, &RetryPolicy::no_retry(), " \n", "TASK");
        assert!(empty.is_err());
        assert!(service.prompts.borrow().is_empty());

        let retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 2.0,
        };
        let err = synthesize(&service, &mut pacer, &retry, "row\n", "TASK")
            .expect_err("service keeps failing");
        assert!(err.to_string().contains("after 2 attempt(s)"));
        assert_eq!(service.prompts.borrow().len(), 2);
    }
}
