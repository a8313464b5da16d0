//! Sequential, window-by-window delivery of the report to the completion
//! service.
//!
//! At most one request is in flight. Each response is written to disk before
//! the next window starts, so the on-disk order always matches window order.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Instant;

use tracing::{info, warn};

use crate::cleaning::ResponseCleaner;
use crate::error::{DispatchError, ModelError};
use crate::llm::CompletionService;
use crate::model::WindowArtifact;
use crate::pacing::{CancelToken, RequestPacer, RetryPolicy};
use crate::prompts::compose_prompt;
use crate::util::{sha256_text, text_preview};

const WINDOW_FILE_PREFIX: &str = "window_";

pub fn window_file_name(index: usize, extension: &str) -> String {
    format!("{WINDOW_FILE_PREFIX}{index:04}.{extension}")
}

/// Inverse of [`window_file_name`]: `window_0007.txt` → `(7, "txt")`.
pub fn parse_window_file_name(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix(WINDOW_FILE_PREFIX)?;
    let (digits, extension) = rest.split_once('.')?;
    if digits.is_empty() || !digits.chars().all(|character| character.is_ascii_digit()) {
        return None;
    }
    Some((digits.parse().ok()?, extension))
}

/// Splits `corpus` into contiguous windows of at most `window_chars`
/// characters. An empty corpus has no windows.
pub fn split_windows(corpus: &str, window_chars: usize) -> Result<Vec<&str>, DispatchError> {
    if window_chars == 0 {
        return Err(DispatchError::ZeroWindow);
    }

    let mut windows = Vec::new();
    let mut start = 0usize;
    let mut chars_in_window = 0usize;

    for (byte_offset, _) in corpus.char_indices() {
        if chars_in_window == window_chars {
            windows.push(&corpus[start..byte_offset]);
            start = byte_offset;
            chars_in_window = 0;
        }
        chars_in_window += 1;
    }

    if chars_in_window > 0 {
        windows.push(&corpus[start..]);
    }

    Ok(windows)
}

/// Sends `prompt` until it succeeds, the failure is not retryable, or the
/// attempt budget is spent. Every attempt goes through `pacer`. `label` only
/// tags log lines. On failure returns the attempt count with the last error.
pub fn complete_with_retry<S, P>(
    service: &S,
    pacer: &mut P,
    retry: &RetryPolicy,
    label: usize,
    prompt: &str,
) -> Result<(String, u32), (u32, ModelError)>
where
    S: CompletionService + ?Sized,
    P: RequestPacer,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut backoff = retry.backoff();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        pacer.wait_turn();
        let result = service.complete(prompt);
        pacer.record_completion();

        match result {
            Ok(text) => return Ok((text, attempt)),
            Err(err) if attempt < max_attempts && err.is_retryable() => {
                let delay = backoff.next_delay();
                warn!(
                    request = label,
                    attempt,
                    max_attempts,
                    retry_in_ms = delay.as_millis(),
                    error = %err,
                    "completion failed, will retry"
                );
                thread::sleep(delay);
            }
            Err(err) => return Err((attempt, err)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub window_chars: usize,
    pub preamble: String,
    pub retry: RetryPolicy,
    pub save_structured: bool,
}

/// Progress of a dispatch run; filled in window by window so a failed run
/// still reports what was persisted.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub corpus_chars: usize,
    pub window_count: usize,
    pub windows: Vec<WindowArtifact>,
    pub warnings: Vec<String>,
}

pub struct ChunkedDispatcher<'a, S: CompletionService + ?Sized, P: RequestPacer> {
    service: &'a S,
    pacer: P,
    cleaner: &'a ResponseCleaner,
    settings: DispatchSettings,
    cancel: CancelToken,
}

impl<'a, S: CompletionService + ?Sized, P: RequestPacer> ChunkedDispatcher<'a, S, P> {
    pub fn new(
        service: &'a S,
        pacer: P,
        cleaner: &'a ResponseCleaner,
        settings: DispatchSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            service,
            pacer,
            cleaner,
            settings,
            cancel,
        }
    }

    pub fn run(
        &mut self,
        corpus: &str,
        out_dir: &Path,
        report: &mut DispatchReport,
    ) -> Result<(), DispatchError> {
        let windows = split_windows(corpus, self.settings.window_chars)?;
        report.corpus_chars = corpus.chars().count();
        report.window_count = windows.len();

        info!(
            corpus_chars = report.corpus_chars,
            window_chars = self.settings.window_chars,
            windows = windows.len(),
            model = %self.service.model_id(),
            "dispatching report windows"
        );

        for (index, window) in windows.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(completed = index, total = windows.len(), "dispatch cancelled");
                return Err(DispatchError::Cancelled { completed: index });
            }

            let started = Instant::now();
            let prompt = compose_prompt(window, &self.settings.preamble);
            let (text, attempts) = complete_with_retry(
                self.service,
                &mut self.pacer,
                &self.settings.retry,
                index,
                &prompt,
            )
            .map_err(|(attempts, source)| DispatchError::Window {
                index,
                attempts,
                source,
            })?;

            let raw_path = out_dir.join(window_file_name(index, "txt"));
            fs::write(&raw_path, &text).map_err(|source| DispatchError::Persist {
                index,
                path: raw_path.clone(),
                source,
            })?;

            let structured_path = if self.settings.save_structured {
                self.save_structured(index, &text, out_dir, &mut report.warnings)?
            } else {
                None
            };

            let artifact = WindowArtifact {
                index,
                chars: window.chars().count(),
                attempts,
                duration_ms: started.elapsed().as_millis(),
                raw_path: raw_path.display().to_string(),
                raw_sha256: sha256_text(&text),
                structured_path,
            };

            info!(
                window = index + 1,
                total = windows.len(),
                attempts,
                elapsed_ms = artifact.duration_ms,
                path = %raw_path.display(),
                "window response saved"
            );
            report.windows.push(artifact);
        }

        Ok(())
    }

    /// Cleans the response and, when it is JSON, stores it pretty-printed.
    /// Unparseable responses only produce a warning; the raw file stays.
    fn save_structured(
        &self,
        index: usize,
        text: &str,
        out_dir: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<Option<String>, DispatchError> {
        let cleaned = self.cleaner.clean(text);
        let value = match serde_json::from_str::<serde_json::Value>(&cleaned) {
            Ok(value) => value,
            Err(err) => {
                let fragment = text_preview(&cleaned, 200);
                warn!(window = index, error = %err, fragment = %fragment, "response is not JSON");
                warnings.push(format!("window {index}: response is not JSON ({err})"));
                return Ok(None);
            }
        };

        let path = out_dir.join(window_file_name(index, "json"));
        let persist_error = |source: std::io::Error| DispatchError::Persist {
            index,
            path: path.clone(),
            source,
        };
        let data = serde_json::to_vec_pretty(&value)
            .map_err(|err| persist_error(std::io::Error::other(err)))?;
        fs::write(&path, data).map_err(persist_error)?;

        Ok(Some(path.display().to_string()))
    }
}
