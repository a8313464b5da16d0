//! Normalization applied to raw completion text before JSON parsing:
//! strip code fences, unescape literal escape sequences, trim.

use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

use crate::error::ResponseParseError;
use crate::model::ModelJudgment;
use crate::util::text_preview;

const FRAGMENT_CHARS: usize = 200;

/// Applied in this order.
const UNESCAPES: [(&str, &str); 4] = [("\\\"", "\""), ("\\n", "\n"), ("\\t", "\t"), ("\\r", "\r")];

pub struct ResponseCleaner {
    fence: Regex,
}

impl ResponseCleaner {
    pub fn new() -> Result<Self> {
        let fence = Regex::new(r"```[A-Za-z0-9_+-]*").context("failed to compile fence regex")?;
        Ok(Self { fence })
    }

    pub fn clean(&self, raw: &str) -> String {
        let stripped = self.strip_fence_markers(raw);
        let unescaped = unescape_sequences(&stripped);
        unescaped.trim().to_string()
    }

    /// Removes ```` ``` ```` markers along with any language tag that follows.
    pub fn strip_fence_markers(&self, text: &str) -> String {
        self.fence.replace_all(text, "").into_owned()
    }

    /// Cleans `raw` and parses it as a judgment list. A single judgment object
    /// is accepted as a one-element list.
    pub fn parse_judgments(
        &self,
        path: &Path,
        raw: &str,
    ) -> Result<ParsedJudgments, ResponseParseError> {
        let cleaned = self.clean(raw);
        parse_judgment_document(&cleaned).map_err(|source| ResponseParseError {
            path: path.to_path_buf(),
            fragment: text_preview(&cleaned, FRAGMENT_CHARS),
            source,
        })
    }
}

pub fn unescape_sequences(text: &str) -> String {
    UNESCAPES
        .iter()
        .fold(text.to_string(), |acc, (escaped, literal)| {
            acc.replace(escaped, literal)
        })
}

/// Judgments decoded from one artifact. Records that are not judgments
/// (missing `type`, unusable `id`) are listed in `malformed` by position and
/// do not affect their neighbours.
#[derive(Debug, Default)]
pub struct ParsedJudgments {
    pub judgments: Vec<ModelJudgment>,
    pub malformed: Vec<MalformedJudgment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MalformedJudgment {
    pub position: usize,
    pub reason: String,
}

/// Parses a JSON array of judgments, or a single judgment object. Only text
/// that is not JSON, or JSON that is neither an array nor an object, fails.
pub fn parse_judgment_document(text: &str) -> Result<ParsedJudgments, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let records = match value {
        serde_json::Value::Object(_) => vec![value],
        other => serde_json::from_value::<Vec<serde_json::Value>>(other)?,
    };

    let mut parsed = ParsedJudgments::default();
    for (position, record) in records.into_iter().enumerate() {
        match serde_json::from_value::<ModelJudgment>(record) {
            Ok(judgment) => parsed.judgments.push(judgment),
            Err(err) => parsed.malformed.push(MalformedJudgment {
                position,
                reason: err.to_string(),
            }),
        }
    }

    Ok(parsed)
}
