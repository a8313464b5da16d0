//! Error types for the collection and model pipelines
//!
//! Command runners wrap these in `anyhow` with file/step context; the typed
//! variants exist so callers can tell a timeout from a service failure and
//! decide what is retryable.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures while obtaining the element stream from the geographic source
#[derive(Debug, Error)]
pub enum FetchError {
    /// The request did not complete within the client timeout
    #[error("overpass request timed out after {}s", ceiling.as_secs())]
    Timeout { ceiling: Duration },

    /// Connection, TLS or body transfer failure
    #[error("overpass request failed: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("overpass returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body is not the expected JSON document
    #[error("overpass response is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    /// The server answered with a document but aborted the query
    #[error("overpass reported a runtime error: {0}")]
    Remark(String),

    /// An element is missing required fields or has an unknown type
    #[error("element #{index} is malformed: {source}")]
    MalformedElement {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures of a single completion request
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("completion request timed out after {}s", ceiling.as_secs())]
    Timeout { ceiling: Duration },

    #[error("completion request failed: {0}")]
    Transport(String),

    #[error("completion service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered with an error object or an unexpected shape
    #[error("completion response is malformed: {0}")]
    Malformed(String),

    #[error("completion service returned an empty message")]
    EmptyCompletion,
}

impl ModelError {
    /// Whether a later attempt can plausibly succeed.
    ///
    /// 429 and 5xx are upstream pressure; other 4xx mean the request itself
    /// is wrong and repeating it changes nothing.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport(_) | Self::EmptyCompletion => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Malformed(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("window size must be at least one character")]
    ZeroWindow,

    #[error("window {index} failed after {attempts} attempt(s): {source}")]
    Window {
        index: usize,
        attempts: u32,
        #[source]
        source: ModelError,
    },

    #[error("dispatch cancelled after {completed} completed window(s)")]
    Cancelled { completed: usize },

    #[error("failed to persist window {index} to {}: {source}", path.display())]
    Persist {
        index: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A judgment artifact whose cleaned text is not a judgment list
#[derive(Debug, Error)]
#[error("failed to parse judgments in {}: {source}", path.display())]
pub struct ResponseParseError {
    pub path: PathBuf,
    pub fragment: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error)]
pub enum ReportFormatError {
    #[error("report is empty; expected a header row")]
    MissingHeader,

    #[error("report header is missing column `{0}`")]
    MissingColumn(&'static str),

    #[error("report ends inside a quoted cell")]
    UnterminatedQuote,

    #[error("record {record}: {reason}")]
    Record { record: usize, reason: String },
}
