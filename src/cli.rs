use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::overpass::DEFAULT_OVERPASS_URL;

#[derive(Parser, Debug)]
#[command(
    name = "vendsite",
    version,
    about = "Building/organization collection and LLM-assisted vending site selection"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch buildings with their organizations and write the CSV report
    Collect(CollectArgs),
    /// Send the report window by window to the completion service
    Dispatch(DispatchArgs),
    /// Join judgments with the report and request the final synthesis
    Reconcile(ReconcileArgs),
    /// Collect, dispatch and reconcile in one go
    Run(RunArgs),
    /// Summarize the latest run manifests
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CollectArgs {
    #[arg(long)]
    pub city: String,

    #[arg(long, default_value = ".cache/vendsite")]
    pub output_dir: PathBuf,

    #[arg(long, env = "VENDSITE_OVERPASS_URL", default_value = DEFAULT_OVERPASS_URL)]
    pub overpass_url: String,

    /// Server-side timeout written into the Overpass query
    #[arg(long, default_value_t = 36000)]
    pub query_timeout_secs: u64,

    #[arg(long, default_value_t = 3600)]
    pub http_timeout_secs: u64,

    /// Read the Overpass JSON document from a file instead of the network
    #[arg(long)]
    pub elements_file: Option<PathBuf>,

    /// Defaults to `<output-dir>/report_<city>.csv`
    #[arg(long)]
    pub report_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct LlmArgs {
    #[arg(long, env = "VENDSITE_LLM_BASE_URL", default_value = "https://openrouter.ai/api/v1")]
    pub llm_base_url: String,

    #[arg(long, env = "VENDSITE_LLM_MODEL", default_value = "deepseek/deepseek-r1:free")]
    pub llm_model: String,

    #[arg(long, env = "VENDSITE_LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Sent as `HTTP-Referer`
    #[arg(long, env = "VENDSITE_LLM_REFERER")]
    pub llm_referer: Option<String>,

    /// Sent as `X-Title`
    #[arg(long, env = "VENDSITE_LLM_TITLE")]
    pub llm_title: Option<String>,

    #[arg(long, default_value_t = 600)]
    pub llm_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct RetryArgs {
    /// Attempts per request; 1 disables retry
    #[arg(long, default_value_t = 1)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 10_000)]
    pub initial_backoff_ms: u64,

    #[arg(long, default_value_t = 120_000)]
    pub max_backoff_ms: u64,

    /// Growth factor between retry delays; at least 1.0
    #[arg(long, default_value_t = 2.0, value_parser = parse_backoff_multiplier)]
    pub backoff_multiplier: f64,
}

fn parse_backoff_multiplier(value: &str) -> Result<f64, String> {
    let multiplier: f64 = value
        .parse()
        .map_err(|err| format!("`{value}` is not a number: {err}"))?;
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(format!("`{value}` must be a finite number of at least 1.0"));
    }
    Ok(multiplier)
}

#[derive(Args, Debug, Clone)]
pub struct DispatchArgs {
    /// Defaults to the report of the latest collect run
    #[arg(long)]
    pub report_path: Option<PathBuf>,

    #[arg(long, default_value = ".cache/vendsite")]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub options: DispatchOptions,

    #[command(flatten)]
    pub llm: LlmArgs,
}

/// Dispatch settings shared by `dispatch` and `run`.
#[derive(Args, Debug, Clone)]
pub struct DispatchOptions {
    #[arg(long, default_value_t = 100_000)]
    pub window_chars: usize,

    /// Minimum pause between consecutive completion requests
    #[arg(long, default_value_t = 5_000)]
    pub min_interval_ms: u64,

    #[command(flatten)]
    pub retry: RetryArgs,

    /// Also store each response cleaned and pretty-printed as JSON
    #[arg(long, default_value_t = false)]
    pub save_structured: bool,

    /// Stop dispatching new windows once this many seconds have passed
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    #[arg(long)]
    pub preamble_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileArgs {
    /// Defaults to the report of the latest dispatch run
    #[arg(long)]
    pub report_path: Option<PathBuf>,

    /// Defaults to the judgments directory of the latest dispatch run
    #[arg(long)]
    pub judgments_dir: Option<PathBuf>,

    #[arg(long, default_value = ".cache/vendsite")]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub options: ReconcileOptions,

    #[command(flatten)]
    pub retry: RetryArgs,

    #[command(flatten)]
    pub llm: LlmArgs,
}

/// Reconcile settings shared by `reconcile` and `run`.
#[derive(Args, Debug, Clone)]
pub struct ReconcileOptions {
    #[arg(long)]
    pub synthesis_prompt_file: Option<PathBuf>,

    /// Defaults to `<judgments-dir>/final.txt`
    #[arg(long)]
    pub final_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub collect: CollectArgs,

    #[command(flatten)]
    pub dispatch: DispatchOptions,

    #[command(flatten)]
    pub reconcile: ReconcileOptions,

    #[command(flatten)]
    pub llm: LlmArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/vendsite")]
    pub output_dir: PathBuf,
}
