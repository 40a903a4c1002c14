use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use evalflow_types::{BatchState, EvaluatorOutcome, EvaluationInput, ProgressEvent, RowResult};

/// Boxed future returned by user hooks. The engine awaits it before
/// advancing its state machine.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Called on every emitted progress event.
pub type ProgressHook = Arc<dyn Fn(ProgressEvent) -> HookFuture + Send + Sync>;

/// Called for each row after its export, before the in-memory commit.
/// A failure here sends the row back through the retry loop.
pub type ResultHook = Arc<dyn Fn(RowResult) -> HookFuture + Send + Sync>;

/// Called whenever a state snapshot is saved.
pub type StateHook = Arc<dyn Fn(BatchState) -> HookFuture + Send + Sync>;

/// Decides whether a row is written by an exporter.
pub type FilterHook = Arc<dyn Fn(&RowResult) -> bool + Send + Sync>;

/// Combines a row's outcomes into a single numeric score.
pub type CombineHook = Arc<dyn Fn(&[EvaluatorOutcome]) -> f64 + Send + Sync>;

/// Wrap an async closure as a [`ProgressHook`].
pub fn progress_hook<F, Fut>(f: F) -> ProgressHook
where
    F: Fn(ProgressEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Wrap an async closure as a [`ResultHook`].
pub fn result_hook<F, Fut>(f: F) -> ResultHook
where
    F: Fn(RowResult) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |row| Box::pin(f(row)))
}

/// Wrap an async closure as a [`StateHook`].
pub fn state_hook<F, Fut>(f: F) -> StateHook
where
    F: Fn(BatchState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |state| Box::pin(f(state)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Dispatch all evaluators of a row concurrently and await all.
    #[default]
    Parallel,
    /// Run evaluators in declaration order.
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    /// Substring allow-list; when non-empty it replaces the default
    /// classifier and matches case-sensitively.
    #[serde(default)]
    pub retry_on_errors: Vec<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: true,
            retry_on_errors: Vec::new(),
        }
    }
}

/// Sliding-window request quotas enforced at gate admission.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_hour: Option<u32>,
}

/// Fixed assumptions behind the best-effort cost and remaining-token
/// estimates on progress events. Never feeds control decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostModel {
    pub tokens_per_row: u64,
    pub price_per_million_tokens: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// Resolve by file extension (`.csv`/`.tsv` delimited, `.json` structured).
    #[default]
    Auto,
    Csv,
    Json,
}

/// Delimited-text input options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvOptions {
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_quote")]
    pub quote: char,
    /// Escape character inside quoted fields; `None` means doubled quotes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escape: Option<char>,
    #[serde(default = "default_true")]
    pub has_headers: bool,
    #[serde(default = "default_true")]
    pub skip_empty_lines: bool,
    /// Column name (or zero-based index when headerless) to semantic field
    /// name, e.g. `"output" -> "candidate_text"`.
    #[serde(default)]
    pub field_map: HashMap<String, String>,
}

fn default_delimiter() -> char {
    ','
}

fn default_quote() -> char {
    '"'
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            quote: default_quote(),
            escape: None,
            has_headers: true,
            skip_empty_lines: true,
            field_map: HashMap::new(),
        }
    }
}

/// Structured-document input options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JsonOptions {
    /// Dotted path to the row array; `None` requires the root to be an array.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Csv,
    Json,
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    /// Rows per request for bulk export. Streaming posts one row per call.
    #[serde(default = "default_webhook_batch_size")]
    pub batch_size: usize,
}

fn default_webhook_timeout_ms() -> u64 {
    30_000
}

fn default_webhook_batch_size() -> usize {
    100
}

/// Destination description shared by the streaming sink and the post-hoc
/// exporter.
#[derive(Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    pub format: ExportFormat,
    /// File destination for `Csv`/`Json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Delimited-text only: append to an existing file, skipping the header.
    #[serde(default)]
    pub append_to_existing: bool,
    /// Delimited-text only: flatten outcomes into columns instead of a
    /// single escaped `results` column.
    #[serde(default = "default_true")]
    pub flatten_outcomes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_fields: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    #[serde(skip)]
    pub filter_condition: Option<FilterHook>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

impl ExportConfig {
    pub fn csv_file(path: impl Into<PathBuf>) -> Self {
        Self {
            format: ExportFormat::Csv,
            path: Some(path.into()),
            ..Self::empty()
        }
    }

    pub fn json_file(path: impl Into<PathBuf>) -> Self {
        Self {
            format: ExportFormat::Json,
            path: Some(path.into()),
            ..Self::empty()
        }
    }

    pub fn webhook(config: WebhookConfig) -> Self {
        Self {
            format: ExportFormat::Webhook,
            webhook: Some(config),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            format: ExportFormat::Json,
            path: None,
            append_to_existing: false,
            flatten_outcomes: true,
            include_fields: None,
            exclude_fields: Vec::new(),
            filter_condition: None,
            webhook: None,
        }
    }
}

/// Engine options. Hooks are `Arc`'d closures, so the whole struct stays
/// cheap to clone.
#[derive(Clone)]
pub struct BatchOptions {
    /// Max simultaneously admitted row tasks.
    pub concurrency: usize,
    pub execution_mode: ExecutionMode,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    /// Minimum milliseconds between `progress`-kind emissions.
    pub progress_interval_ms: u64,
    pub on_progress: Option<ProgressHook>,
    pub on_result: Option<ResultHook>,
    pub stream_export: Option<ExportConfig>,
    pub resume_from_state: Option<BatchState>,
    pub state_file: Option<PathBuf>,
    pub save_state_interval_ms: Option<u64>,
    pub on_state_save: Option<StateHook>,
    pub stop_on_error: bool,
    /// Per-evaluator wall-time budget in milliseconds.
    pub timeout_ms: Option<u64>,
    pub combine_scores: Option<CombineHook>,
    pub default_input: Option<EvaluationInput>,
    pub cost: Option<CostModel>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            execution_mode: ExecutionMode::Parallel,
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            progress_interval_ms: 1000,
            on_progress: None,
            on_result: None,
            stream_export: None,
            resume_from_state: None,
            state_file: None,
            save_state_interval_ms: None,
            on_state_save: None,
            stop_on_error: false,
            timeout_ms: None,
            combine_scores: None,
            default_input: None,
            cost: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_config_defaults() {
        let cfg: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay_ms, 1000);
        assert!(cfg.exponential_backoff);
        assert!(cfg.retry_on_errors.is_empty());
    }

    #[test]
    fn export_config_deserializes_without_filter() {
        let cfg: ExportConfig = serde_json::from_str(
            r#"{"format": "csv", "path": "out.csv", "append_to_existing": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.format, ExportFormat::Csv);
        assert!(cfg.append_to_existing);
        assert!(cfg.flatten_outcomes);
        assert!(cfg.filter_condition.is_none());
    }

    #[test]
    fn batch_options_defaults() {
        let options = BatchOptions::default();
        assert_eq!(options.concurrency, 5);
        assert_eq!(options.execution_mode, ExecutionMode::Parallel);
        assert_eq!(options.progress_interval_ms, 1000);
        assert!(!options.stop_on_error);
    }
}
