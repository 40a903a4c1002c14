//! evalflow-core: concurrent batch evaluation engine.
//! Apply a set of evaluators to every row of a tabular input, under bounded
//! concurrency and sliding-window rate limits, with per-row classified
//! retry, live progress events, incremental streaming export, and
//! resumable state. See `examples/simple.rs` for a quickstart.

pub mod config;
pub mod datasource;
pub mod error;
pub mod evaluator;
pub mod export;
pub mod gate;
pub mod progress;
pub mod retry;
pub mod runner;
pub mod sink;
pub mod state;
pub mod testing;

pub mod evaluators {
    pub mod contains;
    pub mod exact;
    pub mod levenshtein;
    pub mod regex;
}

pub use config::{
    progress_hook, result_hook, state_hook, BatchOptions, CombineHook, CostModel, CsvOptions,
    ExecutionMode, ExportConfig, ExportFormat, FilterHook, HttpMethod, InputFormat, JsonOptions,
    ProgressHook, RateLimitConfig, ResultHook, RetryConfig, StateHook, WebhookConfig,
};
pub use datasource::{source_for_path, CsvRowSource, JsonRowSource, RowSource, VecRowSource};
pub use error::ConfigError;
pub use evaluator::{evaluator_fn, Evaluator};
pub use evaluators::{
    contains::ContainsEvaluator, exact::ExactMatchEvaluator,
    levenshtein::LevenshteinEvaluator, regex::RegexEvaluator,
};
pub use export::export_results;
pub use gate::ConcurrencyGate;
pub use progress::ProgressTracker;
pub use runner::{BatchRunner, BatchRunnerBuilder};
pub use sink::StreamSink;
pub use state::StateManager;

pub use evalflow_types::{
    BatchResult, BatchState, BatchSummary, CombinedScore, EvaluationInput, EvaluatorOutcome,
    ProcessingStats, ProgressEvent, ProgressEventKind, RowResult, ScoreValue, TokenUsage,
};
