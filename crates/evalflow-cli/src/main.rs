use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};

use evalflow_core::{
    progress_hook, source_for_path, BatchOptions, BatchRunner, ContainsEvaluator, CsvOptions,
    Evaluator, ExactMatchEvaluator, ExportConfig, InputFormat, JsonOptions, LevenshteinEvaluator,
    ProgressEventKind, RateLimitConfig, RegexEvaluator, StateManager,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Auto,
    Csv,
    Json,
}

impl From<FormatArg> for InputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Auto => InputFormat::Auto,
            FormatArg::Csv => InputFormat::Csv,
            FormatArg::Json => InputFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every row of an input file
    Run {
        /// Input file (.csv, .tsv or .json)
        input: PathBuf,

        /// Input format; auto resolves from the file extension
        #[arg(long, value_enum, default_value_t = FormatArg::Auto)]
        format: FormatArg,

        /// Evaluators to run: exact, levenshtein, contains=<substring>,
        /// regex=<pattern>. Repeatable.
        #[arg(short, long = "evaluator", required = true)]
        evaluators: Vec<String>,

        /// Max simultaneous rows
        #[arg(short, long, default_value_t = 5)]
        concurrency: usize,

        /// Retry budget per row
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-evaluator wall-time budget in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Sliding-window request cap per minute
        #[arg(long)]
        requests_per_minute: Option<u32>,

        /// Sliding-window request cap per hour
        #[arg(long)]
        requests_per_hour: Option<u32>,

        /// Stream each result to this file as rows complete (.csv or .json)
        #[arg(long)]
        stream_to: Option<PathBuf>,

        /// Write the final results to this file (.csv or .json)
        #[arg(long)]
        export_to: Option<PathBuf>,

        /// Append to an existing delimited-text export instead of truncating
        #[arg(long)]
        append: bool,

        /// Persist resumable state to this file
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Resume from a previously saved state file
        #[arg(long)]
        resume_from: Option<PathBuf>,

        /// Skip the first N rows
        #[arg(long, default_value_t = 0)]
        start_index: usize,

        /// Abort the batch on the first terminal row failure
        #[arg(long)]
        stop_on_error: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run {
            input,
            format,
            evaluators,
            concurrency,
            max_retries,
            timeout_ms,
            requests_per_minute,
            requests_per_hour,
            stream_to,
            export_to,
            append,
            state_file,
            resume_from,
            start_index,
            stop_on_error,
        }) => {
            let source = source_for_path(
                input,
                format.into(),
                CsvOptions::default(),
                JsonOptions::default(),
            )?;

            let mut options = BatchOptions {
                concurrency,
                timeout_ms,
                stop_on_error,
                state_file,
                ..BatchOptions::default()
            };
            if let Some(max_retries) = max_retries {
                options.retry.max_retries = max_retries;
            }
            options.rate_limit = RateLimitConfig {
                max_requests_per_minute: requests_per_minute,
                max_requests_per_hour: requests_per_hour,
            };
            if let Some(path) = &stream_to {
                let mut config = export_config_for(path)?;
                config.append_to_existing = append;
                options.stream_export = Some(config);
            }
            if let Some(path) = resume_from {
                options.resume_from_state = Some(StateManager::load(&path).await?);
            }
            options.on_progress = Some(progress_hook(|event| async move {
                match event.kind {
                    ProgressEventKind::Retry => tracing::warn!(
                        "retry {} on row {:?}: {}",
                        event.retry_count.unwrap_or(0),
                        event.current_index,
                        event.current_error.as_deref().unwrap_or("unknown")
                    ),
                    _ => tracing::info!(
                        "[{:?}] {}/{} rows ({:.1}%), {} failed",
                        event.kind,
                        event.processed_rows,
                        event.total_rows,
                        event.percent_complete,
                        event.failed_rows
                    ),
                }
                Ok(())
            }));

            let runner = BatchRunner::builder()
                .source(source)
                .evaluators(parse_evaluators(&evaluators)?)
                .options(options)
                .start_index(start_index)
                .build()?;

            let result = runner.run().await?;
            println!("{}", result.summary_table());

            if let Some(path) = export_to {
                let mut config = export_config_for(&path)?;
                config.append_to_existing = append;
                runner.export(&config).await?;
                println!("Results written to {}", path.display());
            }

            if result.failed_rows > 0 {
                std::process::exit(1);
            }
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
        }
    }

    Ok(())
}

fn parse_evaluators(specs: &[String]) -> Result<Vec<Arc<dyn Evaluator>>> {
    let mut evaluators: Vec<Arc<dyn Evaluator>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let (name, arg) = match spec.split_once('=') {
            Some((name, arg)) => (name, Some(arg)),
            None => (spec.as_str(), None),
        };
        let evaluator: Arc<dyn Evaluator> = match (name, arg) {
            ("exact", None) => Arc::new(ExactMatchEvaluator),
            ("levenshtein", None) => Arc::new(LevenshteinEvaluator),
            ("contains", Some(substring)) => Arc::new(ContainsEvaluator::case_insensitive(substring)),
            ("regex", Some(pattern)) => Arc::new(RegexEvaluator::new(pattern)?),
            _ => bail!("unknown evaluator spec `{spec}`"),
        };
        evaluators.push(evaluator);
    }
    Ok(evaluators)
}

fn export_config_for(path: &Path) -> Result<ExportConfig> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") | Some("tsv") => Ok(ExportConfig::csv_file(path)),
        Some("json") => Ok(ExportConfig::json_file(path)),
        other => bail!("cannot infer export format from extension {other:?}"),
    }
}
