use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{BatchOptions, ExecutionMode, ExportConfig};
use crate::datasource::{RowSource, VecRowSource};
use crate::evaluator::Evaluator;
use crate::export::export_results;
use crate::gate::ConcurrencyGate;
use crate::progress::ProgressTracker;
use crate::retry::{backoff_delay, is_retryable};
use crate::sink::StreamSink;
use crate::state::StateManager;
use evalflow_types::{
	BatchResult, BatchState, CombinedScore, EvaluationInput, EvaluatorOutcome, RowResult,
};

pub struct BatchRunnerBuilder {
	source: Option<Arc<dyn RowSource>>,
	evaluators: Vec<Arc<dyn Evaluator>>,
	options: BatchOptions,
	start_index: usize,
}

impl BatchRunnerBuilder {
	pub fn new() -> Self {
		Self {
			source: None,
			evaluators: Vec::new(),
			options: BatchOptions::default(),
			start_index: 0,
		}
	}

	pub fn source(mut self, source: Arc<dyn RowSource>) -> Self {
		self.source = Some(source);
		self
	}

	/// Convenience for an in-memory row sequence.
	pub fn rows(mut self, rows: Vec<EvaluationInput>) -> Self {
		self.source = Some(Arc::new(VecRowSource::new(rows)));
		self
	}

	pub fn evaluators<I>(mut self, evaluators: I) -> Self
	where
		I: IntoIterator<Item = Arc<dyn Evaluator>>,
	{
		self.evaluators = evaluators.into_iter().collect();
		self
	}

	pub fn add_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
		self.evaluators.push(evaluator);
		self
	}

	pub fn options(mut self, options: BatchOptions) -> Self {
		self.options = options;
		self
	}

	pub fn concurrency(mut self, n: usize) -> Self {
		self.options.concurrency = n.max(1);
		self
	}

	/// Skip a prefix of the parsed sequence; the skipped indices are
	/// treated as already processed.
	pub fn start_index(mut self, n: usize) -> Self {
		self.start_index = n;
		self
	}

	pub fn build(self) -> Result<BatchRunner> {
		Ok(BatchRunner {
			source: self.source.ok_or_else(|| anyhow!("source must be set"))?,
			evaluators: Arc::new(self.evaluators),
			options: self.options,
			start_index: self.start_index,
			run_state: Arc::new(Mutex::new(RunState {
				results: Vec::new(),
				processed: BTreeSet::new(),
			})),
			state_manager: Mutex::new(None),
		})
	}
}

impl Default for BatchRunnerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct RunState {
	/// Commit-ordered results. A row appears here only after its external
	/// side effects have been acknowledged.
	results: Vec<RowResult>,
	processed: BTreeSet<usize>,
}

/// The orchestrator: resolves input, seeds resume state, and drives every
/// row through gate admission, the evaluator set, classified retry, and
/// the strictly ordered commit sequence.
pub struct BatchRunner {
	source: Arc<dyn RowSource>,
	evaluators: Arc<Vec<Arc<dyn Evaluator>>>,
	options: BatchOptions,
	start_index: usize,
	run_state: Arc<Mutex<RunState>>,
	state_manager: Mutex<Option<Arc<StateManager>>>,
}

impl BatchRunner {
	pub fn builder() -> BatchRunnerBuilder {
		BatchRunnerBuilder::new()
	}

	/// One-shot batch run.
	pub async fn run(&self) -> Result<BatchResult> {
		let rows = self.source.load().await?;
		let total = rows.len();

		let mut batch_id = Uuid::new_v4().to_string();
		let mut started_at = Utc::now();
		let run_start = Instant::now();

		{
			let mut state = self.run_state.lock().unwrap();
			state.results.clear();
			state.processed.clear();
			for index in 0..self.start_index.min(total) {
				state.processed.insert(index);
			}
		}

		if let Some(snapshot) = &self.options.resume_from_state {
			batch_id = snapshot.batch_id.clone();
			started_at = snapshot.started_at;
			let mut state = self.run_state.lock().unwrap();
			state.processed = snapshot.processed_rows.clone();
			state.results = snapshot.results.clone();
		}

		let sink = match &self.options.stream_export {
			Some(config) => {
				let sink = StreamSink::from_config(config)?;
				sink.initialize().await?;
				Some(Arc::new(sink))
			}
			None => None,
		};

		let tracker = Arc::new(ProgressTracker::new(
			total,
			self.options.on_progress.clone(),
			self.options.progress_interval_ms,
			self.options.cost,
		));
		tracker.start().await;
		let already_processed = self.run_state.lock().unwrap().processed.len();
		if already_processed > 0 {
			tracker.skip_rows(already_processed);
		}

		let state_manager = self.install_state_manager(&batch_id, started_at, total);

		let gate = Arc::new(ConcurrencyGate::new(
			self.options.concurrency,
			self.options.rate_limit,
		));
		let context = Arc::new(RowContext {
			options: self.options.clone(),
			evaluators: self.evaluators.clone(),
			tracker: tracker.clone(),
			sink: sink.clone(),
			state_manager: state_manager.clone(),
			run_state: self.run_state.clone(),
			abort: Arc::new(OnceLock::new()),
		});

		// Chunked submission bounds the number of outstanding scheduled
		// tasks without serializing them.
		let chunk_size = (self.options.concurrency * 2).max(1);
		let indexed: Vec<(usize, EvaluationInput)> = rows.into_iter().enumerate().collect();
		for chunk in indexed.chunks(chunk_size) {
			if context.abort.get().is_some() {
				break;
			}
			let tasks = chunk
				.iter()
				.filter(|(index, _)| !context.is_processed(*index))
				.map(|(index, row)| {
					let context = context.clone();
					let gate = gate.clone();
					let index = *index;
					let row = row.clone();
					async move { gate.run(process_row(context, index, row)).await }
				});
			let _ = join_all(tasks).await;
		}

		if let Some(message) = context.abort.get() {
			// Keep external artifacts coherent before raising.
			if let Some(sink) = &sink {
				if let Err(err) = sink.finalize().await {
					tracing::warn!("sink finalize after abort failed: {err:#}");
				}
			}
			if let Some(manager) = &state_manager {
				if let Err(err) = manager.cleanup().await {
					tracing::warn!("state cleanup after abort failed: {err:#}");
				}
			}
			bail!("batch aborted: {message}");
		}

		tracker.complete().await;
		if let Some(sink) = &sink {
			sink.finalize().await?;
		}
		if let Some(manager) = &state_manager {
			manager.update(|s| s.progress = Some(tracker.current_progress()));
			if let Err(err) = manager.cleanup().await {
				tracing::warn!("final state save failed: {err:#}");
			}
		}

		let mut results = self.run_state.lock().unwrap().results.clone();
		results.sort_by_key(|r| r.index);
		let successful_rows = results.iter().filter(|r| r.is_success()).count();
		let failed_rows = results.len() - successful_rows;
		let summary = BatchResult::summarize(&results);

		tracing::info!(
			"batch {batch_id} finished: {} rows, {} failed",
			results.len(),
			failed_rows
		);

		Ok(BatchResult {
			batch_id,
			started_at,
			completed_at: Utc::now(),
			duration_ms: run_start.elapsed().as_millis() as u64,
			total_rows: results.len(),
			successful_rows,
			failed_rows,
			results,
			summary,
		})
	}

	/// Post-hoc export of the accumulated results.
	pub async fn export(&self, config: &ExportConfig) -> Result<()> {
		let results = self.current_results();
		export_results(&results, config).await
	}

	/// Defensive copy of the committed results, ordered by row index.
	pub fn current_results(&self) -> Vec<RowResult> {
		let mut results = self.run_state.lock().unwrap().results.clone();
		results.sort_by_key(|r| r.index);
		results
	}

	/// Snapshot of the live batch state, when state management is active.
	pub fn current_state(&self) -> Option<BatchState> {
		self.state_manager
			.lock()
			.unwrap()
			.as_ref()
			.map(|m| m.snapshot())
	}

	fn install_state_manager(
		&self,
		batch_id: &str,
		started_at: chrono::DateTime<Utc>,
		total: usize,
	) -> Option<Arc<StateManager>> {
		let enabled = self.options.state_file.is_some()
			|| self.options.on_state_save.is_some()
			|| self.options.save_state_interval_ms.is_some()
			|| self.options.resume_from_state.is_some();
		if !enabled {
			*self.state_manager.lock().unwrap() = None;
			return None;
		}

		let initial = {
			let state = self.run_state.lock().unwrap();
			BatchState {
				batch_id: batch_id.to_string(),
				started_at,
				last_update: Utc::now(),
				input_path: self.source.describe(),
				evaluator_names: self.evaluators.iter().map(|e| e.name().to_string()).collect(),
				total_rows: total,
				processed_rows: state.processed.clone(),
				results: state.results.clone(),
				progress: None,
			}
		};
		let manager = Arc::new(StateManager::new(
			initial,
			self.options.state_file.clone(),
			self.options.on_state_save.clone(),
		));
		if let Some(interval_ms) = self.options.save_state_interval_ms {
			manager.spawn_autosave(Duration::from_millis(interval_ms));
		}
		*self.state_manager.lock().unwrap() = Some(manager.clone());
		Some(manager)
	}
}

struct RowContext {
	options: BatchOptions,
	evaluators: Arc<Vec<Arc<dyn Evaluator>>>,
	tracker: Arc<ProgressTracker>,
	sink: Option<Arc<StreamSink>>,
	state_manager: Option<Arc<StateManager>>,
	run_state: Arc<Mutex<RunState>>,
	/// First terminal failure message when `stop_on_error` is set.
	abort: Arc<OnceLock<String>>,
}

impl RowContext {
	fn is_processed(&self, index: usize) -> bool {
		self.run_state.lock().unwrap().processed.contains(&index)
	}

	/// Append the result and mark the index processed, atomically.
	fn commit(&self, index: usize, result: RowResult) {
		let mut state = self.run_state.lock().unwrap();
		state.results.push(result);
		state.processed.insert(index);
	}

	fn update_state(&self) {
		if let Some(manager) = &self.state_manager {
			let (processed, results) = {
				let state = self.run_state.lock().unwrap();
				(state.processed.clone(), state.results.clone())
			};
			let progress = self.tracker.current_progress();
			manager.update(|s| {
				s.processed_rows = processed;
				s.results = results;
				s.progress = Some(progress);
			});
		}
	}
}

/// Per-row task. Returns an error only to signal a `stop_on_error` abort;
/// ordinary row failures are contained in a terminal RowResult.
async fn process_row(context: Arc<RowContext>, index: usize, row: EvaluationInput) -> Result<()> {
	if context.abort.get().is_some() {
		return Ok(());
	}
	if context.is_processed(index) {
		return Ok(());
	}

	let effective = match &context.options.default_input {
		Some(defaults) => row.merged_with(defaults),
		None => row.clone(),
	};
	let id = effective
		.id
		.clone()
		.unwrap_or_else(|| format!("row-{index}"));
	let task_start = Instant::now();
	let mut retry_count: u32 = 0;

	loop {
		match attempt_row(&context, index, &id, &effective, task_start, retry_count).await {
			Ok(()) => return Ok(()),
			Err(err) => {
				let message = format!("{err:#}");
				let next_attempt = retry_count + 1;
				if next_attempt <= context.options.retry.max_retries
					&& is_retryable(&message, &context.options.retry)
				{
					context.tracker.record_retry(index, &message, next_attempt).await;
					tokio::time::sleep(backoff_delay(&context.options.retry, next_attempt)).await;
					retry_count = next_attempt;
					continue;
				}

				let duration_ms = task_start.elapsed().as_millis() as u64;
				let result = RowResult {
					id: id.clone(),
					index,
					// The raw row, not the merged input: keep "what the
					// user supplied" distinguishable from "what we tried".
					input: row.clone(),
					outcomes: Vec::new(),
					combined_score: context
						.options
						.combine_scores
						.as_ref()
						.map(|_| CombinedScore::NotAvailable),
					completed_at: Utc::now(),
					duration_ms,
					retry_count,
					error: Some(message.clone()),
				};
				context.commit(index, result);
				context.tracker.record_failure(index, duration_ms, &message).await;
				context.update_state();

				if context.options.stop_on_error {
					let _ = context.abort.set(message.clone());
					bail!("row {index} failed terminally: {message}");
				}
				return Ok(());
			}
		}
	}
}

/// One attempt: run the evaluator set, then the strictly ordered commit
/// sequence (export, result callback, in-memory append, tracker, state).
/// Any failure sends the whole row back to the classifier.
async fn attempt_row(
	context: &Arc<RowContext>,
	index: usize,
	id: &str,
	effective: &EvaluationInput,
	task_start: Instant,
	retry_count: u32,
) -> Result<()> {
	let outcomes = run_evaluators(context, effective).await?;

	let duration_ms = task_start.elapsed().as_millis() as u64;
	let tokens: u64 = outcomes
		.iter()
		.filter_map(|o| o.stats.tokens.as_ref())
		.map(|t| t.total_tokens as u64)
		.sum();
	let combined_score = context
		.options
		.combine_scores
		.as_ref()
		.map(|combine| CombinedScore::Value(combine(&outcomes)));

	let result = RowResult {
		id: id.to_string(),
		index,
		input: effective.clone(),
		outcomes,
		combined_score,
		completed_at: Utc::now(),
		duration_ms,
		retry_count,
		error: None,
	};

	if let Some(sink) = &context.sink {
		sink.export_result(&result).await.context("streaming export")?;
	}
	if let Some(hook) = &context.options.on_result {
		hook(result.clone()).await.context("result callback")?;
	}
	context.commit(index, result);
	context.tracker.record_success(index, duration_ms, tokens).await;
	context.update_state();
	Ok(())
}

async fn run_evaluators(
	context: &Arc<RowContext>,
	input: &EvaluationInput,
) -> Result<Vec<EvaluatorOutcome>> {
	match context.options.execution_mode {
		ExecutionMode::Parallel => {
			let tasks = context.evaluators.iter().map(|evaluator| {
				run_one_evaluator(evaluator.clone(), input.clone(), context.options.timeout_ms)
			});
			// join_all preserves declaration order.
			join_all(tasks).await.into_iter().collect()
		}
		ExecutionMode::Sequential => {
			let mut outcomes = Vec::with_capacity(context.evaluators.len());
			for evaluator in context.evaluators.iter() {
				outcomes.push(
					run_one_evaluator(evaluator.clone(), input.clone(), context.options.timeout_ms)
						.await?,
				);
			}
			Ok(outcomes)
		}
	}
}

async fn run_one_evaluator(
	evaluator: Arc<dyn Evaluator>,
	input: EvaluationInput,
	timeout_ms: Option<u64>,
) -> Result<EvaluatorOutcome> {
	let started = Instant::now();
	let mut outcome = match timeout_ms {
		Some(ms) => tokio::time::timeout(Duration::from_millis(ms), evaluator.evaluate(&input))
			.await
			.map_err(|_| anyhow!("evaluator '{}' hit its timeout after {ms}ms", evaluator.name()))??,
		None => evaluator.evaluate(&input).await?,
	};
	outcome.stats.execution_time_ms = started.elapsed().as_millis() as u64;
	Ok(outcome)
}
