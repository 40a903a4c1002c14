use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tabled::Tabled;

/// One input record. The unit of retry and commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationInput {
	pub candidate_text: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reference_text: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub source_text: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub prompt: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub content_type: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub language: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	/// Any additional named fields from the input source.
	#[serde(flatten, default)]
	pub extra: Map<String, Value>,
}

impl EvaluationInput {
	pub fn new(candidate_text: impl Into<String>) -> Self {
		Self { candidate_text: candidate_text.into(), ..Default::default() }
	}

	pub fn with_id(id: impl Into<String>, candidate_text: impl Into<String>) -> Self {
		Self {
			id: Some(id.into()),
			candidate_text: candidate_text.into(),
			..Default::default()
		}
	}

	/// Merge `defaults` under this row. Row fields win; extra fields union,
	/// row entries shadowing default entries.
	pub fn merged_with(&self, defaults: &EvaluationInput) -> EvaluationInput {
		let mut extra = defaults.extra.clone();
		for (k, v) in &self.extra {
			extra.insert(k.clone(), v.clone());
		}
		EvaluationInput {
			candidate_text: self.candidate_text.clone(),
			reference_text: self.reference_text.clone().or_else(|| defaults.reference_text.clone()),
			source_text: self.source_text.clone().or_else(|| defaults.source_text.clone()),
			prompt: self.prompt.clone().or_else(|| defaults.prompt.clone()),
			content_type: self.content_type.clone().or_else(|| defaults.content_type.clone()),
			language: self.language.clone().or_else(|| defaults.language.clone()),
			id: self.id.clone().or_else(|| defaults.id.clone()),
			extra,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
	pub input_tokens: u32,
	pub output_tokens: u32,
	pub total_tokens: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingStats {
	pub execution_time_ms: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tokens: Option<TokenUsage>,
}

/// An evaluator's score: either a bounded number (0–100 by convention) or a
/// member of an enumerated category set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
	Number(f64),
	Category(String),
}

impl ScoreValue {
	pub fn as_number(&self) -> Option<f64> {
		match self {
			ScoreValue::Number(v) => Some(*v),
			ScoreValue::Category(_) => None,
		}
	}
}

/// One evaluator's verdict on one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorOutcome {
	pub evaluator: String,
	pub score: ScoreValue,
	pub feedback: String,
	#[serde(default)]
	pub stats: ProcessingStats,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl EvaluatorOutcome {
	pub fn new(evaluator: impl Into<String>, score: ScoreValue, feedback: impl Into<String>) -> Self {
		Self {
			evaluator: evaluator.into(),
			score,
			feedback: feedback.into(),
			stats: ProcessingStats::default(),
			error: None,
		}
	}
}

/// Combined score over all outcomes of a row. Serializes as a number on
/// success and as the literal string `"N/A"` on terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub enum CombinedScore {
	Value(f64),
	NotAvailable,
}

impl Serialize for CombinedScore {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			CombinedScore::Value(v) => serializer.serialize_f64(*v),
			CombinedScore::NotAvailable => serializer.serialize_str("N/A"),
		}
	}
}

impl<'de> Deserialize<'de> for CombinedScore {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Raw {
			Num(f64),
			Text(String),
		}
		match Raw::deserialize(deserializer)? {
			Raw::Num(v) => Ok(CombinedScore::Value(v)),
			Raw::Text(_) => Ok(CombinedScore::NotAvailable),
		}
	}
}

/// The committed result of one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowResult {
	pub id: String,
	pub index: usize,
	/// Effective (defaults-merged) input on success; the raw row on terminal
	/// failure.
	pub input: EvaluationInput,
	pub outcomes: Vec<EvaluatorOutcome>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub combined_score: Option<CombinedScore>,
	pub completed_at: DateTime<Utc>,
	pub duration_ms: u64,
	pub retry_count: u32,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl RowResult {
	pub fn is_success(&self) -> bool {
		self.error.is_none()
	}

	/// Sum of reported token totals across outcomes; missing usage counts as
	/// zero.
	pub fn total_tokens(&self) -> u64 {
		self.outcomes
			.iter()
			.filter_map(|o| o.stats.tokens.as_ref())
			.map(|t| t.total_tokens as u64)
			.sum()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
	pub average_processing_time_ms: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub total_tokens_used: Option<u64>,
	pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
	pub batch_id: String,
	pub started_at: DateTime<Utc>,
	pub completed_at: DateTime<Utc>,
	pub duration_ms: u64,
	pub total_rows: usize,
	pub successful_rows: usize,
	pub failed_rows: usize,
	pub results: Vec<RowResult>,
	pub summary: BatchSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct SummaryRow {
	id: String,
	status: String,
	score: String,
	duration_ms: u64,
	retries: u32,
	error: String,
}

impl BatchResult {
	pub fn summarize(results: &[RowResult]) -> BatchSummary {
		let total = results.len();
		let failed = results.iter().filter(|r| !r.is_success()).count();

		let duration_sum: u64 = results.iter().map(|r| r.duration_ms).sum();
		let average_processing_time_ms = if total == 0 {
			0.0
		} else {
			duration_sum as f64 / total as f64
		};

		let tokens: u64 = results.iter().map(|r| r.total_tokens()).sum();
		let total_tokens_used = if tokens > 0 { Some(tokens) } else { None };

		let error_rate = if total == 0 { 0.0 } else { failed as f64 / total as f64 };

		BatchSummary { average_processing_time_ms, total_tokens_used, error_rate }
	}

	pub fn summary_table(&self) -> String {
		use tabled::Table;
		let rows: Vec<SummaryRow> = self.results.iter().map(|r| {
			let score = match (&r.combined_score, r.outcomes.first()) {
				(Some(CombinedScore::Value(v)), _) => format!("{:.1}", v),
				(Some(CombinedScore::NotAvailable), _) => "N/A".to_string(),
				(None, Some(outcome)) => match &outcome.score {
					ScoreValue::Number(v) => format!("{:.1}", v),
					ScoreValue::Category(c) => c.clone(),
				},
				(None, None) => "-".to_string(),
			};
			SummaryRow {
				id: r.id.clone(),
				status: if r.is_success() { "✓".to_string() } else { "✗".to_string() },
				score,
				duration_ms: r.duration_ms,
				retries: r.retry_count,
				error: truncate(r.error.clone().unwrap_or_default(), 48),
			}
		}).collect();

		let table = Table::new(rows);

		let summary_text = format!(
			"Total: {}  Succeeded: {}  Failed: {}  Error rate: {:.1}%  Avg row time: {:.0}ms",
			self.total_rows,
			self.successful_rows,
			self.failed_rows,
			self.summary.error_rate * 100.0,
			self.summary.average_processing_time_ms
		);

		format!("{}\n\n{}\n", table, summary_text)
	}
}

fn truncate(s: String, max_len: usize) -> String {
	if s.len() <= max_len {
		return s;
	}
	let mut truncated = s.chars().take(max_len.saturating_sub(1)).collect::<String>();
	truncated.push('…');
	truncated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
	Started,
	Progress,
	Completed,
	Error,
	Retry,
	Paused,
	Resumed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
	pub kind: ProgressEventKind,
	pub timestamp: DateTime<Utc>,
	pub total_rows: usize,
	pub processed_rows: usize,
	pub successful_rows: usize,
	pub failed_rows: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub current_index: Option<usize>,
	pub percent_complete: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub estimated_remaining_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub average_row_time_ms: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub current_error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry_count: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub estimated_cost: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub estimated_tokens_remaining: Option<u64>,
}

/// Durable image of batch progress, sufficient to resume a partial run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
	pub batch_id: String,
	pub started_at: DateTime<Utc>,
	pub last_update: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_path: Option<String>,
	pub evaluator_names: Vec<String>,
	pub total_rows: usize,
	pub processed_rows: BTreeSet<usize>,
	pub results: Vec<RowResult>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub progress: Option<ProgressEvent>,
}
