use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

use crate::evaluator::Evaluator;
use evalflow_types::{EvaluationInput, EvaluatorOutcome, ScoreValue};

/// Checks whether the candidate text matches a regex pattern.
pub struct RegexEvaluator {
	pattern: Regex,
	pattern_str: String,
}

impl RegexEvaluator {
	pub fn new(pattern: &str) -> Result<Self> {
		let regex = Regex::new(pattern)?;
		Ok(Self {
			pattern: regex,
			pattern_str: pattern.to_string(),
		})
	}
}

#[async_trait]
impl Evaluator for RegexEvaluator {
	fn name(&self) -> &str {
		"regex"
	}

	async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluatorOutcome> {
		let matches = self.pattern.is_match(&input.candidate_text);
		let feedback = if matches {
			format!("candidate matches /{}/", self.pattern_str)
		} else {
			format!("candidate does not match /{}/", self.pattern_str)
		};
		Ok(EvaluatorOutcome::new(
			self.name(),
			ScoreValue::Number(if matches { 100.0 } else { 0.0 }),
			feedback,
		))
	}
}
