use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::evaluator::Evaluator;
use evalflow_types::{EvaluationInput, EvaluatorOutcome, ScoreValue};

pub struct ExactMatchEvaluator;

#[async_trait]
impl Evaluator for ExactMatchEvaluator {
	fn name(&self) -> &str {
		"exact_match"
	}

	async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluatorOutcome> {
		let reference = input
			.reference_text
			.as_deref()
			.ok_or_else(|| anyhow!("exact_match requires reference_text"))?;
		let matched = input.candidate_text == reference;
		let score = if matched { 100.0 } else { 0.0 };
		let feedback = if matched {
			"candidate matches the reference exactly".to_string()
		} else {
			"candidate differs from the reference".to_string()
		};
		Ok(EvaluatorOutcome::new(self.name(), ScoreValue::Number(score), feedback))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn match_scores_full() {
		let mut input = EvaluationInput::new("Paris");
		input.reference_text = Some("Paris".to_string());
		let outcome = ExactMatchEvaluator.evaluate(&input).await.unwrap();
		assert_eq!(outcome.score, ScoreValue::Number(100.0));
	}

	#[tokio::test]
	async fn missing_reference_fails() {
		let input = EvaluationInput::new("Paris");
		assert!(ExactMatchEvaluator.evaluate(&input).await.is_err());
	}
}
