use anyhow::{anyhow, Result};
use async_trait::async_trait;
use strsim::levenshtein;

use crate::evaluator::Evaluator;
use evalflow_types::{EvaluationInput, EvaluatorOutcome, ScoreValue};

/// Scores the candidate by normalized edit distance to the reference,
/// on a 0–100 scale.
pub struct LevenshteinEvaluator;

#[async_trait]
impl Evaluator for LevenshteinEvaluator {
    fn name(&self) -> &str {
        "levenshtein"
    }

    async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluatorOutcome> {
        let reference = input
            .reference_text
            .as_deref()
            .ok_or_else(|| anyhow!("levenshtein requires reference_text"))?;

        let max_len = reference.len().max(input.candidate_text.len()).max(1) as f64;
        let similarity = 1.0 - (levenshtein(reference, &input.candidate_text) as f64 / max_len);
        let score = similarity * 100.0;

        Ok(EvaluatorOutcome::new(
            self.name(),
            ScoreValue::Number(score),
            format!("{:.1}% similar to the reference", score),
        ))
    }
}
