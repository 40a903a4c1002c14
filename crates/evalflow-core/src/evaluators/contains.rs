use anyhow::Result;
use async_trait::async_trait;

use crate::evaluator::Evaluator;
use evalflow_types::{EvaluationInput, EvaluatorOutcome, ScoreValue};

/// Checks whether the candidate text contains a substring.
pub struct ContainsEvaluator {
    substring: String,
    case_sensitive: bool,
}

impl ContainsEvaluator {
    /// Creates a case-sensitive contains evaluator.
    pub fn new(substring: impl Into<String>) -> Self {
        Self {
            substring: substring.into(),
            case_sensitive: true,
        }
    }

    /// Creates a case-insensitive contains evaluator.
    pub fn case_insensitive(substring: impl Into<String>) -> Self {
        Self {
            substring: substring.into(),
            case_sensitive: false,
        }
    }
}

#[async_trait]
impl Evaluator for ContainsEvaluator {
    fn name(&self) -> &str {
        "contains"
    }

    async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluatorOutcome> {
        let found = if self.case_sensitive {
            input.candidate_text.contains(&self.substring)
        } else {
            input
                .candidate_text
                .to_lowercase()
                .contains(&self.substring.to_lowercase())
        };

        let feedback = if found {
            format!("candidate contains \"{}\"", self.substring)
        } else {
            format!("candidate does not contain \"{}\"", self.substring)
        };

        Ok(EvaluatorOutcome::new(
            self.name(),
            ScoreValue::Number(if found { 100.0 } else { 0.0 }),
            feedback,
        ))
    }
}
