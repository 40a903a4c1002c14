use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use evalflow_types::{EvaluationInput, EvaluatorOutcome};

/// A single evaluation capability: consume one input row, produce one
/// outcome, possibly failing. Evaluators are opaque to the engine.
#[async_trait]
pub trait Evaluator: Send + Sync {
	fn name(&self) -> &str;
	async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluatorOutcome>;
}

type EvalFuture = Pin<Box<dyn Future<Output = Result<EvaluatorOutcome>> + Send>>;

struct ClosureEvaluator {
	name: String,
	f: Box<dyn Fn(EvaluationInput) -> EvalFuture + Send + Sync>,
}

#[async_trait]
impl Evaluator for ClosureEvaluator {
	fn name(&self) -> &str {
		&self.name
	}

	async fn evaluate(&self, input: &EvaluationInput) -> Result<EvaluatorOutcome> {
		(self.f)(input.clone()).await
	}
}

/// Wrap an async closure as an `Evaluator`.
pub fn evaluator_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Evaluator>
where
	F: Send + Sync + 'static + Fn(EvaluationInput) -> Fut,
	Fut: Future<Output = Result<EvaluatorOutcome>> + Send + 'static,
{
	Arc::new(ClosureEvaluator {
		name: name.into(),
		f: Box::new(move |input| Box::pin(f(input))),
	})
}
