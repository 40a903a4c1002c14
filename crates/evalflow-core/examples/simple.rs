use std::sync::Arc;

use evalflow_core::{
    source_for_path, BatchRunner, ContainsEvaluator, CsvOptions, EvaluationInput, Evaluator,
    InputFormat, JsonOptions, LevenshteinEvaluator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Example 1: Inline rows
    let mut first = EvaluationInput::with_id("0", "Hello World!");
    first.reference_text = Some("Hello World!".to_string());
    let mut second = EvaluationInput::with_id("1", "Hi World");
    second.reference_text = Some("Hi World!".to_string());

    let evaluators: Vec<Arc<dyn Evaluator>> = vec![
        Arc::new(ContainsEvaluator::case_insensitive("world")),
        Arc::new(LevenshteinEvaluator),
    ];

    let runner = BatchRunner::builder()
        .rows(vec![first, second])
        .evaluators(evaluators)
        .concurrency(8)
        .build()?;

    let result = runner.run().await?;
    println!("{}", result.summary_table());

    // Example 2: Load from a CSV or JSON file if provided
    if let Some(path) = std::env::args().nth(1) {
        let source = source_for_path(
            path,
            InputFormat::Auto,
            CsvOptions::default(),
            JsonOptions::default(),
        )?;
        let evaluators: Vec<Arc<dyn Evaluator>> =
            vec![Arc::new(ContainsEvaluator::case_insensitive("world"))];
        let runner = BatchRunner::builder()
            .source(source)
            .evaluators(evaluators)
            .build()?;
        let result = runner.run().await?;
        println!("{}", result.summary_table());
    }

    Ok(())
}
