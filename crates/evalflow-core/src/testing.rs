use anyhow::Result;
use evalflow_types::BatchResult;

/// Helper to assert a batch's success rate meets a threshold.
///
/// Use this in your `#[tokio::test]` functions.
///
/// # Example
/// ```ignore
/// #[tokio::test]
/// async fn test_my_evaluators() -> Result<()> {
///     let runner = BatchRunner::builder()
///         .rows(rows)
///         .evaluators(evaluators)
///         .build()?;
///
///     let result = runner.run().await?;
///
///     // Assert 90% of rows succeeded
///     assert_batch_success_rate(&result, 0.9)?;
///
///     Ok(())
/// }
/// ```
pub fn assert_batch_success_rate(result: &BatchResult, min_success_rate: f64) -> Result<()> {
    let rate = if result.total_rows == 0 {
        1.0
    } else {
        result.successful_rows as f64 / result.total_rows as f64
    };
    if rate < min_success_rate {
        anyhow::bail!(
            "Batch failed: success rate {:.1}% is below threshold {:.1}%\n{}",
            rate * 100.0,
            min_success_rate * 100.0,
            result.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert every row succeeded.
pub fn assert_batch_all_succeeded(result: &BatchResult) -> Result<()> {
    if result.failed_rows != 0 {
        anyhow::bail!(
            "Batch failed: {}/{} rows succeeded\n{}",
            result.successful_rows,
            result.total_rows,
            result.summary_table()
        );
    }
    Ok(())
}

/// Helper to assert the batch error rate stays under a ceiling.
pub fn assert_batch_error_rate_below(result: &BatchResult, max_error_rate: f64) -> Result<()> {
    if result.summary.error_rate > max_error_rate {
        anyhow::bail!(
            "Batch failed: error rate {:.1}% exceeds {:.1}%\n{}",
            result.summary.error_rate * 100.0,
            max_error_rate * 100.0,
            result.summary_table()
        );
    }
    Ok(())
}
