use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::config::{CostModel, ProgressHook};
use evalflow_types::{ProgressEvent, ProgressEventKind};

/// Rolling window bound for per-row duration samples.
const DURATION_WINDOW: usize = 1000;

/// Maintains cumulative counters, derives rolling statistics, and emits
/// events through the user hook at most once per interval. Lifecycle and
/// retry events bypass the interval.
pub struct ProgressTracker {
    inner: Mutex<TrackerInner>,
    hook: Option<ProgressHook>,
    interval: Duration,
    cost: Option<CostModel>,
}

struct TrackerInner {
    total: usize,
    processed: usize,
    successful: usize,
    failed: usize,
    durations_ms: VecDeque<u64>,
    total_tokens: u64,
    last_emit: Option<Instant>,
}

impl ProgressTracker {
    pub fn new(
        total: usize,
        hook: Option<ProgressHook>,
        interval_ms: u64,
        cost: Option<CostModel>,
    ) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                total,
                processed: 0,
                successful: 0,
                failed: 0,
                durations_ms: VecDeque::new(),
                total_tokens: 0,
                last_emit: None,
            }),
            hook,
            interval: Duration::from_millis(interval_ms),
            cost,
        }
    }

    /// Emit a `started` event immediately.
    pub async fn start(&self) {
        let event = {
            let inner = self.inner.lock().unwrap();
            self.build_event(&inner, ProgressEventKind::Started, None, None, None)
        };
        self.emit(event).await;
    }

    pub async fn record_success(&self, index: usize, duration_ms: u64, tokens: u64) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.processed += 1;
            inner.successful += 1;
            inner.durations_ms.push_back(duration_ms);
            if inner.durations_ms.len() > DURATION_WINDOW {
                inner.durations_ms.pop_front();
            }
            inner.total_tokens += tokens;
            self.maybe_build(&mut inner, ProgressEventKind::Progress, Some(index), None, None)
        };
        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    pub async fn record_failure(&self, index: usize, duration_ms: u64, error: &str) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.processed += 1;
            inner.failed += 1;
            inner.durations_ms.push_back(duration_ms);
            if inner.durations_ms.len() > DURATION_WINDOW {
                inner.durations_ms.pop_front();
            }
            self.maybe_build(
                &mut inner,
                ProgressEventKind::Error,
                Some(index),
                Some(error.to_string()),
                None,
            )
        };
        if let Some(event) = event {
            self.emit(event).await;
        }
    }

    /// Emit a `retry` event immediately; retries are never rate-limited.
    pub async fn record_retry(&self, index: usize, error: &str, attempt: u32) {
        let event = {
            let inner = self.inner.lock().unwrap();
            self.build_event(
                &inner,
                ProgressEventKind::Retry,
                Some(index),
                Some(error.to_string()),
                Some(attempt),
            )
        };
        self.emit(event).await;
    }

    /// Count `n` rows as already processed and successful, without duration
    /// sampling. Used when resuming past an index the caller asserts was
    /// done.
    pub fn skip_rows(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.processed += n;
        inner.successful += n;
    }

    /// Emit a `completed` event immediately with the final counters.
    pub async fn complete(&self) {
        let event = {
            let inner = self.inner.lock().unwrap();
            self.build_event(&inner, ProgressEventKind::Completed, None, None, None)
        };
        self.emit(event).await;
    }

    /// Synchronous read of the latest derived event, without emission.
    pub fn current_progress(&self) -> ProgressEvent {
        let inner = self.inner.lock().unwrap();
        self.build_event(&inner, ProgressEventKind::Progress, None, None, None)
    }

    fn maybe_build(
        &self,
        inner: &mut TrackerInner,
        kind: ProgressEventKind,
        current_index: Option<usize>,
        error: Option<String>,
        retry_count: Option<u32>,
    ) -> Option<ProgressEvent> {
        let now = Instant::now();
        let due = inner
            .last_emit
            .map_or(true, |last| now.duration_since(last) >= self.interval);
        if !due {
            return None;
        }
        inner.last_emit = Some(now);
        Some(self.build_event(inner, kind, current_index, error, retry_count))
    }

    fn build_event(
        &self,
        inner: &TrackerInner,
        kind: ProgressEventKind,
        current_index: Option<usize>,
        current_error: Option<String>,
        retry_count: Option<u32>,
    ) -> ProgressEvent {
        let percent_complete = if inner.total > 0 {
            inner.processed as f64 / inner.total as f64 * 100.0
        } else {
            0.0
        };

        let average_row_time_ms = if inner.durations_ms.is_empty() {
            None
        } else {
            let sum: u64 = inner.durations_ms.iter().sum();
            Some(sum as f64 / inner.durations_ms.len() as f64)
        };

        let remaining = inner.total.saturating_sub(inner.processed);
        let estimated_remaining_ms = match average_row_time_ms {
            Some(avg) if remaining > 0 && avg > 0.0 => Some((remaining as f64 * avg) as u64),
            _ => None,
        };

        let estimated_cost = self
            .cost
            .map(|c| inner.total_tokens as f64 / 1_000_000.0 * c.price_per_million_tokens);
        let estimated_tokens_remaining = self.cost.map(|c| remaining as u64 * c.tokens_per_row);

        ProgressEvent {
            kind,
            timestamp: Utc::now(),
            total_rows: inner.total,
            processed_rows: inner.processed,
            successful_rows: inner.successful,
            failed_rows: inner.failed,
            current_index,
            percent_complete,
            estimated_remaining_ms,
            average_row_time_ms,
            current_error,
            retry_count,
            estimated_cost,
            estimated_tokens_remaining,
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        if let Some(hook) = &self.hook {
            if let Err(err) = hook(event).await {
                tracing::warn!("progress hook failed: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::progress_hook;
    use std::sync::Arc;

    fn collecting_hook() -> (ProgressHook, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let hook = progress_hook(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        });
        (hook, events)
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_events_are_forced() {
        let (hook, events) = collecting_hook();
        let tracker = ProgressTracker::new(2, Some(hook), 1000, None);

        tracker.start().await;
        tracker.record_retry(0, "rate limit", 1).await;
        tracker.complete().await;

        let kinds: Vec<ProgressEventKind> =
            events.lock().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ProgressEventKind::Started,
                ProgressEventKind::Retry,
                ProgressEventKind::Completed
            ]
        );
        let retry = events.lock().unwrap()[1].clone();
        assert_eq!(retry.retry_count, Some(1));
        assert_eq!(retry.current_error.as_deref(), Some("rate limit"));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_emissions_are_rate_limited() {
        let (hook, events) = collecting_hook();
        let tracker = ProgressTracker::new(10, Some(hook), 1000, None);

        tracker.record_success(0, 5, 0).await;
        tracker.record_success(1, 5, 0).await;
        tracker.record_success(2, 5, 0).await;
        assert_eq!(events.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(1001)).await;
        tracker.record_success(3, 5, 0).await;
        assert_eq!(events.lock().unwrap().len(), 2);

        let last = events.lock().unwrap().last().unwrap().clone();
        assert_eq!(last.processed_rows, 4);
        assert_eq!(last.successful_rows, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn counters_and_derived_fields() {
        let tracker = ProgressTracker::new(4, None, 1000, None);
        tracker.record_success(0, 100, 30).await;
        tracker.record_success(1, 300, 0).await;
        tracker.record_failure(2, 200, "boom").await;

        let progress = tracker.current_progress();
        assert_eq!(progress.processed_rows, 3);
        assert_eq!(progress.successful_rows, 2);
        assert_eq!(progress.failed_rows, 1);
        assert_eq!(progress.average_row_time_ms, Some(200.0));
        // one remaining row at 200ms average
        assert_eq!(progress.estimated_remaining_ms, Some(200));
        assert!((progress.percent_complete - 75.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn skip_rows_counts_as_successful_without_samples() {
        let tracker = ProgressTracker::new(5, None, 1000, None);
        tracker.skip_rows(2);
        let progress = tracker.current_progress();
        assert_eq!(progress.processed_rows, 2);
        assert_eq!(progress.successful_rows, 2);
        assert_eq!(progress.average_row_time_ms, None);
        assert_eq!(progress.estimated_remaining_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cost_estimates_follow_the_model() {
        let cost = CostModel { tokens_per_row: 500, price_per_million_tokens: 3.0 };
        let tracker = ProgressTracker::new(4, None, 1000, Some(cost));
        tracker.record_success(0, 100, 1_000_000).await;

        let progress = tracker.current_progress();
        assert_eq!(progress.estimated_cost, Some(3.0));
        assert_eq!(progress.estimated_tokens_remaining, Some(1500));
    }
}
