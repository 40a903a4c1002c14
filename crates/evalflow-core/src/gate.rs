use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};

use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Safety margin added when sleeping until a window slides.
const WINDOW_SLACK: Duration = Duration::from_millis(100);

/// Bounds simultaneous in-flight tasks and enforces sliding-window request
/// quotas. Throttling suspends submission; admitted tasks always run to
/// their own conclusion.
pub struct ConcurrencyGate {
    max_concurrency: usize,
    limits: RateLimitConfig,
    inner: Mutex<GateInner>,
}

struct GateInner {
    active: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
    /// Chronological admission stamps for the rate windows.
    admissions: VecDeque<Instant>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrency: usize, limits: RateLimitConfig) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            limits,
            inner: Mutex::new(GateInner {
                active: 0,
                waiters: VecDeque::new(),
                admissions: VecDeque::new(),
            }),
        }
    }

    /// Acquire a slot, wait for rate-limit compliance, stamp the admission,
    /// run the task to completion, release the slot. The task's value or
    /// failure is returned unchanged; a failing task still consumed a slot
    /// and a stamp.
    pub async fn run<T, F>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.acquire_slot().await;
        self.wait_for_windows().await;
        let out = task.await;
        self.release_slot();
        out
    }

    /// Number of admitted, unreleased tasks.
    pub fn active(&self) -> usize {
        self.inner.lock().unwrap().active
    }

    async fn acquire_slot(&self) {
        let mut woken = false;
        loop {
            let rx = {
                let mut inner = self.inner.lock().unwrap();
                if inner.active < self.max_concurrency {
                    inner.active += 1;
                    return;
                }
                let (tx, rx) = oneshot::channel();
                if woken {
                    // A concurrent release consumed the slot we were woken
                    // for; keep our place at the head of the line.
                    inner.waiters.push_front(tx);
                } else {
                    inner.waiters.push_back(tx);
                }
                rx
            };
            let _ = rx.await;
            woken = true;
        }
    }

    fn release_slot(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.active -= 1;
        while let Some(tx) = inner.waiters.pop_front() {
            if tx.send(()).is_ok() {
                break;
            }
        }
    }

    async fn wait_for_windows(&self) {
        loop {
            let delay = {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                while inner
                    .admissions
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > HOUR)
                {
                    inner.admissions.pop_front();
                }

                let caps = [
                    (MINUTE, self.limits.max_requests_per_minute),
                    (HOUR, self.limits.max_requests_per_hour),
                ];
                let mut delay: Option<Duration> = None;
                for (window, cap) in caps {
                    let Some(cap) = cap else { continue };
                    let oldest_in_window = inner
                        .admissions
                        .iter()
                        .find(|t| now.duration_since(**t) <= window)
                        .copied();
                    let in_window = inner
                        .admissions
                        .iter()
                        .filter(|t| now.duration_since(**t) <= window)
                        .count();
                    if in_window >= cap as usize {
                        if let Some(oldest) = oldest_in_window {
                            let wait =
                                window.saturating_sub(now.duration_since(oldest)) + WINDOW_SLACK;
                            delay = Some(delay.map_or(wait, |d| d.max(wait)));
                        }
                    }
                }

                match delay {
                    None => {
                        inner.admissions.push_back(now);
                        return;
                    }
                    Some(d) => d,
                }
            };
            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn gate(max: usize, limits: RateLimitConfig) -> Arc<ConcurrencyGate> {
        Arc::new(ConcurrencyGate::new(max, limits))
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_in_flight_tasks_and_admits_fifo() {
        let gate = gate(2, RateLimitConfig::default());
        let admitted: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, mut release_rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();

        let mut handles = Vec::new();
        for i in 0..4usize {
            let gate = gate.clone();
            let admitted = admitted.clone();
            let release_tx = release_tx.clone();
            handles.push(tokio::spawn(async move {
                gate.run(async {
                    admitted.lock().unwrap().push(i);
                    let (done_tx, done_rx) = oneshot::channel();
                    release_tx.send(done_tx).unwrap();
                    let _ = done_rx.await;
                    Ok(())
                })
                .await
            }));
        }

        // Let the first two tasks be admitted and block.
        sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.active(), 2);
        assert_eq!(*admitted.lock().unwrap(), vec![0, 1]);

        // Release tasks one at a time; the maximum never exceeds the cap
        // and the queue drains in submission order.
        for expected in [3usize, 4, 4] {
            let done = release_rx.recv().await.unwrap();
            let _ = done.send(());
            sleep(Duration::from_millis(10)).await;
            assert!(gate.active() <= 2);
            assert_eq!(admitted.lock().unwrap().len(), expected.min(4));
        }
        assert_eq!(*admitted.lock().unwrap(), vec![0, 1, 2, 3]);

        let done = release_rx.recv().await.unwrap();
        let _ = done.send(());
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_minute_window_throttles_admissions() {
        let limits = RateLimitConfig {
            max_requests_per_minute: Some(3),
            max_requests_per_hour: None,
        };
        let gate = gate(10, limits);

        let start = Instant::now();
        let mut stamps = Vec::new();
        for _ in 0..6 {
            gate.run(async {
                stamps.push(Instant::now());
                Ok(())
            })
            .await
            .unwrap();
        }

        // Any 60-second window contains at most 3 admissions.
        for (i, a) in stamps.iter().enumerate() {
            let within = stamps[i..]
                .iter()
                .filter(|b| b.duration_since(*a) < MINUTE)
                .count();
            assert!(within <= 3, "window starting at stamp {} holds {}", i, within);
        }
        assert!(start.elapsed() >= MINUTE);
        assert!(start.elapsed() < MINUTE + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn per_hour_window_throttles_admissions() {
        let limits = RateLimitConfig {
            max_requests_per_minute: None,
            max_requests_per_hour: Some(2),
        };
        let gate = gate(10, limits);

        let start = Instant::now();
        for _ in 0..3 {
            gate.run(async { Ok(()) }).await.unwrap();
        }
        assert!(start.elapsed() >= HOUR);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_still_releases_its_slot() {
        let gate = gate(1, RateLimitConfig::default());

        let err = gate
            .run(async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(gate.active(), 0);

        gate.run(async { Ok(()) }).await.unwrap();
    }
}
