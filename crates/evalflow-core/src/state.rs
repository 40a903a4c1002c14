use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::StateHook;
use evalflow_types::BatchState;

/// Keeps the live batch image and persists it on demand, on an interval,
/// and once more at cleanup. Because updates land after the commit step,
/// a saved snapshot never references a row whose export was not
/// acknowledged.
pub struct StateManager {
    state: Mutex<BatchState>,
    file: Option<PathBuf>,
    hook: Option<StateHook>,
    autosave: Mutex<Option<AutosaveHandle>>,
}

struct AutosaveHandle {
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl StateManager {
    pub fn new(initial: BatchState, file: Option<PathBuf>, hook: Option<StateHook>) -> Self {
        Self {
            state: Mutex::new(initial),
            file,
            hook,
            autosave: Mutex::new(None),
        }
    }

    /// Merge fields into the snapshot and stamp `last_update`.
    pub fn update(&self, apply: impl FnOnce(&mut BatchState)) {
        let mut state = self.state.lock().unwrap();
        apply(&mut state);
        state.last_update = Utc::now();
    }

    pub fn snapshot(&self) -> BatchState {
        self.state.lock().unwrap().clone()
    }

    /// Write the snapshot to its file (if any) and await the user hook
    /// (if any).
    pub async fn save(&self) -> Result<()> {
        let snapshot = self.snapshot();
        if let Some(path) = &self.file {
            let json = serde_json::to_string_pretty(&snapshot)?;
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("writing state to {path:?}"))?;
        }
        if let Some(hook) = &self.hook {
            hook(snapshot).await?;
        }
        Ok(())
    }

    /// Start periodic saves. Save failures are logged, not propagated; a
    /// flaky disk must not take the batch down mid-run.
    pub fn spawn_autosave(self: &Arc<Self>, every: Duration) {
        let (shutdown, mut rx) = mpsc::channel::<()>(1);
        let manager = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = manager.save().await {
                            tracing::warn!("state autosave failed: {err:#}");
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
        });
        *self.autosave.lock().unwrap() = Some(AutosaveHandle { shutdown, task });
    }

    /// Stop the autosave timer and perform one final save.
    pub async fn cleanup(&self) -> Result<()> {
        let handle = self.autosave.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(()).await;
            let _ = handle.task.await;
        }
        self.save().await
    }

    /// Read and parse a previously written snapshot.
    pub async fn load(path: impl AsRef<Path>) -> Result<BatchState> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading state from {path:?}"))?;
        serde_json::from_str(&content).with_context(|| format!("parsing state in {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::state_hook;
    use std::collections::BTreeSet;

    fn initial_state() -> BatchState {
        BatchState {
            batch_id: "batch-1".to_string(),
            started_at: Utc::now(),
            last_update: Utc::now(),
            input_path: None,
            evaluator_names: vec!["exact_match".to_string()],
            total_rows: 3,
            processed_rows: BTreeSet::new(),
            results: Vec::new(),
            progress: None,
        }
    }

    #[tokio::test]
    async fn update_stamps_last_update() {
        let manager = StateManager::new(initial_state(), None, None);
        let before = manager.snapshot().last_update;
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager.update(|s| {
            s.processed_rows.insert(0);
        });
        let after = manager.snapshot();
        assert!(after.last_update > before);
        assert!(after.processed_rows.contains(&0));
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let manager = StateManager::new(initial_state(), Some(path.clone()), None);
        manager.update(|s| {
            s.processed_rows.insert(1);
            s.processed_rows.insert(2);
        });
        manager.save().await.unwrap();

        let loaded = StateManager::load(&path).await.unwrap();
        assert_eq!(loaded.batch_id, "batch-1");
        assert_eq!(loaded.processed_rows, BTreeSet::from([1, 2]));
        assert_eq!(loaded.evaluator_names, vec!["exact_match".to_string()]);
    }

    #[tokio::test]
    async fn save_awaits_the_hook() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook = state_hook(move |state: BatchState| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(state.batch_id);
                Ok(())
            }
        });
        let manager = StateManager::new(initial_state(), None, Some(hook));
        manager.save().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["batch-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_fires_until_cleanup() {
        let saves: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let counter = saves.clone();
        let hook = state_hook(move |_state: BatchState| {
            let counter = counter.clone();
            async move {
                *counter.lock().unwrap() += 1;
                Ok(())
            }
        });
        let manager = Arc::new(StateManager::new(initial_state(), None, Some(hook)));
        manager.spawn_autosave(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(350)).await;
        let periodic = *saves.lock().unwrap();
        assert!(periodic >= 2, "expected periodic saves, got {periodic}");

        manager.cleanup().await.unwrap();
        let after_cleanup = *saves.lock().unwrap();
        assert!(after_cleanup > periodic, "cleanup performs a final save");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*saves.lock().unwrap(), after_cleanup, "timer stopped");
    }
}
