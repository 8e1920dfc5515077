//! Parallel batch execution.
//!
//! Tests are assigned round-robin over the supplied environments and
//! dispatched in submission order. A semaphore bounds the number of tests in
//! flight, and each environment has a slot so it never runs two tests at
//! once. Cancellation only stops further dispatch; tests already running
//! finish normally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{EnvironmentRef, TestCase, TestResult};

use super::ExecutionEngine;

/// Lifecycle of a parallel batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelStatus {
    Running,
    Completed,
    Cancelled,
}

impl std::fmt::Display for ParallelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParallelStatus::Running => write!(f, "running"),
            ParallelStatus::Completed => write!(f, "completed"),
            ParallelStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Snapshot of a parallel batch.
#[derive(Debug, Clone, Serialize)]
pub struct ParallelHandle {
    pub id: String,
    pub status: ParallelStatus,
    /// Tests submitted.
    pub total: usize,
    /// Tests handed to a worker so far.
    pub dispatched: usize,
    /// Results in completion order.
    pub results: Vec<TestResult>,
    pub started_at: DateTime<Utc>,
    /// Set once every dispatched test has resolved.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ParallelHandle {
    /// True once no dispatched work is outstanding.
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

pub(crate) struct HandleEntry {
    state: ParallelHandle,
    cancel: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl ExecutionEngine {
    /// Starts running `tests` over the environments in `env_ids` and returns
    /// immediately with the initial handle snapshot.
    ///
    /// Test `i` goes to environment `i % env_ids.len()`. Failures of one
    /// test (including an unusable environment) are recorded as ERROR
    /// results and never stop the batch.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NoEnvironments` if `env_ids` is empty.
    pub fn execute_parallel(
        &self,
        tests: Vec<TestCase>,
        env_ids: Vec<String>,
        timeout: Duration,
    ) -> Result<ParallelHandle, EngineError> {
        if env_ids.is_empty() {
            return Err(EngineError::NoEnvironments);
        }

        self.purge_finished();

        let id = format!("par-{}", Uuid::new_v4());
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        let state = ParallelHandle {
            id: id.clone(),
            status: ParallelStatus::Running,
            total: tests.len(),
            dispatched: 0,
            results: Vec::with_capacity(tests.len()),
            started_at: Utc::now(),
            finished_at: None,
        };

        self.lock_handles().insert(
            id.clone(),
            HandleEntry {
                state: state.clone(),
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        info!(
            handle = %id,
            tests = tests.len(),
            environments = env_ids.len(),
            workers = self.max_workers,
            "Parallel execution started"
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine.dispatch(&id, tests, env_ids, timeout, cancel).await;
            engine.finish(&id);
            let _ = done_tx.send(true);
        });

        Ok(state)
    }

    async fn dispatch(
        &self,
        handle_id: &str,
        tests: Vec<TestCase>,
        env_ids: Vec<String>,
        timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let slots: HashMap<String, Arc<AsyncMutex<()>>> = env_ids
            .iter()
            .map(|id| (id.clone(), Arc::new(AsyncMutex::new(()))))
            .collect();
        let mut workers = JoinSet::new();

        for (index, test) in tests.into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                info!(handle = %handle_id, dispatched = index, "Dispatch stopped by cancellation");
                break;
            }

            let env_id = env_ids[index % env_ids.len()].clone();
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let Some(slot) = slots.get(&env_id) else {
                break;
            };
            let slot = slot.clone().lock_owned().await;

            // Waiting for a worker may have taken a while.
            if cancel.load(Ordering::SeqCst) {
                info!(handle = %handle_id, dispatched = index, "Dispatch stopped by cancellation");
                break;
            }

            self.update_handle(handle_id, |state| state.dispatched += 1);
            debug!(handle = %handle_id, test_id = %test.id, env_id = %env_id, "Dispatched test");

            let engine = self.clone();
            let handle_id = handle_id.to_string();
            workers.spawn(async move {
                let _permit = permit;
                let _slot = slot;
                let result = match engine.execute_one(&test, &env_id, timeout).await {
                    Ok(result) => result,
                    Err(e) => {
                        let env_ref = engine
                            .envs
                            .get(&env_id)
                            .map(|env| env.reference())
                            .unwrap_or_else(|| EnvironmentRef::unknown(&env_id));
                        TestResult::error(&test, env_ref, e.to_string())
                    }
                };
                engine.update_handle(&handle_id, |state| state.results.push(result));
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(handle = %handle_id, error = %e, "Parallel worker task failed");
            }
        }
    }

    fn finish(&self, handle_id: &str) {
        self.update_handle(handle_id, |state| {
            if state.status == ParallelStatus::Running {
                state.status = ParallelStatus::Completed;
            }
            state.finished_at = Some(Utc::now());
            info!(
                handle = %state.id,
                status = %state.status,
                results = state.results.len(),
                "Parallel execution finished"
            );
        });
    }

    /// Snapshot of a parallel batch.
    pub fn handle(&self, handle_id: &str) -> Option<ParallelHandle> {
        self.lock_handles()
            .get(handle_id)
            .map(|entry| entry.state.clone())
    }

    /// Waits until every dispatched test of the batch has resolved.
    pub async fn wait(&self, handle_id: &str) -> Result<ParallelHandle, EngineError> {
        let mut done = self
            .lock_handles()
            .get(handle_id)
            .map(|entry| entry.done.clone())
            .ok_or_else(|| EngineError::HandleNotFound(handle_id.to_string()))?;

        // A closed channel means the coordinator is gone; the state is final.
        let _ = done.wait_for(|finished| *finished).await;

        self.handle(handle_id)
            .ok_or_else(|| EngineError::HandleNotFound(handle_id.to_string()))
    }

    /// Stops further dispatch for a running batch.
    ///
    /// Returns false if the handle is unknown or no longer running.
    pub fn cancel(&self, handle_id: &str) -> bool {
        let mut handles = self.lock_handles();
        match handles.get_mut(handle_id) {
            Some(entry) if entry.state.status == ParallelStatus::Running => {
                entry.cancel.store(true, Ordering::SeqCst);
                entry.state.status = ParallelStatus::Cancelled;
                info!(handle = %handle_id, "Parallel execution cancelled");
                true
            }
            _ => false,
        }
    }

    /// Drops a finished handle. Returns false if it is unknown or running.
    pub fn forget(&self, handle_id: &str) -> bool {
        let mut handles = self.lock_handles();
        match handles.get(handle_id) {
            Some(entry) if entry.state.is_finished() => {
                handles.remove(handle_id);
                true
            }
            _ => false,
        }
    }

    /// Drops handles that finished longer ago than the engine's handle
    /// retention. Running batches are never dropped.
    pub fn purge_finished(&self) -> usize {
        self.purge_finished_at(Utc::now(), self.handle_retention)
    }

    pub fn purge_finished_at(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut handles = self.lock_handles();
        let before = handles.len();
        handles.retain(|_, entry| match entry.state.finished_at {
            Some(finished) => now - finished < max_age,
            None => true,
        });
        let removed = before - handles.len();
        if removed > 0 {
            debug!(removed, "Purged finished parallel handles");
        }
        removed
    }

    fn update_handle(&self, handle_id: &str, f: impl FnOnce(&mut ParallelHandle)) {
        if let Some(entry) = self.lock_handles().get_mut(handle_id) {
            f(&mut entry.state);
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, HandleEntry>> {
        self.handles.lock().expect("parallel handle lock poisoned")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ContainerEngine, OrchestratorConfig};
    use crate::environment::{Emulator, EnvironmentConfig, EnvironmentManager, HardwareProfile};
    use crate::model::{TestStatus, TestType};
    use crate::runner::RunnerFactory;
    use tempfile::TempDir;

    async fn engine_with_envs(dir: &TempDir, count: usize, workers: usize) -> (ExecutionEngine, Vec<String>) {
        let envs = Arc::new(EnvironmentManager::new(dir.path()).with_disk_size_mb(1));
        let config = OrchestratorConfig::default().with_container_engine(ContainerEngine::Host);
        let factory = RunnerFactory::with_defaults(&config, envs.processes().clone());

        let mut ids = Vec::new();
        for _ in 0..count {
            let env = envs
                .provision(&EnvironmentConfig::new(HardwareProfile::virtual_machine(
                    "x86_64",
                    Emulator::Host,
                )))
                .await
                .unwrap();
            ids.push(env.id);
        }
        (ExecutionEngine::new(envs, factory, workers), ids)
    }

    #[tokio::test]
    async fn test_parallel_runs_everything() {
        let dir = TempDir::new().unwrap();
        let (engine, ids) = engine_with_envs(&dir, 2, 2).await;
        let tests: Vec<TestCase> = (0..5)
            .map(|i| TestCase::new(format!("t{i}"), TestType::Unit, format!("exit {}", i % 2)))
            .collect();

        let handle = engine
            .execute_parallel(tests, ids.clone(), Duration::from_secs(10))
            .unwrap();
        assert_eq!(handle.status, ParallelStatus::Running);

        let done = engine.wait(&handle.id).await.unwrap();
        assert_eq!(done.status, ParallelStatus::Completed);
        assert_eq!(done.dispatched, 5);
        assert_eq!(done.results.len(), 5);
        let passed = done.results.iter().filter(|r| r.is_passed()).count();
        assert_eq!(passed, 3);

        // Round-robin: t0, t2, t4 on the first environment.
        for result in &done.results {
            let index: usize = result.test_id[1..].parse().unwrap();
            assert_eq!(result.environment.id, ids[index % 2]);
        }
        for id in &ids {
            assert!(engine.environments().get(id).unwrap().is_idle());
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatch() {
        let dir = TempDir::new().unwrap();
        let (engine, ids) = engine_with_envs(&dir, 1, 1).await;
        let tests: Vec<TestCase> = (0..5)
            .map(|i| TestCase::new(format!("t{i}"), TestType::Unit, "sleep 0.3"))
            .collect();

        let handle = engine
            .execute_parallel(tests, ids, Duration::from_secs(10))
            .unwrap();
        assert!(engine.cancel(&handle.id));
        assert!(!engine.cancel(&handle.id));

        let done = engine.wait(&handle.id).await.unwrap();
        assert_eq!(done.status, ParallelStatus::Cancelled);
        assert!(done.dispatched <= 1);
        assert_eq!(done.results.len(), done.dispatched);
        assert!(done.results.iter().all(|r| r.status() == TestStatus::Passed));
    }

    #[tokio::test]
    async fn test_unknown_environment_becomes_error_result() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine_with_envs(&dir, 0, 1).await;
        let tests = vec![TestCase::new("t", TestType::Unit, "true")];

        let handle = engine
            .execute_parallel(tests, vec!["env-gone".to_string()], Duration::from_secs(1))
            .unwrap();
        let done = engine.wait(&handle.id).await.unwrap();
        assert_eq!(done.results.len(), 1);
        assert_eq!(done.results[0].status(), TestStatus::Error);
        assert_eq!(done.results[0].environment.architecture, "unknown");
    }

    #[tokio::test]
    async fn test_handle_lookup_errors() {
        let dir = TempDir::new().unwrap();
        let (engine, _) = engine_with_envs(&dir, 0, 1).await;

        assert!(matches!(
            engine.execute_parallel(vec![], vec![], Duration::from_secs(1)),
            Err(EngineError::NoEnvironments)
        ));
        assert!(matches!(
            engine.wait("par-missing").await,
            Err(EngineError::HandleNotFound(_))
        ));
        assert!(engine.handle("par-missing").is_none());
        assert!(!engine.cancel("par-missing"));
    }

    #[tokio::test]
    async fn test_forget_only_finished() {
        let dir = TempDir::new().unwrap();
        let (engine, ids) = engine_with_envs(&dir, 1, 1).await;
        let handle = engine
            .execute_parallel(vec![], ids, Duration::from_secs(1))
            .unwrap();
        engine.wait(&handle.id).await.unwrap();
        assert!(engine.forget(&handle.id));
        assert!(engine.handle(&handle.id).is_none());
    }

    #[tokio::test]
    async fn test_finished_handles_expire() {
        let dir = TempDir::new().unwrap();
        let (engine, ids) = engine_with_envs(&dir, 1, 1).await;
        let engine = engine.with_handle_retention(Duration::ZERO);

        let slow = engine
            .execute_parallel(
                vec![TestCase::new("slow", TestType::Unit, "sleep 0.5")],
                ids.clone(),
                Duration::from_secs(10),
            )
            .unwrap();
        let first = engine
            .execute_parallel(vec![], ids.clone(), Duration::from_secs(1))
            .unwrap();
        engine.wait(&first.id).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(3600);
        assert_eq!(engine.purge_finished_at(later, Duration::from_secs(60)), 1);
        assert!(engine.handle(&first.id).is_none());
        assert!(engine.handle(&slow.id).is_some());

        // Starting a batch sweeps out expired ones.
        engine.wait(&slow.id).await.unwrap();
        let next = engine
            .execute_parallel(vec![], ids, Duration::from_secs(1))
            .unwrap();
        assert!(engine.handle(&slow.id).is_none());
        assert!(engine.handle(&next.id).is_some());
    }
}
