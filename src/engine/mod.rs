//! Test execution engine.
//!
//! [`ExecutionEngine::execute_one`] runs a single test on an idle
//! environment: it marks the environment busy, creates the selected runner,
//! enforces the timeout, classifies the outcome and attaches artifacts. The
//! environment goes back to idle on every exit path, including panics inside
//! a runner.
//!
//! [`ExecutionEngine::execute_parallel`] fans a batch out over a pool of
//! environments with a bounded number of workers.

pub mod aggregate;
pub mod classify;
pub mod parallel;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::environment::{Environment, EnvironmentManager};
use crate::error::{EngineError, EnvironmentError};
use crate::metrics::MetricsCollector;
use crate::model::{FailureInfo, TestCase, TestOutcome, TestResult};
use crate::runner::RunnerFactory;

pub use aggregate::{aggregate, AggregateReport, GroupBy, ResultStats};
pub use classify::{classify, detect_crash, CrashMatch};
pub use parallel::{ParallelHandle, ParallelStatus};

use parallel::HandleEntry;

/// Extra time a runner gets past the test timeout before the engine kills
/// the environment's process group itself.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How long a finished parallel handle stays queryable by default.
pub const DEFAULT_HANDLE_RETENTION: Duration = Duration::from_secs(3600);

/// Returns the environment to idle when dropped.
struct BusyGuard<'a> {
    envs: &'a EnvironmentManager,
    env_id: &'a str,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        if !self.envs.mark_idle(self.env_id) {
            debug!(env_id = %self.env_id, "Environment not returned to idle (gone or not busy)");
        }
    }
}

/// Runs tests on environments.
///
/// Cheap to clone; clones share the same handle registry.
#[derive(Clone)]
pub struct ExecutionEngine {
    envs: Arc<EnvironmentManager>,
    factory: Arc<RunnerFactory>,
    max_workers: usize,
    handle_retention: Duration,
    handles: Arc<Mutex<HashMap<String, HandleEntry>>>,
    metrics: MetricsCollector,
}

impl ExecutionEngine {
    /// Creates an engine running at most `max_workers` tests at once in
    /// [`execute_parallel`](Self::execute_parallel).
    pub fn new(envs: Arc<EnvironmentManager>, factory: RunnerFactory, max_workers: usize) -> Self {
        Self {
            envs,
            factory: Arc::new(factory),
            max_workers: max_workers.max(1),
            handle_retention: DEFAULT_HANDLE_RETENTION,
            handles: Arc::new(Mutex::new(HashMap::new())),
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets how long finished parallel handles are kept before they are
    /// purged.
    pub fn with_handle_retention(mut self, retention: Duration) -> Self {
        self.handle_retention = retention;
        self
    }

    pub fn environments(&self) -> &Arc<EnvironmentManager> {
        &self.envs
    }

    pub fn factory(&self) -> &RunnerFactory {
        &self.factory
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Runs `test` on the idle environment `env_id`.
    ///
    /// Anything that goes wrong after the environment was acquired is
    /// recorded in the returned result (ERROR, FAILED or TIMEOUT).
    ///
    /// # Errors
    ///
    /// - `EngineError::EnvironmentNotFound` if `env_id` is not registered
    /// - `EngineError::EnvironmentNotIdle` if the environment is busy or in
    ///   error state
    pub async fn execute_one(
        &self,
        test: &TestCase,
        env_id: &str,
        timeout: Duration,
    ) -> Result<TestResult, EngineError> {
        let env = self.envs.mark_busy(env_id).map_err(|e| match e {
            EnvironmentError::NotFound(_) => EngineError::EnvironmentNotFound(env_id.to_string()),
            EnvironmentError::InvalidState { env_id, status, .. } => {
                EngineError::EnvironmentNotIdle { env_id, status }
            }
            other => EngineError::Environment(other),
        })?;
        let _guard = BusyGuard {
            envs: &self.envs,
            env_id,
        };

        info!(test_id = %test.id, env_id = %env_id, test_type = %test.test_type, "Test started");
        let started = Instant::now();

        let result = match AssertUnwindSafe(self.run_on(test, &env, timeout))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(test_id = %test.id, env_id = %env_id, panic = %message, "Runner panicked");
                self.envs.processes().kill(env_id);
                TestResult::error(
                    test,
                    env.reference(),
                    format!("Internal error during execution: {message}"),
                )
            }
        };

        write_output_logs(&env, &result).await;
        let artifacts = self.envs.capture_artifacts(env_id);
        let result = result
            .with_artifacts(artifacts)
            .with_execution_time(started.elapsed());

        let backend = result
            .backend
            .as_ref()
            .map(|b| b.label().to_string())
            .unwrap_or_else(|| "none".to_string());
        self.metrics.record_test(
            result.status().as_str(),
            &backend,
            result.execution_time.as_secs_f64(),
        );
        info!(
            test_id = %test.id,
            env_id = %env_id,
            status = %result.status(),
            backend = %backend,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "Test finished"
        );

        Ok(result)
    }

    async fn run_on(&self, test: &TestCase, env: &Environment, timeout: Duration) -> TestResult {
        let runner = match self.factory.create_runner(test, env) {
            Ok(runner) => runner,
            Err(e) => {
                warn!(test_id = %test.id, env_id = %env.id, error = %e, "No runner for test");
                return TestResult::error(test, env.reference(), e.to_string());
            }
        };
        let kind = runner.kind();
        debug!(test_id = %test.id, backend = %kind, "Runner created");

        let outcome = tokio::time::timeout(timeout + KILL_GRACE, runner.execute(test, timeout)).await;

        if let Err(e) = runner.cleanup().await {
            warn!(test_id = %test.id, backend = %kind, error = %e, "Runner cleanup failed");
        }

        let result = match outcome {
            Ok(Ok(execution)) => {
                let classified = classify::classify(test, &execution, timeout);
                TestResult::new(test, env.reference(), classified).with_execution(&execution)
            }
            Ok(Err(e)) => {
                warn!(test_id = %test.id, backend = %kind, error = %e, "Runner failed");
                TestResult::error(test, env.reference(), format!("Runner failed: {e}"))
            }
            Err(_) => {
                warn!(test_id = %test.id, backend = %kind, "Runner ignored its timeout, killing process group");
                self.envs.processes().kill(&env.id);
                TestResult::new(
                    test,
                    env.reference(),
                    TestOutcome::Timeout(FailureInfo::timeout(timeout)),
                )
            }
        };

        result.with_backend(kind)
    }
}

/// Writes captured output into the environment's log directory so artifact
/// capture picks it up.
async fn write_output_logs(env: &Environment, result: &TestResult) {
    let stem = log_file_stem(&result.test_id);
    let logs_dir = env.logs_dir();
    if let Err(e) = tokio::fs::create_dir_all(&logs_dir).await {
        warn!(env_id = %env.id, error = %e, "Failed to create log directory");
        return;
    }
    for (suffix, content) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
        let path = logs_dir.join(format!("{stem}.{suffix}.log"));
        if let Err(e) = tokio::fs::write(&path, content).await {
            warn!(path = %path.display(), error = %e, "Failed to write test output log");
        }
    }
}

fn log_file_stem(test_id: &str) -> String {
    test_id
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ContainerEngine, OrchestratorConfig};
    use crate::environment::{Emulator, EnvironmentConfig, EnvironmentStatus, HardwareProfile};
    use crate::error::RunnerError;
    use crate::model::{ExecutionResult, TestStatus, TestType};
    use crate::runner::{BackendKind, Runner, RunnerContext};
    use async_trait::async_trait;
    use tempfile::TempDir;

    async fn setup(dir: &TempDir) -> (ExecutionEngine, String) {
        let envs = Arc::new(EnvironmentManager::new(dir.path()).with_disk_size_mb(1));
        let config = OrchestratorConfig::default().with_container_engine(ContainerEngine::Host);
        let factory = RunnerFactory::with_defaults(&config, envs.processes().clone());
        let env = envs
            .provision(&EnvironmentConfig::new(HardwareProfile::virtual_machine(
                "x86_64",
                Emulator::Host,
            )))
            .await
            .unwrap();
        (ExecutionEngine::new(envs, factory, 2), env.id)
    }

    #[tokio::test]
    async fn test_passing_test_writes_logs() {
        let dir = TempDir::new().unwrap();
        let (engine, env_id) = setup(&dir).await;
        let test = TestCase::new("ok/1", TestType::Unit, "echo hello");

        let result = engine
            .execute_one(&test, &env_id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.status(), TestStatus::Passed);
        assert!(result.failure_info().is_none());
        assert_eq!(result.backend, Some(BackendKind::Container));
        assert!(result.stdout.contains("hello"));
        assert!(result
            .artifacts
            .logs
            .iter()
            .any(|p| p.ends_with("ok_1.stdout.log")));
        assert_eq!(
            engine.environments().get(&env_id).unwrap().status,
            EnvironmentStatus::Idle
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_and_returns_to_idle() {
        let dir = TempDir::new().unwrap();
        let (engine, env_id) = setup(&dir).await;
        let test = TestCase::new("slow", TestType::Unit, "sleep 10");

        let started = Instant::now();
        let result = engine
            .execute_one(&test, &env_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(result.status(), TestStatus::Timeout);
        assert!(result.failure_info().unwrap().timeout_occurred);
        assert!(engine.environments().get(&env_id).unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_crash_signature_fails() {
        let dir = TempDir::new().unwrap();
        let (engine, env_id) = setup(&dir).await;
        let test = TestCase::new("oops", TestType::Unit, "echo 'BUG: kernel NULL pointer dereference'");

        let result = engine
            .execute_one(&test, &env_id, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.status(), TestStatus::Failed);
        assert!(result.failure_info().unwrap().kernel_panic);
    }

    #[tokio::test]
    async fn test_requires_idle_environment() {
        let dir = TempDir::new().unwrap();
        let (engine, env_id) = setup(&dir).await;
        let test = TestCase::new("t", TestType::Unit, "true");

        assert!(matches!(
            engine.execute_one(&test, "env-missing", Duration::from_secs(1)).await,
            Err(EngineError::EnvironmentNotFound(_))
        ));

        engine.environments().mark_busy(&env_id).unwrap();
        assert!(matches!(
            engine.execute_one(&test, &env_id, Duration::from_secs(1)).await,
            Err(EngineError::EnvironmentNotIdle { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_backend_is_error_result() {
        let dir = TempDir::new().unwrap();
        let (engine, env_id) = setup(&dir).await;
        let empty = ExecutionEngine::new(
            engine.environments().clone(),
            RunnerFactory::new(engine.environments().processes().clone()),
            1,
        );
        let test = TestCase::new("t", TestType::Unit, "true");

        let result = empty
            .execute_one(&test, &env_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.status(), TestStatus::Error);
        assert!(result
            .failure_info()
            .unwrap()
            .error_message
            .contains("No runner registered"));
        assert!(empty.environments().get(&env_id).unwrap().is_idle());
    }

    struct PanicRunner;

    #[async_trait]
    impl Runner for PanicRunner {
        fn kind(&self) -> BackendKind {
            BackendKind::Container
        }

        async fn execute(
            &self,
            _test: &TestCase,
            _timeout: Duration,
        ) -> Result<ExecutionResult, RunnerError> {
            panic!("runner exploded");
        }

        async fn cleanup(&self) -> Result<(), RunnerError> {
            Ok(())
        }

        fn supports_test_type(&self, _test_type: TestType) -> bool {
            true
        }

        fn supports_hardware(&self, _profile: &HardwareProfile) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_panicking_runner_is_error_and_releases_environment() {
        let dir = TempDir::new().unwrap();
        let (engine, env_id) = setup(&dir).await;
        let mut factory = RunnerFactory::new(engine.environments().processes().clone());
        factory.register(
            BackendKind::Container,
            |_ctx: RunnerContext| -> Result<Box<dyn Runner>, RunnerError> {
                Ok(Box::new(PanicRunner))
            },
        );
        let engine = ExecutionEngine::new(engine.environments().clone(), factory, 1);
        let test = TestCase::new("t", TestType::Unit, "true");

        let result = engine
            .execute_one(&test, &env_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.status(), TestStatus::Error);
        let info = result.failure_info().unwrap();
        assert!(info.error_message.contains("runner exploded"));
        assert!(!info.kernel_panic);
        assert!(engine.environments().get(&env_id).unwrap().is_idle());
    }
}
