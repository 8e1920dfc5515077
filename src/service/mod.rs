//! Plan-level orchestration.
//!
//! The [`ExecutionService`] accepts execution plans and runs each one on a
//! background task. Tests of a plan are dispatched in order; each one gets
//! an environment round-robin from the idle pool, or a freshly provisioned
//! one when the pool is empty. Cancellation is checked before every
//! dispatch and never interrupts a running test.
//!
//! ```text
//! start_plan ─► [queued] ─► [running] ─┬─► completed
//!                                       ├─► failed     (environment exhausted)
//!                                       └─► cancelled  (cancel_plan)
//! ```

pub mod events;
pub mod plan;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::engine::ExecutionEngine;
use crate::environment::EnvironmentManager;
use crate::error::EngineError;
use crate::metrics::MetricsCollector;
use crate::model::{EnvironmentRef, TestCase, TestResult};
use crate::resource::{ReclaimerHandle, ResourceManager, ResourceStatus};
use crate::runner::RunnerFactory;

pub use events::{PlanEvent, EVENT_CHANNEL_CAPACITY};
pub use plan::{
    ExecutionPlan, ExecutionProgress, PlanRequest, PlanSnapshot, PlanStatus, Priority,
};

/// Attempts to get an environment for one test when another plan keeps
/// taking the chosen one.
const ACQUIRE_ATTEMPTS: usize = 3;

const MAX_RETENTION_HOURS: u64 = 24 * 365 * 100;

struct PlanRecord {
    plan: ExecutionPlan,
    progress: ExecutionProgress,
    results: Vec<TestResult>,
    cancel: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

impl PlanRecord {
    fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            plan: self.plan.clone(),
            progress: self.progress.clone(),
            results: self.results.clone(),
        }
    }
}

/// Background tasks started by [`ExecutionService::start_maintenance`].
struct Maintenance {
    reclaimer: ReclaimerHandle,
    stop_flag: Arc<AtomicBool>,
    purger: JoinHandle<()>,
}

struct ServiceInner {
    config: OrchestratorConfig,
    engine: ExecutionEngine,
    resources: Arc<ResourceManager>,
    plans: Mutex<HashMap<String, PlanRecord>>,
    events: broadcast::Sender<PlanEvent>,
    maintenance: Mutex<Option<Maintenance>>,
    metrics: MetricsCollector,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        let maintenance = self
            .maintenance
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(maintenance) = maintenance.take() {
            maintenance.stop_flag.store(true, Ordering::Relaxed);
        }
    }
}

/// Top-level orchestrator for execution plans.
///
/// Constructed once and shared by cloning; clones drive the same plans.
#[derive(Clone)]
pub struct ExecutionService {
    inner: Arc<ServiceInner>,
}

impl ExecutionService {
    /// Creates a service from already-built components.
    pub fn new(
        config: OrchestratorConfig,
        engine: ExecutionEngine,
        resources: Arc<ResourceManager>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                engine,
                resources,
                plans: Mutex::new(HashMap::new()),
                events,
                maintenance: Mutex::new(None),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    /// Builds the whole stack (environments, runners, engine, resources)
    /// from `config`.
    pub fn from_config(config: OrchestratorConfig) -> Self {
        let envs = Arc::new(EnvironmentManager::from_config(&config));
        let factory = RunnerFactory::with_defaults(&config, envs.processes().clone());
        let engine = ExecutionEngine::new(envs.clone(), factory, config.max_workers)
            .with_handle_retention(config.plan_retention);
        let resources = Arc::new(ResourceManager::from_config(envs, &config));
        Self::new(config, engine, resources)
    }

    /// Starts the idle reclaimer and the plan retention purge, both every
    /// `reclaim_interval`.
    ///
    /// Returns false if maintenance is already running. Must be called from
    /// within a tokio runtime.
    pub fn start_maintenance(&self) -> bool {
        let mut slot = self.inner.lock_maintenance();
        if slot.is_some() {
            return false;
        }

        let interval = self.inner.config.reclaim_interval;
        let reclaimer = self.inner.resources.spawn_reclaimer(interval);
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);

        let purger = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = ExecutionService { inner };
                service.purge_expired();
                service.inner.engine.purge_finished();
            }
            debug!("Plan purger stopped");
        });

        *slot = Some(Maintenance {
            reclaimer,
            stop_flag,
            purger,
        });
        info!(
            interval_secs = interval.as_secs_f64(),
            retention_secs = self.inner.config.plan_retention.as_secs_f64(),
            "Service maintenance started"
        );
        true
    }

    /// Stops the background tasks started by
    /// [`start_maintenance`](Self::start_maintenance) and waits for them.
    ///
    /// Plans still running are left alone.
    pub async fn shutdown(&self) {
        let maintenance = self.inner.lock_maintenance().take();
        if let Some(maintenance) = maintenance {
            maintenance.stop_flag.store(true, Ordering::Relaxed);
            maintenance.reclaimer.stop().await;
            if let Err(e) = maintenance.purger.await {
                warn!(error = %e, "Plan purger task failed");
            }
            info!("Service maintenance stopped");
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.inner.engine
    }

    pub fn environments(&self) -> &Arc<EnvironmentManager> {
        self.inner.engine.environments()
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.inner.resources
    }

    /// Receiver of plan events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.inner.events.subscribe()
    }

    /// Accepts a plan and starts running it in the background.
    ///
    /// Returns false if a plan with the same id is still queued, running or
    /// winding down after cancellation. A finished plan's id may be reused.
    /// Must be called from within a tokio runtime.
    pub fn start_plan(&self, request: PlanRequest) -> bool {
        let now = Utc::now();
        let timeout = request.timeout.unwrap_or(self.inner.config.default_timeout);
        let plan_id = request.plan_id.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);

        let tests = {
            let mut plans = self.inner.lock_plans();
            if plans
                .get(&plan_id)
                .is_some_and(|record| !record.plan.status.is_terminal() || !*record.done.borrow())
            {
                warn!(plan_id = %plan_id, "Plan already active, rejecting");
                return false;
            }

            let plan = ExecutionPlan::from_request(request, timeout, now);
            let progress = ExecutionProgress::new(&plan_id, plan.tests.len(), timeout, now);
            let tests = plan.tests.clone();
            plans.insert(
                plan_id.clone(),
                PlanRecord {
                    plan,
                    progress,
                    results: Vec::new(),
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
            tests
        };

        info!(
            plan_id = %plan_id,
            tests = tests.len(),
            timeout_secs = timeout.as_secs_f64(),
            "Plan accepted"
        );
        self.inner.metrics.inc_plans_active();
        self.inner.publish(PlanEvent::PlanStarted {
            plan_id: plan_id.clone(),
            total: tests.len(),
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_plan(&plan_id, tests, timeout, cancel).await;
            let _ = done_tx.send(true);
        });

        true
    }

    /// Cancels a queued or running plan.
    ///
    /// The plan stops before its next dispatch; a test already running
    /// finishes. Returns false if the plan is unknown or already finished.
    pub fn cancel_plan(&self, plan_id: &str) -> bool {
        let mut plans = self.inner.lock_plans();
        match plans.get_mut(plan_id) {
            Some(record) if !record.plan.status.is_terminal() => {
                record.cancel.store(true, Ordering::SeqCst);
                record.plan.status = PlanStatus::Cancelled;
                info!(plan_id = %plan_id, "Plan cancelled");
                true
            }
            _ => false,
        }
    }

    /// Snapshot of one plan.
    pub fn get_status(&self, plan_id: &str) -> Option<PlanSnapshot> {
        self.inner
            .lock_plans()
            .get(plan_id)
            .map(PlanRecord::snapshot)
    }

    /// Snapshots of queued and running plans, highest priority first.
    pub fn get_active(&self) -> Vec<PlanSnapshot> {
        let mut active: Vec<PlanSnapshot> = self
            .inner
            .lock_plans()
            .values()
            .filter(|record| !record.plan.status.is_terminal())
            .map(PlanRecord::snapshot)
            .collect();
        active.sort_by(|a, b| {
            b.plan
                .priority
                .cmp(&a.plan.priority)
                .then(a.plan.created_at.cmp(&b.plan.created_at))
        });
        active
    }

    /// Waits for a plan's background task to finish and returns its final
    /// snapshot.
    pub async fn wait_for_completion(&self, plan_id: &str) -> Option<PlanSnapshot> {
        let mut done = self
            .inner
            .lock_plans()
            .get(plan_id)
            .map(|record| record.done.clone())?;
        let _ = done.wait_for(|finished| *finished).await;
        self.get_status(plan_id)
    }

    /// Purges terminal plans that finished more than `max_age_hours` ago.
    pub fn cleanup_old(&self, max_age_hours: u64) -> usize {
        self.cleanup_old_at(Utc::now(), max_age_hours)
    }

    pub fn cleanup_old_at(&self, now: DateTime<Utc>, max_age_hours: u64) -> usize {
        self.purge_older_than(
            now,
            chrono::Duration::hours(max_age_hours.min(MAX_RETENTION_HOURS) as i64),
        )
    }

    /// Purges terminal plans older than the configured retention.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let max_age = self.inner.config.plan_retention;
        let max_age = chrono::Duration::from_std(max_age)
            .unwrap_or(chrono::Duration::hours(MAX_RETENTION_HOURS as i64))
            .min(chrono::Duration::hours(MAX_RETENTION_HOURS as i64));
        self.purge_older_than(now, max_age)
    }

    fn purge_older_than(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> usize {
        let cutoff = now - max_age;
        let mut plans = self.inner.lock_plans();
        let before = plans.len();
        plans.retain(|_, record| {
            let plan = &record.plan;
            let finished = plan.finished_at.unwrap_or(plan.created_at);
            // A cancelled plan whose task is still winding down is kept.
            !(plan.status.is_terminal() && *record.done.borrow() && finished < cutoff)
        });
        let removed = before - plans.len();
        if removed > 0 {
            info!(removed, "Purged old plans");
        }
        removed
    }
}

impl ServiceInner {
    async fn run_plan(
        &self,
        plan_id: &str,
        tests: Vec<TestCase>,
        timeout: Duration,
        cancel: Arc<AtomicBool>,
    ) {
        self.update(plan_id, |record| {
            if record.plan.status == PlanStatus::Queued {
                record.plan.status = PlanStatus::Running;
            }
        });

        let mut cursor = 0usize;
        let mut failure: Option<String> = None;

        for test in tests {
            if cancel.load(Ordering::SeqCst) {
                info!(plan_id = %plan_id, test_id = %test.id, "Cancellation observed, stopping dispatch");
                break;
            }

            let result = match self.run_test(plan_id, &test, timeout, &mut cursor).await {
                Ok(result) => result,
                Err(message) => {
                    error!(plan_id = %plan_id, error = %message, "Plan aborted");
                    failure = Some(message);
                    break;
                }
            };

            let status = result.status();
            let progress = self.update(plan_id, |record| {
                record.progress.test_finished(&result, Utc::now());
                record.results.push(result);
                record.progress.clone()
            });
            if let Some(progress) = progress {
                self.publish(PlanEvent::TestCompleted {
                    plan_id: plan_id.to_string(),
                    test_id: test.id.clone(),
                    status,
                    progress,
                });
            }
        }

        let finished = self.update(plan_id, |record| {
            record.plan.status = if cancel.load(Ordering::SeqCst) {
                PlanStatus::Cancelled
            } else if failure.is_some() {
                PlanStatus::Failed
            } else {
                PlanStatus::Completed
            };
            record.plan.error = failure.clone();
            record.plan.finished_at = Some(Utc::now());
            record.progress.stopped();
            (record.plan.status, record.results.len())
        });

        self.metrics.dec_plans_active();
        if let Some((status, results)) = finished {
            info!(plan_id = %plan_id, status = %status, results, "Plan finished");
            self.publish(PlanEvent::PlanFinished {
                plan_id: plan_id.to_string(),
                status,
                error: failure,
            });
        }
    }

    /// Runs one test of a plan.
    ///
    /// Errors only when no environment can be obtained at all, which aborts
    /// the plan.
    async fn run_test(
        &self,
        plan_id: &str,
        test: &TestCase,
        timeout: Duration,
        cursor: &mut usize,
    ) -> Result<TestResult, String> {
        for attempt in 1..=ACQUIRE_ATTEMPTS {
            let env_id = self.acquire_environment(cursor).await?;

            self.update(plan_id, |record| record.progress.test_started(&test.name));
            self.publish(PlanEvent::TestStarted {
                plan_id: plan_id.to_string(),
                test_id: test.id.clone(),
                env_id: env_id.clone(),
            });

            self.track_usage(&env_id, ResourceStatus::Busy, false);
            let outcome = self.engine.execute_one(test, &env_id, timeout).await;
            self.track_usage(&env_id, ResourceStatus::Idle, outcome.is_ok());

            match outcome {
                Ok(result) => return Ok(result),
                Err(e @ (EngineError::EnvironmentNotIdle { .. } | EngineError::EnvironmentNotFound(_)))
                    if attempt < ACQUIRE_ATTEMPTS =>
                {
                    debug!(plan_id = %plan_id, env_id = %env_id, error = %e, "Environment taken, retrying");
                }
                Err(e) => {
                    let env_ref = self
                        .engine
                        .environments()
                        .get(&env_id)
                        .map(|env| env.reference())
                        .unwrap_or_else(|| EnvironmentRef::unknown(&env_id));
                    return Ok(TestResult::error(test, env_ref, e.to_string()));
                }
            }
        }
        Err(format!("No environment available for test '{}'", test.id))
    }

    /// Picks the next idle environment round-robin, or provisions one.
    async fn acquire_environment(&self, cursor: &mut usize) -> Result<String, String> {
        let envs = self.engine.environments();
        let idle = envs.list_idle();
        if !idle.is_empty() {
            let env = &idle[*cursor % idle.len()];
            *cursor = cursor.wrapping_add(1);
            return Ok(env.id.clone());
        }

        debug!("Idle pool empty, provisioning environment");
        match envs.provision(&self.config.default_environment).await {
            Ok(env) => {
                self.resources.register(&env.id);
                Ok(env.id)
            }
            Err(e) => Err(format!("Environment provisioning failed: {e}")),
        }
    }

    /// Records resource activity, re-registering a resource the reclaimer
    /// or a sync dropped while its environment is still alive.
    fn track_usage(&self, env_id: &str, status: ResourceStatus, completed: bool) {
        if self.resources.record_usage(env_id, status, completed).is_ok() {
            return;
        }
        if self.engine.environments().get(env_id).is_none() {
            debug!(env_id = %env_id, "Environment gone, usage not recorded");
            return;
        }
        self.resources.register(env_id);
        if let Err(e) = self.resources.record_usage(env_id, status, completed) {
            warn!(env_id = %env_id, error = %e, "Failed to record resource usage");
        }
    }

    fn update<T>(&self, plan_id: &str, f: impl FnOnce(&mut PlanRecord) -> T) -> Option<T> {
        self.lock_plans().get_mut(plan_id).map(f)
    }

    fn publish(&self, event: PlanEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_plans(&self) -> std::sync::MutexGuard<'_, HashMap<String, PlanRecord>> {
        self.plans.lock().expect("plan registry lock poisoned")
    }

    fn lock_maintenance(&self) -> std::sync::MutexGuard<'_, Option<Maintenance>> {
        self.maintenance.lock().expect("maintenance lock poisoned")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ContainerEngine;
    use crate::environment::{Emulator, EnvironmentConfig, HardwareProfile};
    use crate::model::{TestStatus, TestType};
    use tempfile::TempDir;

    fn host_config(dir: &TempDir) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_storage_root(dir.path())
            .with_disk_size_mb(1)
            .with_container_engine(ContainerEngine::Host)
            .with_default_environment(EnvironmentConfig::new(HardwareProfile::virtual_machine(
                "x86_64",
                Emulator::Host,
            )))
    }

    fn tests(n: usize, script: &str) -> Vec<TestCase> {
        (0..n)
            .map(|i| TestCase::new(format!("t{i}"), TestType::Unit, script))
            .collect()
    }

    #[tokio::test]
    async fn test_plan_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let service = ExecutionService::from_config(host_config(&dir));
        let mut events = service.subscribe();

        let mut suite = tests(2, "true");
        suite.push(TestCase::new("bad", TestType::Unit, "exit 1"));
        assert!(service.start_plan(PlanRequest::new("plan-1", suite).with_created_by("ci")));

        let snapshot = service.wait_for_completion("plan-1").await.unwrap();
        assert_eq!(snapshot.plan.status, PlanStatus::Completed);
        assert_eq!(snapshot.results.len(), 3);
        assert_eq!(snapshot.progress.completed, 3);
        assert_eq!(snapshot.progress.failed, 1);
        assert_eq!(snapshot.progress.percentage, 100.0);
        assert_eq!(snapshot.results[2].status(), TestStatus::Failed);

        // One environment provisioned on demand and reused.
        assert_eq!(service.environments().len(), 1);
        assert_eq!(service.resources().len(), 1);

        let first = events.recv().await.unwrap();
        assert!(matches!(first, PlanEvent::PlanStarted { total: 3, .. }));
    }

    #[tokio::test]
    async fn test_duplicate_active_plan_rejected() {
        let dir = TempDir::new().unwrap();
        let service = ExecutionService::from_config(host_config(&dir));

        assert!(service.start_plan(PlanRequest::new("p", tests(1, "sleep 0.2"))));
        assert!(!service.start_plan(PlanRequest::new("p", tests(1, "true"))));
        assert_eq!(service.get_active().len(), 1);

        service.wait_for_completion("p").await.unwrap();
        assert!(service.get_active().is_empty());
        assert!(service.start_plan(PlanRequest::new("p", tests(1, "true"))));
        service.wait_for_completion("p").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let service = ExecutionService::from_config(host_config(&dir));

        assert!(service.start_plan(PlanRequest::new("p", tests(5, "true"))));
        assert!(service.cancel_plan("p"));
        assert!(!service.cancel_plan("p"));

        let snapshot = service.wait_for_completion("p").await.unwrap();
        assert_eq!(snapshot.plan.status, PlanStatus::Cancelled);
        assert!(snapshot.results.is_empty());
        assert!(service.environments().is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_failure_fails_plan() {
        let dir = TempDir::new().unwrap();
        let config = host_config(&dir).with_default_environment(EnvironmentConfig::new(
            HardwareProfile::physical("aarch64", "rpi4"),
        ));
        let service = ExecutionService::from_config(config);

        assert!(service.start_plan(PlanRequest::new("p", tests(2, "true"))));
        let snapshot = service.wait_for_completion("p").await.unwrap();
        assert_eq!(snapshot.plan.status, PlanStatus::Failed);
        assert!(snapshot
            .plan
            .error
            .unwrap()
            .contains("Environment provisioning failed"));
        assert!(snapshot.results.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_old_purges_only_terminal() {
        let dir = TempDir::new().unwrap();
        let service = ExecutionService::from_config(host_config(&dir));

        assert!(service.start_plan(PlanRequest::new("done", tests(1, "true"))));
        service.wait_for_completion("done").await.unwrap();

        assert_eq!(service.cleanup_old(24), 0);
        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(service.cleanup_old_at(later, 24), 1);
        assert!(service.get_status("done").is_none());
    }

    #[tokio::test]
    async fn test_purge_expired_honors_retention() {
        let dir = TempDir::new().unwrap();
        let config = host_config(&dir).with_plan_retention(Duration::from_secs(60));
        let service = ExecutionService::from_config(config);

        assert!(service.start_plan(PlanRequest::new("short", tests(1, "true"))));
        service.wait_for_completion("short").await.unwrap();

        assert_eq!(service.purge_expired(), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(service.purge_expired_at(later), 1);
        assert!(service.get_status("short").is_none());
    }

    #[tokio::test]
    async fn test_maintenance_reclaims_and_purges() {
        let dir = TempDir::new().unwrap();
        let config = host_config(&dir)
            .with_idle_threshold(Duration::ZERO)
            .with_reclaim_interval(Duration::from_millis(50))
            .with_plan_retention(Duration::ZERO);
        let service = ExecutionService::from_config(config);

        assert!(service.start_plan(PlanRequest::new("p", tests(1, "true"))));
        service.wait_for_completion("p").await.unwrap();
        assert_eq!(service.environments().len(), 1);

        assert!(service.start_maintenance());
        assert!(!service.start_maintenance());
        tokio::time::sleep(Duration::from_millis(400)).await;
        service.shutdown().await;

        assert!(service.environments().is_empty());
        assert!(service.resources().is_empty());
        assert!(service.get_status("p").is_none());

        // Restartable after shutdown.
        assert!(service.start_maintenance());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_usage_tracked_for_unregistered_environment() {
        let dir = TempDir::new().unwrap();
        let service = ExecutionService::from_config(host_config(&dir));
        let env = service
            .environments()
            .provision(&service.config().default_environment)
            .await
            .unwrap();
        assert!(service.resources().is_empty());

        service.inner.track_usage(&env.id, ResourceStatus::Busy, false);
        service.inner.track_usage(&env.id, ResourceStatus::Idle, true);
        let state = service.resources().state(&env.id).unwrap();
        assert_eq!(state.status, ResourceStatus::Idle);
        assert_eq!(state.usage.tests_completed, 1);

        service.inner.track_usage("env-gone", ResourceStatus::Idle, true);
        assert!(service.resources().state("env-gone").is_none());
        assert_eq!(service.resources().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_plan() {
        let dir = TempDir::new().unwrap();
        let service = ExecutionService::from_config(host_config(&dir));
        assert!(service.get_status("nope").is_none());
        assert!(!service.cancel_plan("nope"));
        assert!(service.wait_for_completion("nope").await.is_none());
    }
}
