//! Resource manager and background reclaimer.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::environment::{EnvironmentManager, EnvironmentStatus};
use crate::error::ResourceError;
use crate::metrics::MetricsCollector;

use super::{seconds_between, PowerState, ResourceState, ResourceStatus, UtilizationSummary};

/// Tracks resource activity and reclaims idle environments.
pub struct ResourceManager {
    envs: Arc<EnvironmentManager>,
    idle_threshold: Duration,
    hourly_cost: f64,
    resources: Mutex<HashMap<String, ResourceState>>,
    metrics: MetricsCollector,
}

impl ResourceManager {
    /// Creates a manager reclaiming resources idle for at least
    /// `idle_threshold`.
    pub fn new(envs: Arc<EnvironmentManager>, idle_threshold: Duration) -> Self {
        Self {
            envs,
            idle_threshold,
            hourly_cost: 0.10,
            resources: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_config(envs: Arc<EnvironmentManager>, config: &OrchestratorConfig) -> Self {
        Self::new(envs, config.idle_threshold).with_hourly_cost(config.hourly_cost)
    }

    /// Sets the cost of one powered-on resource hour.
    pub fn with_hourly_cost(mut self, cost: f64) -> Self {
        self.hourly_cost = cost;
        self
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Starts tracking a resource, powered on and idle.
    ///
    /// Returns false if it was already tracked.
    pub fn register(&self, resource_id: &str) -> bool {
        self.register_at(resource_id, Utc::now())
    }

    pub fn register_at(&self, resource_id: &str, now: DateTime<Utc>) -> bool {
        let mut resources = self.lock();
        if resources.contains_key(resource_id) {
            return false;
        }
        resources.insert(resource_id.to_string(), ResourceState::new(resource_id, now));
        debug!(resource_id = %resource_id, "Registered resource");
        true
    }

    /// Stops tracking a resource without touching its environment.
    pub fn unregister(&self, resource_id: &str) -> bool {
        self.lock().remove(resource_id).is_some()
    }

    /// Records activity on a resource.
    ///
    /// `test_completed` counts one finished test against the resource.
    pub fn record_usage(
        &self,
        resource_id: &str,
        status: ResourceStatus,
        test_completed: bool,
    ) -> Result<(), ResourceError> {
        self.record_usage_at(resource_id, status, test_completed, Utc::now())
    }

    pub fn record_usage_at(
        &self,
        resource_id: &str,
        status: ResourceStatus,
        test_completed: bool,
        now: DateTime<Utc>,
    ) -> Result<(), ResourceError> {
        let mut resources = self.lock();
        let state = resources
            .get_mut(resource_id)
            .ok_or_else(|| ResourceError::NotFound(resource_id.to_string()))?;

        match (state.status, status) {
            (ResourceStatus::Idle, ResourceStatus::Busy) => state.busy_since = Some(now),
            (ResourceStatus::Busy, ResourceStatus::Idle) => {
                if let Some(since) = state.busy_since.take() {
                    state.usage.busy_seconds += seconds_between(since, now);
                }
            }
            _ => {}
        }
        state.status = status;
        state.last_active = now;
        if test_completed {
            state.usage.tests_completed += 1;
            state.usage.last_test_at = Some(now);
        }
        Ok(())
    }

    /// Ids of powered-on idle resources unused for at least the threshold.
    pub fn detect_idle(&self) -> BTreeSet<String> {
        self.detect_idle_at(Utc::now())
    }

    pub fn detect_idle_at(&self, now: DateTime<Utc>) -> BTreeSet<String> {
        let threshold = self.idle_threshold.as_secs_f64();
        self.lock()
            .values()
            .filter(|state| {
                state.power_state == PowerState::On
                    && state.status == ResourceStatus::Idle
                    && state.idle_seconds(now) >= threshold
            })
            .map(|state| state.resource_id.clone())
            .collect()
    }

    /// Powers down and destroys every idle resource.
    ///
    /// A resource whose environment is busy is skipped and marked busy. A
    /// resource whose destruction fails is powered back on and retried on
    /// the next call.
    pub async fn cleanup_idle(&self) -> Result<usize, ResourceError> {
        self.cleanup_idle_at(Utc::now()).await
    }

    pub async fn cleanup_idle_at(&self, now: DateTime<Utc>) -> Result<usize, ResourceError> {
        let mut count = 0;

        for resource_id in self.detect_idle_at(now) {
            if !self.set_power(&resource_id, PowerState::Off) {
                continue;
            }

            match self
                .envs
                .cleanup_if_idle(&resource_id, now, Duration::ZERO)
                .await
            {
                Ok(true) => {
                    self.lock().remove(&resource_id);
                    info!(resource_id = %resource_id, "Reclaimed idle resource");
                    count += 1;
                }
                Ok(false) => match self.envs.get(&resource_id) {
                    Some(env) => {
                        debug!(resource_id = %resource_id, "Skipping reclaim of environment in use");
                        self.set_power(&resource_id, PowerState::On);
                        if env.status == EnvironmentStatus::Busy {
                            self.mark_status(&resource_id, ResourceStatus::Busy, now);
                        }
                    }
                    None => {
                        debug!(resource_id = %resource_id, "Environment already gone, dropping resource");
                        self.lock().remove(&resource_id);
                    }
                },
                Err(e) => {
                    warn!(resource_id = %resource_id, error = %e, "Failed to reclaim resource");
                    self.set_power(&resource_id, PowerState::On);
                }
            }
        }

        if count > 0 {
            self.metrics.record_reclaimed(count);
        }
        Ok(count)
    }

    /// Aligns the registry with the environment manager: tracks new
    /// environments, mirrors busy state and drops resources whose
    /// environment is gone.
    pub fn sync_environments(&self) -> usize {
        let now = Utc::now();
        let envs = self.envs.list();
        let mut resources = self.lock();

        let live: BTreeSet<&str> = envs.iter().map(|env| env.id.as_str()).collect();
        let before = resources.len();
        resources.retain(|id, _| live.contains(id.as_str()));
        let dropped = before - resources.len();

        let mut added = 0;
        for env in &envs {
            let state = resources.entry(env.id.clone()).or_insert_with(|| {
                added += 1;
                let mut state = ResourceState::new(&env.id, now);
                state.last_active = env.last_used;
                state
            });
            match (env.status, state.status) {
                (EnvironmentStatus::Busy, ResourceStatus::Idle) => {
                    state.status = ResourceStatus::Busy;
                    state.busy_since = Some(now);
                }
                (EnvironmentStatus::Idle, ResourceStatus::Busy) => {
                    if let Some(since) = state.busy_since.take() {
                        state.usage.busy_seconds += seconds_between(since, env.last_used);
                    }
                    state.status = ResourceStatus::Idle;
                    state.last_active = state.last_active.max(env.last_used);
                }
                _ => {}
            }
        }

        if added > 0 || dropped > 0 {
            debug!(added, dropped, "Synchronized resources with environments");
        }
        added
    }

    /// Snapshot of one resource, with its cost estimate filled in.
    pub fn state(&self, resource_id: &str) -> Option<ResourceState> {
        let now = Utc::now();
        self.lock()
            .get(resource_id)
            .map(|state| self.snapshot(state, now))
    }

    /// Snapshot of every resource, sorted by id.
    pub fn list(&self) -> Vec<ResourceState> {
        let now = Utc::now();
        let mut states: Vec<ResourceState> = self
            .lock()
            .values()
            .map(|state| self.snapshot(state, now))
            .collect();
        states.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        states
    }

    /// Busy fraction of a resource's lifetime.
    pub fn utilization(&self, resource_id: &str) -> Option<f64> {
        let now = Utc::now();
        self.lock()
            .get(resource_id)
            .map(|state| state.utilization(now))
    }

    /// Cost accrued by a resource so far.
    pub fn cost_estimate(&self, resource_id: &str) -> Option<f64> {
        self.state(resource_id).map(|state| state.cost_estimate)
    }

    /// Aggregate utilization across all tracked resources.
    pub fn summary(&self) -> UtilizationSummary {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> UtilizationSummary {
        let resources = self.lock();
        let mut summary = UtilizationSummary {
            total_resources: resources.len(),
            ..Default::default()
        };

        let mut utilization_sum = 0.0;
        for state in resources.values() {
            if state.power_state == PowerState::On {
                summary.powered_on += 1;
            }
            match state.status {
                ResourceStatus::Busy => summary.busy += 1,
                ResourceStatus::Idle => summary.idle += 1,
            }
            summary.tests_completed += state.usage.tests_completed;
            utilization_sum += state.utilization(now);
            summary.total_cost_estimate += self.cost_at(state, now);
        }

        if summary.total_resources > 0 {
            summary.average_utilization = utilization_sum / summary.total_resources as f64;
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs [`cleanup_idle`](Self::cleanup_idle) every `interval` until the
    /// returned handle is stopped.
    pub fn spawn_reclaimer(self: &Arc<Self>, interval: Duration) -> ReclaimerHandle {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let manager = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                manager.sync_environments();
                match manager.cleanup_idle().await {
                    Ok(0) => {}
                    Ok(count) => info!(count, "Reclaimer pass complete"),
                    Err(e) => warn!(error = %e, "Reclaimer pass failed"),
                }
            }
            debug!("Reclaimer stopped");
        });

        info!(interval_secs = interval.as_secs_f64(), "Idle reclaimer started");
        ReclaimerHandle {
            stop_flag,
            handle: Some(handle),
        }
    }

    fn mark_status(&self, resource_id: &str, status: ResourceStatus, now: DateTime<Utc>) {
        if let Err(e) = self.record_usage_at(resource_id, status, false, now) {
            debug!(resource_id = %resource_id, error = %e, "Resource vanished before status update");
        }
    }

    fn set_power(&self, resource_id: &str, power: PowerState) -> bool {
        match self.lock().get_mut(resource_id) {
            Some(state) => {
                state.power_state = power;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self, state: &ResourceState, now: DateTime<Utc>) -> ResourceState {
        let mut snapshot = state.clone();
        snapshot.cost_estimate = self.cost_at(state, now);
        snapshot
    }

    fn cost_at(&self, state: &ResourceState, now: DateTime<Utc>) -> f64 {
        seconds_between(state.registered_at, now) / 3600.0 * self.hourly_cost
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResourceState>> {
        self.resources.lock().expect("resource registry lock poisoned")
    }
}

/// Handle of a running background reclaimer.
pub struct ReclaimerHandle {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimerHandle {
    /// Signals the reclaimer to stop and waits for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ReclaimerHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{Emulator, EnvironmentConfig, HardwareProfile};
    use tempfile::TempDir;

    async fn setup(dir: &TempDir, threshold_secs: u64) -> (Arc<ResourceManager>, String) {
        let envs = Arc::new(EnvironmentManager::new(dir.path()).with_disk_size_mb(1));
        let env = envs
            .provision(&EnvironmentConfig::new(HardwareProfile::virtual_machine(
                "x86_64",
                Emulator::Host,
            )))
            .await
            .unwrap();
        let manager = Arc::new(
            ResourceManager::new(envs, Duration::from_secs(threshold_secs)).with_hourly_cost(1.0),
        );
        (manager, env.id)
    }

    #[tokio::test]
    async fn test_register_is_powered_on_idle() {
        let dir = TempDir::new().unwrap();
        let (manager, env_id) = setup(&dir, 60).await;

        assert!(manager.register(&env_id));
        assert!(!manager.register(&env_id));
        let state = manager.state(&env_id).unwrap();
        assert_eq!(state.power_state, PowerState::On);
        assert_eq!(state.status, ResourceStatus::Idle);
    }

    #[tokio::test]
    async fn test_idle_threshold_boundary() {
        let dir = TempDir::new().unwrap();
        let (manager, env_id) = setup(&dir, 60).await;
        let t0 = Utc::now();
        manager.register_at(&env_id, t0);

        let just_under = t0 + chrono::Duration::seconds(59);
        assert!(manager.detect_idle_at(just_under).is_empty());
        assert_eq!(manager.cleanup_idle_at(just_under).await.unwrap(), 0);
        assert_eq!(manager.state(&env_id).unwrap().power_state, PowerState::On);

        let past = t0 + chrono::Duration::seconds(61);
        assert!(manager.detect_idle_at(past).contains(&env_id));
        assert_eq!(manager.cleanup_idle_at(past).await.unwrap(), 1);
        assert!(manager.state(&env_id).is_none());
        assert!(manager.envs.get(&env_id).is_none());
        assert!(!dir.path().join(&env_id).exists());

        // Idempotent.
        assert_eq!(manager.cleanup_idle_at(past).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_busy_resources_are_not_idle() {
        let dir = TempDir::new().unwrap();
        let (manager, env_id) = setup(&dir, 10).await;
        let t0 = Utc::now();
        manager.register_at(&env_id, t0);
        manager
            .record_usage_at(&env_id, ResourceStatus::Busy, false, t0)
            .unwrap();

        let later = t0 + chrono::Duration::seconds(100);
        assert!(manager.detect_idle_at(later).is_empty());
    }

    #[tokio::test]
    async fn test_busy_environment_skipped_on_cleanup() {
        let dir = TempDir::new().unwrap();
        let (manager, env_id) = setup(&dir, 10).await;
        let t0 = Utc::now();
        manager.register_at(&env_id, t0);
        manager.envs.mark_busy(&env_id).unwrap();

        let later = t0 + chrono::Duration::seconds(100);
        assert_eq!(manager.cleanup_idle_at(later).await.unwrap(), 0);
        assert_eq!(manager.state(&env_id).unwrap().status, ResourceStatus::Busy);
        assert!(manager.envs.get(&env_id).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reclaim_spares_environment_claimed_mid_pass() {
        let dir = TempDir::new().unwrap();
        let (manager, first) = setup(&dir, 10).await;
        let second = manager
            .envs
            .provision(&EnvironmentConfig::new(HardwareProfile::virtual_machine(
                "x86_64",
                Emulator::Host,
            )))
            .await
            .unwrap()
            .id;
        let t0 = Utc::now();
        for env_id in [&first, &second] {
            manager.register_at(env_id, t0);
            let logs = manager.envs.get(env_id).unwrap().logs_dir();
            for i in 0..2000 {
                std::fs::write(logs.join(format!("{i}.log")), "x").unwrap();
            }
        }

        let reclaimer = manager.clone();
        let later = t0 + chrono::Duration::seconds(100);
        let pass = tokio::spawn(async move { reclaimer.cleanup_idle_at(later).await });

        let mut claimed = None;
        while !pass.is_finished() {
            let live = manager.envs.list();
            if live.len() == 1 {
                if manager.envs.mark_busy(&live[0].id).is_ok() {
                    claimed = Some(live[0].id.clone());
                }
                break;
            }
            tokio::task::yield_now().await;
        }

        let reclaimed = pass.await.unwrap().unwrap();
        if let Some(env_id) = claimed {
            assert_eq!(reclaimed, 1);
            assert!(manager.envs.get(&env_id).is_some());
            assert!(dir.path().join(&env_id).exists());
            let state = manager.state(&env_id).unwrap();
            assert_eq!(state.power_state, PowerState::On);
            assert_eq!(state.status, ResourceStatus::Busy);
        }
    }

    #[tokio::test]
    async fn test_usage_and_utilization() {
        let dir = TempDir::new().unwrap();
        let (manager, env_id) = setup(&dir, 60).await;
        let t0 = Utc::now() - chrono::Duration::seconds(100);
        manager.register_at(&env_id, t0);

        manager
            .record_usage_at(&env_id, ResourceStatus::Busy, false, t0)
            .unwrap();
        manager
            .record_usage_at(
                &env_id,
                ResourceStatus::Idle,
                true,
                t0 + chrono::Duration::seconds(50),
            )
            .unwrap();

        let state = manager.state(&env_id).unwrap();
        assert_eq!(state.usage.tests_completed, 1);
        assert!((state.usage.busy_seconds - 50.0).abs() < 1e-6);
        let utilization = manager.utilization(&env_id).unwrap();
        assert!(utilization > 0.4 && utilization <= 0.5);
        assert!(manager.cost_estimate(&env_id).unwrap() > 0.0);

        assert!(matches!(
            manager.record_usage("nope", ResourceStatus::Idle, false),
            Err(ResourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_summary_and_sync() {
        let dir = TempDir::new().unwrap();
        let (manager, env_id) = setup(&dir, 60).await;

        assert_eq!(manager.sync_environments(), 1);
        assert_eq!(manager.sync_environments(), 0);
        manager.register("env-stale");
        manager.sync_environments();
        assert!(manager.state("env-stale").is_none());

        let summary = manager.summary();
        assert_eq!(summary.total_resources, 1);
        assert_eq!(summary.powered_on, 1);
        assert_eq!(summary.idle, 1);
        assert!(manager.state(&env_id).is_some());
    }

    #[tokio::test]
    async fn test_reclaimer_start_stop() {
        let dir = TempDir::new().unwrap();
        let (manager, env_id) = setup(&dir, 0).await;

        let reclaimer = manager.spawn_reclaimer(Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(300)).await;
        reclaimer.stop().await;

        assert!(manager.envs.get(&env_id).is_none());
        assert!(manager.is_empty());
    }
}
