//! End-to-end orchestration tests.
//!
//! Tests run on the host-process container engine, so neither Docker nor
//! QEMU is needed.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kernel_forge::config::{ContainerEngine, OrchestratorConfig};
use kernel_forge::engine::{aggregate, ExecutionEngine, GroupBy, ParallelStatus};
use kernel_forge::environment::{
    Emulator, EnvironmentConfig, EnvironmentManager, EnvironmentStatus, HardwareProfile,
};
use kernel_forge::model::{TestCase, TestStatus, TestType};
use kernel_forge::resource::{PowerState, ResourceManager};
use kernel_forge::runner::{select_backend, BackendKind, RunnerFactory};
use kernel_forge::service::{ExecutionService, PlanRequest, PlanStatus};
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

fn engine_for(config: &OrchestratorConfig) -> (Arc<EnvironmentManager>, ExecutionEngine) {
    let envs = Arc::new(EnvironmentManager::from_config(config));
    let factory = RunnerFactory::with_defaults(config, envs.processes().clone());
    let engine = ExecutionEngine::new(envs.clone(), factory, config.max_workers);
    (envs, engine)
}

fn host_env(arch: &str) -> EnvironmentConfig {
    EnvironmentConfig::new(HardwareProfile::virtual_machine(arch, Emulator::Host))
}

#[test]
fn test_physical_environments_always_select_physical() {
    let profile = HardwareProfile::physical("aarch64", "rpi4");
    for test_type in TestType::ALL {
        let test = TestCase::new("t", test_type, "true");
        assert_eq!(select_backend(&test, &profile), BackendKind::Physical);
    }

    let virtual_profile = HardwareProfile::virtual_machine("x86_64", Emulator::Qemu);
    let unit = TestCase::new("u", TestType::Unit, "insmod foo.ko");
    assert_eq!(select_backend(&unit, &virtual_profile), BackendKind::Container);
}

#[tokio::test]
async fn test_aggregate_by_architecture() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir);
    let (envs, engine) = engine_for(&config);

    let x86 = envs.provision(&host_env("x86_64")).await.unwrap();
    let arm = envs.provision(&host_env("arm64")).await.unwrap();

    let tests: Vec<TestCase> = (0..4)
        .map(|i| TestCase::new(format!("t{i}"), TestType::Unit, "true"))
        .collect();
    let handle = engine
        .execute_parallel(tests, vec![x86.id.clone(), arm.id.clone()], Duration::from_secs(10))
        .unwrap();
    let finished = engine.wait(&handle.id).await.unwrap();
    assert_eq!(finished.status, ParallelStatus::Completed);
    assert_eq!(finished.results.len(), 4);

    let report = aggregate(&finished.results, GroupBy::Architecture);
    assert_eq!(report.overall.total, 4);
    assert_eq!(report.groups.len(), 2);
    assert_eq!(report.groups["x86_64"].total, 2);
    assert_eq!(report.groups["arm64"].total, 2);
    assert_eq!(
        report.groups.values().map(|stats| stats.total).sum::<usize>(),
        report.overall.total
    );
}

#[tokio::test]
async fn test_timeout_returns_environment_to_idle() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir);
    let (envs, engine) = engine_for(&config);
    let env = envs.provision(&host_env("x86_64")).await.unwrap();

    let test = TestCase::new("sleepy", TestType::Unit, "sleep 10");
    let started = std::time::Instant::now();
    let result = engine
        .execute_one(&test, &env.id, Duration::from_secs(2))
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(result.status(), TestStatus::Timeout);
    let info = result.failure_info().unwrap();
    assert!(info.timeout_occurred);
    assert!(!info.kernel_panic);
    assert_eq!(envs.get(&env.id).unwrap().status, EnvironmentStatus::Idle);
}

#[tokio::test]
async fn test_failed_results_carry_failure_info() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir);
    let (envs, engine) = engine_for(&config);
    let env = envs.provision(&host_env("x86_64")).await.unwrap();

    let failing = TestCase::new("fail", TestType::Unit, "echo nope; exit 3");
    let result = engine
        .execute_one(&failing, &env.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result.status(), TestStatus::Failed);
    let info = result.failure_info().unwrap();
    assert_eq!(info.exit_code, Some(3));
    assert!(!info.error_message.is_empty());

    let panicking = TestCase::new("oops", TestType::Unit, "echo 'Kernel panic - not syncing'; exit 1");
    let result = engine
        .execute_one(&panicking, &env.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result.status(), TestStatus::Failed);
    assert!(result.failure_info().unwrap().kernel_panic);

    let passing = TestCase::new("ok", TestType::Unit, "true");
    let result = engine
        .execute_one(&passing, &env.id, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(result.is_passed());
    assert!(result.failure_info().is_none());
}

#[tokio::test]
async fn test_cleanup_twice_is_harmless() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir);
    let (envs, _engine) = engine_for(&config);
    let env = envs.provision(&host_env("x86_64")).await.unwrap();

    assert!(envs.cleanup(&env.id).await.unwrap());
    let after_first = envs.list();
    assert!(!envs.cleanup(&env.id).await.unwrap());
    assert_eq!(envs.list(), after_first);
    assert!(!env.storage_dir.exists());
}

#[tokio::test]
async fn test_reclaim_idle_past_threshold() {
    let dir = TempDir::new().unwrap();
    let config = host_config(&dir);
    let (envs, _engine) = engine_for(&config);
    let old = envs.provision(&host_env("x86_64")).await.unwrap();
    let fresh = envs.provision(&host_env("x86_64")).await.unwrap();

    let threshold = 60;
    let resources = ResourceManager::new(envs.clone(), Duration::from_secs(threshold));
    let now = Utc::now();
    resources.register_at(&old.id, now - chrono::Duration::seconds(threshold as i64 + 1));
    resources.register_at(&fresh.id, now - chrono::Duration::seconds(threshold as i64 - 1));

    assert_eq!(resources.cleanup_idle_at(now).await.unwrap(), 1);
    assert!(envs.get(&old.id).is_none());
    assert!(!old.storage_dir.exists());

    let remaining = resources.state(&fresh.id).unwrap();
    assert_eq!(remaining.power_state, PowerState::On);
    assert!(envs.get(&fresh.id).is_some());
}

#[tokio::test]
async fn test_cancelled_plan_dispatches_nothing() {
    let dir = TempDir::new().unwrap();
    let service = ExecutionService::from_config(host_config(&dir));

    let tests: Vec<TestCase> = (0..5)
        .map(|i| TestCase::new(format!("t{i}"), TestType::Unit, "true"))
        .collect();
    assert!(service.start_plan(PlanRequest::new("cancel-me", tests)));
    assert!(service.cancel_plan("cancel-me"));

    let snapshot = service.wait_for_completion("cancel-me").await.unwrap();
    assert_eq!(snapshot.plan.status, PlanStatus::Cancelled);
    assert_eq!(snapshot.plan.status.to_string(), "cancelled");
    assert!(snapshot.results.is_empty());
    assert!(service.get_active().is_empty());
}

#[tokio::test]
async fn test_plan_uses_idle_pool_round_robin() {
    let dir = TempDir::new().unwrap();
    let service = ExecutionService::from_config(host_config(&dir));
    let a = service.environments().provision(&host_env("x86_64")).await.unwrap();
    let b = service.environments().provision(&host_env("x86_64")).await.unwrap();

    let tests: Vec<TestCase> = (0..4)
        .map(|i| TestCase::new(format!("t{i}"), TestType::Unit, "true"))
        .collect();
    assert!(service.start_plan(PlanRequest::new("rr", tests)));
    let snapshot = service.wait_for_completion("rr").await.unwrap();

    assert_eq!(snapshot.plan.status, PlanStatus::Completed);
    assert_eq!(snapshot.results.len(), 4);
    assert!(snapshot.results.iter().all(|r| r.is_passed()));
    let on_a = snapshot
        .results
        .iter()
        .filter(|r| r.environment.id == a.id)
        .count();
    let on_b = snapshot
        .results
        .iter()
        .filter(|r| r.environment.id == b.id)
        .count();
    assert_eq!((on_a, on_b), (2, 2));
    assert_eq!(service.environments().len(), 2);

    let summary = service.resources().summary();
    assert_eq!(summary.tests_completed, 4);
}
