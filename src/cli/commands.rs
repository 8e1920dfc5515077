//! CLI command definitions for kernel-forge.
//!
//! Plans are read from YAML files; results are printed to stdout as JSON.

use crate::config::{ContainerEngine, OrchestratorConfig};
use crate::engine::{aggregate, AggregateReport, GroupBy};
use crate::environment::{EnvironmentConfig, EnvironmentManager, KernelImage};
use crate::metrics::{export_metrics, init_metrics};
use crate::model::{TestCase, TestResult, TestStatus};
use crate::runner::factory::requirements_met;
use crate::runner::select_backend;
use crate::service::{ExecutionService, PlanRequest, PlanStatus, Priority};
use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Kernel test orchestration.
#[derive(Parser)]
#[command(name = "kernel-forge")]
#[command(about = "Run kernel test plans on ephemeral environments")]
#[command(version)]
#[command(
    long_about = "kernel-forge provisions ephemeral environments, picks an execution backend per test \
(container, QEMU virtual machine or physical lab), runs tests under timeouts and reclaims idle resources.\n\n\
Settings come from KFORGE_* environment variables.\n\n\
Example usage:\n  kernel-forge run --plan ./nightly.yaml --group-by architecture"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a plan to completion and print a JSON summary.
    Run(RunArgs),

    /// Print the backend each test of a plan would run on.
    Select(SelectArgs),

    /// Remove environment storage left behind by earlier runs.
    Reclaim(ReclaimArgs),

    /// Print metrics in Prometheus text format.
    Metrics,
}

/// Arguments for `kernel-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Plan file (YAML).
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Aggregate results by this dimension (none, architecture, board_type, peripheral_config).
    #[arg(short, long, default_value = "none")]
    pub group_by: GroupBy,

    /// Run tests concurrently over the plan's environments instead of in order.
    #[arg(long)]
    pub parallel: bool,

    /// Keep environments after the run instead of destroying them.
    #[arg(long)]
    pub keep: bool,

    /// Override the environment storage root.
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// Override the container engine (docker, host).
    #[arg(long)]
    pub engine: Option<ContainerEngine>,

    /// Append Prometheus metrics to the output.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `kernel-forge select`.
#[derive(Parser, Debug)]
pub struct SelectArgs {
    /// Plan file (YAML).
    #[arg(short, long)]
    pub plan: PathBuf,
}

/// Arguments for `kernel-forge reclaim`.
#[derive(Parser, Debug)]
pub struct ReclaimArgs {
    /// Only remove storage untouched for at least this many seconds.
    #[arg(long, default_value = "3600")]
    pub max_age_secs: u64,

    /// Override the environment storage root.
    #[arg(long)]
    pub storage_root: Option<PathBuf>,
}

/// Plan file layout.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    /// Generated when absent.
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Per-test timeout; the configured default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Kernel deployed into every environment before the run.
    #[serde(default)]
    pub kernel: Option<KernelImage>,
    /// Environments provisioned up front; the plan provisions the
    /// configured default on demand when empty.
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
    pub tests: Vec<TestCase>,
}

impl PlanFile {
    /// Reads and checks a plan file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut plan: PlanFile = serde_yaml::from_str(content)
            .map_err(|e| anyhow::anyhow!("Failed to parse plan YAML: {}", e))?;

        if plan.tests.is_empty() {
            anyhow::bail!("Plan has no tests");
        }
        let mut seen = std::collections::HashSet::new();
        for test in &mut plan.tests {
            if !seen.insert(test.id.clone()) {
                anyhow::bail!("Duplicate test id in plan: {}", test.id);
            }
            if test.name.is_empty() {
                test.name = test.id.clone();
            }
        }
        Ok(plan)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Short form of one result.
#[derive(Debug, Clone, Serialize)]
struct ResultLine {
    test_id: String,
    status: TestStatus,
    environment: String,
    backend: Option<String>,
    exit_code: Option<i32>,
    execution_secs: f64,
    failure: Option<String>,
}

impl From<&TestResult> for ResultLine {
    fn from(result: &TestResult) -> Self {
        Self {
            test_id: result.test_id.clone(),
            status: result.status(),
            environment: result.environment.id.clone(),
            backend: result.backend.as_ref().map(|kind| kind.to_string()),
            exit_code: result.exit_code,
            execution_secs: result.execution_time.as_secs_f64(),
            failure: result.failure_info().map(|info| info.error_message.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RunOutput {
    plan_id: String,
    status: String,
    error: Option<String>,
    results: Vec<ResultLine>,
    report: AggregateReport,
}

#[derive(Debug, Clone, Serialize)]
struct SelectionLine {
    test_id: String,
    test_type: String,
    environment: usize,
    architecture: String,
    board_type: String,
    backend: String,
    requirements_met: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_plan_command(args).await,
        Commands::Select(args) => run_select_command(args),
        Commands::Reclaim(args) => run_reclaim_command(args).await,
        Commands::Metrics => run_metrics_command(),
    }
}

// ============================================================================
// Run
// ============================================================================

async fn run_plan_command(args: RunArgs) -> anyhow::Result<()> {
    let plan = PlanFile::load(&args.plan)?;

    let mut config = OrchestratorConfig::from_env()?;
    if let Some(root) = &args.storage_root {
        config = config.with_storage_root(root);
    }
    if let Some(engine) = args.engine {
        config = config.with_container_engine(engine);
    }
    config.validate()?;

    if args.metrics {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    let service = ExecutionService::from_config(config);
    service.start_maintenance();
    let outcome = match prepare_environments(&service, &plan).await {
        Ok(env_ids) if args.parallel => run_parallel(&service, &plan, env_ids).await,
        Ok(_) => run_sequential(&service, &plan).await,
        Err(e) => Err(e),
    };

    service.shutdown().await;
    if !args.keep {
        destroy_environments(&service).await;
    }
    let (plan_id, status, error, results) = outcome?;

    let report = aggregate(&results, args.group_by);
    let output = RunOutput {
        plan_id,
        status,
        error,
        results: results.iter().map(ResultLine::from).collect(),
        report,
    };

    let json_output = serde_json::to_string_pretty(&output)
        .map_err(|e| anyhow::anyhow!("Failed to serialize run summary: {}", e))?;
    println!("{}", json_output);
    if args.metrics {
        print!("{}", export_metrics());
    }

    let overall = &output.report.overall;
    if overall.passed + overall.skipped < plan.tests.len() {
        anyhow::bail!(
            "{} of {} tests did not pass",
            plan.tests.len() - overall.passed - overall.skipped,
            plan.tests.len()
        );
    }
    Ok(())
}

/// Provisions the plan's environments and deploys its kernel into them.
async fn prepare_environments(
    service: &ExecutionService,
    plan: &PlanFile,
) -> anyhow::Result<Vec<String>> {
    let envs = service.environments();
    let mut env_ids = Vec::with_capacity(plan.environments.len());

    for env_config in &plan.environments {
        let env = envs
            .provision(env_config)
            .await
            .context("Failed to provision plan environment")?;
        if let Some(kernel) = &plan.kernel {
            envs.deploy(&env.id, kernel)
                .await
                .with_context(|| format!("Failed to deploy kernel into {}", env.id))?;
        }
        service.resources().register(&env.id);
        env_ids.push(env.id);
    }

    if !env_ids.is_empty() {
        info!(count = env_ids.len(), "Plan environments ready");
    }
    Ok(env_ids)
}

type RunOutcome = (String, String, Option<String>, Vec<TestResult>);

async fn run_sequential(service: &ExecutionService, plan: &PlanFile) -> anyhow::Result<RunOutcome> {
    let plan_id = plan
        .plan_id
        .clone()
        .unwrap_or_else(|| format!("plan-{}", uuid::Uuid::new_v4()));

    let mut request = PlanRequest::new(&plan_id, plan.tests.clone())
        .with_created_by(plan.created_by.clone().unwrap_or_else(|| "cli".to_string()))
        .with_priority(plan.priority);
    if let Some(timeout) = plan.timeout() {
        request = request.with_timeout(timeout);
    }
    for (key, value) in &plan.metadata {
        request = request.with_metadata(key, value);
    }

    if !service.start_plan(request) {
        anyhow::bail!("Plan {} is already running", plan_id);
    }
    let snapshot = service
        .wait_for_completion(&plan_id)
        .await
        .ok_or_else(|| anyhow::anyhow!("Plan {} disappeared", plan_id))?;

    if snapshot.plan.status == PlanStatus::Failed {
        warn!(plan_id = %plan_id, error = ?snapshot.plan.error, "Plan failed");
    }
    Ok((
        plan_id,
        snapshot.plan.status.to_string(),
        snapshot.plan.error,
        snapshot.results,
    ))
}

async fn run_parallel(
    service: &ExecutionService,
    plan: &PlanFile,
    mut env_ids: Vec<String>,
) -> anyhow::Result<RunOutcome> {
    let config = service.config();
    if env_ids.is_empty() {
        let env = service
            .environments()
            .provision(&config.default_environment)
            .await
            .context("Failed to provision default environment")?;
        env_ids.push(env.id);
    }

    let timeout = plan.timeout().unwrap_or(config.default_timeout);
    let engine = service.engine();
    let handle = engine.execute_parallel(plan.tests.clone(), env_ids, timeout)?;
    let finished = engine.wait(&handle.id).await?;
    engine.forget(&handle.id);

    Ok((
        plan.plan_id.clone().unwrap_or(finished.id),
        finished.status.to_string(),
        None,
        finished.results,
    ))
}

async fn destroy_environments(service: &ExecutionService) {
    for env in service.environments().list() {
        if let Err(e) = service.environments().cleanup(&env.id).await {
            warn!(env_id = %env.id, error = %e, "Failed to destroy environment");
        }
        service.resources().unregister(&env.id);
    }
}

// ============================================================================
// Select
// ============================================================================

fn run_select_command(args: SelectArgs) -> anyhow::Result<()> {
    let plan = PlanFile::load(&args.plan)?;
    let config = OrchestratorConfig::from_env()?;

    let environments = if plan.environments.is_empty() {
        vec![config.default_environment.clone()]
    } else {
        plan.environments.clone()
    };

    let lines = selection_table(&plan.tests, &environments);
    let json_output = serde_json::to_string_pretty(&lines)
        .map_err(|e| anyhow::anyhow!("Failed to serialize selection: {}", e))?;
    println!("{}", json_output);
    Ok(())
}

fn selection_table(tests: &[TestCase], environments: &[EnvironmentConfig]) -> Vec<SelectionLine> {
    let mut lines = Vec::with_capacity(tests.len() * environments.len());
    for test in tests {
        for (index, env) in environments.iter().enumerate() {
            lines.push(SelectionLine {
                test_id: test.id.clone(),
                test_type: test.test_type.to_string(),
                environment: index,
                architecture: env.hardware.architecture.clone(),
                board_type: env.hardware.board_label(),
                backend: select_backend(test, &env.hardware).to_string(),
                requirements_met: requirements_met(test, &env.hardware),
            });
        }
    }
    lines
}

// ============================================================================
// Reclaim / Metrics
// ============================================================================

async fn run_reclaim_command(args: ReclaimArgs) -> anyhow::Result<()> {
    let mut config = OrchestratorConfig::from_env()?;
    if let Some(root) = args.storage_root {
        config = config.with_storage_root(root);
    }

    let envs = EnvironmentManager::from_config(&config);
    let removed = envs
        .sweep_orphans(Duration::from_secs(args.max_age_secs))
        .await?;

    info!(removed, root = %config.storage_root.display(), "Reclaim complete");
    println!("{}", serde_json::json!({ "removed": removed }));
    Ok(())
}

fn run_metrics_command() -> anyhow::Result<()> {
    init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    print!("{}", export_metrics());
    Ok(())
}
