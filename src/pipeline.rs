//! Provisioning pipeline executor
//!
//! `Provisioner` owns an ordered list of steps and runs them one at a time
//! against a [`Host`]. It stops at the first failure, retries only transient
//! errors, drives the [`ProvisioningRun`] state machine and returns a
//! [`RunReport`] with one entry per executed step.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config_file::ProvisionConfig;
use crate::error::ProvisionError;
use crate::host::Host;
use crate::package_manager::PackageManager;
use crate::retry::RetryConfig;
use crate::run_state::{ProvisioningRun, RunStage, StageTransition};
use crate::steps::{
    EnableRepositories, EnableService, InstallPackages, ReloadSupervisor, StartService, Step,
    StepContext, StepEffect, SystemUpdate, WriteServiceUnit,
};
use crate::types::{ErrorKind, StartPolicy, StepId};

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Skipped { reason: String },
    Failed { reason: String, kind: ErrorKind },
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: StepId,
    pub outcome: StepOutcome,
    /// Attempts made, 0 when a precondition failed
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Structured result of a whole run, written for post-mortem diagnosis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Executed steps, in order; steps after a failure are absent
    pub steps: Vec<StepReport>,
    pub final_stage: RunStage,
    pub failed_at: Option<RunStage>,
    pub failed_step: Option<StepId>,
    /// True only if a start command ran. With `OnNextBootOnly` the service
    /// is enabled but nothing guarantees it runs before the next boot.
    pub service_started_now: bool,
    pub unit_path: Option<PathBuf>,
    pub history: Vec<StageTransition>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.final_stage == RunStage::Complete
    }

    /// Process exit code for the boot log contract
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() { 0 } else { 1 }
    }

    pub fn report_for(&self, step: StepId) -> Option<&StepReport> {
        self.steps.iter().find(|r| r.step == step)
    }

    /// Report of the step that failed, if any
    pub fn failure(&self) -> Option<&StepReport> {
        self.steps.iter().find(|r| r.outcome.is_failed())
    }

    /// Write the report as pretty JSON
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run report")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write run report to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Write the report if a path is given, then return the exit code.
    ///
    /// A report that cannot be written is logged; the exit code still
    /// reflects the provisioning outcome.
    pub fn save_and_exit_code(&self, path: Option<&Path>) -> i32 {
        if let Some(path) = path {
            match self.save_to_file(path) {
                Ok(()) => tracing::info!(path = %path.display(), "Run report written"),
                Err(e) => tracing::error!(error = %format!("{:#}", e), "Could not write run report"),
            }
        }
        self.exit_code()
    }
}

/// Single-threaded step executor
pub struct Provisioner {
    steps: Vec<Box<dyn Step>>,
    retry: RetryConfig,
    unit_dir: PathBuf,
}

impl Provisioner {
    /// Build a pipeline from explicit steps
    pub fn new(steps: Vec<Box<dyn Step>>, retry: RetryConfig, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            steps,
            retry,
            unit_dir: unit_dir.into(),
        }
    }

    /// Build the standard pipeline described by a config
    pub fn from_config(config: &ProvisionConfig) -> Self {
        let pm = PackageManager::new(config.package_manager);
        let timeouts = &config.timeouts;
        let unit_file = config.service.file_name();

        let mut steps: Vec<Box<dyn Step>> = vec![
            Box::new(SystemUpdate {
                package_manager: pm,
                timeout: timeouts.system_update,
            }),
            Box::new(EnableRepositories {
                package_manager: pm,
                repositories: config.effective_repositories(),
                timeout: timeouts.enable_repositories,
            }),
            Box::new(InstallPackages {
                package_manager: pm,
                packages: config.packages.clone(),
                timeout: timeouts.install_packages,
            }),
            Box::new(WriteServiceUnit {
                unit: config.service.clone(),
                verify_exec_path: config.verify_exec_path,
            }),
            Box::new(ReloadSupervisor {
                timeout: timeouts.supervisor,
            }),
            Box::new(EnableService {
                unit_file: unit_file.clone(),
                timeout: timeouts.supervisor,
            }),
        ];

        if config.start_policy == StartPolicy::Immediate {
            steps.push(Box::new(StartService {
                unit_file,
                timeout: timeouts.supervisor,
            }));
        }

        Self::new(steps, config.retry.clone(), config.unit_dir.clone())
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    /// Run every step in order, stopping at the first failure
    pub fn run(&self, host: &dyn Host) -> RunReport {
        let mut run = ProvisioningRun::new();
        let mut ctx = StepContext::new(host, self.unit_dir.clone());
        let mut reports = Vec::with_capacity(self.steps.len());
        let mut failed_step = None;

        for step in &self.steps {
            let id = step.id();
            tracing::info!(step = %id, index = id.index(), "Starting step: {}", id.description());

            let started = Instant::now();
            let (outcome, attempts) = self.execute(step.as_ref(), &mut ctx);
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let failed = outcome.is_failed();
            match &outcome {
                StepOutcome::Success => tracing::info!(step = %id, attempts, duration_ms, "Step succeeded"),
                StepOutcome::Skipped { reason } => tracing::info!(step = %id, reason = %reason, "Step skipped"),
                StepOutcome::Failed { reason, kind } => tracing::error!(
                    step = %id,
                    index = id.index(),
                    kind = %kind,
                    attempts,
                    "Provisioning step {} ({}) failed: {}",
                    id.index(),
                    id,
                    reason
                ),
            }
            reports.push(StepReport {
                step: id,
                outcome,
                attempts,
                duration_ms,
            });

            if failed {
                failed_step = Some(id);
                if let Err(e) = run.fail() {
                    tracing::error!(error = %e, "Could not record run failure");
                }
                break;
            }

            ctx.mark_completed(id);
            if let Some(stage) = step.milestone() {
                advance_until(&mut run, stage);
            }
        }

        if failed_step.is_none() {
            advance_until(&mut run, RunStage::Complete);
            tracing::info!(steps = reports.len(), "Provisioning complete");
        }

        RunReport {
            steps: reports,
            final_stage: run.current_stage(),
            failed_at: run.failed_at(),
            failed_step,
            service_started_now: ctx.started_now(),
            unit_path: ctx.unit_path().map(Path::to_path_buf),
            history: run.history().to_vec(),
        }
    }

    /// Check preconditions once, then run with bounded retry
    fn execute(&self, step: &dyn Step, ctx: &mut StepContext<'_>) -> (StepOutcome, u32) {
        if let Err(e) = step.check_preconditions(ctx) {
            return (failed(&e), 0);
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match step.run(ctx) {
                Ok(StepEffect::Applied) => return (StepOutcome::Success, attempts),
                Ok(StepEffect::Skipped(reason)) => {
                    return (StepOutcome::Skipped { reason }, attempts);
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempts) => {
                    let delay = self.retry.delay_after_attempt(attempts);
                    tracing::warn!(
                        step = %step.id(),
                        attempt = attempts,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient error, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(e) => return (failed(&e), attempts),
            }
        }
    }
}

fn failed(e: &ProvisionError) -> StepOutcome {
    StepOutcome::Failed {
        reason: e.to_string(),
        kind: e.kind(),
    }
}

/// Walk the run forward to `target`; pipelines without some steps still
/// pass through every intermediate stage
fn advance_until(run: &mut ProvisioningRun, target: RunStage) {
    while !run.current_stage().is_terminal() && run.current_stage().order() < target.order() {
        if let Err(e) = run.advance() {
            tracing::error!(error = %e, "Run stage transition rejected");
            break;
        }
    }
}
