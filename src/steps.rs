//! Provisioning steps
//!
//! Each step is a small struct implementing [`Step`]: an identifier, the
//! preconditions that must hold before it runs, and the action itself. The
//! executor in `pipeline` checks preconditions, runs the action, retries
//! transient failures and records the outcome.
//!
//! | # | Step                 | Preconditions                                    |
//! |---|----------------------|--------------------------------------------------|
//! | 1 | `SystemUpdate`       | privileged                                       |
//! | 2 | `EnableRepositories` | privileged, step 1                               |
//! | 3 | `InstallPackages`    | privileged, step 1, every required repo enabled  |
//! | 4 | `WriteServiceUnit`   | privileged, step 3, ExecStart binary exists      |
//! | 5 | `ReloadSupervisor`   | privileged, step 4                               |
//! | 6 | `EnableService`      | privileged, step 5                               |
//! | 7 | `StartService`       | privileged, step 6 (only with `Immediate`)       |

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProvisionError, Result};
use crate::host::{Host, HostCommand};
use crate::package_manager::{PackageManager, classify_failure};
use crate::package_set::PackageSet;
use crate::run_state::RunStage;
use crate::service_unit::ServiceUnitSpec;
use crate::types::StepId;

/// Something that must be true before a step may run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The provisioner runs as root
    Privileged,
    /// An earlier step finished (successfully or skipped) in this run
    StepCompleted(StepId),
    /// `repository` was enabled in this run, because `package` needs it
    RepositoryEnabled { repository: String, package: String },
    /// The path exists and is executable
    ExecutableExists(PathBuf),
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Privileged => write!(f, "running as root"),
            Self::StepCompleted(id) => write!(f, "step {} completed", id),
            Self::RepositoryEnabled { repository, package } => {
                write!(f, "repository {} enabled (for {})", repository, package)
            }
            Self::ExecutableExists(path) => write!(f, "{} is executable", path.display()),
        }
    }
}

impl Precondition {
    /// Check against the current run; failures are fatal, never retried
    pub fn check(&self, ctx: &StepContext<'_>) -> Result<()> {
        match self {
            Self::Privileged => {
                if ctx.host.is_privileged() {
                    Ok(())
                } else {
                    Err(ProvisionError::permission(
                        "provisioning steps must run as root",
                    ))
                }
            }
            Self::StepCompleted(id) => {
                if ctx.is_completed(*id) {
                    Ok(())
                } else {
                    Err(ProvisionError::config(format!(
                        "step {} must complete first",
                        id
                    )))
                }
            }
            Self::RepositoryEnabled { repository, package } => {
                if ctx.is_repository_enabled(repository) {
                    Ok(())
                } else {
                    Err(ProvisionError::config(format!(
                        "package {} requires repository {}, which was not enabled in this run",
                        package, repository
                    )))
                }
            }
            Self::ExecutableExists(path) => {
                if ctx.host.is_executable(path) {
                    Ok(())
                } else {
                    Err(ProvisionError::config(format!(
                        "ExecStart binary {} does not exist after package installation",
                        path.display()
                    )))
                }
            }
        }
    }
}

/// Result of a step that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEffect {
    /// The host was changed (or would have been, in a dry run)
    Applied,
    /// Nothing to do; the reason is reported
    Skipped(String),
}

/// Mutable state shared by the steps of one run
pub struct StepContext<'a> {
    host: &'a dyn Host,
    unit_dir: PathBuf,
    completed: BTreeSet<StepId>,
    enabled_repositories: BTreeSet<String>,
    unit_path: Option<PathBuf>,
    started_now: bool,
}

impl<'a> StepContext<'a> {
    pub fn new(host: &'a dyn Host, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            host,
            unit_dir: unit_dir.into(),
            completed: BTreeSet::new(),
            enabled_repositories: BTreeSet::new(),
            unit_path: None,
            started_now: false,
        }
    }

    pub fn is_completed(&self, id: StepId) -> bool {
        self.completed.contains(&id)
    }

    pub fn mark_completed(&mut self, id: StepId) {
        self.completed.insert(id);
    }

    pub fn is_repository_enabled(&self, repository: &str) -> bool {
        self.enabled_repositories.contains(repository)
    }

    /// Path of the unit file written in this run
    pub fn unit_path(&self) -> Option<&Path> {
        self.unit_path.as_deref()
    }

    /// Whether a start command was issued in this run
    pub fn started_now(&self) -> bool {
        self.started_now
    }

    /// Run a command and turn a non-zero exit into a classified error
    fn run_checked(&self, cmd: &HostCommand, timeout: Duration) -> Result<()> {
        let output = self.host.run(cmd, timeout)?;
        if output.success {
            Ok(())
        } else {
            Err(classify_failure(&cmd.to_string(), &output))
        }
    }
}

/// A single provisioning step
pub trait Step {
    fn id(&self) -> StepId;

    /// Everything that must hold before `run` is called
    fn preconditions(&self) -> Vec<Precondition>;

    /// Perform the step. Transient errors may lead to another call.
    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect>;

    /// Stage the run reaches once this step has completed, if any
    fn milestone(&self) -> Option<RunStage> {
        None
    }

    /// Check every precondition, stopping at the first unmet one
    fn check_preconditions(&self, ctx: &StepContext<'_>) -> Result<()> {
        for precondition in self.preconditions() {
            precondition.check(ctx)?;
        }
        Ok(())
    }
}

// ============================================================================
// 1. System update
// ============================================================================

/// Refresh package metadata and upgrade base packages
#[derive(Debug, Clone)]
pub struct SystemUpdate {
    pub package_manager: PackageManager,
    pub timeout: Duration,
}

impl Step for SystemUpdate {
    fn id(&self) -> StepId {
        StepId::SystemUpdate
    }

    fn preconditions(&self) -> Vec<Precondition> {
        vec![Precondition::Privileged]
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect> {
        for cmd in self.package_manager.update_commands() {
            ctx.run_checked(&cmd, self.timeout)?;
        }
        Ok(StepEffect::Applied)
    }
}

// ============================================================================
// 2. Repository enablement
// ============================================================================

/// Enable extras repositories before the packages that need them
#[derive(Debug, Clone)]
pub struct EnableRepositories {
    pub package_manager: PackageManager,
    pub repositories: Vec<String>,
    pub timeout: Duration,
}

impl Step for EnableRepositories {
    fn id(&self) -> StepId {
        StepId::EnableRepositories
    }

    fn preconditions(&self) -> Vec<Precondition> {
        vec![
            Precondition::Privileged,
            Precondition::StepCompleted(StepId::SystemUpdate),
        ]
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect> {
        if self.repositories.is_empty() {
            return Ok(StepEffect::Skipped("no repositories required".to_string()));
        }

        for repository in &self.repositories {
            // Already enabled on an earlier attempt of this step
            if ctx.is_repository_enabled(repository) {
                continue;
            }
            for cmd in self.package_manager.enable_repository_commands(repository) {
                ctx.run_checked(&cmd, self.timeout)?;
            }
            tracing::info!(repository = %repository, "Repository enabled");
            ctx.enabled_repositories.insert(repository.clone());
        }
        Ok(StepEffect::Applied)
    }
}

// ============================================================================
// 3. Package installation
// ============================================================================

/// Install the package set, touching only packages that are missing
#[derive(Debug, Clone)]
pub struct InstallPackages {
    pub package_manager: PackageManager,
    pub packages: PackageSet,
    pub timeout: Duration,
}

impl InstallPackages {
    fn missing_packages(&self, ctx: &StepContext<'_>) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for package in self.packages.packages() {
            let query = self.package_manager.query_installed_command(package);
            let output = ctx.host.run(&query, self.timeout)?;
            if self.package_manager.is_installed(&output) {
                tracing::debug!(package = %package, "Package already installed");
            } else {
                missing.push(package.clone());
            }
        }
        Ok(missing)
    }
}

impl Step for InstallPackages {
    fn id(&self) -> StepId {
        StepId::InstallPackages
    }

    fn preconditions(&self) -> Vec<Precondition> {
        let mut pre = vec![
            Precondition::Privileged,
            Precondition::StepCompleted(StepId::SystemUpdate),
        ];
        pre.extend(self.packages.requirements().iter().map(|req| {
            Precondition::RepositoryEnabled {
                repository: req.repository.clone(),
                package: req.package.clone(),
            }
        }));
        pre
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect> {
        // A dry-run host answers every query with success, which would hide
        // the install command from the preview
        let missing = if ctx.host.is_dry_run() {
            self.packages.packages().to_vec()
        } else {
            self.missing_packages(ctx)?
        };

        if missing.is_empty() {
            return Ok(StepEffect::Skipped(format!(
                "all {} packages already installed",
                self.packages.len()
            )));
        }

        tracing::info!(packages = ?missing, "Installing packages");
        ctx.run_checked(&self.package_manager.install_command(&missing), self.timeout)?;

        if !ctx.host.is_dry_run() {
            let still_missing = self.missing_packages(ctx)?;
            if !still_missing.is_empty() {
                return Err(ProvisionError::config(format!(
                    "packages not installed after install: {}",
                    still_missing.join(", ")
                )));
            }
        }
        Ok(StepEffect::Applied)
    }

    fn milestone(&self) -> Option<RunStage> {
        Some(RunStage::PackagesInstalled)
    }
}

// ============================================================================
// 4. Service unit materialisation
// ============================================================================

/// Atomically write the unit file
#[derive(Debug, Clone)]
pub struct WriteServiceUnit {
    pub unit: ServiceUnitSpec,
    pub verify_exec_path: bool,
}

impl Step for WriteServiceUnit {
    fn id(&self) -> StepId {
        StepId::WriteServiceUnit
    }

    fn preconditions(&self) -> Vec<Precondition> {
        let mut pre = vec![
            Precondition::Privileged,
            Precondition::StepCompleted(StepId::InstallPackages),
        ];
        if self.verify_exec_path {
            if let Some(path) = self.unit.exec_path() {
                pre.push(Precondition::ExecutableExists(path));
            }
        }
        pre
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect> {
        let path = self.unit.unit_path(&ctx.unit_dir);
        let rendered = self.unit.render();

        if ctx.host.is_dry_run() {
            tracing::info!(path = %path.display(), "[dry-run] would write unit file:\n{}", rendered);
            ctx.unit_path = Some(path);
            return Ok(StepEffect::Applied);
        }

        let up_to_date = std::fs::read_to_string(&path).is_ok_and(|existing| existing == rendered);
        ctx.unit_path = Some(path.clone());
        if up_to_date {
            return Ok(StepEffect::Skipped(format!(
                "{} already up to date",
                path.display()
            )));
        }

        self.unit.write_atomic(&ctx.unit_dir)?;
        Ok(StepEffect::Applied)
    }

    fn milestone(&self) -> Option<RunStage> {
        Some(RunStage::ServiceUnitWritten)
    }
}

// ============================================================================
// 5-7. Supervisor
// ============================================================================

fn systemctl(args: &[&str]) -> HostCommand {
    HostCommand::new("systemctl").args(args.iter().copied())
}

/// `systemctl daemon-reload`
#[derive(Debug, Clone)]
pub struct ReloadSupervisor {
    pub timeout: Duration,
}

impl Step for ReloadSupervisor {
    fn id(&self) -> StepId {
        StepId::ReloadSupervisor
    }

    fn preconditions(&self) -> Vec<Precondition> {
        vec![
            Precondition::Privileged,
            Precondition::StepCompleted(StepId::WriteServiceUnit),
        ]
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect> {
        ctx.run_checked(&systemctl(&["daemon-reload"]), self.timeout)?;
        Ok(StepEffect::Applied)
    }
}

/// `systemctl enable <unit>`; does not start the process
#[derive(Debug, Clone)]
pub struct EnableService {
    pub unit_file: String,
    pub timeout: Duration,
}

impl Step for EnableService {
    fn id(&self) -> StepId {
        StepId::EnableService
    }

    fn preconditions(&self) -> Vec<Precondition> {
        vec![
            Precondition::Privileged,
            Precondition::StepCompleted(StepId::ReloadSupervisor),
        ]
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect> {
        ctx.run_checked(&systemctl(&["enable", &self.unit_file]), self.timeout)?;
        Ok(StepEffect::Applied)
    }

    fn milestone(&self) -> Option<RunStage> {
        Some(RunStage::ServiceEnabled)
    }
}

/// `systemctl start <unit>`, only present with `StartPolicy::Immediate`
#[derive(Debug, Clone)]
pub struct StartService {
    pub unit_file: String,
    pub timeout: Duration,
}

impl Step for StartService {
    fn id(&self) -> StepId {
        StepId::StartService
    }

    fn preconditions(&self) -> Vec<Precondition> {
        vec![
            Precondition::Privileged,
            Precondition::StepCompleted(StepId::EnableService),
        ]
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> Result<StepEffect> {
        ctx.run_checked(&systemctl(&["start", &self.unit_file]), self.timeout)?;
        ctx.started_now = true;
        Ok(StepEffect::Applied)
    }

    fn milestone(&self) -> Option<RunStage> {
        Some(RunStage::ServiceEnabled)
    }
}
