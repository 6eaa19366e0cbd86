//! Tests for the provisioning pipeline
//!
//! These tests run the real step pipeline against a scripted host that
//! behaves like an Amazon Linux 2 machine: yum, amazon-linux-extras, rpm and
//! systemctl are simulated in memory, the unit file goes to a temp dir.
//!
//! These tests verify:
//! - Step order and stage transitions on a fresh host
//! - Idempotent re-runs
//! - Repository preconditions and error classification
//! - The enable-only start gap
//! - Failure ordering (nothing written after a failed step)

use bootprov::{
    CommandOutput, ErrorKind, Host, HostCommand, PackageSet, ProvisionConfig, ProvisionError,
    Provisioner, RetryConfig, RunStage, ServiceUnitSpec, StartPolicy, StepId, StepOutcome,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Scripted host
// =============================================================================

struct Injected {
    prefix: String,
    output: CommandOutput,
    remaining: u32,
}

#[derive(Default)]
struct HostState {
    installed: BTreeSet<String>,
    enabled_repos: BTreeSet<String>,
    daemon_reloads: u32,
    enabled_units: BTreeSet<String>,
    running_units: BTreeSet<String>,
    commands: Vec<String>,
    injected: Vec<Injected>,
    /// Commands that hang past their deadline: (prefix, remaining)
    hangs: Vec<(String, u32)>,
}

/// In-memory Amazon Linux 2 host
struct FakeHost {
    state: RefCell<HostState>,
    /// package -> extras topic it needs (None = base repository)
    catalog: BTreeMap<String, Option<String>>,
    known_topics: BTreeSet<String>,
    /// package -> executables it installs
    provides: BTreeMap<String, Vec<PathBuf>>,
    preexisting_executables: BTreeSet<PathBuf>,
    privileged: bool,
}

impl FakeHost {
    fn amazon_linux() -> Self {
        let catalog = BTreeMap::from([
            ("python3".to_string(), None),
            ("python3-pip".to_string(), None),
            ("git".to_string(), None),
            ("nginx".to_string(), Some("nginx1".to_string())),
            ("postgresql-devel".to_string(), Some("postgresql11".to_string())),
        ]);
        Self {
            state: RefCell::new(HostState::default()),
            catalog,
            known_topics: BTreeSet::from(["nginx1".to_string(), "postgresql11".to_string()]),
            provides: BTreeMap::from([(
                "python3".to_string(),
                vec![PathBuf::from("/usr/bin/python3")],
            )]),
            preexisting_executables: BTreeSet::new(),
            privileged: true,
        }
    }

    fn with_executable(mut self, path: &str) -> Self {
        self.preexisting_executables.insert(PathBuf::from(path));
        self
    }

    fn unprivileged(mut self) -> Self {
        self.privileged = false;
        self
    }

    /// Make commands starting with `prefix` fail `times` times
    fn inject(&self, prefix: &str, output: CommandOutput, times: u32) {
        self.state.borrow_mut().injected.push(Injected {
            prefix: prefix.to_string(),
            output,
            remaining: times,
        });
    }

    /// Make commands starting with `prefix` exceed their timeout `times` times
    fn hang(&self, prefix: &str, times: u32) {
        self.state.borrow_mut().hangs.push((prefix.to_string(), times));
    }

    fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    fn clear_commands(&self) {
        self.state.borrow_mut().commands.clear();
    }

    fn installed(&self) -> BTreeSet<String> {
        self.state.borrow().installed.clone()
    }

    fn is_enabled(&self, unit: &str) -> bool {
        self.state.borrow().enabled_units.contains(unit)
    }

    fn is_running(&self, unit: &str) -> bool {
        self.state.borrow().running_units.contains(unit)
    }

    fn yum_install(&self, packages: &[String]) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        for package in packages {
            let available = match self.catalog.get(package) {
                Some(None) => true,
                Some(Some(topic)) => state.enabled_repos.contains(topic),
                None => false,
            };
            if !available {
                return CommandOutput::failed(
                    1,
                    format!("No package {} available.\nError: Nothing to do", package),
                );
            }
        }
        state.installed.extend(packages.iter().cloned());
        CommandOutput::ok()
    }
}

impl Host for FakeHost {
    fn run(&self, cmd: &HostCommand, timeout: Duration) -> bootprov::Result<CommandOutput> {
        let line = cmd.to_string();
        {
            let mut state = self.state.borrow_mut();
            state.commands.push(line.clone());
            if let Some((_, remaining)) = state
                .hangs
                .iter_mut()
                .find(|(prefix, remaining)| *remaining > 0 && line.starts_with(prefix.as_str()))
            {
                *remaining -= 1;
                return Err(ProvisionError::timeout(format!(
                    "'{}' did not finish within {}s",
                    line,
                    timeout.as_secs()
                )));
            }
            if let Some(inj) = state
                .injected
                .iter_mut()
                .find(|i| i.remaining > 0 && line.starts_with(&i.prefix))
            {
                inj.remaining -= 1;
                return Ok(inj.output.clone());
            }
        }

        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();
        let output = match (cmd.program.as_str(), args.as_slice()) {
            ("yum", ["update", "-y"]) | ("yum", ["clean", "metadata"]) => CommandOutput::ok(),
            ("yum", ["install", "-y", packages @ ..]) => {
                let packages: Vec<String> = packages.iter().map(|p| p.to_string()).collect();
                self.yum_install(&packages)
            }
            ("amazon-linux-extras", ["enable", topic]) => {
                if self.known_topics.contains(*topic) {
                    self.state.borrow_mut().enabled_repos.insert(topic.to_string());
                    CommandOutput::ok()
                } else {
                    CommandOutput::failed(1, format!("Topic {} not found.", topic))
                }
            }
            ("rpm", ["-q", package]) => {
                if self.state.borrow().installed.contains(*package) {
                    CommandOutput {
                        stdout: format!("{}-1.0-1.amzn2.x86_64", package),
                        ..CommandOutput::ok()
                    }
                } else {
                    CommandOutput::failed(1, format!("package {} is not installed", package))
                }
            }
            ("systemctl", ["daemon-reload"]) => {
                self.state.borrow_mut().daemon_reloads += 1;
                CommandOutput::ok()
            }
            ("systemctl", ["enable", unit]) => {
                self.state.borrow_mut().enabled_units.insert(unit.to_string());
                CommandOutput::ok()
            }
            ("systemctl", ["start", unit]) => {
                self.state.borrow_mut().running_units.insert(unit.to_string());
                CommandOutput::ok()
            }
            _ => {
                return Err(ProvisionError::config(format!(
                    "Command '{}' not found on this host",
                    cmd.program
                )));
            }
        };
        Ok(output)
    }

    fn is_executable(&self, path: &Path) -> bool {
        if self.preexisting_executables.contains(path) {
            return true;
        }
        let state = self.state.borrow();
        self.provides
            .iter()
            .any(|(pkg, paths)| state.installed.contains(pkg) && paths.iter().any(|p| p == path))
    }

    fn is_privileged(&self) -> bool {
        self.privileged
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn config_in(dir: &TempDir) -> ProvisionConfig {
    ProvisionConfig {
        unit_dir: dir.path().to_path_buf(),
        retry: RetryConfig::immediate(3),
        ..ProvisionConfig::default()
    }
}

fn app_config(dir: &TempDir) -> ProvisionConfig {
    ProvisionConfig {
        packages: PackageSet::from_names(["python3", "git"]),
        service: ServiceUnitSpec {
            name: "app".to_string(),
            description: "Application server".to_string(),
            working_directory: PathBuf::from("/srv/app"),
            run_user: "app".to_string(),
            run_group: "app".to_string(),
            environment: BTreeMap::from([("PYTHONPATH".to_string(), "/srv/app".to_string())]),
            exec_command: "/srv/app/venv/bin/serve --host 0.0.0.0 --port 8000".to_string(),
            after_target: "network.target".to_string(),
            wanted_by: "multi-user.target".to_string(),
        },
        ..config_in(dir)
    }
}

fn outcome(report: &bootprov::RunReport, step: StepId) -> &StepOutcome {
    &report
        .report_for(step)
        .unwrap_or_else(|| panic!("no report for {}", step))
        .outcome
}

// =============================================================================
// Full runs
// =============================================================================

#[test]
fn test_fresh_host_runs_every_step_in_order() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let host = FakeHost::amazon_linux();

    let report = Provisioner::from_config(&config).run(&host);

    assert!(report.succeeded(), "{:?}", report.failure());
    assert_eq!(report.exit_code(), 0);
    let order: Vec<StepId> = report.steps.iter().map(|r| r.step).collect();
    assert_eq!(
        order,
        vec![
            StepId::SystemUpdate,
            StepId::EnableRepositories,
            StepId::InstallPackages,
            StepId::WriteServiceUnit,
            StepId::ReloadSupervisor,
            StepId::EnableService,
        ]
    );
    assert!(report.steps.iter().all(|r| r.outcome == StepOutcome::Success));

    let stages: Vec<RunStage> = report.history.iter().map(|t| t.stage).collect();
    assert_eq!(stages, RunStage::all_stages());

    let unit_path = dir.path().join("gunicorn.service");
    assert_eq!(report.unit_path.as_deref(), Some(unit_path.as_path()));
    let written = ServiceUnitSpec::read_from(&unit_path).unwrap();
    assert_eq!(written, config.service);

    let commands = host.commands();
    let pos = |c: &str| commands.iter().position(|x| x == c).unwrap();
    let install = pos("yum install -y python3 python3-pip git nginx postgresql-devel");
    assert!(pos("amazon-linux-extras enable nginx1") < install);
    assert!(pos("amazon-linux-extras enable postgresql11") < install);
    assert!(pos("systemctl daemon-reload") < pos("systemctl enable gunicorn.service"));
    assert_eq!(host.state.borrow().daemon_reloads, 1);
}

#[test]
fn test_spec_example_unit_has_exact_exec_and_working_directory() {
    let dir = TempDir::new().unwrap();
    let config = app_config(&dir);
    let host = FakeHost::amazon_linux().with_executable("/srv/app/venv/bin/serve");

    let report = Provisioner::from_config(&config).run(&host);
    assert!(report.succeeded(), "{:?}", report.failure());
    assert!(matches!(outcome(&report, StepId::EnableRepositories), StepOutcome::Skipped { .. }));

    let content = std::fs::read_to_string(dir.path().join("app.service")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert!(lines.contains(&"ExecStart=/srv/app/venv/bin/serve --host 0.0.0.0 --port 8000"));
    assert!(lines.contains(&"WorkingDirectory=/srv/app"));
    assert!(lines.contains(&"User=app"));
    assert!(lines.contains(&"After=network.target"));
    assert!(lines.contains(&"WantedBy=multi-user.target"));
}

// =============================================================================
// Idempotence
// =============================================================================

#[test]
fn test_rerun_on_provisioned_host_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let host = FakeHost::amazon_linux();
    let provisioner = Provisioner::from_config(&config);

    assert!(provisioner.run(&host).succeeded());
    let installed_before = host.installed();
    let unit_before = std::fs::read_to_string(dir.path().join("gunicorn.service")).unwrap();
    host.clear_commands();

    let second = provisioner.run(&host);

    assert!(second.succeeded(), "{:?}", second.failure());
    assert!(matches!(outcome(&second, StepId::InstallPackages), StepOutcome::Skipped { .. }));
    assert!(matches!(outcome(&second, StepId::WriteServiceUnit), StepOutcome::Skipped { .. }));
    assert_eq!(host.installed(), installed_before);
    assert!(!host.commands().iter().any(|c| c.starts_with("yum install")));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("gunicorn.service")).unwrap(),
        unit_before
    );
}

#[test]
fn test_partially_installed_host_installs_only_missing() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let host = FakeHost::amazon_linux();
    host.state.borrow_mut().installed.insert("git".to_string());
    host.state.borrow_mut().installed.insert("python3".to_string());

    let report = Provisioner::from_config(&config).run(&host);

    assert!(report.succeeded());
    assert!(host
        .commands()
        .contains(&"yum install -y python3-pip nginx postgresql-devel".to_string()));
}

// =============================================================================
// Repository preconditions and classification
// =============================================================================

#[test]
fn test_omitted_repository_enablement_is_configuration_error() {
    let dir = TempDir::new().unwrap();
    let config = ProvisionConfig {
        repositories: Some(vec!["postgresql11".to_string()]),
        ..config_in(&dir)
    };
    let host = FakeHost::amazon_linux();

    let report = Provisioner::from_config(&config).run(&host);

    assert_eq!(report.failed_step, Some(StepId::InstallPackages));
    match outcome(&report, StepId::InstallPackages) {
        StepOutcome::Failed { kind, reason } => {
            assert_eq!(*kind, ErrorKind::Configuration);
            assert!(reason.contains("nginx1"), "{}", reason);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    // Rejected by precondition: the package manager was never asked
    assert_eq!(report.report_for(StepId::InstallPackages).unwrap().attempts, 0);
    assert!(!host.commands().iter().any(|c| c.starts_with("yum install")));
}

#[test]
fn test_undeclared_repository_dependency_is_configuration_error() {
    let dir = TempDir::new().unwrap();
    // nginx listed as a plain package: nothing enables nginx1
    let config = ProvisionConfig {
        packages: PackageSet::from_names(["python3", "nginx"]),
        ..config_in(&dir)
    };
    let host = FakeHost::amazon_linux();

    let report = Provisioner::from_config(&config).run(&host);

    let install = report.report_for(StepId::InstallPackages).unwrap();
    assert!(matches!(
        install.outcome,
        StepOutcome::Failed { kind: ErrorKind::Configuration, .. }
    ));
    assert_eq!(install.attempts, 1, "configuration errors are not retried");
}

#[test]
fn test_unknown_extras_topic_fails_enablement() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.packages.require_repository("postgresql", "postgresql99");
    let host = FakeHost::amazon_linux();

    let report = Provisioner::from_config(&config).run(&host);

    assert_eq!(report.failed_step, Some(StepId::EnableRepositories));
    assert!(matches!(
        outcome(&report, StepId::EnableRepositories),
        StepOutcome::Failed { kind: ErrorKind::Configuration, .. }
    ));
    assert!(report.report_for(StepId::InstallPackages).is_none());
}

// =============================================================================
// Retry
// =============================================================================

#[test]
fn test_transient_update_failure_is_retried() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux();
    host.inject(
        "yum update",
        CommandOutput::failed(1, "Could not retrieve mirrorlist: Could not resolve host"),
        2,
    );

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);

    assert!(report.succeeded(), "{:?}", report.failure());
    assert_eq!(report.report_for(StepId::SystemUpdate).unwrap().attempts, 3);
}

#[test]
fn test_persistent_mirror_outage_fails_after_bound() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux();
    host.inject(
        "yum update",
        CommandOutput::failed(1, "Cannot find a valid baseurl for repo: amzn2-core"),
        100,
    );

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);

    assert_eq!(report.exit_code(), 1);
    let update = report.report_for(StepId::SystemUpdate).unwrap();
    assert_eq!(update.attempts, 3);
    assert!(matches!(
        update.outcome,
        StepOutcome::Failed { kind: ErrorKind::NetworkTransient, .. }
    ));
    assert_eq!(report.steps.len(), 1);
}

#[test]
fn test_hung_install_is_killed_retried_and_reported() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux();
    host.hang("yum install", 100);

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);

    let install = report.report_for(StepId::InstallPackages).unwrap();
    assert_eq!(install.attempts, 3);
    match &install.outcome {
        StepOutcome::Failed { kind, reason } => {
            assert_eq!(*kind, ErrorKind::Timeout);
            assert!(reason.contains("1800s"), "{}", reason);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(!dir.path().join("gunicorn.service").exists());
}

#[test]
fn test_single_hang_recovers_on_retry() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux();
    host.hang("yum update", 1);

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);

    assert!(report.succeeded(), "{:?}", report.failure());
    assert_eq!(report.report_for(StepId::SystemUpdate).unwrap().attempts, 2);
}

// =============================================================================
// Failure ordering
// =============================================================================

#[test]
fn test_install_failure_halts_before_unit_is_written() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux();
    host.inject("yum install", CommandOutput::failed(1, "rpmdb: corrupted"), 100);

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);

    assert_eq!(report.failed_step, Some(StepId::InstallPackages));
    assert_eq!(report.final_stage, RunStage::Failed);
    assert_eq!(report.failed_at, Some(RunStage::Started));
    assert!(report.report_for(StepId::WriteServiceUnit).is_none());
    assert!(report.unit_path.is_none());
    assert!(!dir.path().join("gunicorn.service").exists());
    assert!(!host.commands().iter().any(|c| c.starts_with("systemctl")));
}

#[test]
fn test_missing_exec_binary_blocks_unit_write() {
    let dir = TempDir::new().unwrap();
    let config = app_config(&dir);
    // /srv/app/venv/bin/serve never appears on this host
    let host = FakeHost::amazon_linux();

    let report = Provisioner::from_config(&config).run(&host);

    assert_eq!(report.failed_step, Some(StepId::WriteServiceUnit));
    assert_eq!(report.failed_at, Some(RunStage::PackagesInstalled));
    assert!(!dir.path().join("app.service").exists());
}

#[test]
fn test_unprivileged_host_fails_first_step() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux().unprivileged();

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);

    assert_eq!(report.steps.len(), 1);
    assert!(matches!(
        outcome(&report, StepId::SystemUpdate),
        StepOutcome::Failed { kind: ErrorKind::Permission, .. }
    ));
    assert!(host.commands().is_empty());
}

// =============================================================================
// Start policy
// =============================================================================

#[test]
fn test_enable_only_does_not_start_service() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux();

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);

    assert!(report.succeeded());
    assert!(host.is_enabled("gunicorn.service"));
    // Enabled for the next boot, but nothing started it in this run
    assert!(!host.is_running("gunicorn.service"));
    assert!(!report.service_started_now);
    assert!(report.report_for(StepId::StartService).is_none());
}

#[test]
fn test_immediate_policy_starts_service() {
    let dir = TempDir::new().unwrap();
    let config = ProvisionConfig {
        start_policy: StartPolicy::Immediate,
        ..config_in(&dir)
    };
    let host = FakeHost::amazon_linux();

    let report = Provisioner::from_config(&config).run(&host);

    assert!(report.succeeded());
    assert!(host.is_running("gunicorn.service"));
    assert!(report.service_started_now);
    assert_eq!(report.steps.last().map(|r| r.step), Some(StepId::StartService));
}

#[test]
fn test_report_json_names_failed_step() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::amazon_linux();
    host.inject("systemctl enable", CommandOutput::failed(1, "Failed to enable unit"), 1);

    let report = Provisioner::from_config(&config_in(&dir)).run(&host);
    let path = dir.path().join("report.json");
    report.save_to_file(&path).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["failed_step"], "enable-service");
    assert_eq!(json["final_stage"], "failed");
    assert_eq!(json["failed_at"], "service_unit_written");
    assert_eq!(json["steps"].as_array().map(Vec::len), Some(6));
    assert_eq!(json["steps"][5]["outcome"]["kind"], "command");
}
