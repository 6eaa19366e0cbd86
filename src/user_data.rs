//! Render a provisioning config as a standalone user-data shell script.
//!
//! Some orchestrators can only hand a VM a shell script at creation time.
//! The rendered script follows the same step order, retry bound and
//! timeouts as the typed pipeline, writes the unit via temp file + rename,
//! and exits non-zero naming the first failed step.
//!
//! The script cannot classify failures, so every failed command is retried
//! up to the bound, including ones the typed pipeline treats as fatal. Delays
//! are whole seconds (at least one) and the backoff multiplier is applied in
//! integer percent.

use std::fmt::Write as _;

use crate::config_file::ProvisionConfig;
use crate::host::{HostCommand, shell_quote};
use crate::package_manager::PackageManager;
use crate::types::{StartPolicy, StepId};

const UNIT_DELIMITER: &str = "BOOTPROV_UNIT_EOF";

const PRELUDE: &str = r#"#!/bin/bash
# Generated by bootprov. Runs once at first boot.
set -uo pipefail

log() { echo "[bootprov] $*" >&2; }
fail() { log "step $1 ($2) failed"; exit 1; }

# retry <attempts> <initial-delay-secs> <max-delay-secs> <multiplier-percent> <command...>
retry() {
    local max=$1 delay=$2 cap=$3 pct=$4 n=1
    shift 4
    until "$@"; do
        if [ "$n" -ge "$max" ]; then
            return 1
        fi
        log "attempt $n failed, retrying in ${delay}s: $*"
        sleep "$delay"
        delay=$(( (delay * pct + 99) / 100 ))
        if [ "$delay" -gt "$cap" ]; then delay=$cap; fi
        n=$((n + 1))
    done
}
"#;

/// Render the full script
pub fn render_user_data(config: &ProvisionConfig) -> String {
    let pm = PackageManager::new(config.package_manager);
    let t = &config.timeouts;
    let retry = &config.retry;
    let retry_prefix = format!(
        "retry {} {} {} {}",
        retry.max_attempts.max(1),
        retry.initial_delay.as_secs().max(1),
        retry.max_delay.as_secs().max(1),
        multiplier_percent(retry.backoff_multiplier)
    );

    let mut script = String::from(PRELUDE);

    begin(&mut script, StepId::SystemUpdate);
    for cmd in pm.update_commands() {
        line(&mut script, StepId::SystemUpdate, Some(&retry_prefix), t.system_update.as_secs(), &cmd);
    }

    let repositories = config.effective_repositories();
    if !repositories.is_empty() {
        begin(&mut script, StepId::EnableRepositories);
        for repo in &repositories {
            for cmd in pm.enable_repository_commands(repo) {
                line(
                    &mut script,
                    StepId::EnableRepositories,
                    Some(&retry_prefix),
                    t.enable_repositories.as_secs(),
                    &cmd,
                );
            }
        }
    }

    begin(&mut script, StepId::InstallPackages);
    line(
        &mut script,
        StepId::InstallPackages,
        Some(&retry_prefix),
        t.install_packages.as_secs(),
        &pm.install_command(config.packages.packages()),
    );

    begin(&mut script, StepId::WriteServiceUnit);
    let unit = &config.service;
    let unit_dir = config.unit_dir.display().to_string();
    let final_path = unit.unit_path(&config.unit_dir).display().to_string();
    let tmp_path = config
        .unit_dir
        .join(format!(".{}.tmp", unit.file_name()))
        .display()
        .to_string();
    let step = StepId::WriteServiceUnit;
    if config.verify_exec_path {
        if let Some(exec) = unit.exec_path() {
            let exec = shell_quote(&exec.display().to_string());
            let _ = writeln!(
                script,
                "[ -x {exec} ] || {{ log \"missing executable {exec}\"; fail {} {}; }}",
                step.index(),
                step
            );
        }
    }
    let _ = writeln!(script, "mkdir -p {} || fail {} {}", shell_quote(&unit_dir), step.index(), step);
    let _ = writeln!(
        script,
        "cat > {} <<'{}' || fail {} {}",
        shell_quote(&tmp_path),
        UNIT_DELIMITER,
        step.index(),
        step
    );
    script.push_str(&unit.render());
    script.push_str(UNIT_DELIMITER);
    script.push('\n');
    let _ = writeln!(
        script,
        "chmod 0644 {tmp} && sync {tmp} && mv -f {tmp} {dst} || fail {} {}",
        step.index(),
        step,
        tmp = shell_quote(&tmp_path),
        dst = shell_quote(&final_path),
    );

    let supervisor = t.supervisor.as_secs();
    let unit_file = unit.file_name();
    begin(&mut script, StepId::ReloadSupervisor);
    line(
        &mut script,
        StepId::ReloadSupervisor,
        None,
        supervisor,
        &HostCommand::new("systemctl").arg("daemon-reload"),
    );

    begin(&mut script, StepId::EnableService);
    line(
        &mut script,
        StepId::EnableService,
        None,
        supervisor,
        &HostCommand::new("systemctl").args(["enable", unit_file.as_str()]),
    );

    if config.start_policy == StartPolicy::Immediate {
        begin(&mut script, StepId::StartService);
        line(
            &mut script,
            StepId::StartService,
            None,
            supervisor,
            &HostCommand::new("systemctl").args(["start", unit_file.as_str()]),
        );
    } else {
        script.push_str("# start_policy=on_next_boot_only: the service first runs after the next boot\n");
    }

    script.push_str("log \"provisioning complete\"\n");
    script
}

/// Backoff multiplier as an integer percentage, never below 100
fn multiplier_percent(multiplier: f64) -> u64 {
    if multiplier.is_finite() && multiplier > 1.0 {
        (multiplier * 100.0).round() as u64
    } else {
        100
    }
}

fn begin(script: &mut String, step: StepId) {
    let _ = writeln!(script, "\nlog \"step {}: {}\"", step.index(), step);
}

/// One command line with optional retry, a timeout and the failure handler
fn line(script: &mut String, step: StepId, retry: Option<&str>, timeout_secs: u64, cmd: &HostCommand) {
    if let Some(prefix) = retry {
        script.push_str(prefix);
        script.push(' ');
    }
    let _ = write!(script, "timeout {} ", timeout_secs.max(1));
    if !cmd.env.is_empty() {
        script.push_str("env ");
    }
    let _ = writeln!(script, "{} || fail {} {}", cmd, step.index(), step);
}
