//! Package manager command construction and failure classification
//!
//! The provisioner supports the three package manager families found on
//! common cloud images. This module knows the exact command lines for each
//! and how to read their failures:
//!
//! - `PackageManager`: builds `HostCommand`s for update, repository
//!   enablement, installed-package queries and installation
//! - `classify_failure`: maps a failed command's output to the
//!   `ProvisionError` taxonomy (transient, configuration, permission)
//!
//! # Repository enablement
//!
//! | Kind  | Enable command                          | Example repository |
//! |-------|-----------------------------------------|--------------------|
//! | `yum` | `amazon-linux-extras enable <topic>`    | `nginx1`           |
//! | `dnf` | `dnf module enable -y <module:stream>`  | `postgresql:13`    |
//! | `apt` | `add-apt-repository -y <component>`     | `universe`         |

use crate::error::ProvisionError;
use crate::host::{CommandOutput, HostCommand};
use crate::types::PackageManagerKind;

/// Substrings that mark a mirror or network problem worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "could not resolve host",
    "could not retrieve mirrorlist",
    "cannot find a valid baseurl",
    "no more mirrors to try",
    "errno 14",
    "curl#",
    "operation too slow",
    "temporary failure",
    "timed out",
    "timeout was reached",
    "connection refused",
    "connection reset",
    "network is unreachable",
    "failed to download metadata",
    "failed to synchronize cache",
    "could not get lock",
    "503 service unavailable",
    "502 bad gateway",
    "try again",
];

/// Line shapes that mark an unknown package or repository.
///
/// A line matches when, after its `Error:`/`E:`/`-` prefix, it starts with
/// the first text and the second text follows somewhere after it.
const CONFIGURATION_PATTERNS: &[(&str, &str)] = &[
    ("no package ", " available"),
    ("topic ", " not found"),
    ("unable to locate package ", ""),
    ("package ", " has no installation candidate"),
    ("no match for argument", ""),
    ("unable to find a match", ""),
    ("nothing provides ", ""),
    ("missing groups or modules", ""),
    ("no matching modules", ""),
];

const LINE_PREFIXES: &[&str] = &["error:", "e:", "-"];

fn is_configuration_line(line: &str) -> bool {
    let mut line = line.trim();
    for prefix in LINE_PREFIXES {
        if let Some(rest) = line.strip_prefix(prefix) {
            line = rest.trim_start();
        }
    }
    CONFIGURATION_PATTERNS.iter().any(|(lead, tail)| {
        line.strip_prefix(lead)
            .is_some_and(|rest| tail.is_empty() || rest.contains(tail))
    })
}

/// Substrings that mark a privilege problem
const PERMISSION_MARKERS: &[&str] = &[
    "you need to be root",
    "permission denied",
    "are you root",
    "must be run as root",
    "operation not permitted",
];

/// Command builder for one package manager family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageManager {
    kind: PackageManagerKind,
}

impl PackageManager {
    pub fn new(kind: PackageManagerKind) -> Self {
        Self { kind }
    }

    /// Commands that refresh metadata and upgrade base packages
    pub fn update_commands(&self) -> Vec<HostCommand> {
        match self.kind {
            PackageManagerKind::Yum => vec![HostCommand::new("yum").args(["update", "-y"])],
            PackageManagerKind::Dnf => {
                vec![HostCommand::new("dnf").args(["upgrade", "-y", "--refresh"])]
            }
            PackageManagerKind::Apt => vec![
                apt_get().arg("update"),
                apt_get().args(["upgrade", "-y"]),
            ],
        }
    }

    /// Commands that make `repository`'s packages installable
    pub fn enable_repository_commands(&self, repository: &str) -> Vec<HostCommand> {
        match self.kind {
            PackageManagerKind::Yum => vec![
                HostCommand::new("amazon-linux-extras").args(["enable", repository]),
                HostCommand::new("yum").args(["clean", "metadata"]),
            ],
            PackageManagerKind::Dnf => {
                vec![HostCommand::new("dnf").args(["module", "enable", "-y", repository])]
            }
            PackageManagerKind::Apt => vec![
                HostCommand::new("add-apt-repository").args(["-y", repository]),
                apt_get().arg("update"),
            ],
        }
    }

    /// Query whether `package` is installed; see [`Self::is_installed`]
    pub fn query_installed_command(&self, package: &str) -> HostCommand {
        match self.kind {
            PackageManagerKind::Yum | PackageManagerKind::Dnf => {
                HostCommand::new("rpm").args(["-q", package])
            }
            PackageManagerKind::Apt => {
                HostCommand::new("dpkg-query").args(["-W", "-f=${Status}", package])
            }
        }
    }

    /// Interpret the output of [`Self::query_installed_command`]
    pub fn is_installed(&self, output: &CommandOutput) -> bool {
        match self.kind {
            PackageManagerKind::Yum | PackageManagerKind::Dnf => output.success,
            PackageManagerKind::Apt => {
                output.success && output.stdout.contains("install ok installed")
            }
        }
    }

    /// Install `packages` non-interactively; installed packages are a no-op
    pub fn install_command(&self, packages: &[String]) -> HostCommand {
        match self.kind {
            PackageManagerKind::Yum => HostCommand::new("yum")
                .args(["install", "-y"])
                .args(packages.iter().cloned()),
            PackageManagerKind::Dnf => HostCommand::new("dnf")
                .args(["install", "-y"])
                .args(packages.iter().cloned()),
            PackageManagerKind::Apt => apt_get()
                .args(["install", "-y", "--no-install-recommends"])
                .args(packages.iter().cloned()),
        }
    }
}

fn apt_get() -> HostCommand {
    HostCommand::new("apt-get").env("DEBIAN_FRONTEND", "noninteractive")
}

/// Map a failed command to the error taxonomy.
///
/// Permission markers win over configuration lines, which win over
/// transient markers: a missing package on an unreachable mirror is reported
/// as transient only if no line says the package itself is unknown.
pub fn classify_failure(context: &str, output: &CommandOutput) -> ProvisionError {
    let diagnostics = output.diagnostics();
    let lower = diagnostics.to_lowercase();
    let code = output.exit_code.unwrap_or(-1);
    let msg = format!("{} failed (exit code {}): {}", context, code, diagnostics);

    if PERMISSION_MARKERS.iter().any(|m| lower.contains(m)) {
        ProvisionError::permission(msg)
    } else if lower.lines().any(is_configuration_line) {
        ProvisionError::config(msg)
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ProvisionError::network(msg)
    } else {
        ProvisionError::command(msg)
    }
}
