//! Type-safe enums shared across the provisioner
//!
//! Closed sets of values that appear in configs, logs and reports. They are
//! plain strum/serde enums so the string forms stay in one place.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Identifier of a provisioning step, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StepId {
    SystemUpdate,
    EnableRepositories,
    InstallPackages,
    WriteServiceUnit,
    ReloadSupervisor,
    EnableService,
    StartService,
}

impl StepId {
    /// 1-based position used in boot-log lines and exit diagnostics
    pub const fn index(self) -> usize {
        match self {
            Self::SystemUpdate => 1,
            Self::EnableRepositories => 2,
            Self::InstallPackages => 3,
            Self::WriteServiceUnit => 4,
            Self::ReloadSupervisor => 5,
            Self::EnableService => 6,
            Self::StartService => 7,
        }
    }

    /// Human-readable description for plans and logs
    pub const fn description(self) -> &'static str {
        match self {
            Self::SystemUpdate => "Refresh package metadata and upgrade base packages",
            Self::EnableRepositories => "Enable extras repositories",
            Self::InstallPackages => "Install application packages",
            Self::WriteServiceUnit => "Write service unit file",
            Self::ReloadSupervisor => "Reload supervisor unit definitions",
            Self::EnableService => "Enable service for future boots",
            Self::StartService => "Start service now",
        }
    }
}

/// When the application service should first run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StartPolicy {
    /// Enable only; the supervisor starts the service on the next boot
    #[default]
    OnNextBootOnly,
    /// Enable and start immediately
    Immediate,
}

/// Package manager family of the guest OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PackageManagerKind {
    /// Amazon Linux 2 / CentOS 7 (`yum` + `amazon-linux-extras`)
    #[default]
    Yum,
    /// Amazon Linux 2023 / Fedora / RHEL 8+ (`dnf` modules)
    Dnf,
    /// Debian / Ubuntu (`apt-get` components)
    Apt,
}

/// Coarse error classification recorded in step reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NetworkTransient,
    Configuration,
    Filesystem,
    Permission,
    Timeout,
    Command,
}
