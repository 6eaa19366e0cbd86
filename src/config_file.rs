//! Provisioning configuration file handling.
//!
//! A `ProvisionConfig` is the JSON document handed to the provisioner at
//! first boot. It uses type-safe enums instead of strings wherever the set of
//! values is closed. The defaults reproduce the original deployment: a
//! Django app served by gunicorn behind nginx on Amazon Linux 2.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::package_set::PackageSet;
use crate::retry::{RetryConfig, duration_secs};
use crate::service_unit::{DEFAULT_UNIT_DIR, ServiceUnitSpec};
use crate::types::{PackageManagerKind, StartPolicy};

/// Per-step command timeouts, in seconds in the JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepTimeouts {
    #[serde(with = "duration_secs")]
    pub system_update: Duration,
    #[serde(with = "duration_secs")]
    pub enable_repositories: Duration,
    #[serde(with = "duration_secs")]
    pub install_packages: Duration,
    #[serde(with = "duration_secs")]
    pub supervisor: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            system_update: Duration::from_secs(900),
            enable_repositories: Duration::from_secs(300),
            install_packages: Duration::from_secs(1800),
            supervisor: Duration::from_secs(90),
        }
    }
}

/// Provisioning configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub package_manager: PackageManagerKind,

    pub packages: PackageSet,

    /// Repositories to enable. `None` derives them from the package set's
    /// requirements; an explicit list is used as-is.
    #[serde(default)]
    pub repositories: Option<Vec<String>>,

    pub service: ServiceUnitSpec,

    #[serde(default)]
    pub start_policy: StartPolicy,

    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// Require the ExecStart binary to exist before writing the unit
    #[serde(default = "default_true")]
    pub verify_exec_path: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub timeouts: StepTimeouts,
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from(DEFAULT_UNIT_DIR)
}

fn default_true() -> bool {
    true
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        let mut packages = PackageSet::from_names(["python3", "python3-pip", "git"]);
        packages
            .require_repository("nginx", "nginx1")
            .require_repository("postgresql-devel", "postgresql11");

        let app_dir = "/home/ec2-user/app";
        Self {
            package_manager: PackageManagerKind::Yum,
            packages,
            repositories: None,
            service: ServiceUnitSpec {
                name: "gunicorn".to_string(),
                description: "gunicorn daemon for the Django application".to_string(),
                working_directory: PathBuf::from(app_dir),
                run_user: "ec2-user".to_string(),
                run_group: "nginx".to_string(),
                environment: BTreeMap::from([("PYTHONPATH".to_string(), app_dir.to_string())]),
                exec_command:
                    "/usr/bin/python3 -m gunicorn --workers 3 --bind 0.0.0.0:8000 app.wsgi:application"
                        .to_string(),
                after_target: "network.target".to_string(),
                wanted_by: "multi-user.target".to_string(),
            },
            start_policy: StartPolicy::OnNextBootOnly,
            unit_dir: default_unit_dir(),
            verify_exec_path: true,
            retry: RetryConfig::default(),
            timeouts: StepTimeouts::default(),
        }
    }
}

impl ProvisionConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Repositories the run will enable
    pub fn effective_repositories(&self) -> Vec<String> {
        self.repositories
            .clone()
            .unwrap_or_else(|| self.packages.repositories())
    }

    /// Validate the configuration
    ///
    /// An explicit repository list that omits a required repository is
    /// allowed here and only logged: the install step reports it as a
    /// configuration error at run time, naming the package.
    pub fn validate(&self) -> Result<()> {
        self.packages.validate().context("Invalid package set")?;
        self.service.validate().context("Invalid service definition")?;

        if let Some(repos) = &self.repositories {
            for repo in repos {
                if repo.trim().is_empty() || repo.chars().any(char::is_whitespace) {
                    anyhow::bail!("Invalid repository name '{}'", repo);
                }
            }
            let enabled = repos.iter().cloned().collect();
            for req in self.packages.unmet_requirements(&enabled) {
                tracing::warn!(
                    package = %req.package,
                    repository = %req.repository,
                    "Required repository is not in the explicit repository list"
                );
            }
        }

        if !self.unit_dir.is_absolute() {
            anyhow::bail!("unit_dir {:?} must be an absolute path", self.unit_dir);
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            anyhow::bail!("retry.backoff_multiplier must be a finite number >= 1.0");
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("system_update", t.system_update),
            ("enable_repositories", t.enable_repositories),
            ("install_packages", t.install_packages),
            ("supervisor", t.supervisor),
        ] {
            if value.is_zero() {
                anyhow::bail!("timeouts.{} must be greater than zero", name);
            }
        }

        Ok(())
    }
}
