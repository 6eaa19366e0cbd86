//! Package sets and the repositories they depend on.
//!
//! A `PackageSet` is an ordered, duplicate-free list of package names plus
//! the extras repositories some of those packages need. The provisioner uses
//! the requirements to order repository enablement before installation and to
//! reject an install whose repository was never enabled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{ProvisionError, Result};

/// A package that only becomes installable once `repository` is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRequirement {
    pub package: String,
    /// Extras topic, module stream or apt component (e.g. `nginx1`)
    pub repository: String,
}

/// Ordered set of packages to install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    packages: Vec<String>,
    #[serde(default)]
    requirements: Vec<RepositoryRequirement>,
}

impl PackageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from names, dropping duplicates (first position wins)
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for name in names {
            set.insert(name);
        }
        set
    }

    /// Append a package; returns false if it was already present
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        let name = name.into();
        if self.packages.contains(&name) {
            return false;
        }
        self.packages.push(name);
        true
    }

    /// Record that `package` needs `repository`, adding the package if absent
    pub fn require_repository(
        &mut self,
        package: impl Into<String>,
        repository: impl Into<String>,
    ) -> &mut Self {
        let package = package.into();
        let repository = repository.into();
        self.insert(package.clone());
        let req = RepositoryRequirement { package, repository };
        if !self.requirements.contains(&req) {
            self.requirements.push(req);
        }
        self
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn requirements(&self) -> &[RepositoryRequirement] {
        &self.requirements
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.iter().any(|p| p == name)
    }

    /// Repositories to enable, in first-needed order without duplicates
    pub fn repositories(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for package in &self.packages {
            for req in self.requirements.iter().filter(|r| &r.package == package) {
                if seen.insert(req.repository.clone()) {
                    ordered.push(req.repository.clone());
                }
            }
        }
        ordered
    }

    /// Requirements whose repository is not in `enabled`
    pub fn unmet_requirements<'a>(
        &'a self,
        enabled: &BTreeSet<String>,
    ) -> Vec<&'a RepositoryRequirement> {
        self.requirements
            .iter()
            .filter(|r| !enabled.contains(&r.repository))
            .collect()
    }

    /// Reject empty sets, blank names and requirements for unknown packages
    pub fn validate(&self) -> Result<()> {
        if self.packages.is_empty() {
            return Err(ProvisionError::config("Package set must not be empty"));
        }
        for (i, name) in self.packages.iter().enumerate() {
            if self.packages[..i].contains(name) {
                return Err(ProvisionError::config(format!(
                    "Package '{}' is listed more than once",
                    name
                )));
            }
            if name.trim().is_empty() || name.chars().any(char::is_whitespace) {
                return Err(ProvisionError::config(format!(
                    "Invalid package name '{}'",
                    name
                )));
            }
            if name.starts_with('-') {
                return Err(ProvisionError::config(format!(
                    "Package name '{}' looks like a command-line flag",
                    name
                )));
            }
            // Installed state is checked per package name afterwards, so
            // groups, file capabilities and globs cannot be verified
            if name.starts_with(['@', '/']) || name.contains(['*', '?', '[', '(', ')']) {
                return Err(ProvisionError::config(format!(
                    "'{}' is not a plain package name (groups, file paths, capabilities and globs are not supported)",
                    name
                )));
            }
        }
        for req in &self.requirements {
            if !self.contains(&req.package) {
                return Err(ProvisionError::config(format!(
                    "Repository requirement references unknown package '{}'",
                    req.package
                )));
            }
            if req.repository.trim().is_empty() || req.repository.chars().any(char::is_whitespace)
            {
                return Err(ProvisionError::config(format!(
                    "Invalid repository name '{}' for package {}",
                    req.repository, req.package
                )));
            }
        }
        Ok(())
    }
}
