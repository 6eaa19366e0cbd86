//! bootprov library
//!
//! Typed first-boot provisioning: a sequence of steps that installs packages,
//! writes a service unit and enables an application server, with structured
//! per-step outcomes instead of an opaque user-data script.

pub mod cli;
pub mod config_file;
pub mod error;
pub mod host;
pub mod package_manager;
pub mod package_set;
pub mod pipeline;
pub mod process_guard;
pub mod retry;
pub mod run_state;
pub mod service_unit;
pub mod steps;
pub mod types;
pub mod user_data;

// Re-export main types for convenience
pub use config_file::{ProvisionConfig, StepTimeouts};
pub use error::{ProvisionError, Result};
pub use host::{CommandOutput, DryRunHost, Host, HostCommand, SystemHost};
pub use package_manager::{PackageManager, classify_failure};
pub use package_set::{PackageSet, RepositoryRequirement};
pub use pipeline::{Provisioner, RunReport, StepOutcome, StepReport};
pub use retry::RetryConfig;
pub use run_state::{ProvisioningRun, RunStage, RunTransitionError};
pub use service_unit::ServiceUnitSpec;
pub use steps::{Precondition, Step, StepContext, StepEffect};
pub use types::{ErrorKind, PackageManagerKind, StartPolicy, StepId};
pub use user_data::render_user_data;
