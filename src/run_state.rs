//! Provisioning Run State Machine
//!
//! This module is the authoritative record of how far a provisioning run got.
//! It enforces valid state transitions and makes it impossible to skip stages
//! programmatically.
//!
//! # Design Principles
//!
//! - **Single Source of Truth**: `ProvisioningRun` owns the current stage
//! - **Validated Transitions**: Only forward transitions to the next stage are allowed
//! - **Non-resumable**: There is no reset; a failed run is recovered by
//!   re-provisioning the host, not by rewinding the run
//!
//! # Stage Flow
//!
//! ```text
//! Started
//!     ↓
//! PackagesInstalled
//!     ↓
//! ServiceUnitWritten
//!     ↓
//! ServiceEnabled
//!     ↓
//! Complete
//!
//! (Any non-terminal stage can transition to Failed)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Run stages in sequential order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RunStage {
    /// Run has begun; nothing on the host is known to be changed yet
    Started = 0,

    /// Update, repository enablement and package installation done
    PackagesInstalled = 1,

    /// Unit file is on disk
    ServiceUnitWritten = 2,

    /// Supervisor reloaded and the unit enabled (and started, if requested)
    ServiceEnabled = 3,

    /// Every step succeeded (terminal state)
    Complete = 4,

    /// A step failed (terminal state)
    Failed = 255,
}

impl RunStage {
    /// Returns the numeric order of this stage (0-4, 255 for Failed)
    #[inline]
    pub const fn order(self) -> u8 {
        self as u8
    }

    /// Returns true if this is a terminal state (Complete or Failed)
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Returns the next stage in the sequence, or None if at a terminal state
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Started => Some(Self::PackagesInstalled),
            Self::PackagesInstalled => Some(Self::ServiceUnitWritten),
            Self::ServiceUnitWritten => Some(Self::ServiceEnabled),
            Self::ServiceEnabled => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }

    /// Returns a human-readable description of this stage
    pub const fn description(self) -> &'static str {
        match self {
            Self::Started => "Started",
            Self::PackagesInstalled => "Packages installed",
            Self::ServiceUnitWritten => "Service unit written",
            Self::ServiceEnabled => "Service enabled",
            Self::Complete => "Provisioning complete",
            Self::Failed => "Provisioning failed",
        }
    }

    /// Returns all stages in order (excluding Failed)
    pub const fn all_stages() -> &'static [Self] {
        &[
            Self::Started,
            Self::PackagesInstalled,
            Self::ServiceUnitWritten,
            Self::ServiceEnabled,
            Self::Complete,
        ]
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    /// Attempted to skip one or more stages
    #[error("Cannot skip from {from} to {to} (must transition through intermediate stages)")]
    SkippedStage { from: RunStage, to: RunStage },

    /// Attempted to go backwards (not allowed)
    #[error("Cannot go backwards from {from} to {to} (runs are forward-only)")]
    BackwardTransition { from: RunStage, to: RunStage },

    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: RunStage },

    /// Attempted to transition to the same state
    #[error("Already at stage {stage}")]
    AlreadyAtStage { stage: RunStage },
}

/// One entry of the transition log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: RunStage,
    /// Seconds since the UNIX epoch
    pub at: u64,
}

/// A single, non-resumable provisioning run.
///
/// # Example
///
/// ```
/// use bootprov::run_state::{ProvisioningRun, RunStage};
///
/// let mut run = ProvisioningRun::new();
/// assert_eq!(run.current_stage(), RunStage::Started);
///
/// run.advance().unwrap();
/// assert_eq!(run.current_stage(), RunStage::PackagesInstalled);
///
/// // Cannot skip stages
/// assert!(run.transition_to(RunStage::Complete).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ProvisioningRun {
    current: RunStage,

    /// Stage the run was in when it failed
    failed_at: Option<RunStage>,

    /// Every stage entered, starting with Started
    history: Vec<StageTransition>,
}

impl Default for ProvisioningRun {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisioningRun {
    /// Begin a run in the Started stage
    pub fn new() -> Self {
        let mut run = Self {
            current: RunStage::Started,
            failed_at: None,
            history: Vec::with_capacity(RunStage::all_stages().len()),
        };
        run.record(RunStage::Started);
        tracing::info!(stage = %RunStage::Started, "Provisioning run started");
        run
    }

    #[inline]
    pub fn current_stage(&self) -> RunStage {
        self.current
    }

    #[inline]
    pub fn failed_at(&self) -> Option<RunStage> {
        self.failed_at
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.current == RunStage::Complete
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.current == RunStage::Failed
    }

    /// Stages entered so far, with timestamps
    pub fn history(&self) -> &[StageTransition] {
        &self.history
    }

    /// Advance to the next stage in sequence.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Complete or Failed
    pub fn advance(&mut self) -> Result<RunStage, RunTransitionError> {
        let Some(next_stage) = self.current.next() else {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        };

        self.enter(next_stage);
        Ok(next_stage)
    }

    /// Transition to a specific stage (must be the next stage in sequence).
    ///
    /// # Errors
    ///
    /// - `AlreadyAtStage` if target is the current stage
    /// - `BackwardTransition` if target is before current
    /// - `SkippedStage` if target is not the immediate next stage
    /// - `FromTerminalState` if current is a terminal state
    pub fn transition_to(&mut self, target: RunStage) -> Result<RunStage, RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        }

        if target == self.current {
            return Err(RunTransitionError::AlreadyAtStage { stage: target });
        }

        // Failure goes through fail()
        if target == RunStage::Failed {
            return Err(RunTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        if target.order() < self.current.order() {
            return Err(RunTransitionError::BackwardTransition {
                from: self.current,
                to: target,
            });
        }

        if self.current.next() != Some(target) {
            return Err(RunTransitionError::SkippedStage {
                from: self.current,
                to: target,
            });
        }

        self.enter(target);
        Ok(target)
    }

    /// Mark the run as failed, remembering the stage it was in.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already at Complete or Failed
    pub fn fail(&mut self) -> Result<(), RunTransitionError> {
        if self.current.is_terminal() {
            return Err(RunTransitionError::FromTerminalState { from: self.current });
        }

        self.failed_at = Some(self.current);
        self.enter(RunStage::Failed);
        Ok(())
    }

    fn enter(&mut self, stage: RunStage) {
        tracing::info!(from = %self.current, to = %stage, "Run stage transition");
        self.record(stage);
        self.current = stage;
    }

    fn record(&mut self, stage: RunStage) {
        let at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.history.push(StageTransition { stage, at });
    }
}
