use crate::task::{Outcome, OutcomeStatus, Step};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use stockpile_schema::Progress;
use stockpile_store::InstalledRecord;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Installing,
    Uninstalling,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Installing => write!(f, "installing"),
            Operation::Uninstalling => write!(f, "uninstalling"),
        }
    }
}

/// Installed state of one inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ItemState {
    NotInstalled,
    Installed {
        version_code: u64,
        version_name: String,
    },
    Failed {
        operation: Operation,
        steps: Vec<Step>,
    },
    Operating {
        operation: Operation,
        progress: Progress,
    },
}

impl ItemState {
    /// Initial state from the host's installed facts.
    pub fn seed(installed: Option<&InstalledRecord>) -> Self {
        match installed {
            Some(record) => ItemState::Installed {
                version_code: record.version_code,
                version_name: record.version_name.clone(),
            },
            None => ItemState::NotInstalled,
        }
    }

    pub fn is_operating(&self) -> bool {
        matches!(self, ItemState::Operating { .. })
    }

    pub fn installed_version(&self) -> Option<u64> {
        match self {
            ItemState::Installed { version_code, .. } => Some(*version_code),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ItemState::NotInstalled => "not_installed",
            ItemState::Installed { .. } => "installed",
            ItemState::Failed { .. } => "failed",
            ItemState::Operating { .. } => "operating",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Installed { version_name, .. } => write!(f, "installed ({version_name})"),
            ItemState::Failed { operation, .. } => write!(f, "failed ({operation})"),
            ItemState::Operating { operation, .. } => write!(f, "{operation}"),
            other => f.write_str(other.name()),
        }
    }
}

/// Check that `operation` may start from `state`.
///
/// Installing is allowed from any settled state (reinstall and upgrade
/// included). Uninstalling needs the package to be installed on the host.
pub fn validate_start(
    state: &ItemState,
    operation: Operation,
    installed: Option<&InstalledRecord>,
) -> Result<(), CoreError> {
    let valid = match (state, operation) {
        (ItemState::Operating { .. }, _) => false,
        (_, Operation::Installing) => true,
        (_, Operation::Uninstalling) => installed.is_some(),
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: state.to_string(),
            to: operation.to_string(),
        })
    }
}

/// State after a pipeline run for `operation` finished with `outcome`.
///
/// A cancelled install always lands on `NotInstalled`; a cancelled
/// uninstall falls back to whatever the host reports.
pub fn finish<A>(
    operation: Operation,
    outcome: &Outcome<A>,
    installed: Option<&InstalledRecord>,
) -> ItemState {
    match (outcome.status(), operation) {
        (OutcomeStatus::Succeeded, Operation::Installing) => ItemState::seed(installed),
        (OutcomeStatus::Succeeded, Operation::Uninstalling) => ItemState::NotInstalled,
        (OutcomeStatus::Failed, _) => ItemState::Failed {
            operation,
            steps: outcome.steps().to_vec(),
        },
        (OutcomeStatus::Cancelled, Operation::Installing) => ItemState::NotInstalled,
        (OutcomeStatus::Cancelled, Operation::Uninstalling) => ItemState::seed(installed),
    }
}

/// Update lifecycle of one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RepositoryState {
    Idle,
    Updating,
    UpdateFailed { steps: Vec<Step> },
}

impl RepositoryState {
    pub fn is_updating(&self) -> bool {
        matches!(self, RepositoryState::Updating)
    }

    /// State after an update finished with `outcome`.
    pub fn after_update<A>(outcome: &Outcome<A>) -> Self {
        match outcome {
            Outcome::Failed { steps } => RepositoryState::UpdateFailed {
                steps: steps.clone(),
            },
            Outcome::Succeeded { .. } | Outcome::Cancelled { .. } => RepositoryState::Idle,
        }
    }
}

impl fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryState::Idle => write!(f, "idle"),
            RepositoryState::Updating => write!(f, "updating"),
            RepositoryState::UpdateFailed { .. } => write!(f, "update failed"),
        }
    }
}
