//! Engine errors.

use std::fmt;
use std::time::Duration;

use keel_reconcile::ReconcileError;
use keel_release::{HookPhase, ReleaseStatus, StoreError};
use thiserror::Error;

use crate::render::RenderError;

/// Why an operation could not start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    /// The latest revision is still pending.
    InProgress { revision: u32, status: ReleaseStatus },
    /// Install found a deployed revision.
    AlreadyDeployed { revision: u32 },
    /// Install found history for the name and `replace` was not set.
    NameInUse,
    /// The release has no deployed revision to operate on.
    NotDeployed { latest: u32, status: ReleaseStatus },
    /// The release was already uninstalled.
    AlreadyUninstalled { revision: u32 },
    /// Another operation committed the same revision first.
    RevisionRace { revision: u32 },
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress { revision, status } => {
                write!(f, "another operation is in progress (revision {revision} is {status})")
            }
            Self::AlreadyDeployed { revision } => {
                write!(f, "name is in use by deployed revision {revision}")
            }
            Self::NameInUse => f.write_str("name has history; set replace to reuse it"),
            Self::NotDeployed { latest, status } => {
                write!(f, "no deployed revision (latest is {latest}, {status})")
            }
            Self::AlreadyUninstalled { revision } => {
                write!(f, "already uninstalled at revision {revision}")
            }
            Self::RevisionRace { revision } => {
                write!(f, "revision {revision} was created concurrently")
            }
        }
    }
}

/// Errors returned by engine actions.
///
/// `release` fields hold `namespace/name`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed chart, configuration or manifest. Nothing was changed.
    #[error("{release}: validation failed: {message}")]
    Validation { release: String, message: String },

    /// Rendering failed. Nothing was changed.
    #[error("{release}: render failed: {source}")]
    Render {
        release: String,
        #[source]
        source: RenderError,
    },

    /// A lifecycle hook did not succeed.
    #[error("{release}#{revision}: {phase} hook {hook} failed: {reason}")]
    HookFailure {
        release: String,
        revision: u32,
        phase: HookPhase,
        hook: String,
        reason: String,
    },

    /// The cluster rejected a mutation.
    #[error("{release}#{revision}: {source}")]
    Apply {
        release: String,
        revision: u32,
        #[source]
        source: ReconcileError,
    },

    /// A readiness wait exceeded its timeout.
    #[error("{release}#{revision}: timed out after {elapsed:?} waiting for {resource}")]
    Timeout {
        release: String,
        revision: u32,
        resource: String,
        elapsed: Duration,
    },

    /// The operation cannot proceed given the stored history.
    #[error("{release}: {reason}")]
    Conflict {
        release: String,
        reason: ConflictReason,
    },

    /// The release store failed.
    #[error("{release}: storage error: {source}")]
    Storage {
        release: String,
        #[source]
        source: StoreError,
    },

    /// The release, or the requested revision, does not exist.
    #[error("{release}: {}", not_found_message(.revision))]
    NotFound {
        release: String,
        revision: Option<u32>,
    },

    /// The caller cancelled the operation.
    #[error("{release}#{revision}: cancelled")]
    Cancelled { release: String, revision: u32 },

    /// The operation failed and the cluster was restored.
    #[error("{cause}; {}", rolled_back_message(.restored_revision))]
    RolledBack {
        cause: Box<EngineError>,
        /// Revision left deployed, or `None` if the release was removed.
        restored_revision: Option<u32>,
    },

    /// The operation failed and restoring the cluster failed too.
    #[error("{cause}; rollback also failed: {rollback}")]
    RollbackFailed {
        cause: Box<EngineError>,
        rollback: Box<EngineError>,
    },
}

fn not_found_message(revision: &Option<u32>) -> String {
    match revision {
        Some(r) => format!("revision {r} not found"),
        None => "release not found".to_string(),
    }
}

fn rolled_back_message(restored: &Option<u32>) -> String {
    match restored {
        Some(r) => format!("rolled back to revision {r}"),
        None => "rolled back by removing the release".to_string(),
    }
}

impl EngineError {
    pub(crate) fn storage(release: &str, source: StoreError) -> Self {
        Self::Storage {
            release: release.to_string(),
            source,
        }
    }

    pub(crate) fn conflict(release: &str, reason: ConflictReason) -> Self {
        Self::Conflict {
            release: release.to_string(),
            reason,
        }
    }

    pub(crate) fn validation(release: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            release: release.to_string(),
            message: message.into(),
        }
    }

    /// Map a reconcile failure of revision `revision`.
    pub(crate) fn reconcile(release: &str, revision: u32, source: ReconcileError) -> Self {
        match source {
            ReconcileError::Timeout { resource, elapsed } => Self::Timeout {
                release: release.to_string(),
                revision,
                resource,
                elapsed,
            },
            ReconcileError::Cancelled { .. } => Self::Cancelled {
                release: release.to_string(),
                revision,
            },
            source => Self::Apply {
                release: release.to_string(),
                revision,
                source,
            },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The failure that started a rollback, or `self`.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            Self::RolledBack { cause, .. } | Self::RollbackFailed { cause, .. } => {
                cause.root_cause()
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_mapping() {
        let timeout = EngineError::reconcile(
            "default/demo",
            2,
            ReconcileError::Timeout {
                resource: "apps/v1/Deployment default/web".to_string(),
                elapsed: Duration::from_secs(5),
            },
        );
        assert!(matches!(timeout, EngineError::Timeout { revision: 2, .. }));

        let cancelled = EngineError::reconcile(
            "default/demo",
            2,
            ReconcileError::Cancelled {
                resource: "x".to_string(),
            },
        );
        assert!(matches!(cancelled, EngineError::Cancelled { .. }));
    }

    #[test]
    fn test_rolled_back_message_and_cause() {
        let cause = EngineError::HookFailure {
            release: "default/demo".to_string(),
            revision: 3,
            phase: HookPhase::PostUpgrade,
            hook: "batch/v1/Job default/check".to_string(),
            reason: "BackoffLimitExceeded".to_string(),
        };
        let err = EngineError::RolledBack {
            cause: Box::new(cause),
            restored_revision: Some(2),
        };
        assert!(err.to_string().ends_with("rolled back to revision 2"));
        assert!(matches!(err.root_cause(), EngineError::HookFailure { .. }));

        let missing = EngineError::NotFound {
            release: "default/demo".to_string(),
            revision: Some(9),
        };
        assert_eq!(missing.to_string(), "default/demo: revision 9 not found");
    }
}
