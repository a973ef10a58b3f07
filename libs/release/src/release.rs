//! Release records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hook::Hook;

/// Status of a release revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Uninstalling,
    Deployed,
    Failed,
    Superseded,
    Uninstalled,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
            Self::Uninstalling => "uninstalling",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::Superseded => "superseded",
            Self::Uninstalled => "uninstalled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending-install" => Some(Self::PendingInstall),
            "pending-upgrade" => Some(Self::PendingUpgrade),
            "pending-rollback" => Some(Self::PendingRollback),
            "uninstalling" => Some(Self::Uninstalling),
            "deployed" => Some(Self::Deployed),
            "failed" => Some(Self::Failed),
            "superseded" => Some(Self::Superseded),
            "uninstalled" => Some(Self::Uninstalled),
            _ => None,
        }
    }

    /// Returns true while an operation on the release is in flight.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback | Self::Uninstalling
        )
    }
}

impl fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the chart a revision was rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartRef {
    pub name: String,
    pub version: String,
    /// Content digest of the chart.
    pub digest: String,
}

/// Mutable status information of a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub status: ReleaseStatus,
    pub description: String,
    pub first_deployed_at: DateTime<Utc>,
    pub last_deployed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One historical snapshot of a deployment attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// Starts at 1 and increases by one per attempt.
    pub revision: u32,
    pub chart: ChartRef,
    /// Fully merged configuration used to render.
    pub config: serde_json::Value,
    /// Rendered resources, as stored.
    pub manifest: String,
    pub hooks: Vec<Hook>,
    pub info: ReleaseInfo,
}

impl Release {
    pub fn status(&self) -> ReleaseStatus {
        self.info.status
    }

    /// Move the revision to a new status with a description.
    pub fn transition(&mut self, status: ReleaseStatus, description: impl Into<String>) {
        self.info.status = status;
        self.info.description = description.into();
    }

    /// Short label used in logs and errors.
    pub fn label(&self) -> String {
        format!("{}/{}#{}", self.namespace, self.name, self.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ReleaseStatus::PendingInstall).unwrap(),
            "\"pending-install\""
        );
        for status in [
            ReleaseStatus::PendingUpgrade,
            ReleaseStatus::Uninstalling,
            ReleaseStatus::Superseded,
        ] {
            assert_eq!(ReleaseStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_pending_statuses() {
        assert!(ReleaseStatus::PendingRollback.is_pending());
        assert!(ReleaseStatus::Uninstalling.is_pending());
        assert!(!ReleaseStatus::Deployed.is_pending());
        assert!(!ReleaseStatus::Failed.is_pending());
    }
}
