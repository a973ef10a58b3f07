//! Lifecycle hook definitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::manifest::ResourceKey;

/// Lifecycle phase at which a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPhase {
    PreInstall,
    PostInstall,
    PreUpgrade,
    PostUpgrade,
    PreRollback,
    PostRollback,
    PreDelete,
    PostDelete,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreInstall => "pre-install",
            Self::PostInstall => "post-install",
            Self::PreUpgrade => "pre-upgrade",
            Self::PostUpgrade => "post-upgrade",
            Self::PreRollback => "pre-rollback",
            Self::PostRollback => "post-rollback",
            Self::PreDelete => "pre-delete",
            Self::PostDelete => "post-delete",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-install" => Ok(Self::PreInstall),
            "post-install" => Ok(Self::PostInstall),
            "pre-upgrade" => Ok(Self::PreUpgrade),
            "post-upgrade" => Ok(Self::PostUpgrade),
            "pre-rollback" => Ok(Self::PreRollback),
            "post-rollback" => Ok(Self::PostRollback),
            "pre-delete" => Ok(Self::PreDelete),
            "post-delete" => Ok(Self::PostDelete),
            other => Err(other.to_string()),
        }
    }
}

/// When a hook resource is removed from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookDeletePolicy {
    /// Delete a leftover resource with the same identity before creating.
    BeforeHookCreation,
    /// Delete once the hook succeeded.
    HookSucceeded,
    /// Delete once the hook failed.
    HookFailed,
    /// Leave the resource in place.
    Never,
}

impl HookDeletePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeHookCreation => "before-hook-creation",
            Self::HookSucceeded => "hook-succeeded",
            Self::HookFailed => "hook-failed",
            Self::Never => "never",
        }
    }
}

impl FromStr for HookDeletePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "before-hook-creation" => Ok(Self::BeforeHookCreation),
            "hook-succeeded" => Ok(Self::HookSucceeded),
            "hook-failed" => Ok(Self::HookFailed),
            "never" => Ok(Self::Never),
            other => Err(other.to_string()),
        }
    }
}

/// Outcome of the most recent hook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookRunPhase {
    Running,
    Succeeded,
    Failed,
}

/// Record of the most recent execution of a hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookExecution {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub phase: HookRunPhase,
}

/// A resource executed at one or more lifecycle phases.
///
/// Hooks are owned by the release revision that declared them and are
/// persisted only as part of that record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    /// Template path the hook was rendered from.
    pub path: String,
    /// Identity of the hook resource.
    pub key: ResourceKey,
    /// Raw document, as rendered.
    pub manifest: String,
    pub phases: Vec<HookPhase>,
    /// Sort key within a phase, ascending.
    pub weight: i32,
    pub delete_policies: Vec<HookDeletePolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<HookExecution>,
}

impl Hook {
    /// Returns true if the hook runs in the given phase.
    pub fn runs_in(&self, phase: HookPhase) -> bool {
        self.phases.contains(&phase)
    }

    /// Returns true if the hook carries the given delete policy.
    pub fn has_policy(&self, policy: HookDeletePolicy) -> bool {
        self.delete_policies.contains(&policy)
    }

    /// Parse the raw manifest into a JSON object.
    pub fn object(&self) -> Result<serde_json::Value, crate::ManifestError> {
        serde_yaml::from_str(&self.manifest).map_err(|e| crate::ManifestError::Parse {
            source_path: self.path.clone(),
            message: e.to_string(),
        })
    }
}
