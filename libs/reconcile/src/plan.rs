//! Diff plans between two manifest sets.

use std::collections::{HashMap, HashSet};
use std::fmt;

use keel_release::{ResourceIdentity, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::Resource;
use crate::order::{apply_order, delete_order};

/// Kind of mutation a change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// One planned mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub action: ChangeAction,
    pub key: ResourceKey,
    /// Document to apply; absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
    /// Previously applied document; absent for creates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

/// Ordered mutations turning the previous manifest into the desired one.
///
/// Creates and updates come first, in apply order of the desired set.
/// Deletes follow, in reverse apply order of the previous set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub changes: Vec<Change>,
    /// Resources dropped from the manifest but kept by resource policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kept: Vec<ResourceKey>,
}

impl Plan {
    /// Diff `previous` against `desired`, matching objects by identity.
    pub fn compute(previous: &[Resource], desired: &[Resource]) -> Self {
        let previous_by_identity: HashMap<ResourceIdentity, &Resource> =
            previous.iter().map(|r| (r.identity(), r)).collect();
        let desired_identities: HashSet<ResourceIdentity> =
            desired.iter().map(Resource::identity).collect();

        let desired_refs: Vec<&Resource> = desired.iter().collect();
        let mut changes: Vec<Change> = apply_order(desired_refs, |r| &r.key.kind)
            .into_iter()
            .map(|resource| {
                let prior = previous_by_identity.get(&resource.identity());
                Change {
                    action: if prior.is_some() {
                        ChangeAction::Update
                    } else {
                        ChangeAction::Create
                    },
                    key: resource.key.clone(),
                    desired: Some(resource.object.clone()),
                    previous: prior.map(|p| p.object.clone()),
                }
            })
            .collect();

        let mut kept = Vec::new();
        let removed: Vec<&Resource> = previous
            .iter()
            .filter(|r| !desired_identities.contains(&r.identity()))
            .collect();
        for resource in delete_order(removed, |r| &r.key.kind) {
            if resource.is_kept() {
                kept.push(resource.key.clone());
                continue;
            }
            changes.push(Change {
                action: ChangeAction::Delete,
                key: resource.key.clone(),
                desired: None,
                previous: Some(resource.object.clone()),
            });
        }

        Self { changes, kept }
    }

    /// Plan that creates every resource.
    pub fn install(desired: &[Resource]) -> Self {
        Self::compute(&[], desired)
    }

    /// Plan that deletes every resource not kept by policy.
    pub fn uninstall(previous: &[Resource]) -> Self {
        Self::compute(previous, &[])
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        let count = |action| self.changes.iter().filter(|c| c.action == action).count();
        PlanSummary {
            create: count(ChangeAction::Create),
            update: count(ChangeAction::Update),
            delete: count(ChangeAction::Delete),
            kept: self.kept.len(),
        }
    }
}

/// Change counts of a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub kept: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete",
            self.create, self.update, self.delete
        )?;
        if self.kept > 0 {
            write!(f, ", {} kept", self.kept)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(kind: &str, name: &str, extra: &str) -> Resource {
        let raw = format!("apiVersion: v1\nkind: {kind}\nmetadata:\n  name: {name}\n{extra}");
        Resource::parse(&raw, "default").unwrap()
    }

    #[test]
    fn test_compute_orders_and_classifies() {
        let previous = vec![
            resource("ConfigMap", "cfg", ""),
            resource("Service", "old-svc", ""),
            resource("Secret", "old-secret", ""),
        ];
        let desired = vec![
            resource("Service", "svc", ""),
            resource("Deployment", "web", ""),
            resource("ConfigMap", "cfg", "data:\n  a: b\n"),
        ];

        let plan = Plan::compute(&previous, &desired);
        let steps: Vec<(ChangeAction, &str)> = plan
            .changes
            .iter()
            .map(|c| (c.action, c.key.name.as_str()))
            .collect();
        assert_eq!(
            steps,
            vec![
                (ChangeAction::Update, "cfg"),
                (ChangeAction::Create, "web"),
                (ChangeAction::Create, "svc"),
                (ChangeAction::Delete, "old-svc"),
                (ChangeAction::Delete, "old-secret"),
            ]
        );
        assert_eq!(plan.summary().to_string(), "2 to create, 1 to update, 2 to delete");
    }

    #[test]
    fn test_kept_resources_are_not_deleted() {
        let previous = vec![resource(
            "PersistentVolumeClaim",
            "data",
            "  annotations:\n    keel.sh/resource-policy: keep\n",
        )];

        let plan = Plan::uninstall(&previous);
        assert!(plan.is_empty());
        assert_eq!(plan.kept.len(), 1);
        assert_eq!(plan.summary().kept, 1);
    }
}
