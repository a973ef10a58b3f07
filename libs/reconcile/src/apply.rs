//! Executing plans against a cluster.

use std::time::Duration;

use keel_release::{annotations, ResourceKey};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{ClusterClient, Resource};
use crate::error::{ClusterError, ReconcileError};
use crate::merge::{is_empty_patch, three_way_merge};
use crate::plan::{Change, ChangeAction, Plan};
use crate::wait::Waiter;

/// Release that owns the applied objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub name: String,
    pub namespace: String,
}

impl Owner {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Stamp ownership annotations onto a document.
    pub fn stamp(&self, key: &ResourceKey, object: &Value) -> Value {
        let mut resource = Resource::new(key.clone(), object.clone());
        resource.set_annotation(annotations::RELEASE_NAME, &self.name);
        resource.set_annotation(annotations::RELEASE_NAMESPACE, &self.namespace);
        resource.object
    }

    /// Returns true if the live object carries this owner's annotations.
    pub fn owns(&self, live: &Resource) -> bool {
        live.annotation(annotations::RELEASE_NAME) == Some(self.name.as_str())
            && live.annotation(annotations::RELEASE_NAMESPACE) == Some(self.namespace.as_str())
    }

    fn describe(live: &Resource) -> String {
        match (
            live.annotation(annotations::RELEASE_NAMESPACE),
            live.annotation(annotations::RELEASE_NAME),
        ) {
            (Some(ns), Some(name)) => format!("{ns}/{name}"),
            _ => "none".to_string(),
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// What an apply run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplyReport {
    pub created: Vec<ResourceKey>,
    pub updated: Vec<ResourceKey>,
    /// Deleted and created again because an immutable field changed.
    pub recreated: Vec<ResourceKey>,
    pub unchanged: Vec<ResourceKey>,
    pub deleted: Vec<ResourceKey>,
}

impl ApplyReport {
    /// Resources whose live state was created or changed, in apply order.
    pub fn mutated(&self) -> impl Iterator<Item = &ResourceKey> {
        self.created
            .iter()
            .chain(&self.updated)
            .chain(&self.recreated)
    }
}

/// Applies plans in order, one mutation at a time.
pub struct Applier<'a> {
    cluster: &'a dyn ClusterClient,
    owner: Owner,
    force: bool,
    timeout: Duration,
    waiter: Waiter<'a>,
}

impl<'a> Applier<'a> {
    /// `waiter` is used when `force` needs to wait for a deletion.
    pub fn new(cluster: &'a dyn ClusterClient, owner: Owner, waiter: Waiter<'a>) -> Self {
        Self {
            cluster,
            owner,
            force: false,
            timeout: Duration::from_secs(300),
            waiter,
        }
    }

    /// Replace objects whose update is rejected for an immutable field.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Apply every change of `plan`, stopping at the first failure.
    #[instrument(skip(self, plan), fields(release = %self.owner, changes = plan.changes.len()))]
    pub async fn apply(&self, plan: &Plan) -> Result<ApplyReport, ReconcileError> {
        let mut report = ApplyReport::default();

        for change in &plan.changes {
            match change.action {
                ChangeAction::Create | ChangeAction::Update => {
                    self.apply_one(change, &mut report).await?
                }
                ChangeAction::Delete => self.delete_one(&change.key, &mut report).await?,
            }
        }

        for key in &plan.kept {
            info!(resource = %key, "Keeping resource per resource policy");
        }
        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            recreated = report.recreated.len(),
            deleted = report.deleted.len(),
            "Applied plan"
        );
        Ok(report)
    }

    async fn apply_one(
        &self,
        change: &Change,
        report: &mut ApplyReport,
    ) -> Result<(), ReconcileError> {
        let key = &change.key;
        let Some(desired) = &change.desired else {
            return Ok(());
        };
        let desired = self.owner.stamp(key, desired);
        let previous = change
            .previous
            .as_ref()
            .map(|previous| self.owner.stamp(key, previous));

        let live = match self.cluster.get(key).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                self.create(key, desired).await?;
                report.created.push(key.clone());
                return Ok(());
            }
            Err(e) => return Err(apply_error(key, e)),
        };

        // Objects we did not apply before must already be ours to touch.
        if change.action == ChangeAction::Create && !self.owner.owns(&live) {
            return Err(ReconcileError::Ownership {
                resource: key.to_string(),
                release: self.owner.to_string(),
                owner: Owner::describe(&live),
            });
        }
        if change.action == ChangeAction::Create {
            info!(resource = %key, "Adopting existing resource");
        }

        let patch = three_way_merge(previous.as_ref(), &desired, &live.object);
        if is_empty_patch(&patch) {
            debug!(resource = %key, "Resource unchanged");
            report.unchanged.push(key.clone());
            return Ok(());
        }

        match self.cluster.update(key, &patch).await {
            Ok(_) => {
                debug!(resource = %key, "Patched resource");
                report.updated.push(key.clone());
                Ok(())
            }
            Err(ClusterError::Immutable { field, .. }) if self.force => {
                warn!(resource = %key, field = %field, "Immutable field changed, recreating");
                self.cluster
                    .delete(key)
                    .await
                    .or_else(ignore_not_found)
                    .map_err(|e| apply_error(key, e))?;
                self.waiter.wait_deleted(key, self.timeout).await?;
                self.create(key, desired).await?;
                report.recreated.push(key.clone());
                Ok(())
            }
            Err(e) => Err(apply_error(key, e)),
        }
    }

    async fn create(&self, key: &ResourceKey, object: Value) -> Result<(), ReconcileError> {
        let resource = Resource::new(key.clone(), object);
        self.cluster
            .create(&resource)
            .await
            .map_err(|e| apply_error(key, e))?;
        debug!(resource = %key, "Created resource");
        Ok(())
    }

    async fn delete_one(
        &self,
        key: &ResourceKey,
        report: &mut ApplyReport,
    ) -> Result<(), ReconcileError> {
        match self.cluster.delete(key).await {
            Ok(()) => {
                debug!(resource = %key, "Deleted resource");
                report.deleted.push(key.clone());
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(resource = %key, "Resource already gone");
                Ok(())
            }
            Err(e) => Err(apply_error(key, e)),
        }
    }
}

fn ignore_not_found(err: ClusterError) -> Result<(), ClusterError> {
    if err.is_not_found() {
        Ok(())
    } else {
        Err(err)
    }
}

fn apply_error(key: &ResourceKey, source: ClusterError) -> ReconcileError {
    ReconcileError::Apply {
        resource: key.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{ClusterEvent, FakeCluster, Operation};
    use serde_json::json;

    fn resource(raw: &str) -> Resource {
        Resource::parse(raw, "default").unwrap()
    }

    const CONFIG: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  mode: fast\n";
    const WEB: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 2\n  selector:\n    app: web\n";

    fn applier(cluster: &FakeCluster) -> Applier<'_> {
        Applier::new(cluster, Owner::new("demo", "default"), Waiter::new(cluster))
    }

    #[tokio::test]
    async fn test_install_creates_in_order_with_ownership() {
        let cluster = FakeCluster::new();
        let plan = Plan::install(&[resource(WEB), resource(CONFIG)]);

        let report = applier(&cluster).apply(&plan).await.unwrap();
        assert_eq!(report.created.len(), 2);

        let journal = cluster.journal();
        assert_eq!(journal[0].key().name, "cfg");
        assert_eq!(journal[1].key().name, "web");

        let live = cluster.object("Deployment", "web").unwrap();
        assert_eq!(live["metadata"]["annotations"]["keel.sh/release-name"], "demo");
    }

    #[tokio::test]
    async fn test_upgrade_preserves_external_changes() {
        let cluster = FakeCluster::new();
        let v1 = resource(WEB);
        applier(&cluster).apply(&Plan::install(&[v1.clone()])).await.unwrap();

        // An autoscaler writes a field that no manifest mentions.
        cluster.modify("Deployment", "web", |obj| {
            obj["status"] = json!({"observedReplicas": 4});
        });

        let v2 = resource(&WEB.replace("replicas: 2", "replicas: 3"));
        let report = applier(&cluster)
            .apply(&Plan::compute(&[v1], &[v2]))
            .await
            .unwrap();
        assert_eq!(report.updated.len(), 1);

        let live = cluster.object("Deployment", "web").unwrap();
        assert_eq!(live["spec"]["replicas"], 3);
        assert_eq!(live["status"]["observedReplicas"], 4);
    }

    #[tokio::test]
    async fn test_unchanged_resources_are_not_patched() {
        let cluster = FakeCluster::new();
        let v1 = resource(CONFIG);
        applier(&cluster).apply(&Plan::install(&[v1.clone()])).await.unwrap();
        cluster.clear_journal();

        let report = applier(&cluster)
            .apply(&Plan::compute(&[v1.clone()], &[v1]))
            .await
            .unwrap();
        assert_eq!(report.unchanged.len(), 1);
        assert!(cluster.journal().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_to_adopt_foreign_object() {
        let cluster = FakeCluster::new();
        cluster.insert(resource(CONFIG));

        let err = applier(&cluster)
            .apply(&Plan::install(&[resource(CONFIG)]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Ownership { ref owner, .. } if owner == "none"));
    }

    #[tokio::test]
    async fn test_adopts_object_owned_by_same_release() {
        let cluster = FakeCluster::new();
        let owner = Owner::new("demo", "default");
        let mut leftover = resource(CONFIG);
        leftover.object = owner.stamp(&leftover.key, &leftover.object);
        cluster.insert(leftover);

        let report = applier(&cluster)
            .apply(&Plan::install(&[resource(CONFIG)]))
            .await
            .unwrap();
        assert_eq!(report.unchanged.len(), 1);
    }

    #[tokio::test]
    async fn test_force_recreates_on_immutable_field() {
        let cluster = FakeCluster::new();
        cluster.immutable_field("Deployment", "/spec/selector");
        let v1 = resource(WEB);
        applier(&cluster).apply(&Plan::install(&[v1.clone()])).await.unwrap();

        let v2 = resource(&WEB.replace("app: web", "app: web2"));
        let plan = Plan::compute(&[v1], &[v2]);

        let err = applier(&cluster).apply(&plan).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Apply {
                source: ClusterError::Immutable { .. },
                ..
            }
        ));

        cluster.clear_journal();
        let report = applier(&cluster).with_force(true).apply(&plan).await.unwrap();
        assert_eq!(report.recreated.len(), 1);
        assert!(matches!(cluster.journal()[0], ClusterEvent::Deleted(_)));
        assert!(matches!(cluster.journal()[1], ClusterEvent::Created(_)));
        assert_eq!(
            cluster.object("Deployment", "web").unwrap()["spec"]["selector"]["app"],
            "web2"
        );
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let cluster = FakeCluster::new();
        cluster.fail(
            Operation::Create,
            "ConfigMap",
            "cfg",
            ClusterError::Rejected {
                resource: "cfg".to_string(),
                message: "quota exceeded".to_string(),
            },
        );

        let err = applier(&cluster)
            .apply(&Plan::install(&[resource(CONFIG), resource(WEB)]))
            .await
            .unwrap_err();
        assert_eq!(err.resource(), "v1/ConfigMap default/cfg");
        assert!(!cluster.contains("Deployment", "web"));
    }
}
