//! Cluster client interface.
//!
//! The engine never talks to a cluster API directly. Everything it needs is
//! expressed by [`ClusterClient`]: validating documents into typed
//! resources, CRUD on single objects, and a status probe that the
//! [`Waiter`](crate::Waiter) polls.

use async_trait::async_trait;
use keel_release::{annotations, ManifestEntry, ResourceIdentity, ResourceKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ClusterError;

/// A typed cluster object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ResourceKey,
    pub object: Value,
}

impl Resource {
    pub fn new(key: ResourceKey, object: Value) -> Self {
        Self { key, object }
    }

    /// Parse a single YAML document.
    pub fn parse(raw: &str, default_namespace: &str) -> Result<Self, ClusterError> {
        let invalid = |message: String| ClusterError::Invalid { message };

        let object: Value = serde_yaml::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        if !object.is_object() {
            return Err(invalid("document is not a mapping".to_string()));
        }
        let key = ResourceKey::from_object("", &object, default_namespace)
            .map_err(|e| invalid(e.to_string()))?;
        Ok(Self { key, object })
    }

    /// Build from an already parsed manifest entry.
    pub fn from_entry(entry: &ManifestEntry) -> Self {
        Self {
            key: entry.key.clone(),
            object: entry.object.clone(),
        }
    }

    pub fn identity(&self) -> ResourceIdentity {
        self.key.identity()
    }

    /// Value of a `metadata.annotations` entry.
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.object
            .get("metadata")?
            .get("annotations")?
            .get(name)?
            .as_str()
    }

    /// Set a `metadata.annotations` entry, creating the maps as needed.
    pub fn set_annotation(&mut self, name: &str, value: &str) {
        let Some(object) = self.object.as_object_mut() else {
            return;
        };
        let metadata = object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(metadata) = metadata.as_object_mut() else {
            return;
        };
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Map::new()));
        if !annotations.is_object() {
            *annotations = Value::Object(Map::new());
        }
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(name.to_string(), Value::String(value.to_string()));
        }
    }

    /// Returns true if the resource must survive deletion of its release.
    pub fn is_kept(&self) -> bool {
        self.annotation(annotations::RESOURCE_POLICY) == Some(annotations::RESOURCE_POLICY_KEEP)
    }
}

/// Observed state of an object, as reported by [`ClusterClient::state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Exists but has not converged yet.
    Pending,
    /// Serving as desired.
    Ready,
    /// Ran to completion successfully (jobs, pods).
    Succeeded,
    /// Ran to completion unsuccessfully, or cannot become ready.
    Failed(String),
}

impl ResourceState {
    /// Returns true for `Succeeded` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed(_))
    }
}

/// Operations the engine needs from a cluster API.
///
/// Objects are addressed by [`ResourceKey`]; implementations must resolve
/// them independently of the API version so that a chart moving between
/// versions of the same kind keeps addressing the same object.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Validate a raw document and turn it into a typed resource.
    ///
    /// Does not mutate the cluster. Fails with [`ClusterError::Invalid`].
    async fn build(&self, raw: &str, default_namespace: &str) -> Result<Resource, ClusterError>;

    /// Fetch the live object. Fails with [`ClusterError::NotFound`].
    async fn get(&self, key: &ResourceKey) -> Result<Resource, ClusterError>;

    /// Create an object. Fails with [`ClusterError::AlreadyExists`].
    async fn create(&self, resource: &Resource) -> Result<Resource, ClusterError>;

    /// Apply a JSON merge patch to the live object.
    ///
    /// Fails with [`ClusterError::Immutable`] if the patch changes a field
    /// that is fixed after creation.
    async fn update(&self, key: &ResourceKey, patch: &Value) -> Result<Resource, ClusterError>;

    /// Request deletion. Removal may complete asynchronously.
    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError>;

    /// Probe the object's readiness or completion.
    async fn state(&self, key: &ResourceKey) -> Result<ResourceState, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_release::ResourceKind;

    #[test]
    fn test_parse_and_annotate() {
        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  a: b\n";
        let mut resource = Resource::parse(raw, "apps").unwrap();
        assert_eq!(resource.key.kind, ResourceKind::ConfigMap);
        assert_eq!(resource.key.namespace.as_deref(), Some("apps"));
        assert_eq!(resource.annotation("x"), None);

        resource.set_annotation("keel.sh/release-name", "demo");
        assert_eq!(resource.annotation("keel.sh/release-name"), Some("demo"));
        assert_eq!(resource.object["data"]["a"], "b");
    }

    #[test]
    fn test_parse_rejects_scalars() {
        let err = Resource::parse("just a string", "default").unwrap_err();
        assert!(matches!(err, ClusterError::Invalid { .. }));
    }
}
