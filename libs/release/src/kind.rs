//! Typed resource kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a manifest document.
///
/// Well-known kinds get their own variant so ordering and scoping decisions
/// are explicit lookups; anything else is carried as [`ResourceKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    Namespace,
    CustomResourceDefinition,
    ResourceQuota,
    LimitRange,
    PodDisruptionBudget,
    ServiceAccount,
    Secret,
    ConfigMap,
    StorageClass,
    PersistentVolume,
    PersistentVolumeClaim,
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
    DaemonSet,
    Pod,
    ReplicaSet,
    Deployment,
    HorizontalPodAutoscaler,
    StatefulSet,
    Job,
    CronJob,
    NetworkPolicy,
    Service,
    IngressClass,
    Ingress,
    ApiService,
    Other(String),
}

impl ResourceKind {
    /// Parse a `kind` field value.
    pub fn from_name(name: &str) -> Self {
        match name {
            "Namespace" => Self::Namespace,
            "CustomResourceDefinition" => Self::CustomResourceDefinition,
            "ResourceQuota" => Self::ResourceQuota,
            "LimitRange" => Self::LimitRange,
            "PodDisruptionBudget" => Self::PodDisruptionBudget,
            "ServiceAccount" => Self::ServiceAccount,
            "Secret" => Self::Secret,
            "ConfigMap" => Self::ConfigMap,
            "StorageClass" => Self::StorageClass,
            "PersistentVolume" => Self::PersistentVolume,
            "PersistentVolumeClaim" => Self::PersistentVolumeClaim,
            "ClusterRole" => Self::ClusterRole,
            "ClusterRoleBinding" => Self::ClusterRoleBinding,
            "Role" => Self::Role,
            "RoleBinding" => Self::RoleBinding,
            "DaemonSet" => Self::DaemonSet,
            "Pod" => Self::Pod,
            "ReplicaSet" => Self::ReplicaSet,
            "Deployment" => Self::Deployment,
            "HorizontalPodAutoscaler" => Self::HorizontalPodAutoscaler,
            "StatefulSet" => Self::StatefulSet,
            "Job" => Self::Job,
            "CronJob" => Self::CronJob,
            "NetworkPolicy" => Self::NetworkPolicy,
            "Service" => Self::Service,
            "IngressClass" => Self::IngressClass,
            "Ingress" => Self::Ingress,
            "APIService" => Self::ApiService,
            other => Self::Other(other.to_string()),
        }
    }

    /// The `kind` field value.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Namespace => "Namespace",
            Self::CustomResourceDefinition => "CustomResourceDefinition",
            Self::ResourceQuota => "ResourceQuota",
            Self::LimitRange => "LimitRange",
            Self::PodDisruptionBudget => "PodDisruptionBudget",
            Self::ServiceAccount => "ServiceAccount",
            Self::Secret => "Secret",
            Self::ConfigMap => "ConfigMap",
            Self::StorageClass => "StorageClass",
            Self::PersistentVolume => "PersistentVolume",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
            Self::DaemonSet => "DaemonSet",
            Self::Pod => "Pod",
            Self::ReplicaSet => "ReplicaSet",
            Self::Deployment => "Deployment",
            Self::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            Self::StatefulSet => "StatefulSet",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
            Self::NetworkPolicy => "NetworkPolicy",
            Self::Service => "Service",
            Self::IngressClass => "IngressClass",
            Self::Ingress => "Ingress",
            Self::ApiService => "APIService",
            Self::Other(name) => name,
        }
    }

    /// Returns true for kinds that are not namespaced.
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            Self::Namespace
                | Self::CustomResourceDefinition
                | Self::StorageClass
                | Self::PersistentVolume
                | Self::ClusterRole
                | Self::ClusterRoleBinding
                | Self::IngressClass
                | Self::ApiService
        )
    }

    /// Returns true for kinds that run pods and report readiness.
    pub fn is_workload(&self) -> bool {
        matches!(
            self,
            Self::DaemonSet
                | Self::Pod
                | Self::ReplicaSet
                | Self::Deployment
                | Self::StatefulSet
                | Self::Job
        )
    }

    /// Returns true for kinds that run to completion (succeed or fail).
    pub fn runs_to_completion(&self) -> bool {
        matches!(self, Self::Job | Self::Pod)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ResourceKind {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_kind_roundtrip() {
        for name in ["Namespace", "Deployment", "APIService", "Ingress"] {
            assert_eq!(ResourceKind::from_name(name).as_str(), name);
        }
    }

    #[test]
    fn test_unknown_kind_is_preserved() {
        let kind = ResourceKind::from_name("Certificate");
        assert_eq!(kind, ResourceKind::Other("Certificate".to_string()));
        assert_eq!(kind.to_string(), "Certificate");
    }

    #[test]
    fn test_kind_serializes_as_plain_string() {
        let json = serde_json::to_string(&ResourceKind::ApiService).unwrap();
        assert_eq!(json, "\"APIService\"");
        let parsed: ResourceKind = serde_json::from_str("\"ConfigMap\"").unwrap();
        assert_eq!(parsed, ResourceKind::ConfigMap);
    }

    #[test]
    fn test_scoping() {
        assert!(ResourceKind::Namespace.is_cluster_scoped());
        assert!(!ResourceKind::ConfigMap.is_cluster_scoped());
        assert!(ResourceKind::Deployment.is_workload());
        assert!(!ResourceKind::Service.is_workload());
        assert!(ResourceKind::Job.runs_to_completion());
    }
}
