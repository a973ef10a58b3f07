//! Kind-priority apply ordering.
//!
//! Resources are grouped by kind into tiers. Lower tiers are applied
//! first; within a tier, declaration order is kept. Deletion runs the exact
//! reverse of the apply order.

use keel_release::ResourceKind;

/// Apply tier of a kind, lowest first.
pub fn tier(kind: &ResourceKind) -> usize {
    use ResourceKind::*;

    match kind {
        Namespace | CustomResourceDefinition => 0,
        ResourceQuota | LimitRange | PodDisruptionBudget | ServiceAccount | Secret | ConfigMap
        | StorageClass | PersistentVolume | PersistentVolumeClaim | ClusterRole
        | ClusterRoleBinding | Role | RoleBinding => 1,
        DaemonSet | Pod | ReplicaSet | Deployment | HorizontalPodAutoscaler | StatefulSet | Job
        | CronJob => 2,
        NetworkPolicy | Service => 3,
        IngressClass | Ingress | ApiService => 4,
        Other(_) => 5,
    }
}

/// Sort items into apply order. The sort is stable.
pub fn apply_order<T>(mut items: Vec<T>, kind: impl Fn(&T) -> &ResourceKind) -> Vec<T> {
    items.sort_by_key(|item| tier(kind(item)));
    items
}

/// Sort items into delete order: the reverse of [`apply_order`].
pub fn delete_order<T>(items: Vec<T>, kind: impl Fn(&T) -> &ResourceKind) -> Vec<T> {
    let mut items = apply_order(items, kind);
    items.reverse();
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ResourceKind::Namespace, ResourceKind::ConfigMap)]
    #[case(ResourceKind::CustomResourceDefinition, ResourceKind::Deployment)]
    #[case(ResourceKind::Secret, ResourceKind::StatefulSet)]
    #[case(ResourceKind::Deployment, ResourceKind::Service)]
    #[case(ResourceKind::Service, ResourceKind::Ingress)]
    #[case(ResourceKind::Ingress, ResourceKind::Other("Widget".to_string()))]
    fn test_tier_precedence(#[case] first: ResourceKind, #[case] second: ResourceKind) {
        assert!(tier(&first) < tier(&second), "{first} should precede {second}");
    }

    #[test]
    fn test_declaration_order_within_tier() {
        let items = vec![
            ("ingress", ResourceKind::Ingress),
            ("cm-b", ResourceKind::ConfigMap),
            ("deploy", ResourceKind::Deployment),
            ("secret-a", ResourceKind::Secret),
            ("svc", ResourceKind::Service),
            ("ns", ResourceKind::Namespace),
        ];

        let ordered: Vec<_> = apply_order(items.clone(), |(_, k)| k)
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(ordered, vec!["ns", "cm-b", "secret-a", "deploy", "svc", "ingress"]);

        let deleted: Vec<_> = delete_order(items, |(_, k)| k)
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(deleted, vec!["ingress", "svc", "deploy", "secret-a", "cm-b", "ns"]);
    }
}
