//! RoleBindings granting the addon group access on the hub.
//!
//! Bindings live in the cluster namespace and are named after the addon, the
//! cluster and the kind of role they reference. A binding whose `roleRef` no
//! longer matches is deleted and created again since `roleRef` is immutable.

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use crate::api::addon_template::HubPermissionConfig;
use crate::controllers::hub::HubClient;

use super::{addon_group, owner_labels, owner_selector, RegistrationResult};

static RBAC_GROUP: &str = "rbac.authorization.k8s.io";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleKind {
    ClusterRole,
    Role,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterRole => "ClusterRole",
            Self::Role => "Role",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            Self::ClusterRole => "clusterrole",
            Self::Role => "role",
        }
    }
}

pub fn binding_name(addon: &str, cluster: &str, kind: RoleKind) -> String {
    format!(
        "open-cluster-management:{addon}:{cluster}:{}",
        kind.suffix()
    )
}

/// Bindings the permission block asks for, in the given namespace
pub fn desired_bindings(
    permission: &HubPermissionConfig,
    cluster: &str,
    addon: &str,
    namespace: &str,
) -> Vec<RoleBinding> {
    [
        (RoleKind::ClusterRole, &permission.cluster_role_name),
        (RoleKind::Role, &permission.role_name),
    ]
    .into_iter()
    .filter(|(_, role)| !role.is_empty())
    .map(|(kind, role)| RoleBinding {
        metadata: ObjectMeta {
            name: Some(binding_name(addon, cluster, kind)),
            namespace: Some(namespace.to_string()),
            labels: Some(owner_labels(cluster, addon)),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: kind.as_str().to_string(),
            name: role.clone(),
        },
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_GROUP.to_string()),
            kind: "Group".to_string(),
            name: addon_group(cluster, addon),
            namespace: None,
        }]),
    })
    .collect()
}

/// Make the hub bindings of an addon match its permission block. Idempotent; a
/// missing or empty block leaves the hub untouched.
pub async fn ensure_binding<H: HubClient + ?Sized>(
    hub: &H,
    permission: Option<&HubPermissionConfig>,
    cluster: &str,
    addon: &str,
    namespace: &str,
) -> RegistrationResult<()> {
    let Some(permission) = permission.filter(|p| !p.is_empty()) else {
        return Ok(());
    };

    for desired in desired_bindings(permission, cluster, addon, namespace) {
        let name = desired.name_any();
        match hub.get_role_binding(namespace, &name).await? {
            None => {
                hub.apply_role_binding(&desired).await?;
                info!(binding = name, role = desired.role_ref.name, "created hub binding");
            }
            Some(existing) if existing.role_ref != desired.role_ref => {
                hub.delete_role_binding(namespace, &name).await?;
                hub.apply_role_binding(&desired).await?;
                info!(binding = name, role = desired.role_ref.name, "replaced hub binding");
            }
            Some(existing)
                if existing.subjects != desired.subjects
                    || !desired
                        .labels()
                        .iter()
                        .all(|(k, v)| existing.labels().get(k) == Some(v)) =>
            {
                hub.apply_role_binding(&desired).await?;
                info!(binding = name, "updated hub binding subjects");
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Delete bindings of the addon that are not in `keep`
pub async fn prune_bindings<H: HubClient + ?Sized>(
    hub: &H,
    cluster: &str,
    addon: &str,
    namespace: &str,
    keep: &[String],
) -> RegistrationResult<()> {
    for binding in hub
        .list_role_bindings(namespace, &owner_selector(cluster, addon))
        .await?
    {
        let name = binding.name_any();
        if !keep.contains(&name) {
            hub.delete_role_binding(namespace, &name).await?;
            info!(binding = name, "removed hub binding");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::testing::FakeHub;

    fn permission(cluster_role: &str, role: &str) -> HubPermissionConfig {
        HubPermissionConfig {
            cluster_role_name: cluster_role.into(),
            role_name: role.into(),
        }
    }

    fn binding(hub: &FakeHub, kind: RoleKind) -> Option<RoleBinding> {
        hub.state()
            .role_bindings
            .get(&(
                "cluster1".to_string(),
                binding_name("addon-foo", "cluster1", kind),
            ))
            .cloned()
    }

    #[test]
    fn names_and_subjects() {
        assert_eq!(
            binding_name("addon-foo", "cluster1", RoleKind::ClusterRole),
            "open-cluster-management:addon-foo:cluster1:clusterrole"
        );

        let bindings = desired_bindings(&permission("reader", ""), "cluster1", "addon-foo", "cluster1");
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].role_ref.kind, "ClusterRole");
        let subjects = bindings[0].subjects.clone().unwrap();
        assert_eq!(
            subjects[0].name,
            "system:open-cluster-management:cluster:cluster1:addon:addon-foo"
        );
        assert_eq!(subjects[0].kind, "Group");
    }

    #[tokio::test]
    async fn ensure_binding_is_idempotent() {
        let hub = FakeHub::new();
        let perm = permission("reader", "writer");

        ensure_binding(&hub, Some(&perm), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();
        ensure_binding(&hub, Some(&perm), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();

        let state = hub.state();
        assert_eq!(state.role_bindings.len(), 2);
        assert_eq!(state.role_binding_writes, 2);
        assert_eq!(state.role_binding_deletes, 0);
    }

    #[tokio::test]
    async fn absent_or_empty_permission_is_noop() {
        let hub = FakeHub::new();
        ensure_binding(&hub, None, "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();
        ensure_binding(&hub, Some(&permission("", "")), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();
        assert!(hub.state().role_bindings.is_empty());
    }

    #[tokio::test]
    async fn role_ref_drift_recreates_binding() {
        let hub = FakeHub::new();
        ensure_binding(&hub, Some(&permission("reader", "")), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();
        ensure_binding(&hub, Some(&permission("admin", "")), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();

        let current = binding(&hub, RoleKind::ClusterRole).unwrap();
        assert_eq!(current.role_ref.name, "admin");
        assert_eq!(hub.state().role_binding_deletes, 1);
    }

    #[tokio::test]
    async fn subject_drift_is_repaired() {
        let hub = FakeHub::new();
        let perm = permission("", "writer");
        ensure_binding(&hub, Some(&perm), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();

        {
            let mut state = hub.state();
            let key = (
                "cluster1".to_string(),
                binding_name("addon-foo", "cluster1", RoleKind::Role),
            );
            state.role_bindings.get_mut(&key).unwrap().subjects = None;
        }

        ensure_binding(&hub, Some(&perm), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();
        let current = binding(&hub, RoleKind::Role).unwrap();
        assert_eq!(current.subjects.unwrap().len(), 1);
        assert_eq!(hub.state().role_binding_writes, 2);
        assert_eq!(hub.state().role_binding_deletes, 0);
    }

    #[tokio::test]
    async fn prune_keeps_only_listed_bindings() {
        let hub = FakeHub::new();
        ensure_binding(&hub, Some(&permission("reader", "writer")), "cluster1", "addon-foo", "cluster1")
            .await
            .unwrap();

        let keep = vec![binding_name("addon-foo", "cluster1", RoleKind::Role)];
        prune_bindings(&hub, "cluster1", "addon-foo", "cluster1", &keep)
            .await
            .unwrap();

        assert!(binding(&hub, RoleKind::ClusterRole).is_none());
        assert!(binding(&hub, RoleKind::Role).is_some());
    }
}
