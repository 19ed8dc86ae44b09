//! RBAC for curation jobs
//!
//! Every namespace that holds a ClusterCurator needs a ServiceAccount for the
//! curation job plus a Role/RoleBinding granting it access to the resources
//! the curation steps touch. Objects are applied with server-side apply, so
//! applying them again is a no-op and never fails because they exist.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde::Serialize;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::{Error, CURATOR_ROLE, FIELD_MANAGER};

/// Ensures namespace-scoped permissions for curation jobs exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacProvisioner: Send + Sync {
    /// Apply the ServiceAccount, Role and RoleBinding in `namespace`
    ///
    /// Must succeed when the objects already exist.
    async fn apply(&self, namespace: &str) -> Result<(), Error>;
}

/// Server-side-apply implementation against the Kubernetes API
pub struct KubeRbacProvisioner {
    client: Client,
    service_account: String,
}

impl KubeRbacProvisioner {
    /// Create a provisioner binding the curator Role to `service_account`
    pub fn new(client: Client, service_account: impl Into<String>) -> Self {
        Self {
            client,
            service_account: service_account.into(),
        }
    }

    async fn apply_one<K>(&self, namespace: &str, name: &str, obj: &K) -> Result<(), Error>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + Serialize
            + serde::de::DeserializeOwned,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(obj))
            .await
            .map_err(|e| Error::rbac(namespace, e))?;
        debug!(namespace, name, kind = %K::kind(&Default::default()), "applied");
        Ok(())
    }
}

#[async_trait]
impl RbacProvisioner for KubeRbacProvisioner {
    async fn apply(&self, namespace: &str) -> Result<(), Error> {
        self.apply_one(
            namespace,
            &self.service_account,
            &service_account(namespace, &self.service_account),
        )
        .await?;
        self.apply_one(namespace, CURATOR_ROLE, &curator_role(namespace))
            .await?;
        self.apply_one(
            namespace,
            CURATOR_ROLE,
            &curator_role_binding(namespace, &self.service_account),
        )
        .await?;

        info!(namespace, service_account = %self.service_account, "curation RBAC applied");
        Ok(())
    }
}

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

const READ: &[&str] = &["get", "list", "watch"];
const READ_WRITE: &[&str] = &["get", "list", "watch", "create", "update", "patch"];

/// ServiceAccount the curation job runs as
pub fn service_account(namespace: &str, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(crate::managed_labels()),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Role granting what the curation steps need inside the namespace
pub fn curator_role(namespace: &str) -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some(CURATOR_ROLE.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(crate::managed_labels()),
            ..Default::default()
        },
        rules: Some(vec![
            // Curation steps read hook settings and report progress on the curator
            rule(
                "cluster.open-cluster-management.io",
                &["clustercurators", "clustercurators/status"],
                READ_WRITE,
            ),
            // Provisioning credentials and hook configuration
            rule("", &["secrets", "configmaps"], READ_WRITE),
            rule("", &["pods", "pods/log"], READ),
            rule("", &["events"], &["create", "patch"]),
            rule("batch", &["jobs"], READ),
            // Cluster provisioning
            rule(
                "hive.openshift.io",
                &["clusterdeployments", "machinepools"],
                &["get", "list", "watch", "create", "update", "patch", "delete"],
            ),
            // Pre/post hooks
            rule("tower.ansible.com", &["ansiblejobs"], READ_WRITE),
        ]),
    }
}

/// RoleBinding granting the curator Role to the job ServiceAccount
pub fn curator_role_binding(namespace: &str, service_account: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(CURATOR_ROLE.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(crate::managed_labels()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: CURATOR_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_account_lives_in_curator_namespace() {
        let sa = service_account("ns1", "cluster-installer");
        assert_eq!(sa.metadata.name.as_deref(), Some("cluster-installer"));
        assert_eq!(sa.metadata.namespace.as_deref(), Some("ns1"));
        assert!(sa
            .metadata
            .labels
            .unwrap()
            .contains_key("app.kubernetes.io/managed-by"));
    }

    #[test]
    fn role_grants_curator_and_job_access() {
        let role = curator_role("ns1");
        assert_eq!(role.metadata.name.as_deref(), Some(CURATOR_ROLE));
        let rules = role.rules.unwrap();

        let grants = |group: &str, resource: &str, verb: &str| {
            rules.iter().any(|r| {
                r.api_groups.as_ref().is_some_and(|g| g.iter().any(|x| x == group))
                    && r.resources
                        .as_ref()
                        .is_some_and(|res| res.iter().any(|x| x == resource))
                    && r.verbs.iter().any(|v| v == verb)
            })
        };

        assert!(grants("cluster.open-cluster-management.io", "clustercurators", "patch"));
        assert!(grants("", "secrets", "get"));
        assert!(grants("batch", "jobs", "watch"));
        assert!(grants("hive.openshift.io", "clusterdeployments", "delete"));
        assert!(!grants("batch", "jobs", "delete"));
    }

    #[test]
    fn binding_targets_role_and_service_account() {
        let binding = curator_role_binding("ns1", "cluster-installer");
        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(binding.role_ref.name, CURATOR_ROLE);

        let subjects = binding.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].name, "cluster-installer");
        assert_eq!(subjects[0].namespace.as_deref(), Some("ns1"));
    }

    #[test]
    fn objects_serialize_for_server_side_apply() {
        // SSA requires apiVersion/kind in the body
        let role = serde_json::to_value(curator_role("ns1")).unwrap();
        assert_eq!(role["apiVersion"], "rbac.authorization.k8s.io/v1");
        assert_eq!(role["kind"], "Role");

        let sa = serde_json::to_value(service_account("ns1", "cluster-installer")).unwrap();
        assert_eq!(sa["apiVersion"], "v1");
        assert_eq!(sa["kind"], "ServiceAccount");
    }
}
