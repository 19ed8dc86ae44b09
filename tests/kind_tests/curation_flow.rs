//! Integration tests for the curation flow
//!
//! These tests reconcile real ClusterCurators against a kind API server and
//! check what the controller leaves behind: RBAC in the curator's namespace,
//! exactly one curation Job, and `spec.curatingJob` pointing at it.

use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::Client;

use curator::config::ControllerConfig;
use curator::controller::{reconcile_curator, Context};
use curator::crd::{ClusterCurator, ClusterCuratorSpec, CuratorRef};
use curator::events::NoopEventPublisher;
use curator::launcher::CURATOR_LABEL;
use curator::rbac::{KubeRbacProvisioner, RbacProvisioner};
use curator::{CURATOR_ROLE, DEFAULT_SERVICE_ACCOUNT};

use super::helpers::{
    cleanup_namespace, create_curator, ensure_test_cluster, fresh_namespace, TEST_IMAGE,
};

fn context(client: &Client) -> Context {
    Context::builder(client.clone(), ControllerConfig::new(TEST_IMAGE))
        .instance("curator-integration-test")
        .build()
}

async fn jobs_for(client: &Client, namespace: &str, curator: &str) -> Vec<Job> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    jobs.list(&ListParams::default().labels(&format!("{CURATOR_LABEL}={curator}")))
        .await
        .expect("failed to list jobs")
        .items
}

/// Story: a user requests an upgrade of cluster-a
///
/// The first reconcile provisions RBAC, creates job-cluster-a-upgrade and
/// records it on the curator. Reconciling again changes nothing.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_upgrade_request_launches_one_job() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ns = "curator-it-upgrade";
    fresh_namespace(&client, ns).await;

    create_curator(
        &client,
        ns,
        "cluster-a",
        ClusterCuratorSpec::requesting("upgrade"),
    )
    .await;
    let ctx = context(&client);
    let identity = CuratorRef::new(ns, "cluster-a");

    let action = reconcile_curator(&identity, &ctx)
        .await
        .expect("first reconcile should launch");
    assert_eq!(action, Action::await_change());

    let curators: Api<ClusterCurator> = Api::namespaced(client.clone(), ns);
    let recorded = curators.get("cluster-a").await.expect("curator exists");
    assert_eq!(
        recorded.spec.curating_job.as_deref(),
        Some("job-cluster-a-upgrade")
    );

    let jobs = jobs_for(&client, ns, "cluster-a").await;
    assert_eq!(jobs.len(), 1);
    let job_uid = jobs[0].metadata.uid.clone();
    assert_eq!(
        jobs[0].metadata.name.as_deref(),
        Some("job-cluster-a-upgrade")
    );
    let owners = jobs[0].metadata.owner_references.clone().unwrap_or_default();
    assert_eq!(owners.len(), 1);
    assert_eq!(owners[0].uid, recorded.metadata.uid.unwrap_or_default());

    // Second reconcile is a no-op
    reconcile_curator(&identity, &ctx)
        .await
        .expect("second reconcile should succeed");
    let jobs = jobs_for(&client, ns, "cluster-a").await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].metadata.uid, job_uid);

    cleanup_namespace(&client, ns).await;
}

/// Story: the controller provisions RBAC for the curation job
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_rbac_is_provisioned_and_reapplied_safely() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ns = "curator-it-rbac";
    fresh_namespace(&client, ns).await;

    let provisioner = KubeRbacProvisioner::new(client.clone(), DEFAULT_SERVICE_ACCOUNT);
    provisioner.apply(ns).await.expect("first apply");
    provisioner
        .apply(ns)
        .await
        .expect("applying existing RBAC must succeed");

    let sas: Api<ServiceAccount> = Api::namespaced(client.clone(), ns);
    let roles: Api<Role> = Api::namespaced(client.clone(), ns);
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), ns);
    assert!(sas.get_opt(DEFAULT_SERVICE_ACCOUNT).await.unwrap().is_some());
    assert!(roles.get_opt(CURATOR_ROLE).await.unwrap().is_some());

    let binding = bindings
        .get(CURATOR_ROLE)
        .await
        .expect("role binding exists");
    let subjects = binding.subjects.unwrap_or_default();
    assert_eq!(subjects[0].name, DEFAULT_SERVICE_ACCOUNT);

    cleanup_namespace(&client, ns).await;
}

/// Story: a job left over from an earlier attempt is adopted
///
/// The previous controller created the Job but died before recording it.
/// The next reconcile must not fail on AlreadyExists and must record the
/// existing Job.
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_interrupted_launch_adopts_existing_job() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ns = "curator-it-adopt";
    fresh_namespace(&client, ns).await;

    create_curator(
        &client,
        ns,
        "cluster-b",
        ClusterCuratorSpec::requesting("install"),
    )
    .await;
    let ctx = context(&client);
    let identity = CuratorRef::new(ns, "cluster-b");

    // Simulate the crash: the job exists, curatingJob is still empty
    reconcile_curator(&identity, &ctx)
        .await
        .expect("first reconcile");
    let curators: Api<ClusterCurator> = Api::namespaced(client.clone(), ns);
    curators
        .patch(
            "cluster-b",
            &kube::api::PatchParams::default(),
            &kube::api::Patch::Merge(serde_json::json!({ "spec": { "curatingJob": null } })),
        )
        .await
        .expect("clear curatingJob");

    reconcile_curator(&identity, &ctx)
        .await
        .expect("reconcile after interrupted launch");

    let recorded = curators.get("cluster-b").await.expect("curator exists");
    assert_eq!(
        recorded.spec.curating_job.as_deref(),
        Some("job-cluster-b-install")
    );
    assert_eq!(jobs_for(&client, ns, "cluster-b").await.len(), 1);

    cleanup_namespace(&client, ns).await;
}

/// Story: reconciling a curator that was already deleted is not an error
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_deleted_curator_reconciles_cleanly() {
    let client = ensure_test_cluster()
        .await
        .expect("failed to setup cluster");
    let ctx = Context::builder(client.clone(), ControllerConfig::new(TEST_IMAGE))
        .events(Arc::new(NoopEventPublisher))
        .build();

    let action = reconcile_curator(&CuratorRef::new("default", "never-existed"), &ctx)
        .await
        .expect("missing curator is not an error");
    assert_eq!(action, Action::await_change());
}
