//! Test helpers for integration tests
//!
//! Sets up the kind cluster and ClusterCurator CRD once per test binary and
//! gives each test its own namespace.

use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config, CustomResourceExt};
use tokio::sync::OnceCell;
use tokio::time::sleep;

use curator::crd::{ClusterCurator, ClusterCuratorSpec};

/// Name of the kind cluster used for integration tests
pub const TEST_CLUSTER_NAME: &str = "curator-integration-test";

/// Image put on curation jobs
///
/// It cannot be pulled, so the pods stay pending and the jobs stay active:
/// a job from an interrupted launch is still adoptable when the test looks.
pub const TEST_IMAGE: &str = "registry.invalid/cluster-curator-controller:never";

static KIND_READY: OnceLock<Result<(), String>> = OnceLock::new();

static CRD_READY: OnceCell<Result<(), String>> = OnceCell::const_new();

fn kind(args: &[&str]) -> Result<String, String> {
    let output = Command::new("kind")
        .args(args)
        .output()
        .map_err(|e| format!("kind {}: {e}", args.join(" ")))?;
    if !output.status.success() {
        return Err(format!(
            "kind {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Reuse the test cluster when it is already up, otherwise create it
fn ensure_kind_cluster(name: &str) -> Result<(), String> {
    let existing = kind(&["get", "clusters"])?;
    if existing.lines().any(|c| c.trim() == name) {
        return Ok(());
    }
    println!("creating kind cluster {name}");
    kind(&["create", "cluster", "--name", name, "--wait", "60s"]).map(|_| ())
}

/// Apply the ClusterCurator CRD and wait for it to be served
pub async fn install_crd(client: &Client) -> Result<(), kube::Error> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = ClusterCurator::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    crds.patch(
        &name,
        &PatchParams::apply("curator-integration-test").force(),
        &Patch::Apply(&crd),
    )
    .await?;

    sleep(Duration::from_secs(2)).await;
    Ok(())
}

async fn create_test_client() -> Result<Client, String> {
    let options = KubeConfigOptions {
        context: Some(format!("kind-{TEST_CLUSTER_NAME}")),
        ..Default::default()
    };
    let config = Config::from_kubeconfig(&options)
        .await
        .map_err(|e| format!("loading kubeconfig: {e}"))?;
    Client::try_from(config).map_err(|e| format!("building client: {e}"))
}

/// Client for the test cluster, creating the cluster and CRD on first use
pub async fn ensure_test_cluster() -> Result<Client, String> {
    KIND_READY
        .get_or_init(|| ensure_kind_cluster(TEST_CLUSTER_NAME))
        .clone()?;

    CRD_READY
        .get_or_init(|| async {
            let client = create_test_client().await?;
            install_crd(&client)
                .await
                .map_err(|e| format!("installing ClusterCurator CRD: {e}"))
        })
        .await
        .clone()?;

    create_test_client().await
}

/// Create a fresh namespace, deleting a leftover one from an earlier run first
pub async fn fresh_namespace(client: &Client, name: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    if namespaces.get_opt(name).await.ok().flatten().is_some() {
        let _ = namespaces.delete(name, &DeleteParams::default()).await;
        for _ in 0..60 {
            if namespaces.get_opt(name).await.ok().flatten().is_none() {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    namespaces
        .create(&PostParams::default(), &ns)
        .await
        .expect("failed to create namespace");
}

/// Delete a test namespace without waiting
pub async fn cleanup_namespace(client: &Client, name: &str) {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let _ = namespaces.delete(name, &DeleteParams::default()).await;
}

/// Create a ClusterCurator with the given spec
pub async fn create_curator(
    client: &Client,
    namespace: &str,
    name: &str,
    spec: ClusterCuratorSpec,
) -> ClusterCurator {
    let api: Api<ClusterCurator> = Api::namespaced(client.clone(), namespace);
    let mut curator = ClusterCurator::new(name, spec);
    curator.metadata.namespace = Some(namespace.to_string());
    api.create(&PostParams::default(), &curator)
        .await
        .expect("failed to create ClusterCurator")
}
