//! Cluster curator controller - launches ClusterCurator curation jobs

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use curator::config::ControllerConfig;
use curator::controller::{error_policy, reconcile, Context};
use curator::crd::ClusterCurator;
use curator::leader_election::LeaderElector;

/// Cluster curator - launches ClusterCurator curation jobs exactly once per request
#[derive(Parser, Debug)]
#[command(name = "curator-controller", version, about, long_about = None)]
struct Cli {
    /// Print the ClusterCurator CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Image run by curation jobs
    #[arg(long, env = "IMAGE_URI", required_unless_present = "crd")]
    image_uri: Option<String>,

    /// Only watch ClusterCurators in this namespace (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// ServiceAccount curation jobs run as
    #[arg(
        long,
        env = "CURATOR_SERVICE_ACCOUNT",
        default_value = curator::DEFAULT_SERVICE_ACCOUNT
    )]
    service_account: String,

    /// Seconds finished curation jobs are kept
    #[arg(long, default_value = "3600")]
    job_ttl_secs: u64,

    /// First requeue delay after a failed reconcile, in seconds
    #[arg(long, default_value = "5")]
    error_requeue_secs: u64,

    /// Upper bound for the requeue delay after repeated failures, in seconds
    #[arg(long, default_value = "300")]
    max_error_requeue_secs: u64,

    /// Only run the controller while holding the leader Lease
    #[arg(long, env = "LEADER_ELECT")]
    leader_elect: bool,

    /// Namespace of the leader Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "open-cluster-management")]
    lease_namespace: String,

    /// Identity used for leader election and Event reporting
    #[arg(long, env = "POD_NAME")]
    pod_name: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn controller_config(&self) -> anyhow::Result<ControllerConfig> {
        let image = self
            .image_uri
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--image-uri is required"))?;

        let mut config = ControllerConfig::new(image)
            .service_account(self.service_account.clone())
            .job_ttl(Duration::from_secs(self.job_ttl_secs))
            .error_requeue(
                Duration::from_secs(self.error_requeue_secs),
                Duration::from_secs(self.max_error_requeue_secs),
            );
        if let Some(ref ns) = self.watch_namespace {
            config = config.watch_namespace(ns.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&ClusterCurator::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_tracing(cli.log_json);

    let config = cli.controller_config()?;
    tracing::info!(
        image = %config.image_uri,
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        service_account = %config.service_account,
        "cluster curator controller starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !cli.leader_elect {
        run_controller(client, config, cli.pod_name).await;
        return Ok(());
    }

    let identity = cli
        .pod_name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--pod-name (POD_NAME) is required for leader election"))?;
    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        &cli.lease_namespace,
        &identity,
    ));
    let mut guard = elector.acquire().await;

    let lost = tokio::select! {
        _ = run_controller(client, config, Some(identity)) => false,
        _ = guard.lost() => true,
    };
    if lost {
        // Another replica may already be launching jobs
        anyhow::bail!("leadership lost, exiting");
    }

    tracing::info!("controller stopped, releasing leadership");
    if let Err(e) = guard.release().await {
        tracing::warn!(error = %e, "failed to release leader lease");
    }
    Ok(())
}

/// Run the ClusterCurator controller until a shutdown signal arrives
async fn run_controller(client: Client, config: ControllerConfig, instance: Option<String>) {
    let curators: Api<ClusterCurator> = match config.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let mut builder = Context::builder(client, config);
    if let Some(instance) = instance {
        builder = builder.instance(instance);
    }
    let ctx = Arc::new(builder.build());

    tracing::info!("starting ClusterCurator controller");
    Controller::new(curators, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(curator = %obj, ?action, "reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "ClusterCurator reconciliation error");
                }
            }
        })
        .await;
}
