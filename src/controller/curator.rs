//! ClusterCurator controller implementation
//!
//! Turns a curation request (`spec.desiredCuration` set, `spec.curatingJob`
//! empty) into exactly one curation job. The recorded `curatingJob` is the
//! only idempotency guard, so every decision is made on a fresh read of the
//! curator rather than on the object the watch delivered.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::backoff::ErrorBackoff;
use crate::config::ControllerConfig;
use crate::crd::{ClusterCurator, CurationState, CuratorRef};
use crate::events::{
    actions, reasons, EventFailureSink, EventPublisher, FailureSink, FailureStage,
    KubeEventPublisher,
};
use crate::launcher::{JobLauncher, KubeJobLauncher, LaunchRequest};
use crate::rbac::{KubeRbacProvisioner, RbacProvisioner};
use crate::Error;

/// Name the controller reports Events under
pub const CONTROLLER_NAME: &str = "cluster-curator-controller";

/// Reads ClusterCurators by identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CuratorStore: Send + Sync {
    /// Fetch the current state of a curator
    ///
    /// Returns `Ok(None)` when it does not exist.
    async fn get(&self, curator: &CuratorRef) -> Result<Option<ClusterCurator>, Error>;
}

/// Store reading straight from the API server
///
/// Bypasses the watch cache so a `curatingJob` written by the previous
/// reconcile is always visible.
pub struct KubeCuratorStore {
    client: Client,
}

impl KubeCuratorStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CuratorStore for KubeCuratorStore {
    async fn get(&self, curator: &CuratorRef) -> Result<Option<ClusterCurator>, Error> {
        let api: Api<ClusterCurator> = Api::namespaced(self.client.clone(), &curator.namespace);
        Ok(api.get_opt(&curator.name).await?)
    }
}

/// Controller context shared by every reconcile
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client, config)
///     .instance(pod_name)
///     .build();
/// ```
pub struct Context {
    /// Source of truth for curator state
    pub store: Arc<dyn CuratorStore>,
    /// Applies the curation RBAC
    pub rbac: Arc<dyn RbacProvisioner>,
    /// Creates curation jobs and records them
    pub launcher: Arc<dyn JobLauncher>,
    /// Receives collaborator failures
    pub failures: Arc<dyn FailureSink>,
    /// Publishes Normal events on success
    pub events: Arc<dyn EventPublisher>,
    /// Controller settings
    pub config: ControllerConfig,
    /// Requeue delays after failed reconciles
    pub backoff: ErrorBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: ControllerConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context from explicit collaborators, without a Kubernetes client
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn CuratorStore>,
        rbac: Arc<dyn RbacProvisioner>,
        launcher: Arc<dyn JobLauncher>,
        failures: Arc<dyn FailureSink>,
    ) -> Self {
        let config = ControllerConfig::new("quay.io/stolostron/cluster-curator-controller:test");
        let backoff = ErrorBackoff::new(config.error_requeue, config.max_error_requeue);
        Self {
            store,
            rbac,
            launcher,
            failures,
            events: Arc::new(crate::events::NoopEventPublisher),
            config,
            backoff,
        }
    }
}

/// Builder for [`Context`]
///
/// Collaborators are the Kubernetes-backed implementations; tests build a
/// [`Context`] from mocks directly.
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    instance: Option<String>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            instance: None,
            events: None,
        }
    }

    /// Reporter instance recorded on Events (usually the pod name)
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Override the Event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let config = self.config;
        let events: Arc<dyn EventPublisher> = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(
                client.clone(),
                CONTROLLER_NAME,
                self.instance,
            ))
        });

        Context {
            store: Arc::new(KubeCuratorStore::new(client.clone())),
            rbac: Arc::new(KubeRbacProvisioner::new(
                client.clone(),
                config.service_account.clone(),
            )),
            launcher: Arc::new(KubeJobLauncher::new(
                client,
                config.service_account.clone(),
                config.job_ttl,
            )),
            failures: Arc::new(EventFailureSink::new(events.clone())),
            events,
            backoff: ErrorBackoff::new(config.error_requeue, config.max_error_requeue),
            config,
        }
    }
}

/// Reconcile a watched ClusterCurator
///
/// Adapter for `kube::runtime::Controller`: derives the identity from the
/// watched object and hands over to [`reconcile_curator`]. The watched object
/// itself is not used for the decision.
#[instrument(skip(curator, ctx), fields(curator = %curator.name_any()))]
pub async fn reconcile(curator: Arc<ClusterCurator>, ctx: Arc<Context>) -> Result<Action, Error> {
    let identity = CuratorRef::from_resource(&curator)?;
    reconcile_curator(&identity, &ctx).await
}

/// Run one reconcile for the curator at `identity`
///
/// Requires that no other reconcile of the same identity is running; the
/// kube-runtime Controller guarantees that for objects it schedules.
///
/// 1. A curator that no longer exists is done.
/// 2. A curator with a recorded job, or without a request, is left alone.
/// 3. Otherwise the RBAC is applied, then the job is launched. The launcher
///    records `curatingJob`, which turns every later reconcile into step 2.
///
/// A failing step is reported to the failure sink and returned; a failed RBAC
/// apply means no launch is attempted.
pub async fn reconcile_curator(identity: &CuratorRef, ctx: &Context) -> Result<Action, Error> {
    let Some(curator) = ctx.store.get(identity).await? else {
        debug!(curator = %identity, "curator not found, nothing to do");
        ctx.backoff.reset(identity);
        return Ok(Action::await_change());
    };

    let desired = match curator.spec.state() {
        CurationState::Requested { desired } => desired,
        state => {
            debug!(curator = %identity, %state, "nothing to launch");
            ctx.backoff.reset(identity);
            return Ok(Action::await_change());
        }
    };

    info!(curator = %identity, desired = %desired, "launching curation");

    if let Err(e) = ctx.rbac.apply(&identity.namespace).await {
        ctx.failures.record(identity, FailureStage::Rbac, &e).await;
        return Err(e);
    }

    let request = LaunchRequest {
        curator: identity.clone(),
        curator_uid: curator.uid(),
        desired_curation: desired.clone(),
        image_uri: ctx.config.image_uri.clone(),
    };

    let job = match ctx.launcher.create_job(&request).await {
        Ok(job) => job,
        Err(e) => {
            ctx.failures.record(identity, FailureStage::Launch, &e).await;
            return Err(e);
        }
    };

    info!(curator = %identity, desired = %desired, job = %job, "curation started");
    ctx.events
        .publish(
            &identity.object_ref(),
            EventType::Normal,
            reasons::CURATION_STARTED,
            actions::LAUNCH,
            Some(format!("Started {desired} curation with job {job}")),
        )
        .await;
    ctx.backoff.reset(identity);

    Ok(Action::await_change())
}

/// Requeue a failed reconcile with per-curator exponential backoff
pub fn error_policy(curator: Arc<ClusterCurator>, error: &Error, ctx: Arc<Context>) -> Action {
    let Ok(identity) = CuratorRef::from_resource(&curator) else {
        // Not namespaced, so it can never reconcile successfully
        warn!(
            curator = %curator.name_any(),
            error = %error,
            "ignoring unreconcilable curator"
        );
        return Action::await_change();
    };

    let delay = ctx.backoff.next_delay(&identity);
    warn!(
        curator = %identity,
        error = %error,
        failures = ctx.backoff.failures(&identity),
        requeue_secs = delay.as_secs(),
        "reconciliation failed"
    );
    Action::requeue(delay)
}
