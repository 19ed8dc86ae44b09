//! Lease-based leader election
//!
//! Only one replica may launch curation jobs at a time, so the controller runs
//! only while this process holds a coordination.k8s.io/v1 Lease. Writes to the
//! Lease carry the resourceVersion that was read; a concurrent change makes the
//! write fail with 409 and the attempt counts as "not acquired".

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::is_api_status;
use crate::{Error, FIELD_MANAGER};

/// Name of the Lease guarding the controller
pub const LEADER_LEASE_NAME: &str = "cluster-curator-controller-leader";

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// What to do with a Lease as observed at `now`
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum LeaseDecision {
    /// No Lease exists yet
    Create,
    /// We hold it; bump renewTime
    Renew,
    /// Expired or unheld; take it over with the given transition count
    TakeOver {
        /// Transitions recorded so far
        transitions: i32,
    },
    /// Someone else holds a live Lease
    Wait,
}

/// Decide how to treat `lease` for `identity`
pub(crate) fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };
    let spec = lease.spec.as_ref();

    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (holder, renew_time, duration_secs) {
        (None, _, _) => true,
        (Some(_), Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };

    if expired {
        LeaseDecision::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0),
        }
    } else {
        LeaseDecision::Wait
    }
}

fn missing_resource_version() -> Error {
    Error::validation("Lease missing resourceVersion")
}

/// Leader elector backed by a Kubernetes Lease
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create an elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: LEADER_LEASE_NAME.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Block until leadership is acquired, then return a guard that keeps renewing it
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            namespace = %self.namespace,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return self.guard();
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "lease held by another replica");
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(
                i32::try_from(self.lease_duration.as_secs()).unwrap_or(i32::MAX),
            ),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();
        let existing = api.get_opt(&self.lease_name).await?;

        let lease = match decide(existing.as_ref(), &self.identity, now) {
            LeaseDecision::Wait => return Ok(false),
            LeaseDecision::Create => Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(crate::managed_labels()),
                    ..Default::default()
                },
                spec: Some(self.lease_spec(now, 0)),
            },
            LeaseDecision::Renew => {
                let mut renewed = existing.ok_or_else(missing_resource_version)?;
                if renewed.metadata.resource_version.is_none() {
                    return Err(missing_resource_version());
                }
                if let Some(spec) = renewed.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                renewed
            }
            LeaseDecision::TakeOver { transitions } => {
                let rv = existing
                    .and_then(|l| l.metadata.resource_version)
                    .ok_or_else(missing_resource_version)?;
                Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        namespace: Some(self.namespace.clone()),
                        resource_version: Some(rv),
                        labels: Some(crate::managed_labels()),
                        ..Default::default()
                    },
                    spec: Some(self.lease_spec(now, transitions + 1)),
                }
            }
        };

        let written = if lease.metadata.resource_version.is_none() {
            api.create(&PostParams::default(), &lease).await
        } else {
            api.replace(&self.lease_name, &PostParams::default(), &lease)
                .await
        };

        match written {
            Ok(_) => {
                debug!(identity = %self.identity, "lease written");
                Ok(true)
            }
            Err(e) if is_api_status(&e, 409) => {
                debug!(identity = %self.identity, "lease changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(identity = %self.identity, "leadership lost to another replica");
                    break;
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "lease renewal failed, leadership lost"
                    );
                    break;
                }
            }
        }
        let _ = lost_tx.send(());
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let Some(lease) = api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past),
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &Patch::Merge(&patch),
        )
        .await?;

        info!(identity = %self.identity, "lease released");
        Ok(())
    }
}

/// Held while this process is the leader
///
/// Renewal runs in the background until the guard is dropped or renewal fails.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolve once leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Give the Lease up on graceful shutdown
    pub async fn release(self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
    }
}
