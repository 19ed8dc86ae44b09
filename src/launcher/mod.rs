//! Curation job launcher
//!
//! Creates the Job for a curation request and records its name in
//! `spec.curatingJob`. The recorded name is what makes later reconciles of
//! the same request no-ops, so launch only reports success once that write
//! has landed.
//!
//! A Job with the deterministic name may already exist. It is adopted only
//! when it is the live Job of this curator; a finished Job or one owned by a
//! previous incarnation of the curator is deleted and the launch fails, so
//! the requeued reconcile creates a fresh Job.

mod job;

pub use job::{build_curation_job, curation_job_name, JobTemplate, CURATION_LABEL, CURATOR_LABEL};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{ClusterCurator, CurationState, CuratorRef};
use crate::error::is_api_status;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, FIELD_MANAGER};

/// One curation request handed to the launcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Curator the job runs for
    pub curator: CuratorRef,
    /// UID of the curator as last read, for the job's owner reference
    pub curator_uid: Option<String>,
    /// Requested curation token
    pub desired_curation: String,
    /// Image the job runs
    pub image_uri: String,
}

impl LaunchRequest {
    /// Deterministic job name for this request
    pub fn job_name(&self) -> String {
        curation_job_name(&self.curator.name, &self.desired_curation)
    }
}

/// Creates curation jobs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Create the job for `request` and record it on the curator.
    ///
    /// Returns the job name. Calling this again for the same request must not
    /// create a second job.
    async fn create_job(&self, request: &LaunchRequest) -> Result<String, Error>;
}

/// Kubernetes calls made while launching a job
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LaunchApi: Send + Sync {
    /// Create `job` in `namespace`
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error>;

    /// Read a job, `Ok(None)` when it does not exist
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error>;

    /// Delete a job and, in the background, its pods
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// Read a curator, `Ok(None)` when it does not exist
    async fn get_curator(
        &self,
        curator: &CuratorRef,
    ) -> Result<Option<ClusterCurator>, kube::Error>;

    /// Write `spec.curatingJob`, conditional on `resource_version` when given
    async fn patch_curating_job(
        &self,
        curator: &CuratorRef,
        job_name: &str,
        resource_version: Option<String>,
    ) -> Result<(), kube::Error>;
}

/// [`LaunchApi`] backed by the API server
pub struct KubeLaunchApi {
    client: Client,
}

impl KubeLaunchApi {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Plain field-managed merge patch; server-side apply is not used for this write
fn record_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl LaunchApi for KubeLaunchApi {
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.create(&PostParams::default(), job).await?;
        Ok(())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        jobs.get_opt(name).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match jobs.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_api_status(&e, 404) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_curator(
        &self,
        curator: &CuratorRef,
    ) -> Result<Option<ClusterCurator>, kube::Error> {
        let curators: Api<ClusterCurator> =
            Api::namespaced(self.client.clone(), &curator.namespace);
        curators.get_opt(&curator.name).await
    }

    async fn patch_curating_job(
        &self,
        curator: &CuratorRef,
        job_name: &str,
        resource_version: Option<String>,
    ) -> Result<(), kube::Error> {
        let curators: Api<ClusterCurator> =
            Api::namespaced(self.client.clone(), &curator.namespace);
        let mut patch = json!({ "spec": { "curatingJob": job_name } });
        if let Some(rv) = resource_version {
            patch["metadata"] = json!({ "resourceVersion": rv });
        }
        curators
            .patch(&curator.name, &record_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Why an existing job with the request's name must not be adopted
fn stale_reason(job: &Job, curator_uid: Option<&str>) -> Option<&'static str> {
    if job.metadata.deletion_timestamp.is_some() {
        return Some("being deleted");
    }

    let controller_uid = job
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| owner.uid.as_str());
    if controller_uid != curator_uid {
        return Some("owned by another curator");
    }

    let finished = job
        .status
        .iter()
        .flat_map(|status| status.conditions.iter().flatten())
        .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True");
    finished.then_some("already finished")
}

/// Result of one attempt at recording the job
#[derive(Debug)]
enum RecordOutcome {
    Recorded,
    Superseded(String),
}

/// Launcher creating batch Jobs through a [`LaunchApi`]
pub struct KubeJobLauncher {
    api: Arc<dyn LaunchApi>,
    service_account: String,
    job_ttl: Duration,
    record_retry: RetryConfig,
}

impl KubeJobLauncher {
    /// Create a launcher whose jobs run as `service_account`
    pub fn new(client: Client, service_account: impl Into<String>, job_ttl: Duration) -> Self {
        Self::with_api(Arc::new(KubeLaunchApi::new(client)), service_account, job_ttl)
    }

    /// Create a launcher on top of an arbitrary [`LaunchApi`]
    pub fn with_api(
        api: Arc<dyn LaunchApi>,
        service_account: impl Into<String>,
        job_ttl: Duration,
    ) -> Self {
        Self {
            api,
            service_account: service_account.into(),
            job_ttl,
            record_retry: RetryConfig::default(),
        }
    }

    /// Create the job, adopting one left by an interrupted launch of the same request
    async fn ensure_job(&self, request: &LaunchRequest, job_name: &str) -> Result<(), Error> {
        let job = build_curation_job(&JobTemplate {
            curator: &request.curator,
            curator_uid: request.curator_uid.as_deref(),
            desired_curation: &request.desired_curation,
            image_uri: &request.image_uri,
            service_account: &self.service_account,
            ttl: self.job_ttl,
        });

        match self.api.create_job(&request.curator.namespace, &job).await {
            Ok(()) => {
                info!(curator = %request.curator, job = %job_name, "curation job created");
                Ok(())
            }
            Err(e) if is_api_status(&e, 409) => self.adopt_existing(request, job_name, e).await,
            Err(e) => Err(Error::launch(job_name, e)),
        }
    }

    async fn adopt_existing(
        &self,
        request: &LaunchRequest,
        job_name: &str,
        conflict: kube::Error,
    ) -> Result<(), Error> {
        let namespace = &request.curator.namespace;
        let Some(existing) = self
            .api
            .get_job(namespace, job_name)
            .await
            .map_err(|e| Error::launch(job_name, e))?
        else {
            // Gone since the create; the requeued attempt creates it
            return Err(Error::launch(job_name, conflict));
        };

        let Some(reason) = stale_reason(&existing, request.curator_uid.as_deref()) else {
            info!(
                curator = %request.curator,
                job = %job_name,
                "curation job already exists, adopting it"
            );
            return Ok(());
        };

        warn!(
            curator = %request.curator,
            job = %job_name,
            reason,
            "existing curation job belongs to an earlier request, replacing it"
        );
        if existing.metadata.deletion_timestamp.is_none() {
            self.api
                .delete_job(namespace, job_name)
                .await
                .map_err(|e| Error::launch(job_name, e))?;
        }
        Err(Error::launch(job_name, conflict))
    }

    /// Write `spec.curatingJob` against a fresh read of the curator
    ///
    /// The write carries the resourceVersion it was checked against, so a
    /// concurrent change conflicts and the check runs again.
    async fn try_record(
        &self,
        request: &LaunchRequest,
        job_name: &str,
    ) -> Result<RecordOutcome, kube::Error> {
        let Some(curator) = self.api.get_curator(&request.curator).await? else {
            return Ok(RecordOutcome::Superseded("curator was deleted".to_string()));
        };
        if curator.uid() != request.curator_uid {
            return Ok(RecordOutcome::Superseded("curator was recreated".to_string()));
        }

        match curator.spec.state() {
            CurationState::Requested { desired } if desired == request.desired_curation => {}
            CurationState::InProgress { job } if job == job_name => {
                return Ok(RecordOutcome::Recorded);
            }
            state => return Ok(RecordOutcome::Superseded(format!("curator is now {state}"))),
        }

        self.api
            .patch_curating_job(&request.curator, job_name, curator.resource_version())
            .await?;
        Ok(RecordOutcome::Recorded)
    }

    /// Record the job, retrying conflicts and transient failures
    async fn record_job(&self, request: &LaunchRequest, job_name: &str) -> Result<(), Error> {
        let outcome = retry_with_backoff(
            &self.record_retry,
            "record_curating_job",
            is_transient,
            || self.try_record(request, job_name),
        )
        .await
        .map_err(|e| Error::launch(job_name, e))?;

        match outcome {
            RecordOutcome::Recorded => {
                debug!(curator = %request.curator, job = %job_name, "curatingJob recorded");
                Ok(())
            }
            RecordOutcome::Superseded(reason) => Err(Error::superseded(job_name, reason)),
        }
    }
}

#[async_trait]
impl JobLauncher for KubeJobLauncher {
    async fn create_job(&self, request: &LaunchRequest) -> Result<String, Error> {
        let job_name = request.job_name();
        self.ensure_job(request, &job_name).await?;
        self.record_job(request, &job_name).await?;
        Ok(job_name)
    }
}

/// Whether an API failure may succeed if tried again
///
/// 404 means the curator is gone; 4xx other than conflict/throttling will
/// fail the same way every time.
fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code == 409 || resp.code == 429 || resp.code >= 500,
        _ => true,
    }
}
