//! Controller configuration
//!
//! The binary fills this from CLI flags and environment variables; the
//! library only ever sees the validated struct.

use std::time::Duration;

use crate::{Error, DEFAULT_SERVICE_ACCOUNT};

/// Default `ttlSecondsAfterFinished` for curation jobs
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);

/// Default first requeue delay after a failed reconcile
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Default cap for the error requeue delay
pub const DEFAULT_MAX_ERROR_REQUEUE: Duration = Duration::from_secs(300);

/// Settings shared by every reconcile
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Image the curation job runs (the distribution/image locator)
    pub image_uri: String,
    /// Only watch ClusterCurators in this namespace; all namespaces when unset
    pub watch_namespace: Option<String>,
    /// ServiceAccount the curation job runs as (also provisioned by RBAC)
    pub service_account: String,
    /// How long finished curation jobs are kept before garbage collection
    pub job_ttl: Duration,
    /// First requeue delay after a failed reconcile
    pub error_requeue: Duration,
    /// Upper bound for the error requeue delay
    pub max_error_requeue: Duration,
}

impl ControllerConfig {
    /// Configuration with defaults for everything but the image
    pub fn new(image_uri: impl Into<String>) -> Self {
        Self {
            image_uri: image_uri.into(),
            watch_namespace: None,
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            job_ttl: DEFAULT_JOB_TTL,
            error_requeue: DEFAULT_ERROR_REQUEUE,
            max_error_requeue: DEFAULT_MAX_ERROR_REQUEUE,
        }
    }

    /// Restrict the watch to a single namespace
    pub fn watch_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.watch_namespace = Some(namespace.into());
        self
    }

    /// Override the curation job ServiceAccount
    pub fn service_account(mut self, name: impl Into<String>) -> Self {
        self.service_account = name.into();
        self
    }

    /// Override the finished-job TTL
    pub fn job_ttl(mut self, ttl: Duration) -> Self {
        self.job_ttl = ttl;
        self
    }

    /// Override the error requeue bounds
    pub fn error_requeue(mut self, base: Duration, max: Duration) -> Self {
        self.error_requeue = base;
        self.max_error_requeue = max;
        self
    }

    /// Reject configurations the controller cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.image_uri.trim().is_empty() {
            return Err(Error::config("image uri must not be empty"));
        }
        if self.service_account.trim().is_empty() {
            return Err(Error::config("service account must not be empty"));
        }
        if matches!(self.watch_namespace.as_deref(), Some(ns) if ns.trim().is_empty()) {
            return Err(Error::config("watch namespace must not be blank when set"));
        }
        if self.error_requeue.is_zero() {
            return Err(Error::config("error requeue delay must be greater than zero"));
        }
        if self.max_error_requeue < self.error_requeue {
            return Err(Error::config(format!(
                "max error requeue ({:?}) is shorter than the base delay ({:?})",
                self.max_error_requeue, self.error_requeue
            )));
        }
        Ok(())
    }
}
