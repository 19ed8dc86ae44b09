//! Error types for the curation controller

use thiserror::Error;

/// Main error type for curation operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error outside of a collaborator call (e.g. fetching the curator)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// RBAC for curation jobs could not be applied
    #[error("rbac provisioning failed in namespace '{namespace}': {source}")]
    Rbac {
        /// Namespace the RBAC objects were being applied in
        namespace: String,
        /// Underlying API failure
        #[source]
        source: kube::Error,
    },

    /// The curation job could not be created or recorded on the curator
    #[error("curation job '{job}' could not be launched: {source}")]
    Launch {
        /// Deterministic job name for the request
        job: String,
        /// Underlying API failure
        #[source]
        source: kube::Error,
    },

    /// The request changed between launching its job and recording it
    #[error("curation job '{job}' was not recorded: {reason}")]
    Superseded {
        /// Job created for the earlier request
        job: String,
        /// What changed on the curator
        reason: String,
    },

    /// The resource is missing something the controller needs to act on it
    #[error("validation error: {0}")]
    Validation(String),

    /// Controller configuration is unusable
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap an API failure that happened while applying RBAC
    pub fn rbac(namespace: impl Into<String>, source: kube::Error) -> Self {
        Self::Rbac {
            namespace: namespace.into(),
            source,
        }
    }

    /// Wrap an API failure that happened while launching a job
    pub fn launch(job: impl Into<String>, source: kube::Error) -> Self {
        Self::Launch {
            job: job.into(),
            source,
        }
    }

    /// The job for an outdated request was left unrecorded
    pub fn superseded(job: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Superseded {
            job: job.into(),
            reason: reason.into(),
        }
    }
}

/// Returns true when `err` is an API status response with the given HTTP code
pub(crate) fn is_api_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("simulated {reason}"),
        reason: reason.to_string(),
        code,
    })
}
