//! Supporting types for the ClusterCurator CRD

use std::fmt;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};

use super::ClusterCurator;

/// Where a ClusterCurator sits in its curation cycle
///
/// Derived from `spec.desiredCuration` and `spec.curatingJob`, which are the
/// only two fields the controller reads. A recorded job wins over everything
/// else: once a job is set, the request is in progress no matter what the
/// desired curation says.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CurationState {
    /// No curation requested
    Idle,
    /// A curation is requested and no job has been launched for it yet
    Requested {
        /// Opaque curation token (e.g. "install", "upgrade")
        desired: String,
    },
    /// A job has been launched; only an external actor moves the curator on
    InProgress {
        /// Name of the job executing the curation
        job: String,
    },
}

impl CurationState {
    /// Derive the state from the raw spec fields
    ///
    /// Empty strings are treated the same as absent fields.
    pub fn from_fields(desired_curation: Option<&str>, curating_job: Option<&str>) -> Self {
        let non_empty = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);

        match (non_empty(desired_curation), non_empty(curating_job)) {
            (_, Some(job)) => Self::InProgress { job },
            (Some(desired), None) => Self::Requested { desired },
            (None, None) => Self::Idle,
        }
    }
}

impl fmt::Display for CurationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Requested { desired } => write!(f, "Requested({desired})"),
            Self::InProgress { job } => write!(f, "InProgress({job})"),
        }
    }
}

/// Namespace/name identity of a ClusterCurator
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CuratorRef {
    /// Namespace the curator lives in
    pub namespace: String,
    /// Name of the curator (conventionally the managed cluster name)
    pub name: String,
}

impl CuratorRef {
    /// Create a reference from its parts
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build the identity of a watched object
    ///
    /// ClusterCurators are namespaced, so an object without a namespace is
    /// rejected rather than guessed.
    pub fn from_resource(curator: &ClusterCurator) -> Result<Self, crate::Error> {
        let namespace = curator
            .namespace()
            .ok_or_else(|| crate::Error::validation("ClusterCurator has no namespace"))?;
        Ok(Self::new(namespace, curator.name_any()))
    }

    /// Reference used as the subject of Events about this curator
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some(ClusterCurator::api_version(&()).to_string()),
            kind: Some(ClusterCurator::kind(&()).to_string()),
            namespace: Some(self.namespace.clone()),
            name: Some(self.name.clone()),
            ..Default::default()
        }
    }
}

impl fmt::Display for CuratorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
