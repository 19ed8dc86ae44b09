//! ClusterCurator Custom Resource Definition
//!
//! A ClusterCurator requests a curation (install, upgrade, scale, destroy...)
//! of the managed cluster it is named after. The schema is owned by the
//! cluster lifecycle API; this type only models the fields the controller
//! reads and writes. Unknown fields are ignored on read.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::CurationState;

/// Specification for a ClusterCurator
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1beta1",
    kind = "ClusterCurator",
    plural = "clustercurators",
    namespaced,
    printcolumn = r#"{"name":"Desired","type":"string","jsonPath":".spec.desiredCuration"}"#,
    printcolumn = r#"{"name":"Job","type":"string","jsonPath":".spec.curatingJob"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCuratorSpec {
    /// Curation to perform; empty means nothing is requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_curation: Option<String>,

    /// Job executing (or that executed) the current curation; empty means not started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curating_job: Option<String>,
}

impl ClusterCuratorSpec {
    /// Create a spec requesting the given curation
    pub fn requesting(desired: impl Into<String>) -> Self {
        Self {
            desired_curation: Some(desired.into()),
            curating_job: None,
        }
    }

    /// Set the curating job and return self for chaining
    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.curating_job = Some(job.into());
        self
    }

    /// Current position in the curation cycle
    pub fn state(&self) -> CurationState {
        CurationState::from_fields(
            self.desired_curation.as_deref(),
            self.curating_job.as_deref(),
        )
    }
}
