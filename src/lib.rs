//! Cluster curator - launches ClusterCurator curation jobs exactly once per request
//!
//! A ClusterCurator asks for a curation of a managed cluster by setting
//! `spec.desiredCuration`. The controller provisions the RBAC the curation job
//! needs, creates the job, and records its name in `spec.curatingJob`. Once a
//! job is recorded the curator is never acted on again until an external
//! actor clears it.
//!
//! # Modules
//!
//! - [`crd`] - ClusterCurator resource and curation state
//! - [`controller`] - Reconciliation logic and controller context
//! - [`rbac`] - ServiceAccount, Role and RoleBinding for curation jobs
//! - [`launcher`] - Curation Job construction and creation
//! - [`events`] - Kubernetes Events and failure reporting
//! - [`leader_election`] - Lease-based leader election
//! - [`config`] - Controller configuration
//! - [`retry`] - Bounded retry with backoff
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

use std::collections::BTreeMap;

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod launcher;
pub mod leader_election;
pub mod rbac;
pub mod retry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager for every server-side apply and patch issued by the controller
pub const FIELD_MANAGER: &str = "cluster-curator-controller";

/// ServiceAccount curation jobs run as unless configured otherwise
pub const DEFAULT_SERVICE_ACCOUNT: &str = "cluster-installer";

/// Name of the Role and RoleBinding granted to curation jobs
pub const CURATOR_ROLE: &str = "curator";

/// Labels put on every object the controller creates
pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    )])
}
