//! ClusterCurator controller
//!
//! Reconciliation follows the Kubernetes controller pattern: re-read the
//! curator, decide from its spec, act through injected collaborators.

mod backoff;
mod curator;

pub use backoff::ErrorBackoff;
pub use curator::{
    error_policy, reconcile, reconcile_curator, Context, ContextBuilder, CuratorStore,
    KubeCuratorStore, CONTROLLER_NAME,
};
