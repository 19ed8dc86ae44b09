//! Custom Resource Definitions read by the curation controller

mod curator;
mod types;

pub use curator::{ClusterCurator, ClusterCuratorSpec};
pub use types::{CurationState, CuratorRef};
