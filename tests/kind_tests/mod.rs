//! Integration tests for the cluster curator controller
//!
//! These tests need a kind cluster and tell the story of a ClusterCurator
//! going from a curation request to a recorded curation job.
//!
//! - `curation_flow`: reconciling real ClusterCurators against the API server,
//!   including the RBAC and Job the controller creates
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod curation_flow;
mod helpers;
