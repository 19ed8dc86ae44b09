//! Curation Job construction
//!
//! Builds the batch Job that executes one curation request. The Job name is
//! derived only from the curator identity and the requested curation, so a
//! retried launch for the same request always targets the same Job and the
//! API server reports the second create as AlreadyExists.

use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use sha2::{Digest, Sha256};

use crate::crd::{ClusterCurator, CuratorRef};

/// Label carrying the curator name on jobs and pods
pub const CURATOR_LABEL: &str = "open-cluster-management.io/curator";

/// Label carrying the requested curation on jobs and pods
pub const CURATION_LABEL: &str = "open-cluster-management.io/curation";

/// Entrypoint of the curation image
const CURATOR_COMMAND: &str = "./curator";

/// Hook phase run before the curation itself
const PREHOOK_PHASE: &str = "prehook-ansiblejob";

/// Hook phase run after the curation itself
const POSTHOOK_PHASE: &str = "posthook-ansiblejob";

/// Final phase that marks the job complete
const DONE_PHASE: &str = "done";

const MAX_DNS_LABEL: usize = 63;

/// Sanitize a string into a valid K8s DNS label.
///
/// DNS labels: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`, max 63 chars.
pub(crate) fn sanitize_dns_label(s: &str) -> String {
    let sanitized: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.len() > MAX_DNS_LABEL {
        trimmed[..MAX_DNS_LABEL].trim_end_matches('-').to_string()
    } else {
        trimmed.to_string()
    }
}

/// Deterministic name of the job for a curator and requested curation.
///
/// `job-{name}-{desired}` when it fits in a DNS label. Longer names keep a
/// readable prefix and end in 8 hex chars of a SHA-256 over the unsanitized
/// inputs, so distinct requests never collapse onto one job.
pub fn curation_job_name(curator_name: &str, desired_curation: &str) -> String {
    let raw = format!("job-{curator_name}-{desired_curation}");
    let readable = sanitize_dns_label(&raw);
    if readable == raw {
        return readable;
    }

    let digest = Sha256::digest(format!("{curator_name}/{desired_curation}").as_bytes());
    let suffix = hex::encode(&digest[..4]);
    let keep = MAX_DNS_LABEL - suffix.len() - 1;
    let prefix = if readable.len() > keep {
        readable[..keep].trim_end_matches('-')
    } else {
        readable.as_str()
    };
    format!("{prefix}-{suffix}")
}

/// Everything the job builder needs for one request
#[derive(Clone, Debug, PartialEq)]
pub struct JobTemplate<'a> {
    /// Curator the job runs for
    pub curator: &'a CuratorRef,
    /// UID of the curator, used for the owner reference when known
    pub curator_uid: Option<&'a str>,
    /// Requested curation token
    pub desired_curation: &'a str,
    /// Curation image
    pub image_uri: &'a str,
    /// ServiceAccount the pod runs as
    pub service_account: &'a str,
    /// `ttlSecondsAfterFinished`
    pub ttl: Duration,
}

fn phase_container(name: String, image: &str, phase: &str, cluster_name: &str) -> Container {
    Container {
        name,
        image: Some(image.to_string()),
        command: Some(vec![CURATOR_COMMAND.to_string()]),
        args: Some(vec![phase.to_string()]),
        env: Some(vec![EnvVar {
            name: "CLUSTER_NAME".to_string(),
            value: Some(cluster_name.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Build the curation Job for one request.
///
/// The Job:
/// - Runs the prehook, the requested curation and the posthook as ordered
///   init containers, then a `complete` container
/// - Never restarts pods and never retries (`backoffLimit: 0`); a failed
///   curation is resolved by whoever clears `curatingJob`
/// - Is owned by the ClusterCurator when its UID is known
pub fn build_curation_job(template: &JobTemplate<'_>) -> Job {
    let curator = template.curator;
    let job_name = curation_job_name(&curator.name, template.desired_curation);

    let mut labels = crate::managed_labels();
    labels.insert(CURATOR_LABEL.to_string(), sanitize_dns_label(&curator.name));
    labels.insert(
        CURATION_LABEL.to_string(),
        sanitize_dns_label(template.desired_curation),
    );

    let curate_name = sanitize_dns_label(&format!("curate-{}", template.desired_curation));
    let init_containers = vec![
        phase_container(
            PREHOOK_PHASE.to_string(),
            template.image_uri,
            PREHOOK_PHASE,
            &curator.name,
        ),
        phase_container(
            curate_name,
            template.image_uri,
            template.desired_curation,
            &curator.name,
        ),
        phase_container(
            POSTHOOK_PHASE.to_string(),
            template.image_uri,
            POSTHOOK_PHASE,
            &curator.name,
        ),
    ];
    let complete = phase_container(
        "complete".to_string(),
        template.image_uri,
        DONE_PHASE,
        &curator.name,
    );

    let owner_references = template.curator_uid.map(|uid| {
        vec![OwnerReference {
            api_version: ClusterCurator::api_version(&()).to_string(),
            kind: ClusterCurator::kind(&()).to_string(),
            name: curator.name.clone(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });

    Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: Some(curator.namespace.clone()),
            labels: Some(labels.clone()),
            owner_references,
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(
                i32::try_from(template.ttl.as_secs()).unwrap_or(i32::MAX),
            ),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(template.service_account.to_string()),
                    init_containers: Some(init_containers),
                    containers: vec![complete],
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
