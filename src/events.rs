//! Kubernetes Event recording for curation failures and launches.
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so the reconciler
//! can be tested without an API server.
//!
//! Publishing is fire-and-forget: a failed Event is logged at warn and
//! dropped. It never replaces or masks the error a reconcile returns.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::{error, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::CuratorRef;
use crate::Error;

/// Publishes Kubernetes Events about a ClusterCurator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The ClusterCurator this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - What the controller was doing (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`.
    pub fn new(client: Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                object = ?resource_ref.name,
                error = %e,
                "failed to publish Kubernetes event"
            );
        }
    }
}

/// Publisher that drops every event.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`).
pub mod reasons {
    /// RBAC for the curation job could not be applied
    pub const RBAC_FAILED: &str = "RbacProvisioningFailed";
    /// The curation job could not be created or recorded
    pub const LAUNCH_FAILED: &str = "CurationLaunchFailed";
    /// The curation job was created and recorded on the curator
    pub const CURATION_STARTED: &str = "CurationStarted";
}

/// Event actions (ACTION column of `kubectl get events`).
pub mod actions {
    /// Applying ServiceAccount, Role and RoleBinding
    pub const PROVISION_RBAC: &str = "ProvisionRbac";
    /// Creating the curation job
    pub const LAUNCH: &str = "Launch";
}

/// Step of a curation that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureStage {
    /// Applying the curation RBAC
    Rbac,
    /// Creating or recording the curation job
    Launch,
}

impl FailureStage {
    /// Event reason for a failure in this stage
    pub fn reason(self) -> &'static str {
        match self {
            Self::Rbac => reasons::RBAC_FAILED,
            Self::Launch => reasons::LAUNCH_FAILED,
        }
    }

    /// Event action for this stage
    pub fn action(self) -> &'static str {
        match self {
            Self::Rbac => actions::PROVISION_RBAC,
            Self::Launch => actions::LAUNCH,
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rbac => write!(f, "rbac"),
            Self::Launch => write!(f, "launch"),
        }
    }
}

/// Where curation failures are reported.
///
/// Reporting cannot fail from the caller's point of view; the reconcile still
/// returns the original error afterwards.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FailureSink: Send + Sync {
    /// Report that `stage` failed for `curator`
    async fn record(&self, curator: &CuratorRef, stage: FailureStage, error: &Error);
}

/// Logs failures and mirrors them as Warning Events on the curator
pub struct EventFailureSink {
    events: Arc<dyn EventPublisher>,
}

impl EventFailureSink {
    /// Report through the given publisher
    pub fn new(events: Arc<dyn EventPublisher>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl FailureSink for EventFailureSink {
    async fn record(&self, curator: &CuratorRef, stage: FailureStage, err: &Error) {
        error!(curator = %curator, %stage, error = %err, "curation step failed");
        self.events
            .publish(
                &curator.object_ref(),
                EventType::Warning,
                stage.reason(),
                stage.action(),
                Some(err.to_string()),
            )
            .await;
    }
}
