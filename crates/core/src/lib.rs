//! knd core types: desired state, observed state, reconciliation decisions
//! and the error taxonomy shared by the store, reconciler and reporter.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod builder;
mod compare;

pub use builder::{
    build_service_spec, build_workload_spec, CapabilitySet, PodTemplate, ResourceBounds, ResourceQuantities,
    StructuralPolicy,
};
pub use compare::{classify, classify_deletion, PairPresence, PairedReconciliationPolicy, ReconciliationPolicy};

/// Desired state of the managed Deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    /// Never negative; enforced by [`build_workload_spec`].
    pub replicas: i32,
    pub image_version: String,
    pub template: PodTemplate,
}

impl WorkloadSpec {
    /// Full image reference, e.g. `nginx:1.20.1`.
    pub fn image(&self) -> String {
        format!("{}:{}", self.template.image_repository, self.image_version)
    }

    /// Derive a new spec carrying the target values of `change`. `self` is left untouched.
    pub fn with_rollout(&self, change: &RolloutChange) -> WorkloadSpec {
        WorkloadSpec {
            replicas: change.replicas.to,
            image_version: change.image_version.to.clone(),
            ..self.clone()
        }
    }
}

/// Desired state of the Service fronting the workload. Shares the workload's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub port: i32,
    pub protocol: String,
    pub selector: std::collections::BTreeMap<String, String>,
    pub labels: std::collections::BTreeMap<String, String>,
}

/// Namespace + name of the managed pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub namespace: String,
    pub name: String,
}

impl Target {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Result of reading one resource from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "object", rename_all = "snake_case")]
pub enum Observed<T> {
    Present(T),
    Absent,
}

impl<T> Observed<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Observed::Present(_))
    }

    pub fn as_present(&self) -> Option<&T> {
        match self {
            Observed::Present(v) => Some(v),
            Observed::Absent => None,
        }
    }
}

impl<T> From<Option<T>> for Observed<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Observed::Present(v),
            None => Observed::Absent,
        }
    }
}

/// Deployment as currently stored in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedWorkload {
    pub namespace: String,
    pub name: String,
    pub replicas: i32,
    /// Full image reference of the first container.
    pub image: String,
    /// Tag part of `image`.
    pub image_version: String,
    pub generation: Option<i64>,
}

/// Service as currently stored in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedService {
    pub namespace: String,
    pub name: String,
    pub cluster_ip: Option<String>,
}

/// Extract the tag of an image reference. A reference without a tag reads as `latest`.
///
/// The tag is whatever follows the last `:` after the last `/`, so registry
/// ports (`registry:5000/nginx`) are not mistaken for tags. Digests are dropped.
pub fn image_tag(image: &str) -> &str {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last_segment = without_digest.rsplit('/').next().unwrap_or(without_digest);
    match last_segment.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag,
        _ => "latest",
    }
}

/// Before/after pair for one field of an update. `from` is `None` when nothing was observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change<T> {
    pub from: Option<T>,
    pub to: T,
}

impl<T: PartialEq> Change<T> {
    pub fn is_changed(&self) -> bool {
        self.from.as_ref() != Some(&self.to)
    }
}

/// Replica and image deltas between the observed workload and the desired spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutChange {
    pub replicas: Change<i32>,
    pub image_version: Change<String>,
}

impl RolloutChange {
    pub fn between(current: Option<&ObservedWorkload>, desired: &WorkloadSpec) -> Self {
        Self {
            replicas: Change { from: current.map(|w| w.replicas), to: desired.replicas },
            image_version: Change {
                from: current.map(|w| w.image_version.clone()),
                to: desired.image_version.clone(),
            },
        }
    }

    pub fn is_changed(&self) -> bool {
        self.replicas.is_changed() || self.image_version.is_changed()
    }
}

/// Action required to move the observed pair toward the desired pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconciliationDecision {
    NoOp,
    Create,
    Update(RolloutChange),
    Delete,
}

/// Which half of the managed pair a remote call concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Workload,
    Service,
}

impl ResourceKind {
    /// Kubernetes kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::Workload => "Deployment",
            ResourceKind::Service => "Service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Get,
    Create,
    Patch,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Patch => "patch",
            Operation::Delete => "delete",
        })
    }
}

/// A non-404 failure reported by the remote store.
///
/// `code` is the HTTP status when the API server answered; `None` for
/// transport errors and call timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{}{reason}: {message}", .code.map(|c| format!("{} ", c)).unwrap_or_default())]
pub struct RemoteFailure {
    pub code: Option<u16>,
    pub reason: String,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(code: Option<u16>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code, reason: reason.into(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Some(404)
    }
}

/// Errors surfaced by a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ReconcileError {
    /// Rejected before any remote call.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A remote call failed and nothing was written in this pass.
    #[error("{operation} {resource} {target} failed: {failure}")]
    Remote {
        operation: Operation,
        resource: ResourceKind,
        target: Target,
        failure: RemoteFailure,
        attempted: Option<RolloutChange>,
    },
    /// `applied` was written, then the call for `failed` errored. No rollback is attempted.
    #[error("partial apply on {target}: {operation} {applied} succeeded, {operation} {failed} failed: {failure}")]
    PartialApply {
        operation: Operation,
        applied: ResourceKind,
        failed: ResourceKind,
        target: Target,
        failure: RemoteFailure,
        attempted: Option<RolloutChange>,
    },
}

impl ReconcileError {
    /// Resource the failure originated from, if a remote call was involved.
    pub fn failed_resource(&self) -> Option<ResourceKind> {
        match self {
            ReconcileError::InvalidInput(_) => None,
            ReconcileError::Remote { resource, .. } => Some(*resource),
            ReconcileError::PartialApply { failed, .. } => Some(*failed),
        }
    }

    pub fn attempted(&self) -> Option<&RolloutChange> {
        match self {
            ReconcileError::InvalidInput(_) => None,
            ReconcileError::Remote { attempted, .. } | ReconcileError::PartialApply { attempted, .. } => {
                attempted.as_ref()
            }
        }
    }
}

pub mod prelude {
    pub use super::{
        Change, Observed, ObservedService, ObservedWorkload, Operation, ReconcileError, ReconciliationDecision,
        RemoteFailure, ResourceKind, RolloutChange, ServiceSpec, Target, WorkloadSpec,
    };
}
