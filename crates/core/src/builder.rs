//! Desired-state construction.
//!
//! Everything here is pure: inputs are validated and turned into spec values,
//! no remote store is touched. The structural fields of the Deployment and
//! Service (ports, resource bounds, capability set, labels) come from a
//! [`StructuralPolicy`] value rather than per-call arguments.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ReconcileError, ServiceSpec, WorkloadSpec};

// RFC 1123 label, which is what Deployment and Service names must be.
static DNS_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("valid regex"));
// OCI image tag grammar.
static IMAGE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceQuantities {
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceBounds {
    pub requests: ResourceQuantities,
    pub limits: ResourceQuantities,
}

/// Linux capabilities for the container security context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilitySet {
    pub drop: Vec<String>,
    pub add: Vec<String>,
}

/// Operational policy applied to every spec the builder produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StructuralPolicy {
    pub container_name: String,
    pub image_repository: String,
    pub container_port: i32,
    pub service_port: i32,
    pub protocol: String,
    /// Labels stamped on the pod template; also used as the Deployment selector.
    pub pod_labels: BTreeMap<String, String>,
    /// Service selector. Must be a subset of `pod_labels`.
    pub selector: BTreeMap<String, String>,
    pub resources: ResourceBounds,
    pub capabilities: CapabilitySet,
}

impl Default for StructuralPolicy {
    fn default() -> Self {
        let app = BTreeMap::from([("app".to_string(), "nginx".to_string())]);
        Self {
            container_name: "nginx".into(),
            image_repository: "nginx".into(),
            container_port: 9090,
            service_port: 9090,
            protocol: "TCP".into(),
            pod_labels: app.clone(),
            selector: app,
            resources: ResourceBounds {
                requests: ResourceQuantities { cpu: "100m".into(), memory: "200Mi".into() },
                limits: ResourceQuantities { cpu: "500m".into(), memory: "500Mi".into() },
            },
            capabilities: CapabilitySet {
                drop: vec!["ALL".into()],
                add: vec!["NET_BIND_SERVICE".into(), "NET_ADMIN".into(), "SYS_TIME".into()],
            },
        }
    }
}

impl StructuralPolicy {
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let invalid = |msg: String| -> Result<(), ReconcileError> { Err(ReconcileError::InvalidInput(msg)) };
        if self.container_name.trim().is_empty() {
            return invalid("policy: container_name must not be empty".into());
        }
        if self.image_repository.trim().is_empty() {
            return invalid("policy: image_repository must not be empty".into());
        }
        for (field, port) in [("container_port", self.container_port), ("service_port", self.service_port)] {
            if !(1..=65535).contains(&port) {
                return invalid(format!("policy: {} {} out of range 1-65535", field, port));
            }
        }
        if !matches!(self.protocol.as_str(), "TCP" | "UDP" | "SCTP") {
            return invalid(format!("policy: unsupported protocol {:?}", self.protocol));
        }
        if self.selector.is_empty() {
            return invalid("policy: service selector must not be empty".into());
        }
        // A selector key the pods don't carry yields a Service with no endpoints.
        for (k, v) in self.selector.iter() {
            if self.pod_labels.get(k) != Some(v) {
                return invalid(format!("policy: selector {}={} does not match any pod label", k, v));
            }
        }
        Ok(())
    }

    fn template(&self) -> PodTemplate {
        PodTemplate {
            container_name: self.container_name.clone(),
            image_repository: self.image_repository.clone(),
            container_port: self.container_port,
            labels: self.pod_labels.clone(),
            resources: self.resources.clone(),
            capabilities: self.capabilities.clone(),
        }
    }
}

/// Structural part of a [`WorkloadSpec`], copied from the policy at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub container_name: String,
    pub image_repository: String,
    pub container_port: i32,
    pub labels: BTreeMap<String, String>,
    pub resources: ResourceBounds,
    pub capabilities: CapabilitySet,
}

fn validate_name(name: &str) -> Result<(), ReconcileError> {
    if name.is_empty() {
        return Err(ReconcileError::InvalidInput("deployment name is required".into()));
    }
    if !DNS_LABEL.is_match(name) {
        return Err(ReconcileError::InvalidInput(format!(
            "deployment name {:?} is not a valid DNS-1123 label",
            name
        )));
    }
    Ok(())
}

/// Build the desired Deployment state. Fails fast on negative replicas or malformed names/tags.
pub fn build_workload_spec(
    policy: &StructuralPolicy,
    replicas: i32,
    image_version: &str,
    name: &str,
) -> Result<WorkloadSpec, ReconcileError> {
    if replicas < 0 {
        return Err(ReconcileError::InvalidInput(format!("replica count must be >= 0 (got {})", replicas)));
    }
    validate_name(name)?;
    if !IMAGE_TAG.is_match(image_version) {
        return Err(ReconcileError::InvalidInput(format!("image version {:?} is not a valid tag", image_version)));
    }
    policy.validate()?;
    Ok(WorkloadSpec {
        name: name.to_string(),
        replicas,
        image_version: image_version.to_string(),
        template: policy.template(),
    })
}

/// Build the desired Service state for the workload of the same name.
pub fn build_service_spec(policy: &StructuralPolicy, name: &str) -> Result<ServiceSpec, ReconcileError> {
    validate_name(name)?;
    policy.validate()?;
    Ok(ServiceSpec {
        name: name.to_string(),
        port: policy.service_port,
        protocol: policy.protocol.clone(),
        selector: policy.selector.clone(),
        labels: policy.pod_labels.clone(),
    })
}
