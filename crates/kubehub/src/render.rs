//! Conversion between knd specs and Kubernetes objects.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, PodSpec, PodTemplateSpec, ResourceRequirements, SecurityContext, Service,
    ServicePort, ServiceSpec as K8sServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use knd_core::{image_tag, ObservedService, ObservedWorkload, ResourceQuantities, ServiceSpec, WorkloadSpec};

fn quantities(q: &ResourceQuantities) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("cpu".to_string(), Quantity(q.cpu.clone())),
        ("memory".to_string(), Quantity(q.memory.clone())),
    ])
}

pub fn render_deployment(namespace: &str, spec: &WorkloadSpec) -> Deployment {
    let t = &spec.template;
    let container = Container {
        name: t.container_name.clone(),
        image: Some(spec.image()),
        ports: Some(vec![ContainerPort { container_port: t.container_port, ..Default::default() }]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                drop: Some(t.capabilities.drop.clone()),
                add: Some(t.capabilities.add.clone()),
            }),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            requests: Some(quantities(&t.resources.requests)),
            limits: Some(quantities(&t.resources.limits)),
            ..Default::default()
        }),
        ..Default::default()
    };
    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector { match_labels: Some(t.labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(t.labels.clone()), ..Default::default() }),
                spec: Some(PodSpec { containers: vec![container], ..Default::default() }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn render_service(namespace: &str, spec: &ServiceSpec) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(K8sServiceSpec {
            ports: Some(vec![ServicePort {
                port: spec.port,
                protocol: Some(spec.protocol.clone()),
                ..Default::default()
            }]),
            selector: Some(spec.selector.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Project a stored Deployment. `namespace` fills in when the server omits metadata.namespace.
pub fn observe_deployment(namespace: &str, d: &Deployment) -> ObservedWorkload {
    let spec = d.spec.as_ref();
    // Server-side default for an unset replica count is 1.
    let replicas = spec.and_then(|s| s.replicas).unwrap_or(1);
    let image = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    ObservedWorkload {
        namespace: d.metadata.namespace.clone().unwrap_or_else(|| namespace.to_string()),
        name: d.metadata.name.clone().unwrap_or_default(),
        replicas,
        image_version: image_tag(&image).to_string(),
        image,
        generation: d.metadata.generation,
    }
}

pub fn observe_service(namespace: &str, s: &Service) -> ObservedService {
    ObservedService {
        namespace: s.metadata.namespace.clone().unwrap_or_else(|| namespace.to_string()),
        name: s.metadata.name.clone().unwrap_or_default(),
        cluster_ip: s.spec.as_ref().and_then(|sp| sp.cluster_ip.clone()),
    }
}
