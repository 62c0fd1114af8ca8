//! knd kubehub – the remote store the reconciler reads and writes through.
//!
//! [`WorkloadStore`] is the seam: [`KubeStore`] talks to the API server via
//! kube-rs, tests substitute an in-memory store. Reads return
//! [`Observed::Absent`] for 404; every other failure is a [`RemoteFailure`].
//! No caching: each call goes to the server.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy},
    Client,
};
use knd_core::{Observed, ObservedService, ObservedWorkload, RemoteFailure, ServiceSpec, WorkloadSpec};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod render;

pub use render::{observe_deployment, observe_service, render_deployment, render_service};

pub type StoreResult<T> = std::result::Result<T, RemoteFailure>;

/// Deletion propagation for the workload's dependents (ReplicaSets, Pods).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    Foreground,
    Background,
    Orphan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub propagation: Propagation,
    pub grace_period_seconds: u32,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self { propagation: Propagation::Foreground, grace_period_seconds: 2 }
    }
}

impl DeleteOptions {
    fn params(&self) -> DeleteParams {
        let propagation_policy = match self.propagation {
            Propagation::Foreground => PropagationPolicy::Foreground,
            Propagation::Background => PropagationPolicy::Background,
            Propagation::Orphan => PropagationPolicy::Orphan,
        };
        DeleteParams {
            grace_period_seconds: Some(self.grace_period_seconds),
            propagation_policy: Some(propagation_policy),
            ..Default::default()
        }
    }
}

/// Read/create/patch/delete for the Deployment + Service pair, keyed by namespace and name.
#[async_trait::async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn get_workload(&self, namespace: &str, name: &str) -> StoreResult<Observed<ObservedWorkload>>;
    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Observed<ObservedService>>;
    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> StoreResult<ObservedWorkload>;
    async fn create_service(&self, namespace: &str, spec: &ServiceSpec) -> StoreResult<ObservedService>;
    async fn patch_workload(&self, namespace: &str, spec: &WorkloadSpec) -> StoreResult<ObservedWorkload>;
    async fn patch_service(&self, namespace: &str, spec: &ServiceSpec) -> StoreResult<ObservedService>;
    async fn delete_workload(&self, namespace: &str, name: &str, opts: &DeleteOptions) -> StoreResult<()>;
    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

/// Build a client from the ambient kubeconfig / in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("loading kube config")
}

/// Map a kube error to a store failure, keeping the API status when there is one.
pub fn failure_from(err: kube::Error) -> RemoteFailure {
    match err {
        kube::Error::Api(ae) => RemoteFailure::new(Some(ae.code), ae.reason, ae.message),
        other => RemoteFailure::new(None, "Transport", other.to_string()),
    }
}

/// [`WorkloadStore`] backed by the Kubernetes API.
pub struct KubeStore {
    client: Client,
    call_timeout: Duration,
}

impl KubeStore {
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self { client, call_timeout }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn call<T, F>(&self, op: &'static str, name: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>> + Send,
    {
        counter!("knd_remote_calls_total", 1u64);
        debug!(op, name = %name, "remote call");
        let res = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(failure_from(e)),
            Err(_) => Err(RemoteFailure::new(
                None,
                "Timeout",
                format!("{} {} timed out after {}s", op, name, self.call_timeout.as_secs()),
            )),
        };
        if let Err(f) = &res {
            counter!("knd_remote_errors_total", 1u64);
            if !f.is_not_found() {
                warn!(op, name = %name, error = %f, "remote call failed");
            }
        }
        res
    }
}

#[async_trait::async_trait]
impl WorkloadStore for KubeStore {
    async fn get_workload(&self, namespace: &str, name: &str) -> StoreResult<Observed<ObservedWorkload>> {
        let api = self.deployments(namespace);
        let found = self.call("get_deployment", name, api.get_opt(name)).await?;
        Ok(found.map(|d| observe_deployment(namespace, &d)).into())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> StoreResult<Observed<ObservedService>> {
        let api = self.services(namespace);
        let found = self.call("get_service", name, api.get_opt(name)).await?;
        Ok(found.map(|s| observe_service(namespace, &s)).into())
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> StoreResult<ObservedWorkload> {
        let api = self.deployments(namespace);
        let body = render_deployment(namespace, spec);
        let pp = PostParams::default();
        let created = self.call("create_deployment", &spec.name, api.create(&pp, &body)).await?;
        Ok(observe_deployment(namespace, &created))
    }

    async fn create_service(&self, namespace: &str, spec: &ServiceSpec) -> StoreResult<ObservedService> {
        let api = self.services(namespace);
        let body = render_service(namespace, spec);
        let pp = PostParams::default();
        let created = self.call("create_service", &spec.name, api.create(&pp, &body)).await?;
        Ok(observe_service(namespace, &created))
    }

    async fn patch_workload(&self, namespace: &str, spec: &WorkloadSpec) -> StoreResult<ObservedWorkload> {
        let api = self.deployments(namespace);
        let body = render_deployment(namespace, spec);
        let pp = PatchParams::default();
        let patched = self
            .call("patch_deployment", &spec.name, api.patch(&spec.name, &pp, &Patch::Strategic(&body)))
            .await?;
        Ok(observe_deployment(namespace, &patched))
    }

    async fn patch_service(&self, namespace: &str, spec: &ServiceSpec) -> StoreResult<ObservedService> {
        let api = self.services(namespace);
        let body = render_service(namespace, spec);
        let pp = PatchParams::default();
        let patched = self
            .call("patch_service", &spec.name, api.patch(&spec.name, &pp, &Patch::Strategic(&body)))
            .await?;
        Ok(observe_service(namespace, &patched))
    }

    async fn delete_workload(&self, namespace: &str, name: &str, opts: &DeleteOptions) -> StoreResult<()> {
        let api = self.deployments(namespace);
        let dp = opts.params();
        self.call("delete_deployment", name, api.delete(name, &dp)).await?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let api = self.services(namespace);
        let dp = DeleteParams::default();
        self.call("delete_service", name, api.delete(name, &dp)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    #[test]
    fn api_errors_keep_status_code() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "services \"web\" is forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        let f = failure_from(err);
        assert_eq!(f.code, Some(403));
        assert_eq!(f.reason, "Forbidden");
        assert!(!f.is_not_found());
    }

    #[test]
    fn not_found_is_recognised() {
        let err = kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "deployments.apps \"web\" not found".into(),
            reason: "NotFound".into(),
            code: 404,
        });
        assert!(failure_from(err).is_not_found());
    }

    #[test]
    fn default_delete_options_are_foreground_with_grace() {
        let dp = DeleteOptions::default().params();
        assert_eq!(dp.grace_period_seconds, Some(2));
        assert!(matches!(dp.propagation_policy, Some(PropagationPolicy::Foreground)));
    }
}
