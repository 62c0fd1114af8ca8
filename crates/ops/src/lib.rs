//! knd ops: one reconciliation pass over a Deployment/Service pair.
//!
//! A pass is linear: fetch both resources, classify, act, return an
//! [`Outcome`]. Nothing is cached between passes, so running the same pass
//! twice collapses to `Unchanged` once the first one has applied.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use knd_core::{
    Observed, ObservedService, ObservedWorkload, Operation, PairPresence, PairedReconciliationPolicy, ReconcileError,
    ReconciliationDecision, ReconciliationPolicy, RemoteFailure, ResourceKind, RolloutChange, ServiceSpec, Target,
    WorkloadSpec,
};
use knd_kubehub::{DeleteOptions, WorkloadStore};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub mod report;

pub use report::{OutputFormat, Reporter};

/// Result of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Created { target: Target, workload: ObservedWorkload, service: ObservedService },
    Updated { target: Target, change: RolloutChange, workload: ObservedWorkload, service: ObservedService },
    Deleted { target: Target },
    Unchanged { target: Target, reason: UnchangedReason },
}

impl Outcome {
    pub fn target(&self) -> &Target {
        match self {
            Outcome::Created { target, .. }
            | Outcome::Updated { target, .. }
            | Outcome::Deleted { target }
            | Outcome::Unchanged { target, .. } => target,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Outcome::Created { .. } => "created",
            Outcome::Updated { .. } => "updated",
            Outcome::Deleted { .. } => "deleted",
            Outcome::Unchanged { .. } => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnchangedReason {
    /// Observed workload already matches the desired replicas and image.
    InSync,
    /// Deletion requested but neither resource exists.
    NothingToDelete,
}

/// Reporting delay after an action, proportional to the replica count.
///
/// Mirrors the time a rollout takes to settle for someone watching the
/// terminal; it has no effect on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    per_replica: Duration,
    max: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self { per_replica: Duration::from_millis(500), max: Duration::from_secs(30) }
    }
}

impl Pacing {
    pub fn disabled() -> Self {
        Self { per_replica: Duration::ZERO, max: Duration::ZERO }
    }

    pub fn per_replica(per_replica: Duration) -> Self {
        Self { per_replica, ..Self::default() }
    }

    pub fn is_enabled(&self) -> bool {
        !self.per_replica.is_zero() && !self.max.is_zero()
    }

    /// Total delay for `replicas`, capped at `max`.
    pub fn delay_for(&self, replicas: i32) -> Duration {
        if !self.is_enabled() || replicas <= 0 {
            return Duration::ZERO;
        }
        self.per_replica.saturating_mul(replicas as u32).min(self.max)
    }

    pub async fn wait(&self, replicas: i32, stage: &str) {
        let d = self.delay_for(replicas);
        if d.is_zero() {
            return;
        }
        debug!(stage, replicas, delay_ms = d.as_millis() as u64, "pacing");
        tokio::time::sleep(d).await;
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub namespace: String,
    pub deletion: DeleteOptions,
    pub pacing: Pacing,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self { namespace: "default".into(), deletion: DeleteOptions::default(), pacing: Pacing::default() }
    }
}

pub struct Reconciler<S, P = PairedReconciliationPolicy> {
    store: S,
    policy: P,
    config: ReconcilerConfig,
}

impl<S: WorkloadStore> Reconciler<S> {
    pub fn new(store: S, config: ReconcilerConfig) -> Self {
        Self::with_policy(store, PairedReconciliationPolicy, config)
    }
}

impl<S: WorkloadStore, P: ReconciliationPolicy> Reconciler<S, P> {
    pub fn with_policy(store: S, policy: P, config: ReconcilerConfig) -> Self {
        Self { store, policy, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Bring the pair named by the specs to the desired state.
    pub async fn reconcile(
        &self,
        desired_workload: &WorkloadSpec,
        desired_service: &ServiceSpec,
    ) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let res = self.reconcile_inner(desired_workload, desired_service).await;
        record(&res, t0);
        res
    }

    /// Delete both resources of the pair named `name`.
    pub async fn delete(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let t0 = Instant::now();
        let res = self.delete_inner(name).await;
        record(&res, t0);
        res
    }

    async fn reconcile_inner(
        &self,
        desired_workload: &WorkloadSpec,
        desired_service: &ServiceSpec,
    ) -> Result<Outcome, ReconcileError> {
        if desired_workload.replicas < 0 {
            return Err(ReconcileError::InvalidInput(format!(
                "replica count must be >= 0 (got {})",
                desired_workload.replicas
            )));
        }
        if desired_workload.name != desired_service.name {
            return Err(ReconcileError::InvalidInput(format!(
                "workload {:?} and service {:?} must share a name",
                desired_workload.name, desired_service.name
            )));
        }
        let target = self.target(&desired_workload.name);
        let (observed_workload, observed_service) = self.fetch(&target).await?;
        let presence = PairPresence::of(&observed_workload, &observed_service);
        if presence.is_split() {
            warn!(pair = %target, workload = observed_workload.is_present(), service = observed_service.is_present(), "pair is split; reconciling as a unit");
        }
        let decision = self.policy.classify(presence, desired_workload, desired_service);
        info!(pair = %target, decision = ?decision, "classified");

        match decision {
            ReconciliationDecision::Create => self.create(target, desired_workload, desired_service).await,
            ReconciliationDecision::Update(change) => self.update(target, change, desired_workload, desired_service).await,
            ReconciliationDecision::NoOp => {
                self.config.pacing.wait(desired_workload.replicas, "in-sync").await;
                Ok(Outcome::Unchanged { target, reason: UnchangedReason::InSync })
            }
            ReconciliationDecision::Delete => self.remove(target, &observed_workload).await,
        }
    }

    async fn delete_inner(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let target = self.target(name);
        let (observed_workload, observed_service) = self.fetch(&target).await?;
        match self.policy.classify_deletion(PairPresence::of(&observed_workload, &observed_service)) {
            ReconciliationDecision::NoOp => {
                info!(pair = %target, "no such deployment or service; nothing to delete");
                Ok(Outcome::Unchanged { target, reason: UnchangedReason::NothingToDelete })
            }
            ReconciliationDecision::Delete => self.remove(target, &observed_workload).await,
            other => Err(ReconcileError::InvalidInput(format!("deletion policy returned {:?}", other))),
        }
    }

    fn target(&self, name: &str) -> Target {
        Target::new(self.config.namespace.clone(), name)
    }

    async fn fetch(
        &self,
        target: &Target,
    ) -> Result<(Observed<ObservedWorkload>, Observed<ObservedService>), ReconcileError> {
        let workload = self
            .store
            .get_workload(&target.namespace, &target.name)
            .await
            .map_err(|f| remote(Operation::Get, ResourceKind::Workload, target, f, None))?;
        let service = self
            .store
            .get_service(&target.namespace, &target.name)
            .await
            .map_err(|f| remote(Operation::Get, ResourceKind::Service, target, f, None))?;
        debug!(pair = %target, workload = ?workload, service = ?service, "observed");
        Ok((workload, service))
    }

    async fn create(
        &self,
        target: Target,
        desired_workload: &WorkloadSpec,
        desired_service: &ServiceSpec,
    ) -> Result<Outcome, ReconcileError> {
        let ns = target.namespace.as_str();
        info!(pair = %target, replicas = desired_workload.replicas, image = %desired_workload.image(), "creating deployment");
        let workload = self
            .store
            .create_workload(ns, desired_workload)
            .await
            .map_err(|f| remote(Operation::Create, ResourceKind::Workload, &target, f, None))?;
        info!(pair = %target, "creating service");
        let service = self.store.create_service(ns, desired_service).await.map_err(|f| {
            partial(Operation::Create, ResourceKind::Workload, ResourceKind::Service, &target, f, None)
        })?;
        self.config.pacing.wait(workload.replicas, "create").await;
        Ok(Outcome::Created { target, workload, service })
    }

    async fn update(
        &self,
        target: Target,
        change: RolloutChange,
        desired_workload: &WorkloadSpec,
        desired_service: &ServiceSpec,
    ) -> Result<Outcome, ReconcileError> {
        let ns = target.namespace.as_str();
        let next_workload = desired_workload.with_rollout(&change);
        let next_service = desired_service.clone();
        info!(
            pair = %target,
            old_replicas = ?change.replicas.from,
            new_replicas = change.replicas.to,
            old_image = ?change.image_version.from,
            new_image = %change.image_version.to,
            "updating deployment"
        );
        let workload = self
            .store
            .patch_workload(ns, &next_workload)
            .await
            .map_err(|f| remote(Operation::Patch, ResourceKind::Workload, &target, f, Some(change.clone())))?;
        let service = self.store.patch_service(ns, &next_service).await.map_err(|f| {
            partial(Operation::Patch, ResourceKind::Workload, ResourceKind::Service, &target, f, Some(change.clone()))
        })?;
        self.config.pacing.wait(workload.replicas, "update").await;
        Ok(Outcome::Updated { target, change, workload, service })
    }

    async fn remove(
        &self,
        target: Target,
        observed_workload: &Observed<ObservedWorkload>,
    ) -> Result<Outcome, ReconcileError> {
        let ns = target.namespace.as_str();
        info!(pair = %target, propagation = ?self.config.deletion.propagation, "deleting deployment and service");
        let workload_deleted = match self.store.delete_workload(ns, &target.name, &self.config.deletion).await {
            Ok(()) => true,
            Err(f) if f.is_not_found() => false,
            Err(f) => return Err(remote(Operation::Delete, ResourceKind::Workload, &target, f, None)),
        };
        match self.store.delete_service(ns, &target.name).await {
            Ok(()) => {}
            Err(f) if f.is_not_found() => {}
            Err(f) if workload_deleted => {
                return Err(partial(Operation::Delete, ResourceKind::Workload, ResourceKind::Service, &target, f, None))
            }
            Err(f) => return Err(remote(Operation::Delete, ResourceKind::Service, &target, f, None)),
        }
        let replicas = observed_workload.as_present().map(|w| w.replicas).unwrap_or(0);
        self.config.pacing.wait(replicas, "delete").await;
        Ok(Outcome::Deleted { target })
    }
}

fn remote(
    operation: Operation,
    resource: ResourceKind,
    target: &Target,
    failure: RemoteFailure,
    attempted: Option<RolloutChange>,
) -> ReconcileError {
    ReconcileError::Remote { operation, resource, target: target.clone(), failure, attempted }
}

fn partial(
    operation: Operation,
    applied: ResourceKind,
    failed: ResourceKind,
    target: &Target,
    failure: RemoteFailure,
    attempted: Option<RolloutChange>,
) -> ReconcileError {
    warn!(pair = %target, %operation, %applied, %failed, error = %failure, "partial apply; no rollback attempted");
    ReconcileError::PartialApply { operation, applied, failed, target: target.clone(), failure, attempted }
}

fn record(res: &Result<Outcome, ReconcileError>, t0: Instant) {
    let label = match res {
        Ok(o) => o.label(),
        Err(ReconcileError::InvalidInput(_)) => "invalid_input",
        Err(ReconcileError::Remote { .. }) => "remote_error",
        Err(ReconcileError::PartialApply { .. }) => "partial_apply",
    };
    counter!("knd_reconcile_total", 1u64, "outcome" => label);
    histogram!("knd_reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacing_scales_with_replicas_and_caps() {
        let p = Pacing::per_replica(Duration::from_millis(500));
        assert_eq!(p.delay_for(0), Duration::ZERO);
        assert_eq!(p.delay_for(-2), Duration::ZERO);
        assert_eq!(p.delay_for(3), Duration::from_millis(1500));
        assert_eq!(p.delay_for(1000), Duration::from_secs(30));
    }

    #[test]
    fn disabled_pacing_never_waits() {
        let p = Pacing::disabled();
        assert!(!p.is_enabled());
        assert_eq!(p.delay_for(10), Duration::ZERO);
    }

    #[test]
    fn outcome_exposes_target() {
        let o = Outcome::Deleted { target: Target::new("default", "web") };
        assert_eq!(o.target().to_string(), "default/web");
        assert_eq!(o.label(), "deleted");
    }
}
