//! Classification of observed vs desired state.

#![forbid(unsafe_code)]

use crate::{Observed, ObservedService, ObservedWorkload, ReconciliationDecision, RolloutChange, ServiceSpec, WorkloadSpec};

/// The 2x2 presence matrix of the managed pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPresence<'a> {
    Neither,
    WorkloadOnly(&'a ObservedWorkload),
    ServiceOnly(&'a ObservedService),
    Both(&'a ObservedWorkload, &'a ObservedService),
}

impl<'a> PairPresence<'a> {
    pub fn of(workload: &'a Observed<ObservedWorkload>, service: &'a Observed<ObservedService>) -> Self {
        match (workload.as_present(), service.as_present()) {
            (None, None) => PairPresence::Neither,
            (Some(w), None) => PairPresence::WorkloadOnly(w),
            (None, Some(s)) => PairPresence::ServiceOnly(s),
            (Some(w), Some(s)) => PairPresence::Both(w, s),
        }
    }

    pub fn workload(&self) -> Option<&'a ObservedWorkload> {
        match *self {
            PairPresence::WorkloadOnly(w) | PairPresence::Both(w, _) => Some(w),
            PairPresence::Neither | PairPresence::ServiceOnly(_) => None,
        }
    }

    /// True when exactly one of the two resources exists.
    pub fn is_split(&self) -> bool {
        matches!(self, PairPresence::WorkloadOnly(_) | PairPresence::ServiceOnly(_))
    }
}

/// Maps the presence matrix and desired state to a decision.
pub trait ReconciliationPolicy: Send + Sync {
    fn classify(
        &self,
        presence: PairPresence<'_>,
        desired_workload: &WorkloadSpec,
        desired_service: &ServiceSpec,
    ) -> ReconciliationDecision;

    fn classify_deletion(&self, presence: PairPresence<'_>) -> ReconciliationDecision;
}

/// Treats the workload and service as one unit.
///
/// Only the all-absent cell creates; every other cell compares the workload
/// (an absent workload never matches) and patches both resources on drift.
/// A split pair is not repaired per resource: a patch against the missing
/// half fails and surfaces as a partial apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairedReconciliationPolicy;

impl ReconciliationPolicy for PairedReconciliationPolicy {
    fn classify(
        &self,
        presence: PairPresence<'_>,
        desired_workload: &WorkloadSpec,
        _desired_service: &ServiceSpec,
    ) -> ReconciliationDecision {
        if let PairPresence::Neither = presence {
            return ReconciliationDecision::Create;
        }
        let change = RolloutChange::between(presence.workload(), desired_workload);
        if change.is_changed() {
            ReconciliationDecision::Update(change)
        } else {
            ReconciliationDecision::NoOp
        }
    }

    fn classify_deletion(&self, presence: PairPresence<'_>) -> ReconciliationDecision {
        match presence {
            PairPresence::Neither => ReconciliationDecision::NoOp,
            _ => ReconciliationDecision::Delete,
        }
    }
}

/// Classify with the paired policy.
pub fn classify(
    observed_workload: &Observed<ObservedWorkload>,
    observed_service: &Observed<ObservedService>,
    desired_workload: &WorkloadSpec,
    desired_service: &ServiceSpec,
) -> ReconciliationDecision {
    PairedReconciliationPolicy.classify(
        PairPresence::of(observed_workload, observed_service),
        desired_workload,
        desired_service,
    )
}

pub fn classify_deletion(
    observed_workload: &Observed<ObservedWorkload>,
    observed_service: &Observed<ObservedService>,
) -> ReconciliationDecision {
    PairedReconciliationPolicy.classify_deletion(PairPresence::of(observed_workload, observed_service))
}
