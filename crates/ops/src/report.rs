//! Operator-facing rendering of a reconciliation result.

#![forbid(unsafe_code)]

use std::io::{self, Write};

use knd_core::{Change, ObservedService, ObservedWorkload, ReconcileError, RolloutChange};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{Outcome, UnchangedReason};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Serialize)]
struct Report<'a> {
    reconciled_at: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'a Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorReport<'a>>,
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    message: String,
    #[serde(flatten)]
    detail: &'a ReconcileError,
}

/// Writes one report per reconciliation result.
pub struct Reporter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn report(&mut self, result: &Result<Outcome, ReconcileError>) -> io::Result<()> {
        match result {
            Ok(o) => info!(pair = %o.target(), outcome = ?o, "reconciliation finished"),
            Err(e) => error!(error = %e, "reconciliation failed"),
        }
        match self.format {
            OutputFormat::Human => self.human(result),
            OutputFormat::Json => self.json(result),
        }
    }

    fn json(&mut self, result: &Result<Outcome, ReconcileError>) -> io::Result<()> {
        let report = Report {
            reconciled_at: chrono::Utc::now().to_rfc3339(),
            ok: result.is_ok(),
            outcome: result.as_ref().ok(),
            error: result.as_ref().err().map(|e| ErrorReport { message: e.to_string(), detail: e }),
        };
        serde_json::to_writer_pretty(&mut self.out, &report)?;
        writeln!(self.out)
    }

    fn human(&mut self, result: &Result<Outcome, ReconcileError>) -> io::Result<()> {
        match result {
            Ok(Outcome::Created { workload, service, .. }) => {
                writeln!(self.out, "[INFO] Deployment {} created.\n", workload.name)?;
                self.workload_table(workload)?;
                writeln!(self.out, "\n[INFO] Service {} created.\n", service.name)?;
                self.service_table(service)
            }
            Ok(Outcome::Updated { change, workload, service, .. }) => {
                self.change_lines(change)?;
                writeln!(self.out, "\n[INFO] Deployment {} updated.\n", workload.name)?;
                self.workload_table(workload)?;
                writeln!(self.out, "\n[INFO] Service {} updated.\n", service.name)?;
                self.service_table(service)
            }
            Ok(Outcome::Deleted { target }) => {
                writeln!(self.out, "[INFO] Deployment & Service {} deleted from namespace {}.", target.name, target.namespace)
            }
            Ok(Outcome::Unchanged { target, reason: UnchangedReason::InSync }) => {
                writeln!(self.out, "[INFO] No change in DeploymentSpec for {}.", target)
            }
            Ok(Outcome::Unchanged { target, reason: UnchangedReason::NothingToDelete }) => {
                writeln!(self.out, "[INFO] No such deployment {} found.", target)
            }
            Err(e) => self.error_lines(e),
        }
    }

    fn workload_table(&mut self, w: &ObservedWorkload) -> io::Result<()> {
        let revision = w.generation.map(|g| g.to_string()).unwrap_or_else(|| "-".to_string());
        writeln!(self.out, "{:<16} {:<24} {:<9} {}", "NAMESPACE", "NAME", "REVISION", "IMAGE")?;
        writeln!(self.out, "{:<16} {:<24} {:<9} {}", w.namespace, w.name, revision, w.image)
    }

    fn service_table(&mut self, s: &ObservedService) -> io::Result<()> {
        writeln!(self.out, "{:<16} {}", "NAMESPACE", "NAME")?;
        writeln!(self.out, "{:<16} {}", s.namespace, s.name)
    }

    fn change_lines(&mut self, change: &RolloutChange) -> io::Result<()> {
        writeln!(self.out, "Old Replica: {}", from_or_dash(&change.replicas))?;
        writeln!(self.out, "New Replica: {}\n", change.replicas.to)?;
        writeln!(self.out, "Old Image Version: {}", from_or_dash(&change.image_version))?;
        writeln!(self.out, "New Image Version: {}", change.image_version.to)
    }

    fn error_lines(&mut self, e: &ReconcileError) -> io::Result<()> {
        match e {
            ReconcileError::InvalidInput(msg) => writeln!(self.out, "[ERROR] invalid input: {}", msg),
            ReconcileError::Remote { operation, resource, target, failure, .. } => {
                writeln!(self.out, "[ERROR] {} {} {} failed", operation, resource, target)?;
                writeln!(self.out, "        status: {}", failure)
            }
            ReconcileError::PartialApply { operation, applied, failed, target, failure, .. } => {
                writeln!(self.out, "[ERROR] partial apply on {}", target)?;
                writeln!(self.out, "        {} {}: ok (left in place, reconcile manually)", operation, applied)?;
                writeln!(self.out, "        {} {}: failed", operation, failed)?;
                writeln!(self.out, "        status: {}", failure)
            }
        }?;
        if let Some(change) = e.attempted() {
            writeln!(self.out)?;
            self.change_lines(change)?;
        }
        Ok(())
    }
}

fn from_or_dash<T: ToString>(c: &Change<T>) -> String {
    c.from.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
