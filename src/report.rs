//! Run summaries: the failure ledger, console rendering and JSON output.

use crate::copier::CopyOutcome;
use crate::duplicate::DuplicateReport;
use crate::error::CopyError;
use crate::inventory::{InventorySummary, ScanFailure};
use crate::orchestrator::RunMode;
use crate::reconcile::ReconcileReport;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::time::Duration;

const RULE_WIDTH: usize = 70;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retries exhausted on a transient store error.
    Transient,
    /// Destination container migrated from another region.
    Collision,
    /// Checksum or size mismatch after transfer.
    Integrity,
    /// Local staging failed.
    Staging,
    /// Listing failed; the scope was skipped.
    Scan,
    /// Any other store refusal.
    Store,
    /// The worker task itself died.
    Worker,
}

impl From<&CopyError> for FailureKind {
    fn from(e: &CopyError) -> Self {
        match e {
            CopyError::ChecksumMismatch { .. } | CopyError::SizeMismatch { .. } => {
                FailureKind::Integrity
            }
            CopyError::RetriesExhausted { .. } => FailureKind::Transient,
            CopyError::Collision { .. } => FailureKind::Collision,
            CopyError::StagingExhausted { .. } | CopyError::Staging { .. } => FailureKind::Staging,
            CopyError::Store(_) => FailureKind::Store,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Transient => "transient",
            FailureKind::Collision => "collision",
            FailureKind::Integrity => "integrity",
            FailureKind::Staging => "staging",
            FailureKind::Scan => "scan",
            FailureKind::Store => "store",
            FailureKind::Worker => "worker",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub tenant: String,
    pub container: Option<String>,
    pub object: Option<String>,
    pub kind: FailureKind,
    pub error: String,
}

impl Failure {
    pub fn copy(tenant: &str, container: Option<&str>, object: Option<&str>, e: &CopyError) -> Self {
        Self {
            tenant: tenant.to_string(),
            container: container.map(str::to_string),
            object: object.map(str::to_string),
            kind: e.into(),
            error: e.to_string(),
        }
    }

    pub fn tenant(tenant: &str, kind: FailureKind, error: impl fmt::Display) -> Self {
        Self {
            tenant: tenant.to_string(),
            container: None,
            object: None,
            kind,
            error: error.to_string(),
        }
    }

    fn location(&self) -> String {
        let mut location = self.tenant.clone();
        for part in [&self.container, &self.object].into_iter().flatten() {
            location.push('/');
            location.push_str(part);
        }
        location
    }
}

impl From<ScanFailure> for Failure {
    fn from(f: ScanFailure) -> Self {
        Self {
            tenant: f.tenant,
            container: f.container,
            object: None,
            kind: FailureKind::Scan,
            error: f.error,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CopyTotals {
    pub copied_objects: u64,
    pub copied_bytes: u64,
    pub segments: u64,
    pub skipped: u64,
    pub vanished: u64,
}

impl CopyTotals {
    pub fn record(&mut self, outcome: &CopyOutcome) {
        match outcome {
            CopyOutcome::Skipped => self.skipped += 1,
            CopyOutcome::Vanished => self.vanished += 1,
            CopyOutcome::Copied { bytes, segments } => {
                self.copied_objects += 1;
                self.copied_bytes += bytes;
                self.segments += *segments as u64;
            }
        }
    }

    pub fn merge(&mut self, other: &CopyTotals) {
        self.copied_objects += other.copied_objects;
        self.copied_bytes += other.copied_bytes;
        self.segments += other.segments;
        self.skipped += other.skipped;
        self.vanished += other.vanished;
    }
}

/// Everything one worker produced. Owned by the worker until join.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub processed: Vec<String>,
    pub not_processed: Vec<String>,
    pub inventory: InventorySummary,
    pub copy: CopyTotals,
    pub failures: Vec<Failure>,
}

impl WorkerReport {
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub mode: RunMode,
    pub workers: usize,
    pub elapsed_secs: f64,
    pub processed: Vec<String>,
    pub not_processed: Vec<String>,
    pub inventory: InventorySummary,
    pub copy: CopyTotals,
    pub failures: Vec<Failure>,
}

impl RunReport {
    /// Merges worker reports in worker order.
    pub fn from_workers(mode: RunMode, mut workers: Vec<WorkerReport>, elapsed: Duration) -> Self {
        workers.sort_by_key(|w| w.worker);
        let mut report = RunReport {
            mode,
            workers: workers.len(),
            elapsed_secs: elapsed.as_secs_f64(),
            processed: Vec::new(),
            not_processed: Vec::new(),
            inventory: InventorySummary::default(),
            copy: CopyTotals::default(),
            failures: Vec::new(),
        };
        for worker in workers {
            report.processed.extend(worker.processed);
            report.not_processed.extend(worker.not_processed);
            report.inventory.merge(worker.inventory);
            report.copy.merge(&worker.copy);
            report.failures.extend(worker.failures);
        }
        report
    }

    /// Scan failures and copy failures in one list.
    pub fn all_failures(&self) -> Vec<Failure> {
        self.inventory
            .failures
            .iter()
            .cloned()
            .map(Failure::from)
            .chain(self.failures.iter().cloned())
            .collect()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
            || !self.inventory.failures.is_empty()
            || !self.not_processed.is_empty()
    }

    pub fn render(&self, top_n: usize, verbose: bool) -> String {
        let rule = "=".repeat(RULE_WIDTH);
        let mut out = String::new();

        if verbose {
            for tenant in &self.inventory.tenants {
                let _ = writeln!(
                    out,
                    "tenant {}: containers: {}\tobjects: {}\tbytes: {}",
                    tenant.tenant, tenant.containers, tenant.objects, tenant.bytes
                );
                for container in &tenant.container_usage {
                    let _ = writeln!(
                        out,
                        "  {}: objects: {}\tbytes: {}",
                        container.name, container.objects, container.bytes
                    );
                }
            }
            for object in &self.inventory.objects {
                let marker = if object.large_object { " [large-object]" } else { "" };
                let _ = writeln!(
                    out,
                    "    {}/{}/{}: {}{}",
                    object.tenant, object.container, object.name, object.size, marker
                );
            }
        }

        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "elapsed: {:.2} s", self.elapsed_secs);
        let _ = writeln!(
            out,
            "total containers: {}\tobjects: {}\tbytes: {}",
            self.inventory.total_containers(),
            self.inventory.total_objects(),
            self.inventory.total_bytes()
        );
        if self.mode == RunMode::Copy {
            let _ = writeln!(
                out,
                "copied objects: {}\tbytes: {}\tsegments: {}\tskipped: {}\tvanished: {}",
                self.copy.copied_objects,
                self.copy.copied_bytes,
                self.copy.segments,
                self.copy.skipped,
                self.copy.vanished
            );
        }
        let _ = writeln!(out, "{}", rule);

        let _ = writeln!(out, "TOP {} Tenants:", top_n);
        for tenant in self.inventory.top_tenants(top_n) {
            let _ = writeln!(out, "{}: {}", tenant.tenant, tenant.bytes);
        }

        if let Some(largest) = &self.inventory.largest {
            let _ = writeln!(
                out,
                "max object size info: {}/{}/{} ({} bytes)",
                largest.tenant, largest.container, largest.name, largest.size
            );
        }

        let failures = self.all_failures();
        if !failures.is_empty() {
            let _ = writeln!(
                out,
                "\n{} failure(s), {} tenant(s) unreadable:",
                failures.len(),
                self.inventory.failed_tenants()
            );
            for failure in &failures {
                let _ = writeln!(out, "  [{}] {}: {}", failure.kind, failure.location(), failure.error);
            }
        }
        if !self.not_processed.is_empty() {
            let _ = writeln!(out, "not processed: {}", self.not_processed.join(", "));
        }

        out
    }
}

pub fn render_duplicates(report: &DuplicateReport) -> String {
    let mut out = String::new();
    for (tenant, collisions) in &report.collisions {
        let _ = writeln!(
            out,
            "..Tenant: {} has duplicate container name(s) across regions:",
            tenant
        );
        for collision in collisions {
            let _ = writeln!(out, "\t{} ({})", collision.container, collision.regions.join(", "));
            for (region, renamed) in &collision.renamed {
                let _ = writeln!(out, "\t\trenamed in {} to {}", region, renamed);
            }
        }
    }
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(out, "duplicate container names: {}", report.collision_count());
    for failure in &report.failures {
        let failure = Failure::from(failure.clone());
        let _ = writeln!(out, "  [{}] {}: {}", failure.kind, failure.location(), failure.error);
    }
    out
}

pub fn render_reconcile(report: &ReconcileReport) -> String {
    let mut out = String::new();
    for orphan in &report.orphans {
        let what = match &orphan.object {
            Some(object) => format!("object {}/{}/{}", orphan.tenant, orphan.container, object),
            None => format!("container {}/{}", orphan.tenant, orphan.container),
        };
        let state = if orphan.deleted { " (deleted)" } else { "" };
        let _ = writeln!(out, "FOUND nonexistent {}{}", what, state);
    }
    let _ = writeln!(out, "{}", "=".repeat(RULE_WIDTH));
    let _ = writeln!(
        out,
        "checked containers: {}\tobjects: {}\torphan containers: {}\torphan objects: {}",
        report.checked_containers,
        report.checked_objects,
        report.orphan_containers().count(),
        report.orphan_objects().count()
    );
    for failure in &report.failures {
        let failure = Failure::from(failure.clone());
        let _ = writeln!(out, "  [{}] {}: {}", failure.kind, failure.location(), failure.error);
    }
    out
}

/// Writes any report as pretty JSON.
pub fn write_json<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create report file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .with_context(|| format!("Failed to write report file {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("Failed to flush report file {}", path.display()))?;
    Ok(())
}
