//! Tenant-partitioned worker pool.
//!
//! Tenants are split into contiguous blocks, one block per worker. A worker
//! owns its report until it is joined, so no counters are shared between
//! tasks; the coordinator only merges finished reports.

use crate::copier::{CopySettings, ObjectCopier};
use crate::error::CopyError;
use crate::filter::ScanFilter;
use crate::inventory::InventoryScanner;
use crate::model::{ContainerEntry, Tenant};
use crate::progress::{ProgressBoard, WorkerProgress};
use crate::report::{Failure, FailureKind, RunReport, WorkerReport};
use crate::staging::StagingArea;
use crate::store::ObjectStore;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Stat,
    Copy,
}

/// Splits `tenants` into `min(workers, tenants.len())` contiguous blocks
/// whose sizes differ by at most one. Order is preserved, so the same input
/// always yields the same assignment.
pub fn partition(tenants: Vec<Tenant>, workers: usize) -> Vec<Vec<Tenant>> {
    let groups = workers.max(1).min(tenants.len());
    if groups == 0 {
        return Vec::new();
    }
    let base = tenants.len() / groups;
    let extra = tenants.len() % groups;

    let mut rest = tenants.into_iter();
    (0..groups)
        .map(|i| {
            let size = base + usize::from(i < extra);
            rest.by_ref().take(size).collect()
        })
        .collect()
}

/// Shared, read-only context handed to every worker.
pub struct MigrationContext {
    pub source: Arc<dyn ObjectStore>,
    /// Required in copy mode only.
    pub destination: Option<Arc<dyn ObjectStore>>,
    pub filter: ScanFilter,
    pub settings: CopySettings,
    pub staging_dir: PathBuf,
    /// Per-worker staging limit in bytes.
    pub staging_quota: Option<u64>,
    pub verbose: bool,
}

pub struct Orchestrator {
    context: Arc<MigrationContext>,
    concurrency: usize,
    progress: ProgressBoard,
}

impl Orchestrator {
    pub fn new(context: MigrationContext, concurrency: usize, progress: ProgressBoard) -> Self {
        Self {
            context: Arc::new(context),
            concurrency,
            progress,
        }
    }

    pub async fn run(&self, tenants: Vec<Tenant>, mode: RunMode) -> RunReport {
        let started = Instant::now();
        let blocks = partition(tenants, self.concurrency);
        info!(workers = blocks.len(), mode = ?mode, "starting workers");

        let mut handles = Vec::with_capacity(blocks.len());
        for (id, block) in blocks.into_iter().enumerate() {
            let names: Vec<String> = block.iter().map(|t| t.name.clone()).collect();
            let worker = Worker {
                id,
                tenants: block,
                context: self.context.clone(),
                progress: self.progress.worker(id, names.len()),
            };
            handles.push((id, names, tokio::spawn(worker.run(mode))));
        }

        let mut reports = Vec::with_capacity(handles.len());
        for (id, names, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(worker = id, error = %e, "worker task died");
                    let mut report = WorkerReport::new(id);
                    report.failures.push(Failure::tenant(
                        &names.join(","),
                        FailureKind::Worker,
                        format!("worker {} died: {}", id, e),
                    ));
                    report.not_processed = names;
                    reports.push(report);
                }
            }
        }

        RunReport::from_workers(mode, reports, started.elapsed())
    }
}

struct Worker {
    id: usize,
    tenants: Vec<Tenant>,
    context: Arc<MigrationContext>,
    progress: WorkerProgress,
}

impl Worker {
    async fn run(self, mode: RunMode) -> WorkerReport {
        let mut report = WorkerReport::new(self.id);
        let context = self.context.as_ref();
        let scanner = InventoryScanner::new(context.source.as_ref(), &context.filter);
        let staging =
            StagingArea::new(&context.staging_dir, self.id).with_quota(context.staging_quota);

        for (index, tenant) in self.tenants.iter().enumerate() {
            info!(worker = self.id, tenant = %tenant.name, "processing tenant");
            self.progress.start_tenant(&tenant.name);

            let verbose = context.verbose && mode == RunMode::Stat;
            let listed = scanner
                .scan_tenant(tenant, verbose, &mut report.inventory)
                .await;

            // Listing failures were already recorded by the inventory scan.
            if let (RunMode::Copy, Some(containers)) = (mode, listed) {
                let copied = self
                    .copy_tenant(&scanner, &staging, tenant, containers, &mut report)
                    .await;
                if let Err(e) = copied {
                    report
                        .failures
                        .push(Failure::copy(&tenant.name, None, None, &e));
                    if e.halts_worker() {
                        error!(
                            worker = self.id,
                            tenant = %tenant.name,
                            error = %e,
                            "worker stopping"
                        );
                        report.not_processed = self.tenants[index..]
                            .iter()
                            .map(|t| t.name.clone())
                            .collect();
                        break;
                    }
                    warn!(worker = self.id, tenant = %tenant.name, error = %e, "tenant halted");
                }
            }

            report.processed.push(tenant.name.clone());
            self.progress.finish_tenant();
        }

        self.progress.finish();
        report
    }

    /// Copies every selected object of one tenant, walking the container
    /// listing taken by the inventory scan.
    ///
    /// Object failures are recorded and skipped. Errors that stop the tenant
    /// or the worker are returned.
    async fn copy_tenant(
        &self,
        scanner: &InventoryScanner<'_>,
        staging: &StagingArea,
        tenant: &Tenant,
        containers: Vec<ContainerEntry>,
        report: &mut WorkerReport,
    ) -> Result<(), CopyError> {
        let context = self.context.as_ref();
        let Some(destination) = context.destination.as_deref() else {
            return Ok(());
        };
        let copier = ObjectCopier::new(
            context.source.as_ref(),
            destination,
            &context.settings,
            staging,
        );
        let tenant_name = tenant.name.as_str();
        let mut walk = scanner.skip_segments(true).walk(tenant, containers);

        // Empty containers are migrated too, so prepare before walking.
        let mut unprepared = BTreeSet::new();
        for container in walk.containers() {
            let name = container.name.as_str();
            if let Err(e) = copier.prepare_container(tenant_name, name).await {
                if e.halts_tenant() || e.halts_worker() {
                    return Err(e);
                }
                report
                    .failures
                    .push(Failure::copy(tenant_name, Some(name), None, &e));
                unprepared.insert(name.to_string());
            }
        }

        while let Some(item) = walk.next().await {
            let (container, object) = (item.container.name.as_str(), item.object.name.as_str());
            if unprepared.contains(container) {
                continue;
            }
            match copier.copy(tenant_name, container, object).await {
                Ok(outcome) => {
                    report.copy.record(&outcome);
                    self.progress.add_object(item.object.size);
                }
                Err(e) if e.halts_tenant() || e.halts_worker() => return Err(e),
                Err(e) => report.failures.push(Failure::copy(
                    tenant_name,
                    Some(container),
                    Some(object),
                    &e,
                )),
            }
        }

        for failure in walk.failures() {
            report.failures.push(Failure {
                tenant: failure.tenant.clone(),
                container: failure.container.clone(),
                object: None,
                kind: FailureKind::Scan,
                error: failure.error.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ORIGIN_REGION_KEY, OLD_HASH_KEY};
    use crate::retry::RetryPolicy;
    use crate::store::memory::MemoryStore;
    use std::time::Duration;

    fn tenants(count: usize) -> Vec<Tenant> {
        (0..count)
            .map(|i| Tenant::new(format!("id-{}", i), format!("tenant-{:02}", i)))
            .collect()
    }

    fn context(
        source: Arc<MemoryStore>,
        destination: Arc<MemoryStore>,
        staging_dir: PathBuf,
    ) -> MigrationContext {
        MigrationContext {
            source,
            destination: Some(destination),
            filter: ScanFilter::default(),
            settings: CopySettings {
                large_object_threshold: 5 * 1024,
                segment_size: 2 * 1024,
                memory_buffer_limit: 1024,
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(1),
                },
                region: "nz-por-1".to_string(),
            },
            staging_dir,
            staging_quota: None,
            verbose: false,
        }
    }

    /// Partitions are disjoint, cover every tenant, and are balanced.
    #[test]
    fn partition_is_disjoint_and_complete() {
        for count in 0..20 {
            for workers in 1..8 {
                let input = tenants(count);
                let blocks = partition(input.clone(), workers);

                assert_eq!(blocks.len(), workers.min(count));
                let mut seen = BTreeSet::new();
                for block in &blocks {
                    for tenant in block {
                        assert!(seen.insert(tenant.clone()), "tenant assigned twice");
                    }
                }
                assert_eq!(seen, input.iter().cloned().collect::<BTreeSet<_>>());

                let sizes: Vec<usize> = blocks.iter().map(Vec::len).collect();
                if let (Some(min), Some(max)) = (sizes.iter().min(), sizes.iter().max()) {
                    assert!(max - min <= 1);
                    assert!(*min > 0);
                }
            }
        }
    }

    /// The same input always produces the same contiguous blocks.
    #[test]
    fn partition_is_deterministic() {
        let blocks = partition(tenants(5), 2);
        let names: Vec<Vec<&str>> = blocks
            .iter()
            .map(|b| b.iter().map(|t| t.name.as_str()).collect())
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["tenant-00", "tenant-01", "tenant-02"],
                vec!["tenant-03", "tenant-04"]
            ]
        );
        assert_eq!(partition(tenants(5), 2), blocks);
    }

    /// A full copy run moves every tenant, listing each one's containers once,
    /// then a second run uploads nothing.
    #[tokio::test]
    async fn copy_run_covers_all_tenants() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "photos", "img.png", &[1u8; 2000]);
        source.add_object("acme", "photos", "video.mp4", &[2u8; 6 * 1024]);
        source.add_object("globex", "docs", "a.txt", b"alpha");
        source.add_object("initech", "docs", "b.txt", b"beta");
        let destination = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            context(source.clone(), destination.clone(), dir.path().to_path_buf()),
            2,
            ProgressBoard::new(true),
        );
        let all = source.list_tenants().await.unwrap();

        let report = orchestrator.run(all.clone(), RunMode::Copy).await;
        assert!(!report.has_failures(), "{:?}", report.failures);
        assert_eq!(report.workers, 2);
        assert_eq!(report.processed.len(), 3);
        assert_eq!(report.copy.copied_objects, 4);
        assert_eq!(report.copy.segments, 3);
        assert_eq!(source.container_listings(), 3);
        assert!(
            destination
                .object_metadata("globex", "docs", "a.txt")
                .unwrap()
                .contains_key(OLD_HASH_KEY)
        );

        let writes = destination.writes();
        let again = orchestrator.run(all, RunMode::Copy).await;
        assert_eq!(again.copy.skipped, 4);
        assert_eq!(destination.writes(), writes);
    }

    /// A collision halts only the affected tenant; other tenants still migrate.
    #[tokio::test]
    async fn collision_halts_only_its_tenant() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "photos", "img.png", b"png");
        source.add_object("globex", "docs", "a.txt", b"alpha");
        let destination = Arc::new(MemoryStore::new());
        destination.set_container_metadata("acme", "photos", ORIGIN_REGION_KEY, "nz-wlg-2");
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            context(source.clone(), destination.clone(), dir.path().to_path_buf()),
            1,
            ProgressBoard::new(true),
        );
        let report = orchestrator
            .run(source.list_tenants().await.unwrap(), RunMode::Copy)
            .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Collision);
        assert_eq!(report.failures[0].tenant, "acme");
        assert!(destination.object_names("acme", "photos").is_empty());
        assert!(destination.object_data("globex", "docs", "a.txt").is_some());
    }

    /// Integrity failures are recorded per object and the run carries on.
    #[tokio::test]
    async fn object_failures_do_not_stop_the_tenant() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "photos", "a.png", b"one");
        source.add_object("acme", "photos", "b.png", b"two");
        let destination = Arc::new(MemoryStore::new());
        destination.corrupt_writes(true);
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            context(source.clone(), destination, dir.path().to_path_buf()),
            4,
            ProgressBoard::new(true),
        );
        let report = orchestrator
            .run(source.list_tenants().await.unwrap(), RunMode::Copy)
            .await;

        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.kind == FailureKind::Integrity));
        assert_eq!(report.processed, vec!["acme".to_string()]);
        assert!(report.has_failures());
    }

    /// Running out of staging space stops that worker; the other worker carries on.
    #[tokio::test]
    async fn staging_exhaustion_stops_only_its_worker() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("tenant-a", "media", "big.bin", &[1u8; 3 * 1024]);
        source.add_object("tenant-b", "docs", "b.txt", b"bravo");
        source.add_object("tenant-c", "docs", "c.txt", b"charlie");
        source.add_object("tenant-d", "docs", "d.txt", b"delta");
        let destination = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();

        let mut context = context(source.clone(), destination.clone(), dir.path().to_path_buf());
        context.staging_quota = Some(2 * 1024);
        let orchestrator = Orchestrator::new(context, 2, ProgressBoard::new(true));
        let report = orchestrator
            .run(source.list_tenants().await.unwrap(), RunMode::Copy)
            .await;

        assert_eq!(report.not_processed, vec!["tenant-a", "tenant-b"]);
        assert_eq!(report.processed, vec!["tenant-c", "tenant-d"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Staging);
        assert_eq!(report.failures[0].tenant, "tenant-a");
        assert!(destination.object_data("tenant-b", "docs", "b.txt").is_none());
        assert!(destination.object_data("tenant-c", "docs", "c.txt").is_some());
        assert!(destination.object_data("tenant-d", "docs", "d.txt").is_some());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    /// A container that cannot be listed mid-copy is a scan failure; the
    /// rest of the tenant still migrates.
    #[tokio::test]
    async fn unlistable_container_is_reported() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "docs", "a.txt", b"alpha");
        source.add_object("acme", "photos", "img.png", b"png");
        let destination = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let worker = Worker {
            id: 0,
            tenants: Vec::new(),
            context: Arc::new(context(source.clone(), destination, dir.path().to_path_buf())),
            progress: ProgressBoard::new(true).worker(0, 1),
        };
        let scanner = InventoryScanner::new(source.as_ref(), &worker.context.filter);
        let staging = StagingArea::new(dir.path(), 0);
        let tenant = Tenant::new("acme", "acme");
        let containers = scanner.containers("acme").await.unwrap();
        source.remove_object("acme", "photos", "img.png");
        source.delete_container("acme", "photos").await.unwrap();

        let mut report = WorkerReport::new(0);
        worker
            .copy_tenant(&scanner, &staging, &tenant, containers, &mut report)
            .await
            .unwrap();

        assert_eq!(report.copy.copied_objects, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Scan);
        assert_eq!(report.failures[0].container.as_deref(), Some("photos"));
    }

    /// Stat mode reads the source only and merges usage across workers.
    #[tokio::test]
    async fn stat_run_merges_usage() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "photos", "img.png", &[0u8; 300]);
        source.add_object("globex", "docs", "a.txt", &[0u8; 700]);
        source.add_object("initech", "docs", "b.txt", &[0u8; 50]);
        let destination = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();

        let orchestrator = Orchestrator::new(
            context(source.clone(), destination.clone(), dir.path().to_path_buf()),
            3,
            ProgressBoard::new(true),
        );
        let report = orchestrator
            .run(source.list_tenants().await.unwrap(), RunMode::Stat)
            .await;

        assert_eq!(report.inventory.total_bytes(), 1050);
        assert_eq!(report.inventory.top_tenants(1)[0].tenant, "globex");
        assert_eq!(destination.writes(), 0);
        assert!(!destination.has_container("acme", "photos"));
    }
}
