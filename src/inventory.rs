//! Read-only enumeration of tenants, containers and objects.

use crate::error::StoreError;
use crate::filter::{FilterError, ScanFilter};
use crate::model::{ContainerEntry, ObjectEntry, Tenant, is_segments_container};
use crate::store::ObjectStore;
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_TOP_N: usize = 10;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("listing tenants: {0}")]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ContainerUsage {
    pub name: String,
    pub objects: u64,
    pub bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TenantUsage {
    pub tenant: String,
    pub containers: u64,
    pub objects: u64,
    pub bytes: u64,
    pub container_usage: Vec<ContainerUsage>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ObjectDetail {
    pub tenant: String,
    pub container: String,
    pub name: String,
    pub size: u64,
    /// Uploaded in parts at the source (composite checksum).
    pub large_object: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScanFailure {
    pub tenant: String,
    pub container: Option<String>,
    pub error: String,
}

/// Per-tenant usage plus everything that could not be read.
#[derive(Clone, Debug, Default, Serialize)]
pub struct InventorySummary {
    pub tenants: Vec<TenantUsage>,
    pub objects: Vec<ObjectDetail>,
    pub largest: Option<ObjectDetail>,
    pub failures: Vec<ScanFailure>,
}

impl InventorySummary {
    pub fn total_containers(&self) -> u64 {
        self.tenants.iter().map(|t| t.containers).sum()
    }

    pub fn total_objects(&self) -> u64 {
        self.tenants.iter().map(|t| t.objects).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.tenants.iter().map(|t| t.bytes).sum()
    }

    /// Tenants that could not be listed at all.
    pub fn failed_tenants(&self) -> usize {
        self.failures.iter().filter(|f| f.container.is_none()).count()
    }

    /// Top `n` tenants by bytes used, ties broken by name.
    pub fn top_tenants(&self, n: usize) -> Vec<&TenantUsage> {
        let mut ranked: Vec<&TenantUsage> = self.tenants.iter().collect();
        ranked.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.tenant.cmp(&b.tenant)));
        ranked.truncate(n);
        ranked
    }

    /// Folds another worker's summary into this one.
    pub fn merge(&mut self, other: InventorySummary) {
        self.tenants.extend(other.tenants);
        self.objects.extend(other.objects);
        self.failures.extend(other.failures);
        if let Some(candidate) = other.largest {
            self.observe_largest(candidate);
        }
    }

    fn observe_largest(&mut self, candidate: ObjectDetail) {
        let bigger = self
            .largest
            .as_ref()
            .map(|current| candidate.size > current.size)
            .unwrap_or(true);
        if bigger {
            self.largest = Some(candidate);
        }
    }
}

/// One (tenant, container, object) triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryItem {
    pub tenant: Tenant,
    pub container: ContainerEntry,
    pub object: ObjectEntry,
}

#[derive(Clone, Copy)]
pub struct InventoryScanner<'a> {
    store: &'a dyn ObjectStore,
    filter: &'a ScanFilter,
    skip_segments: bool,
}

impl<'a> InventoryScanner<'a> {
    pub fn new(store: &'a dyn ObjectStore, filter: &'a ScanFilter) -> Self {
        Self {
            store,
            filter,
            skip_segments: false,
        }
    }

    /// Leaves `*_segments` containers out of listings.
    pub fn skip_segments(mut self, skip: bool) -> Self {
        self.skip_segments = skip;
        self
    }

    pub async fn tenants(&self) -> Result<Vec<Tenant>, InventoryError> {
        let all = self.store.list_tenants().await?;
        Ok(self.filter.select_tenants(all)?)
    }

    pub async fn containers(&self, tenant: &str) -> Result<Vec<ContainerEntry>, StoreError> {
        let containers = self.store.list_containers(tenant).await?;
        Ok(containers.into_iter().filter(|c| self.keeps(c)).collect())
    }

    fn keeps(&self, container: &ContainerEntry) -> bool {
        self.filter.containers.allows(&container.name)
            && !(self.skip_segments && is_segments_container(&container.name))
    }

    pub async fn objects(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Vec<ObjectEntry>, StoreError> {
        let objects = self.store.list_objects(tenant, container).await?;
        Ok(objects
            .into_iter()
            .filter(|o| self.filter.objects.allows(&o.name))
            .collect())
    }

    /// Lazily walks every object of `tenant`, starting from an existing
    /// container listing. Containers this scanner would not list are dropped.
    pub fn walk(&self, tenant: &Tenant, containers: Vec<ContainerEntry>) -> InventoryWalk<'a> {
        InventoryWalk {
            scanner: *self,
            tenant: tenant.clone(),
            containers: containers.into_iter().filter(|c| self.keeps(c)).collect(),
            pending: VecDeque::new(),
            failures: Vec::new(),
        }
    }

    /// Records one tenant's usage into `summary`; failures are recorded, not returned.
    /// Returns the container listing so callers need not list the tenant again.
    ///
    /// Object listings are only fetched when `verbose` is set or an object
    /// filter is active; otherwise the container listing totals are used.
    pub async fn scan_tenant(
        &self,
        tenant: &Tenant,
        verbose: bool,
        summary: &mut InventorySummary,
    ) -> Option<Vec<ContainerEntry>> {
        let containers = match self.containers(&tenant.name).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(tenant = %tenant.name, error = %e, "skipping unreadable tenant");
                summary.failures.push(ScanFailure {
                    tenant: tenant.name.clone(),
                    container: None,
                    error: e.to_string(),
                });
                return None;
            }
        };

        let per_object = verbose || !self.filter.objects.is_empty();
        let mut usage = TenantUsage {
            tenant: tenant.name.clone(),
            ..Default::default()
        };

        for container in &containers {
            debug!(tenant = %tenant.name, container = %container.name, "scanning container");
            let mut line = ContainerUsage {
                name: container.name.clone(),
                objects: container.object_count,
                bytes: container.bytes,
            };

            if per_object {
                match self.objects(&tenant.name, &container.name).await {
                    Ok(objects) => {
                        line.objects = objects.len() as u64;
                        line.bytes = objects.iter().map(|o| o.size).sum();
                        for object in objects {
                            let detail = ObjectDetail {
                                tenant: tenant.name.clone(),
                                container: container.name.clone(),
                                large_object: object.checksum.is_composite(),
                                name: object.name,
                                size: object.size,
                            };
                            summary.observe_largest(detail.clone());
                            if verbose {
                                summary.objects.push(detail);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            tenant = %tenant.name,
                            container = %container.name,
                            error = %e,
                            "skipping unreadable container"
                        );
                        summary.failures.push(ScanFailure {
                            tenant: tenant.name.clone(),
                            container: Some(container.name.clone()),
                            error: e.to_string(),
                        });
                        continue;
                    }
                }
            }

            usage.containers += 1;
            usage.objects += line.objects;
            usage.bytes += line.bytes;
            usage.container_usage.push(line);
        }

        summary.tenants.push(usage);
        Some(containers)
    }
}

/// Lazy sequence over the (tenant, container, object) triples of one tenant.
/// Each call to [`InventoryScanner::walk`] starts over.
///
/// Containers that cannot be listed are skipped and recorded in
/// [`InventoryWalk::failures`].
pub struct InventoryWalk<'a> {
    scanner: InventoryScanner<'a>,
    tenant: Tenant,
    containers: VecDeque<ContainerEntry>,
    pending: VecDeque<(ContainerEntry, ObjectEntry)>,
    failures: Vec<ScanFailure>,
}

impl InventoryWalk<'_> {
    /// Containers whose objects have not been listed yet, in walk order.
    pub fn containers(&self) -> impl Iterator<Item = &ContainerEntry> {
        self.containers.iter()
    }

    pub async fn next(&mut self) -> Option<InventoryItem> {
        loop {
            if let Some((container, object)) = self.pending.pop_front() {
                return Some(InventoryItem {
                    tenant: self.tenant.clone(),
                    container,
                    object,
                });
            }

            let container = self.containers.pop_front()?;
            match self.scanner.objects(&self.tenant.name, &container.name).await {
                Ok(objects) => {
                    self.pending = objects
                        .into_iter()
                        .map(|o| (container.clone(), o))
                        .collect();
                }
                Err(e) => self.failures.push(ScanFailure {
                    tenant: self.tenant.name.clone(),
                    container: Some(container.name),
                    error: e.to_string(),
                }),
            }
        }
    }

    pub fn failures(&self) -> &[ScanFailure] {
        &self.failures
    }
}
