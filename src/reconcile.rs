//! Destination cleanup after deletions at the source.
//!
//! Containers and objects that exist at the destination but in none of the
//! source regions are reported, or deleted. Segments containers are never
//! examined or removed: deleting a manifest lets the store drop its
//! segments, and the container itself stays.

use crate::error::StoreError;
use crate::filter::ScanFilter;
use crate::inventory::{InventoryScanner, ScanFailure};
use crate::model::Tenant;
use crate::store::{ObjectStore, RegionStore};
use clap::ValueEnum;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum DeletedAction {
    #[default]
    Report,
    Delete,
}

/// A destination container or object with no source counterpart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub tenant: String,
    pub container: String,
    /// `None` when the whole container is orphaned.
    pub object: Option<String>,
    pub deleted: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub checked_containers: u64,
    pub checked_objects: u64,
    pub orphans: Vec<Orphan>,
    pub failures: Vec<ScanFailure>,
}

impl ReconcileReport {
    pub fn orphan_containers(&self) -> impl Iterator<Item = &Orphan> {
        self.orphans.iter().filter(|o| o.object.is_none())
    }

    pub fn orphan_objects(&self) -> impl Iterator<Item = &Orphan> {
        self.orphans.iter().filter(|o| o.object.is_some())
    }
}

pub struct Reconciler<'a> {
    sources: &'a [RegionStore],
    destination: &'a dyn ObjectStore,
    filter: &'a ScanFilter,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        sources: &'a [RegionStore],
        destination: &'a dyn ObjectStore,
        filter: &'a ScanFilter,
    ) -> Self {
        Self {
            sources,
            destination,
            filter,
        }
    }

    fn scanner(&self) -> InventoryScanner<'a> {
        InventoryScanner::new(self.destination, self.filter).skip_segments(true)
    }

    pub async fn tenants(&self) -> Result<Vec<Tenant>, crate::inventory::InventoryError> {
        self.scanner().tenants().await
    }

    pub async fn run(&self, tenants: &[Tenant], action: DeletedAction) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for tenant in tenants {
            info!(tenant = %tenant.name, "checking tenant for deleted data");
            if let Err(e) = self.reconcile_tenant(&tenant.name, action, &mut report).await {
                warn!(tenant = %tenant.name, error = %e, "reconciliation failed");
                report.failures.push(ScanFailure {
                    tenant: tenant.name.clone(),
                    container: None,
                    error: e.to_string(),
                });
            }
        }
        report
    }

    async fn reconcile_tenant(
        &self,
        tenant: &str,
        action: DeletedAction,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        for container in self.scanner().containers(tenant).await? {
            report.checked_containers += 1;
            let result = match self.source_region(tenant, &container.name).await {
                Ok(Some(region)) => {
                    debug!(tenant, container = %container.name, region = %region.name, "container found at source");
                    self.reconcile_objects(tenant, &container.name, region, action, report)
                        .await
                }
                Ok(None) => {
                    self.remove_container(tenant, &container.name, action, report)
                        .await
                }
                Err(e) => Err(e),
            };

            // An undecidable container is left alone.
            if let Err(e) = result {
                warn!(tenant, container = %container.name, error = %e, "skipping container");
                report.failures.push(ScanFailure {
                    tenant: tenant.to_string(),
                    container: Some(container.name.clone()),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// First source region holding `container`, in configured order.
    async fn source_region(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Option<&'a RegionStore>, StoreError> {
        for region in self.sources {
            if region.store.stat_container(tenant, container).await?.is_some() {
                return Ok(Some(region));
            }
        }
        Ok(None)
    }

    async fn reconcile_objects(
        &self,
        tenant: &str,
        container: &str,
        region: &RegionStore,
        action: DeletedAction,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        let present: BTreeSet<String> = region
            .store
            .list_objects(tenant, container)
            .await?
            .into_iter()
            .map(|o| o.name)
            .collect();

        for object in self.scanner().objects(tenant, container).await? {
            report.checked_objects += 1;
            if present.contains(&object.name) {
                continue;
            }
            warn!(tenant, container, object = %object.name, "object missing at source");
            let deleted = match action {
                DeletedAction::Report => false,
                DeletedAction::Delete => {
                    self.destination
                        .delete_object(tenant, container, &object.name)
                        .await?;
                    info!(tenant, container, object = %object.name, "deleted");
                    true
                }
            };
            report.orphans.push(Orphan {
                tenant: tenant.to_string(),
                container: container.to_string(),
                object: Some(object.name),
                deleted,
            });
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        tenant: &str,
        container: &str,
        action: DeletedAction,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        warn!(tenant, container, "container missing in every source region");
        let deleted = match action {
            DeletedAction::Report => false,
            DeletedAction::Delete => {
                for object in self.destination.list_objects(tenant, container).await? {
                    match self
                        .destination
                        .delete_object(tenant, container, &object.name)
                        .await
                    {
                        // Already gone with an earlier manifest's segments.
                        Err(e) if e.is_not_found() => {}
                        other => other?,
                    }
                }
                self.destination.delete_container(tenant, container).await?;
                info!(tenant, container, "deleted");
                true
            }
        };
        report.orphans.push(Orphan {
            tenant: tenant.to_string(),
            container: container.to_string(),
            object: None,
            deleted,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metadata, ObjectBody};
    use crate::segment::SegmentPlan;
    use crate::store::memory::MemoryStore;
    use bytes::Bytes;
    use std::sync::Arc;

    fn region(name: &str, store: Arc<MemoryStore>) -> RegionStore {
        RegionStore {
            name: name.to_string(),
            suffix: name.to_string(),
            store,
        }
    }

    /// Builds a destination `photos` with a small object and a segmented manifest.
    async fn migrated_destination() -> MemoryStore {
        let destination = MemoryStore::new();
        destination.add_object("acme", "photos", "img.png", b"png");
        destination.add_container("acme", "photos_segments");

        let plan = SegmentPlan::new("photos", "video.mp4", 6, 2);
        for segment in &plan.segments {
            destination
                .put_object(
                    "acme",
                    "photos_segments",
                    &segment.name,
                    ObjectBody::Memory(Bytes::from_static(b"vv")),
                    &Metadata::new(),
                )
                .await
                .unwrap();
        }
        destination
            .put_manifest("acme", "photos", "video.mp4", &plan.manifest(), &Metadata::new())
            .await
            .unwrap();
        destination
    }

    /// Report mode lists orphans and deletes nothing.
    #[tokio::test]
    async fn report_only_lists_orphans() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "photos", "video.mp4", b"vvvvvv");
        let destination = migrated_destination().await;
        let sources = vec![region("nz-por-1", source)];
        let filter = ScanFilter::default();

        let reconciler = Reconciler::new(&sources, &destination, &filter);
        let tenants = reconciler.tenants().await.unwrap();
        let report = reconciler.run(&tenants, DeletedAction::Report).await;

        assert_eq!(report.orphan_objects().count(), 1);
        assert!(report.orphans.iter().all(|o| !o.deleted));
        assert!(destination.object_data("acme", "photos", "img.png").is_some());
    }

    /// A manifest deleted at the source is removed with its segments, while
    /// the emptied segments container stays.
    #[tokio::test]
    async fn deleting_manifest_keeps_segments_container() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "photos", "img.png", b"png");
        let destination = migrated_destination().await;
        let sources = vec![region("nz-por-1", source)];
        let filter = ScanFilter::default();

        let reconciler = Reconciler::new(&sources, &destination, &filter);
        let tenants = reconciler.tenants().await.unwrap();
        let report = reconciler.run(&tenants, DeletedAction::Delete).await;

        assert!(report.failures.is_empty(), "{:?}", report.failures);
        assert_eq!(
            destination.object_names("acme", "photos"),
            vec!["img.png".to_string()]
        );
        assert!(destination.has_container("acme", "photos_segments"));
        assert!(destination.object_names("acme", "photos_segments").is_empty());
        assert!(report.orphans.iter().all(|o| o.container != "photos_segments"));
    }

    /// The example flow: an object deleted at source disappears from the
    /// destination, the segments container is untouched.
    #[tokio::test]
    async fn deleted_small_object_is_removed() {
        let source = Arc::new(MemoryStore::new());
        source.add_object("acme", "photos", "video.mp4", b"vvvvvv");
        let destination = migrated_destination().await;
        let segments_before = destination.object_names("acme", "photos_segments");
        let sources = vec![region("nz-por-1", source)];
        let filter = ScanFilter::default();

        let reconciler = Reconciler::new(&sources, &destination, &filter);
        let tenants = reconciler.tenants().await.unwrap();
        let report = reconciler.run(&tenants, DeletedAction::Delete).await;

        assert_eq!(
            report.orphans,
            vec![Orphan {
                tenant: "acme".to_string(),
                container: "photos".to_string(),
                object: Some("img.png".to_string()),
                deleted: true,
            }]
        );
        assert!(destination.object_data("acme", "photos", "img.png").is_none());
        assert_eq!(
            destination.object_names("acme", "photos_segments"),
            segments_before
        );
    }

    /// A container found in any source region is kept; one found nowhere is
    /// emptied and deleted.
    #[tokio::test]
    async fn containers_checked_across_regions() {
        let por = Arc::new(MemoryStore::new());
        let wlg = Arc::new(MemoryStore::new());
        por.add_object("acme", "photos", "a.png", b"a");
        wlg.add_object("acme", "music", "b.mp3", b"b");

        let destination = MemoryStore::new();
        destination.add_object("acme", "photos", "a.png", b"a");
        destination.add_object("acme", "music", "b.mp3", b"b");
        destination.add_object("acme", "old", "c.txt", b"c");
        let sources = vec![region("nz-por-1", por), region("nz-wlg-2", wlg)];
        let filter = ScanFilter::default();

        let reconciler = Reconciler::new(&sources, &destination, &filter);
        let tenants = reconciler.tenants().await.unwrap();
        let report = reconciler.run(&tenants, DeletedAction::Delete).await;

        assert_eq!(report.checked_containers, 3);
        assert_eq!(report.orphan_containers().count(), 1);
        assert!(destination.has_container("acme", "music"));
        assert!(destination.has_container("acme", "photos"));
        assert!(!destination.has_container("acme", "old"));
    }
}
