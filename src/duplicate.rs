//! Cross-region container name collisions.
//!
//! Containers from every source region land in one destination namespace, so
//! a tenant owning `photos` in two regions must be resolved before copying.

use crate::error::{DuplicateError, StoreError};
use crate::filter::ScanFilter;
use crate::inventory::{InventoryScanner, ScanFailure};
use crate::model::{
    MANIFEST_KEY, ManifestRef, Metadata, ObjectEntry, ObjectStat, Tenant, is_segments_container,
    segments_container_for,
};
use crate::store::{ObjectStore, RegionStore};
use clap::ValueEnum;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum DuplicateAction {
    #[default]
    Report,
    Rename,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub container: String,
    /// Regions holding the name, in configured order. The first keeps it.
    pub regions: Vec<String>,
    /// (region, new name) for every rename performed.
    pub renamed: Vec<(String, String)>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DuplicateReport {
    pub collisions: BTreeMap<String, Vec<Collision>>,
    pub failures: Vec<ScanFailure>,
}

impl DuplicateReport {
    pub fn collision_count(&self) -> usize {
        self.collisions.values().map(Vec::len).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.collision_count() == 0 && self.failures.is_empty()
    }
}

/// Names present in more than one region, with the regions holding each.
///
/// Region order follows `per_region`, so the result is deterministic.
pub fn find_collisions(per_region: &[(String, BTreeSet<String>)]) -> BTreeMap<String, Vec<String>> {
    let mut seen: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (region, names) in per_region {
        for name in names {
            seen.entry(name.clone()).or_default().push(region.clone());
        }
    }
    seen.retain(|_, regions| regions.len() > 1);
    seen
}

pub fn renamed_container(name: &str, suffix: &str) -> String {
    format!("{}-{}", name, suffix)
}

pub struct DuplicateDetector<'a> {
    regions: &'a [RegionStore],
    filter: &'a ScanFilter,
}

impl<'a> DuplicateDetector<'a> {
    pub fn new(regions: &'a [RegionStore], filter: &'a ScanFilter) -> Self {
        Self { regions, filter }
    }

    /// Union of the tenants visible in every region, first-seen order.
    pub async fn tenants(&self) -> Result<Vec<Tenant>, crate::inventory::InventoryError> {
        let mut tenants: Vec<Tenant> = Vec::new();
        for region in self.regions {
            let scanner = InventoryScanner::new(region.store.as_ref(), self.filter);
            for tenant in scanner.tenants().await? {
                if !tenants.iter().any(|t| t.name == tenant.name) {
                    tenants.push(tenant);
                }
            }
        }
        Ok(tenants)
    }

    /// Checks every tenant before returning; never stops at the first hit.
    pub async fn run(&self, tenants: &[Tenant], action: DuplicateAction) -> DuplicateReport {
        let mut report = DuplicateReport::default();

        for tenant in tenants {
            info!(tenant = %tenant.name, "checking tenant for duplicate containers");
            let per_region = match self.container_names(&tenant.name).await {
                Ok(per_region) => per_region,
                Err(e) => {
                    warn!(tenant = %tenant.name, error = %e, "cannot list containers");
                    report.failures.push(ScanFailure {
                        tenant: tenant.name.clone(),
                        container: None,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let collisions = find_collisions(&per_region);
            if collisions.is_empty() {
                continue;
            }

            let mut found = Vec::new();
            for (container, regions) in collisions {
                warn!(
                    tenant = %tenant.name,
                    container = %container,
                    regions = ?regions,
                    "duplicate container name"
                );
                let mut collision = Collision {
                    container,
                    regions,
                    renamed: Vec::new(),
                };

                if action == DuplicateAction::Rename {
                    for region_name in collision.regions.iter().skip(1) {
                        let Some(region) = self.regions.iter().find(|r| &r.name == region_name)
                        else {
                            continue;
                        };
                        match self
                            .rename_container(region, &tenant.name, &collision.container)
                            .await
                        {
                            Ok(new_name) => collision.renamed.push((region.name.clone(), new_name)),
                            Err(e) => report.failures.push(ScanFailure {
                                tenant: tenant.name.clone(),
                                container: Some(collision.container.clone()),
                                error: e.to_string(),
                            }),
                        }
                    }
                }
                found.push(collision);
            }

            if action == DuplicateAction::Rename {
                if let Err(e) = self.verify_resolved(&tenant.name).await {
                    report.failures.push(ScanFailure {
                        tenant: tenant.name.clone(),
                        container: None,
                        error: e.to_string(),
                    });
                }
            }
            report.collisions.insert(tenant.name.clone(), found);
        }

        report
    }

    async fn container_names(
        &self,
        tenant: &str,
    ) -> Result<Vec<(String, BTreeSet<String>)>, DuplicateError> {
        let mut per_region = Vec::with_capacity(self.regions.len());
        for region in self.regions {
            let scanner = InventoryScanner::new(region.store.as_ref(), self.filter);
            let names = match scanner.containers(tenant).await {
                Ok(containers) => containers
                    .into_iter()
                    .map(|c| c.name)
                    .filter(|name| !is_segments_container(name))
                    .collect(),
                // A tenant with no presence in a region cannot collide there.
                Err(e) if e.is_not_found() => BTreeSet::new(),
                Err(e) => return Err(e.into()),
            };
            per_region.push((region.name.clone(), names));
        }
        Ok(per_region)
    }

    async fn verify_resolved(&self, tenant: &str) -> Result<(), DuplicateError> {
        let remaining = find_collisions(&self.container_names(tenant).await?);
        if remaining.is_empty() {
            Ok(())
        } else {
            Err(DuplicateError::Unresolved {
                tenant: tenant.to_string(),
                names: remaining.into_keys().collect(),
            })
        }
    }

    /// Moves `name` to `<name>-<suffix>` inside one region, taking its
    /// `_segments` container along so large objects stay readable.
    ///
    /// Objects already present under the new name with a matching checksum
    /// are not copied again, so an interrupted rename can simply be rerun.
    async fn rename_container(
        &self,
        region: &RegionStore,
        tenant: &str,
        name: &str,
    ) -> Result<String, DuplicateError> {
        let store = region.store.as_ref();
        let new_name = renamed_container(name, &region.suffix);
        let segments = segments_container_for(name);
        let new_segments = segments_container_for(&new_name);

        // Segments move first so rewritten manifests can point at them.
        let has_segments = store.stat_container(tenant, &segments).await?.is_some();
        if has_segments {
            move_objects(store, tenant, &segments, &new_segments, None).await?;
        }
        let repoint = has_segments.then_some((segments.as_str(), new_segments.as_str()));
        let objects = move_objects(store, tenant, name, &new_name, repoint).await?;

        // Deleting a manifest also removes its segments under the old name.
        for object in &objects {
            store.delete_object(tenant, name, &object.name).await?;
        }
        store.delete_container(tenant, name).await?;
        if has_segments {
            for object in store.list_objects(tenant, &segments).await? {
                match store.delete_object(tenant, &segments, &object.name).await {
                    Err(e) if !e.is_not_found() => return Err(e.into()),
                    _ => {}
                }
            }
            store.delete_container(tenant, &segments).await?;
        }
        info!(tenant, from = %name, to = %new_name, region = %region.name, "container renamed");

        Ok(new_name)
    }
}

/// Copies every object of `from` into `to` within one store and checks each
/// copy. Manifests pointing into `repoint.0` are recreated against `repoint.1`.
async fn move_objects(
    store: &dyn ObjectStore,
    tenant: &str,
    from: &str,
    to: &str,
    repoint: Option<(&str, &str)>,
) -> Result<Vec<ObjectEntry>, DuplicateError> {
    match store.stat_container(tenant, to).await? {
        Some(_) => info!(tenant, container = %to, "rename target already exists"),
        None => {
            let metadata = store
                .stat_container(tenant, from)
                .await?
                .map(|s| s.metadata)
                .unwrap_or_default();
            info!(tenant, container = %to, "creating rename target");
            store.create_container(tenant, to, &metadata).await?;
        }
    }

    let moved_segments = match repoint {
        Some((_, new_segments)) => store.list_objects(tenant, new_segments).await?,
        None => Vec::new(),
    };

    let objects = store.list_objects(tenant, from).await?;
    for object in &objects {
        let existing = store.stat_object(tenant, to, &object.name).await?;
        let present = existing
            .as_ref()
            .map(|s| s.checksum == object.checksum && s.size == object.size)
            .unwrap_or(false);
        if !present {
            let stat = store
                .stat_object(tenant, from, &object.name)
                .await?
                .ok_or_else(|| StoreError::not_found(format!("{}/{}/{}", tenant, from, object.name)))?;
            match repointed_manifest(&stat, repoint, &moved_segments) {
                Some(manifest) => {
                    info!(tenant, container = %from, object = %object.name, "recreating manifest in rename target");
                    let metadata: Metadata = stat
                        .metadata
                        .into_iter()
                        .filter(|(k, _)| k.as_str() != MANIFEST_KEY)
                        .collect();
                    store
                        .put_manifest(tenant, to, &object.name, &manifest, &metadata)
                        .await?;
                }
                None => {
                    info!(tenant, container = %from, object = %object.name, "copying object to rename target");
                    store.copy_object(tenant, from, &object.name, to).await?;
                }
            }
        }

        let copied = store
            .stat_object(tenant, to, &object.name)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("{}/{}/{}", tenant, to, object.name)))?;
        // Server-side copies of multipart objects get a fresh composite
        // checksum, so only the size can be compared for those.
        let matches = copied.size == object.size
            && (copied.checksum == object.checksum || !object.checksum.is_digest());
        if !matches {
            return Err(DuplicateError::CopyMismatch {
                container: from.to_string(),
                object: object.name.clone(),
                target: to.to_string(),
                expected: object.checksum.clone(),
                actual: copied.checksum,
            });
        }
    }
    Ok(objects)
}

/// The manifest `stat` should carry after its segments moved, if it points
/// into the segments container being renamed.
fn repointed_manifest(
    stat: &ObjectStat,
    repoint: Option<(&str, &str)>,
    moved_segments: &[ObjectEntry],
) -> Option<ManifestRef> {
    let (old_segments, new_segments) = repoint?;
    let (container, prefix) = ManifestRef::parse_pointer(stat.manifest_pointer()?)?;
    if container != old_segments {
        return None;
    }
    let under = format!("{}/", prefix);
    Some(ManifestRef {
        segments_container: new_segments.to_string(),
        prefix: prefix.to_string(),
        segments: moved_segments
            .iter()
            .filter(|o| o.name.starts_with(&under))
            .map(|o| o.name.clone())
            .collect(),
    })
}
