//! Per-object migration: decide, transfer, verify.
//!
//! Every object walks the same states:
//!
//! ```text
//! Evaluate -> Skip                         -> Done
//! Evaluate -> CopySmall | CopyLarge -> Verify -> Done
//!                       (any error)           -> Failed
//! ```
//!
//! Nothing about a run is persisted except the `old-hash` tag on destination
//! objects, so rerunning after an interruption simply redoes whatever was
//! left New or Stale.

use crate::error::{CopyError, StoreError};
use crate::model::{
    Checksum, MANIFEST_KEY, ManifestRef, Metadata, OLD_HASH_KEY, ORIGIN_REGION_KEY, ObjectBody,
    ObjectStat,
};
use crate::retry::RetryPolicy;
use crate::segment::{DEFAULT_LARGE_OBJECT_THRESHOLD, DEFAULT_SEGMENT_SIZE, SegmentPlan};
use crate::staging::{self, StagingArea};
use crate::store::ObjectStore;
use tracing::{debug, info, warn};

/// Objects up to this size are buffered in memory instead of staged to disk.
pub const DEFAULT_MEMORY_BUFFER_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct CopySettings {
    /// Objects at or above this size are segmented.
    pub large_object_threshold: u64,
    pub segment_size: u64,
    pub memory_buffer_limit: u64,
    pub retry: RetryPolicy,
    /// Source region name, stamped on destination containers.
    pub region: String,
}

impl Default for CopySettings {
    fn default() -> Self {
        Self {
            large_object_threshold: DEFAULT_LARGE_OBJECT_THRESHOLD,
            segment_size: DEFAULT_SEGMENT_SIZE,
            memory_buffer_limit: DEFAULT_MEMORY_BUFFER_LIMIT,
            retry: RetryPolicy::default(),
            region: String::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyState {
    Evaluate,
    Skip,
    CopySmall,
    CopyLarge,
    Verify,
    Done,
    Failed,
}

/// Where an object stands, derived fresh on every run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationDecision {
    /// Gone from the source since it was listed.
    Absent,
    /// Destination already holds this version.
    UpToDate,
    /// Destination holds a different version.
    Stale,
    /// Not at the destination yet.
    New,
}

pub fn decide(source: &Checksum, destination: Option<&ObjectStat>) -> MigrationDecision {
    let Some(destination) = destination else {
        return MigrationDecision::New;
    };
    let current = match destination.old_hash() {
        Some(old_hash) => old_hash == *source,
        None => destination.checksum == *source,
    };
    if current {
        MigrationDecision::UpToDate
    } else {
        MigrationDecision::Stale
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CopyOutcome {
    Skipped,
    Vanished,
    Copied { bytes: u64, segments: usize },
}

/// What was written, and what it must be checked against.
enum Written {
    Small {
        size: u64,
        reference: Checksum,
    },
    Large {
        plan: SegmentPlan,
        size: u64,
        segment_checksums: Vec<Checksum>,
        streamed: Checksum,
        source: Checksum,
    },
}

pub struct ObjectCopier<'a> {
    source: &'a dyn ObjectStore,
    destination: &'a dyn ObjectStore,
    settings: &'a CopySettings,
    staging: &'a StagingArea,
}

impl<'a> ObjectCopier<'a> {
    pub fn new(
        source: &'a dyn ObjectStore,
        destination: &'a dyn ObjectStore,
        settings: &'a CopySettings,
        staging: &'a StagingArea,
    ) -> Self {
        Self {
            source,
            destination,
            settings,
            staging,
        }
    }

    /// Makes sure `container` exists at the destination and was not migrated
    /// from a different region.
    pub async fn prepare_container(&self, tenant: &str, container: &str) -> Result<(), CopyError> {
        let what = format!("{}/{}", tenant, container);
        let (source, destination) = (self.source, self.destination);

        let existing = self
            .settings
            .retry
            .run(&what, move || destination.stat_container(tenant, container))
            .await?;

        if let Some(stat) = existing {
            return match stat.metadata.get(ORIGIN_REGION_KEY) {
                Some(found) if *found != self.settings.region => Err(CopyError::Collision {
                    container: container.to_string(),
                    expected: self.settings.region.clone(),
                    found: found.clone(),
                }),
                _ => Ok(()),
            };
        }

        let mut metadata = self
            .settings
            .retry
            .run(&what, move || source.stat_container(tenant, container))
            .await?
            .map(|s| s.metadata)
            .unwrap_or_default();
        metadata.insert(ORIGIN_REGION_KEY.to_string(), self.settings.region.clone());

        info!(tenant, container, region = %self.settings.region, "creating destination container");
        let metadata = &metadata;
        self.settings
            .retry
            .run(&what, move || {
                destination.create_container(tenant, container, metadata)
            })
            .await
    }

    /// Brings one object up to date at the destination.
    pub async fn copy(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<CopyOutcome, CopyError> {
        match self.drive(tenant, container, object).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    tenant,
                    container,
                    object,
                    state = ?CopyState::Failed,
                    error = %e,
                    "object migration failed"
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<CopyOutcome, CopyError> {
        let what = format!("{}/{}/{}", tenant, container, object);
        let (source, destination) = (self.source, self.destination);

        let mut state = CopyState::Evaluate;
        let mut source_stat: Option<ObjectStat> = None;
        // Manifest pointer of the destination version being replaced.
        let mut replaced: Option<String> = None;
        let mut written: Option<Written> = None;

        loop {
            debug!(object = %what, state = ?state, "copy state");
            state = match state {
                CopyState::Evaluate => {
                    let Some(stat) = self
                        .settings
                        .retry
                        .run(&what, move || source.stat_object(tenant, container, object))
                        .await?
                    else {
                        info!(
                            object = %what,
                            decision = ?MigrationDecision::Absent,
                            "object vanished from source, skipping"
                        );
                        return Ok(CopyOutcome::Vanished);
                    };
                    let current = self
                        .settings
                        .retry
                        .run(&what, move || destination.stat_object(tenant, container, object))
                        .await?;

                    let decision = decide(&stat.checksum, current.as_ref());
                    debug!(object = %what, decision = ?decision, "evaluated");
                    let next = match decision {
                        MigrationDecision::UpToDate | MigrationDecision::Absent => CopyState::Skip,
                        _ if stat.size >= self.settings.large_object_threshold => {
                            CopyState::CopyLarge
                        }
                        _ => CopyState::CopySmall,
                    };
                    replaced = current
                        .as_ref()
                        .and_then(|c| c.manifest_pointer())
                        .map(str::to_string);
                    source_stat = Some(stat);
                    next
                }
                CopyState::Skip => return Ok(CopyOutcome::Skipped),
                CopyState::CopySmall => {
                    let stat = source_stat.as_ref().ok_or_else(|| out_of_order(&what, state))?;
                    written = Some(self.copy_small(tenant, container, object, stat).await?);
                    CopyState::Verify
                }
                CopyState::CopyLarge => {
                    let stat = source_stat.as_ref().ok_or_else(|| out_of_order(&what, state))?;
                    written = Some(self.copy_large(tenant, container, object, stat).await?);
                    CopyState::Verify
                }
                CopyState::Verify => {
                    let done = written.as_ref().ok_or_else(|| out_of_order(&what, state))?;
                    self.verify(tenant, container, object, done).await?;
                    CopyState::Done
                }
                CopyState::Done => {
                    if let Some(old) = replaced.as_deref() {
                        let current = match written {
                            Some(Written::Large { ref plan, .. }) => Some(plan.manifest().pointer()),
                            _ => None,
                        };
                        self.retire_segments(tenant, old, current.as_deref()).await;
                    }
                    let outcome = match written {
                        Some(Written::Small { size, .. }) => CopyOutcome::Copied {
                            bytes: size,
                            segments: 0,
                        },
                        Some(Written::Large { size, ref plan, .. }) => CopyOutcome::Copied {
                            bytes: size,
                            segments: plan.len(),
                        },
                        None => CopyOutcome::Skipped,
                    };
                    info!(object = %what, outcome = ?outcome, "object migrated");
                    return Ok(outcome);
                }
                CopyState::Failed => return Err(out_of_order(&what, state).into()),
            };
        }
    }

    async fn copy_small(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        stat: &ObjectStat,
    ) -> Result<Written, CopyError> {
        let what = format!("{}/{}/{}", tenant, container, object);
        let (source, destination) = (self.source, self.destination);

        let (staging, size, limit) = (self.staging, stat.size, self.settings.memory_buffer_limit);
        let what_ref = what.as_str();

        // A dropped connection mid-stream restarts the download from scratch.
        // The staged file, if any, must outlive the upload.
        let (body, streamed, _staged) = self
            .settings
            .retry
            .run_transfer(&what, move || async move {
                let mut reader = source.get_object(tenant, container, object).await?;
                if size <= limit {
                    let (bytes, checksum) = staging::buffer(what_ref, &mut reader, size).await?;
                    Ok::<_, CopyError>((ObjectBody::Memory(bytes), checksum, None))
                } else {
                    let staged = staging.stage(what_ref, &mut reader).await?;
                    let body = staged.body(0, staged.len());
                    let checksum = staged.checksum().clone();
                    Ok::<_, CopyError>((body, checksum, Some(staged)))
                }
            })
            .await?;

        if body.len() != stat.size {
            return Err(CopyError::SizeMismatch {
                what,
                expected: stat.size,
                actual: body.len(),
            });
        }

        let metadata = destination_metadata(stat);
        let (body, metadata) = (&body, &metadata);
        self.settings
            .retry
            .run(&what, move || {
                destination.put_object(tenant, container, object, body.clone(), metadata)
            })
            .await?;

        Ok(Written::Small {
            size: stat.size,
            reference: reference_checksum(&stat.checksum, &streamed),
        })
    }

    async fn copy_large(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        stat: &ObjectStat,
    ) -> Result<Written, CopyError> {
        let what = format!("{}/{}/{}", tenant, container, object);
        let (source, destination) = (self.source, self.destination);
        let plan = SegmentPlan::new(container, object, stat.size, self.settings.segment_size);

        self.prepare_container(tenant, &plan.segments_container)
            .await?;

        let (staging, segment_size) = (self.staging, self.settings.segment_size);
        let what_ref = what.as_str();
        let staged = self
            .settings
            .retry
            .run_transfer(&what, move || async move {
                let mut reader = source.get_object(tenant, container, object).await?;
                staging
                    .stage_segmented(what_ref, &mut reader, segment_size)
                    .await
            })
            .await?;

        if staged.len() != stat.size {
            return Err(CopyError::SizeMismatch {
                what,
                expected: stat.size,
                actual: staged.len(),
            });
        }

        info!(
            object = %what,
            size = stat.size,
            segments = plan.len(),
            "uploading large object segments"
        );
        let no_metadata = &Metadata::new();
        for segment in &plan.segments {
            let body = &staged.body(segment.offset, segment.length);
            let segments_container = plan.segments_container.as_str();
            let name = segment.name.as_str();
            self.settings
                .retry
                .run(&segment.name, move || {
                    destination.put_object(tenant, segments_container, name, body.clone(), no_metadata)
                })
                .await?;
            debug!(object = %what, segment = segment.index, "segment uploaded");
        }

        let manifest = &plan.manifest();
        let metadata = &destination_metadata(stat);
        self.settings
            .retry
            .run(&what, move || {
                destination.put_manifest(tenant, container, object, manifest, metadata)
            })
            .await?;

        Ok(Written::Large {
            size: stat.size,
            segment_checksums: staged.segment_checksums().to_vec(),
            streamed: staged.checksum().clone(),
            source: stat.checksum.clone(),
            plan,
        })
    }

    async fn verify(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        written: &Written,
    ) -> Result<(), CopyError> {
        let what = format!("{}/{}/{}", tenant, container, object);

        match written {
            Written::Small { size, reference } => {
                let stat = self.destination_stat(tenant, container, object).await?;
                check_size(&what, *size, stat.size)?;
                check_checksum(&what, reference, &stat.checksum)
            }
            Written::Large {
                plan,
                size,
                segment_checksums,
                streamed,
                source,
            } => {
                for (segment, expected) in plan.segments.iter().zip(segment_checksums) {
                    let stat = self
                        .destination_stat(tenant, &plan.segments_container, &segment.name)
                        .await?;
                    let segment_what = format!("{}/{}", plan.segments_container, segment.name);
                    check_size(&segment_what, segment.length, stat.size)?;
                    check_checksum(&segment_what, expected, &stat.checksum)?;
                }

                let manifest = self.destination_stat(tenant, container, object).await?;
                check_size(&what, *size, manifest.size)?;
                let composite = Checksum::composite(segment_checksums).ok_or_else(|| {
                    StoreError::rejected(what.clone(), "segment digests are not plain MD5")
                })?;
                check_checksum(&what, &composite, &manifest.checksum)?;

                check_checksum(&what, &reference_checksum(source, streamed), streamed)
            }
        }
    }

    /// Removes the segments a replaced manifest pointed at. The new version
    /// is already verified, so leftovers are only logged.
    async fn retire_segments(&self, tenant: &str, replaced: &str, current: Option<&str>) {
        if current == Some(replaced) {
            return;
        }
        let Some((segments_container, prefix)) = ManifestRef::parse_pointer(replaced) else {
            return;
        };
        let destination = self.destination;
        let listed = self
            .settings
            .retry
            .run(replaced, move || destination.list_objects(tenant, segments_container))
            .await;
        let entries = match listed {
            Ok(entries) => entries,
            Err(CopyError::Store(e)) if e.is_not_found() => return,
            Err(e) => {
                warn!(tenant, segments = replaced, error = %e, "could not list replaced segments");
                return;
            }
        };

        let prefix = format!("{}/", prefix);
        let mut removed = 0usize;
        for entry in entries.iter().filter(|e| e.name.starts_with(&prefix)) {
            let name = entry.name.as_str();
            match self
                .settings
                .retry
                .run(name, move || destination.delete_object(tenant, segments_container, name))
                .await
            {
                Ok(()) => removed += 1,
                Err(CopyError::Store(e)) if e.is_not_found() => {}
                Err(e) => {
                    warn!(tenant, segment = name, error = %e, "could not delete replaced segment");
                }
            }
        }
        info!(tenant, segments = replaced, removed, "replaced segments removed");
    }

    async fn destination_stat(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<ObjectStat, CopyError> {
        let destination = self.destination;
        let what = format!("{}/{}/{}", tenant, container, object);
        self.settings
            .retry
            .run(&what, move || destination.stat_object(tenant, container, object))
            .await?
            .ok_or_else(|| StoreError::not_found(what).into())
    }
}

/// User metadata carried over from the source, plus the `old-hash` tag.
pub fn destination_metadata(source: &ObjectStat) -> Metadata {
    let mut metadata: Metadata = source
        .metadata
        .iter()
        .filter(|(k, _)| k.as_str() != MANIFEST_KEY && k.as_str() != OLD_HASH_KEY)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    metadata.insert(OLD_HASH_KEY.to_string(), source.checksum.to_string());
    metadata
}

/// The source checksum when it is a plain MD5, else the digest of the bytes read.
fn reference_checksum(source: &Checksum, streamed: &Checksum) -> Checksum {
    if source.is_digest() {
        source.clone()
    } else {
        streamed.clone()
    }
}

fn check_size(what: &str, expected: u64, actual: u64) -> Result<(), CopyError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CopyError::SizeMismatch {
            what: what.to_string(),
            expected,
            actual,
        })
    }
}

fn check_checksum(what: &str, expected: &Checksum, actual: &Checksum) -> Result<(), CopyError> {
    if expected == actual {
        Ok(())
    } else {
        Err(CopyError::ChecksumMismatch {
            what: what.to_string(),
            expected: expected.clone(),
            actual: actual.clone(),
        })
    }
}

fn out_of_order(what: &str, state: CopyState) -> StoreError {
    StoreError::rejected(what, format!("copy reached {:?} out of order", state))
}
