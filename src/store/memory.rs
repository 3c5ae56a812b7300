//! In-memory store used by tests.

use super::{ObjectReader, ObjectStore};
use crate::error::StoreError;
use crate::model::{
    Checksum, ContainerEntry, ContainerStat, MANIFEST_KEY, ManifestRef, Metadata, ObjectBody,
    ObjectEntry, ObjectStat, Tenant,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    checksum: Checksum,
    metadata: Metadata,
}

#[derive(Default)]
struct StoredContainer {
    metadata: Metadata,
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Default)]
pub struct MemoryStore {
    tenants: Mutex<BTreeMap<String, BTreeMap<String, StoredContainer>>>,
    writes: AtomicUsize,
    container_listings: AtomicUsize,
    corrupt_writes: AtomicBool,
    transient_put_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, tenant: &str, container: &str) {
        self.tenants
            .lock()
            .unwrap()
            .entry(tenant.to_string())
            .or_default()
            .entry(container.to_string())
            .or_default();
    }

    pub fn add_object(&self, tenant: &str, container: &str, object: &str, data: &[u8]) {
        self.add_object_with_checksum(
            tenant,
            container,
            object,
            data,
            Checksum::from_digest(md5::compute(data)),
        );
    }

    /// Inserts an object whose reported checksum is chosen by the caller,
    /// e.g. a multipart ETag.
    pub fn add_object_with_checksum(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        data: &[u8],
        checksum: Checksum,
    ) {
        self.add_container(tenant, container);
        let mut tenants = self.tenants.lock().unwrap();
        let stored = tenants
            .get_mut(tenant)
            .and_then(|t| t.get_mut(container))
            .unwrap();
        stored.objects.insert(
            object.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                checksum,
                metadata: Metadata::new(),
            },
        );
    }

    pub fn remove_object(&self, tenant: &str, container: &str, object: &str) {
        let mut tenants = self.tenants.lock().unwrap();
        if let Some(c) = tenants.get_mut(tenant).and_then(|t| t.get_mut(container)) {
            c.objects.remove(object);
        }
    }

    pub fn object_data(&self, tenant: &str, container: &str, object: &str) -> Option<Bytes> {
        let tenants = self.tenants.lock().unwrap();
        tenants
            .get(tenant)?
            .get(container)?
            .objects
            .get(object)
            .map(|o| o.data.clone())
    }

    pub fn object_metadata(&self, tenant: &str, container: &str, object: &str) -> Option<Metadata> {
        let tenants = self.tenants.lock().unwrap();
        tenants
            .get(tenant)?
            .get(container)?
            .objects
            .get(object)
            .map(|o| o.metadata.clone())
    }

    pub fn object_names(&self, tenant: &str, container: &str) -> Vec<String> {
        let tenants = self.tenants.lock().unwrap();
        tenants
            .get(tenant)
            .and_then(|t| t.get(container))
            .map(|c| c.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_container(&self, tenant: &str, container: &str) -> bool {
        let tenants = self.tenants.lock().unwrap();
        tenants
            .get(tenant)
            .map(|t| t.contains_key(container))
            .unwrap_or(false)
    }

    pub fn set_container_metadata(&self, tenant: &str, container: &str, key: &str, value: &str) {
        self.add_container(tenant, container);
        let mut tenants = self.tenants.lock().unwrap();
        let stored = tenants
            .get_mut(tenant)
            .and_then(|t| t.get_mut(container))
            .unwrap();
        stored.metadata.insert(key.to_string(), value.to_string());
    }

    /// Number of mutating calls (puts, manifests, copies) served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `list_containers` calls served so far.
    pub fn container_listings(&self) -> usize {
        self.container_listings.load(Ordering::SeqCst)
    }

    /// Flip a byte in every subsequently stored payload.
    pub fn corrupt_writes(&self, enabled: bool) {
        self.corrupt_writes.store(enabled, Ordering::SeqCst);
    }

    /// Fail the next `count` uploads with a transient error.
    pub fn fail_next_puts(&self, count: u32) {
        self.transient_put_failures.store(count, Ordering::SeqCst);
    }

    fn take_transient_failure(&self) -> bool {
        self.transient_put_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        stored: StoredObject,
    ) -> Result<(), StoreError> {
        let mut tenants = self.tenants.lock().unwrap();
        let target = tenants
            .get_mut(tenant)
            .and_then(|t| t.get_mut(container))
            .ok_or_else(|| StoreError::not_found(format!("{}/{}", tenant, container)))?;
        target.objects.insert(object.to_string(), stored);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn read_body(body: ObjectBody) -> Result<Bytes, StoreError> {
    match body {
        ObjectBody::Memory(bytes) => Ok(bytes),
        ObjectBody::File {
            path,
            offset,
            length,
        } => {
            let what = path.display().to_string();
            let mut file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| StoreError::io(what.clone(), e))?;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| StoreError::io(what.clone(), e))?;
            let mut buf = vec![0u8; length as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| StoreError::io(what, e))?;
            Ok(Bytes::from(buf))
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let tenants = self.tenants.lock().unwrap();
        Ok(tenants.keys().map(|t| Tenant::new(t, t)).collect())
    }

    async fn list_containers(&self, tenant: &str) -> Result<Vec<ContainerEntry>, StoreError> {
        self.container_listings.fetch_add(1, Ordering::SeqCst);
        let tenants = self.tenants.lock().unwrap();
        let containers = tenants
            .get(tenant)
            .ok_or_else(|| StoreError::not_found(tenant.to_string()))?;
        Ok(containers
            .iter()
            .map(|(name, c)| ContainerEntry {
                name: name.clone(),
                object_count: c.objects.len() as u64,
                bytes: c.objects.values().map(|o| o.data.len() as u64).sum(),
            })
            .collect())
    }

    async fn stat_container(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Option<ContainerStat>, StoreError> {
        let tenants = self.tenants.lock().unwrap();
        Ok(tenants
            .get(tenant)
            .and_then(|t| t.get(container))
            .map(|c| ContainerStat {
                metadata: c.metadata.clone(),
            }))
    }

    async fn create_container(
        &self,
        tenant: &str,
        container: &str,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let mut tenants = self.tenants.lock().unwrap();
        let containers = tenants.entry(tenant.to_string()).or_default();
        if !containers.contains_key(container) {
            containers.insert(
                container.to_string(),
                StoredContainer {
                    metadata: metadata.clone(),
                    objects: BTreeMap::new(),
                },
            );
        }
        Ok(())
    }

    async fn delete_container(&self, tenant: &str, container: &str) -> Result<(), StoreError> {
        let mut tenants = self.tenants.lock().unwrap();
        let containers = tenants
            .get_mut(tenant)
            .ok_or_else(|| StoreError::not_found(tenant.to_string()))?;
        match containers.get(container) {
            None => Err(StoreError::not_found(format!("{}/{}", tenant, container))),
            Some(c) if !c.objects.is_empty() => Err(StoreError::rejected(
                format!("{}/{}", tenant, container),
                "container not empty",
            )),
            Some(_) => {
                containers.remove(container);
                Ok(())
            }
        }
    }

    async fn list_objects(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Vec<ObjectEntry>, StoreError> {
        let tenants = self.tenants.lock().unwrap();
        let stored = tenants
            .get(tenant)
            .and_then(|t| t.get(container))
            .ok_or_else(|| StoreError::not_found(format!("{}/{}", tenant, container)))?;
        Ok(stored
            .objects
            .iter()
            .map(|(name, o)| ObjectEntry {
                name: name.clone(),
                size: o.data.len() as u64,
                checksum: o.checksum.clone(),
                last_modified: Some(Utc::now()),
            })
            .collect())
    }

    async fn stat_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectStat>, StoreError> {
        let tenants = self.tenants.lock().unwrap();
        Ok(tenants
            .get(tenant)
            .and_then(|t| t.get(container))
            .and_then(|c| c.objects.get(object))
            .map(|o| ObjectStat {
                size: o.data.len() as u64,
                checksum: o.checksum.clone(),
                last_modified: Some(Utc::now()),
                metadata: o.metadata.clone(),
            }))
    }

    async fn get_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<ObjectReader, StoreError> {
        let data = self
            .object_data(tenant, container, object)
            .ok_or_else(|| StoreError::not_found(format!("{}/{}/{}", tenant, container, object)))?;
        Ok(Box::new(Cursor::new(data.to_vec())))
    }

    async fn put_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        body: ObjectBody,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        if self.take_transient_failure() {
            return Err(StoreError::transient(
                format!("{}/{}/{}", tenant, container, object),
                "connection reset by peer",
            ));
        }
        let mut data = read_body(body).await?.to_vec();
        if self.corrupt_writes.load(Ordering::SeqCst) && !data.is_empty() {
            data[0] ^= 0xff;
        }
        let stored = StoredObject {
            checksum: Checksum::from_digest(md5::compute(&data)),
            data: Bytes::from(data),
            metadata: metadata.clone(),
        };
        self.store(tenant, container, object, stored)
    }

    async fn put_manifest(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        manifest: &ManifestRef,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let (data, checksums) = {
            let tenants = self.tenants.lock().unwrap();
            let segments = tenants
                .get(tenant)
                .and_then(|t| t.get(&manifest.segments_container))
                .ok_or_else(|| StoreError::not_found(manifest.segments_container.clone()))?;
            let mut data = Vec::new();
            let mut checksums = Vec::new();
            for name in &manifest.segments {
                let segment = segments
                    .objects
                    .get(name)
                    .ok_or_else(|| StoreError::not_found(name.clone()))?;
                data.extend_from_slice(&segment.data);
                checksums.push(segment.checksum.clone());
            }
            (data, checksums)
        };
        let checksum = Checksum::composite(&checksums)
            .ok_or_else(|| StoreError::rejected(object.to_string(), "bad segment checksum"))?;
        let mut metadata = metadata.clone();
        metadata.insert(MANIFEST_KEY.to_string(), manifest.pointer());
        let stored = StoredObject {
            data: Bytes::from(data),
            checksum,
            metadata,
        };
        self.store(tenant, container, object, stored)
    }

    async fn copy_object(
        &self,
        tenant: &str,
        src_container: &str,
        object: &str,
        dst_container: &str,
    ) -> Result<(), StoreError> {
        let stored = {
            let tenants = self.tenants.lock().unwrap();
            tenants
                .get(tenant)
                .and_then(|t| t.get(src_container))
                .and_then(|c| c.objects.get(object))
                .cloned()
                .ok_or_else(|| {
                    StoreError::not_found(format!("{}/{}/{}", tenant, src_container, object))
                })?
        };
        self.store(tenant, dst_container, object, stored)
    }

    async fn delete_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<(), StoreError> {
        let mut tenants = self.tenants.lock().unwrap();
        let containers = tenants
            .get_mut(tenant)
            .ok_or_else(|| StoreError::not_found(tenant.to_string()))?;
        let removed = containers
            .get_mut(container)
            .and_then(|c| c.objects.remove(object))
            .ok_or_else(|| StoreError::not_found(format!("{}/{}/{}", tenant, container, object)))?;

        if let Some(pointer) = removed.metadata.get(MANIFEST_KEY) {
            if let Some((segments_container, prefix)) = ManifestRef::parse_pointer(pointer) {
                if let Some(segments) = containers.get_mut(segments_container) {
                    let prefix = format!("{}/", prefix);
                    segments.objects.retain(|name, _| !name.starts_with(&prefix));
                }
            }
        }
        Ok(())
    }
}
