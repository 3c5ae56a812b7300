//! Object store capability interface.
//!
//! The migration core only talks to stores through [`ObjectStore`]. Containers
//! are always addressed relative to their tenant so that adapters are free to
//! map tenants onto accounts, bucket prefixes or separate endpoints.

use crate::error::StoreError;
use crate::model::{
    ContainerEntry, ContainerStat, ManifestRef, Metadata, ObjectBody, ObjectEntry, ObjectStat,
    Tenant,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;

#[cfg(test)]
pub mod memory;
pub mod s3;

/// A named region and the store serving it.
#[derive(Clone)]
pub struct RegionStore {
    pub name: String,
    /// Appended to containers renamed away from a cross-region collision.
    pub suffix: String,
    pub store: Arc<dyn ObjectStore>,
}

/// Streaming download handle.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    async fn list_containers(&self, tenant: &str) -> Result<Vec<ContainerEntry>, StoreError>;

    /// `Ok(None)` when the container does not exist.
    async fn stat_container(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Option<ContainerStat>, StoreError>;

    /// Creates the container if missing. Existing containers are left untouched.
    async fn create_container(
        &self,
        tenant: &str,
        container: &str,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    /// Removes an empty container.
    async fn delete_container(&self, tenant: &str, container: &str) -> Result<(), StoreError>;

    async fn list_objects(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Vec<ObjectEntry>, StoreError>;

    /// `Ok(None)` when the object does not exist.
    async fn stat_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectStat>, StoreError>;

    async fn get_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<ObjectReader, StoreError>;

    async fn put_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        body: ObjectBody,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    /// Writes a manifest presenting the ordered segments as one object.
    ///
    /// The resulting object reports the composite checksum over its segment
    /// checksums (see [`Checksum::composite`](crate::model::Checksum::composite)).
    async fn put_manifest(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        manifest: &ManifestRef,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    /// Server-side copy of `object` between two containers of the same tenant.
    async fn copy_object(
        &self,
        tenant: &str,
        src_container: &str,
        object: &str,
        dst_container: &str,
    ) -> Result<(), StoreError>;

    /// Deletes an object. Deleting a manifest also deletes its segments.
    async fn delete_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<(), StoreError>;
}
