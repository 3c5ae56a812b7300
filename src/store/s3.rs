//! S3-compatible adapter (AWS S3, Ceph RGW, Swift s3api).
//!
//! Tenants map onto bucket names: a bucket `acme:photos` is container
//! `photos` of tenant `acme`, following the RGW tenant-qualified naming.
//! Buckets without the delimiter belong to the default tenant. Container
//! metadata lives in bucket tags. Manifests are multipart uploads composed
//! server-side from their segment objects, so the manifest ETag is the
//! composite digest of the segment digests.

use super::{ObjectReader, ObjectStore};
use crate::error::StoreError;
use crate::model::{
    Checksum, ContainerEntry, ContainerStat, MANIFEST_KEY, ManifestRef, Metadata, ObjectBody,
    ObjectEntry, ObjectStat, Tenant,
};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as SmithyDateTime, Length};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    Delete, ObjectIdentifier, Tag, Tagging,
};
use aws_smithy_runtime::client::http::hyper_014::HyperClientBuilder;
use aws_smithy_types::retry::RetryConfig;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task;
use tracing::{debug, warn};

/// Largest object a single CopyObject request may copy.
const MAX_SINGLE_COPY: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_COPY_PART_SIZE: u64 = 256 * 1024 * 1024;
pub const DEFAULT_COPY_CONCURRENCY: usize = 16;
pub const DEFAULT_TENANT_DELIMITER: char = ':';
const DELETE_BATCH: usize = 1000;

#[derive(Clone, Debug)]
pub struct S3StoreConfig {
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub profile: Option<String>,
    pub path_style: bool,
    pub max_attempts: u32,
    /// Idle connections kept per host.
    pub pool_size: usize,
    pub tenant_delimiter: char,
    /// Tenant owning buckets whose name has no delimiter.
    pub default_tenant: String,
    pub copy_part_size: u64,
    pub copy_concurrency: usize,
}

impl Default for S3StoreConfig {
    fn default() -> Self {
        Self {
            region: None,
            endpoint: None,
            profile: None,
            path_style: true,
            max_attempts: 5,
            pool_size: 64,
            tenant_delimiter: DEFAULT_TENANT_DELIMITER,
            default_tenant: "default".to_string(),
            copy_part_size: DEFAULT_COPY_PART_SIZE,
            copy_concurrency: DEFAULT_COPY_CONCURRENCY,
        }
    }
}

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    region: Option<String>,
    tenant_delimiter: char,
    default_tenant: String,
    copy_part_size: u64,
    copy_concurrency: usize,
}

impl S3Store {
    pub async fn connect(config: S3StoreConfig) -> Self {
        // Match idle connections to the worker count to avoid pool bottlenecks
        let mut hyper_builder = hyper::Client::builder();
        hyper_builder.pool_max_idle_per_host(config.pool_size);
        hyper_builder.pool_idle_timeout(Duration::from_secs(90));
        hyper_builder.retry_canceled_requests(true);
        hyper_builder.http2_only(false);

        let http_client = HyperClientBuilder::new()
            .hyper_builder(hyper_builder)
            .build_https();

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .http_client(http_client)
            .retry_config(RetryConfig::standard().with_max_attempts(config.max_attempts));

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            region: config.region,
            tenant_delimiter: config.tenant_delimiter,
            default_tenant: config.default_tenant,
            copy_part_size: config.copy_part_size.max(5 * 1024 * 1024),
            copy_concurrency: config.copy_concurrency.max(1),
        }
    }

    fn bucket(&self, tenant: &str, container: &str) -> String {
        bucket_name(tenant, container, self.tenant_delimiter, &self.default_tenant)
    }

    async fn bucket_names(&self) -> Result<Vec<String>, StoreError> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| classify("list buckets", e))?;
        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectStat>, StoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectStat {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                checksum: Checksum::new(output.e_tag().unwrap_or_default()),
                last_modified: output.last_modified().and_then(to_chrono),
                metadata: output
                    .metadata()
                    .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default(),
            })),
            Err(e) => match classify(format!("{}/{}", bucket, key), e) {
                err if err.is_not_found() => Ok(None),
                err => Err(err),
            },
        }
    }

    async fn list_keys(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectEntry>, StoreError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_prefix(prefix.map(str::to_string))
            .into_paginator()
            .send();

        let mut entries = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(format!("list {}", bucket), e))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                entries.push(ObjectEntry {
                    name: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    checksum: Checksum::new(object.e_tag().unwrap_or_default()),
                    last_modified: object.last_modified().and_then(to_chrono),
                });
            }
        }
        Ok(entries)
    }

    async fn delete_keys(&self, bucket: &str, keys: Vec<String>) -> Result<(), StoreError> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::rejected(bucket, e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| StoreError::rejected(bucket, e.to_string()))?;
            let output = self
                .client
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| classify(format!("delete from {}", bucket), e))?;
            if let Some(failed) = output.errors().first() {
                return Err(StoreError::rejected(
                    format!("{}/{}", bucket, failed.key().unwrap_or_default()),
                    failed.message().unwrap_or("delete failed").to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Composes `parts` (copy sources with optional byte ranges) into one
    /// object with a multipart upload, aborting the upload on any failure.
    async fn compose(
        &self,
        bucket: &str,
        key: &str,
        metadata: &Metadata,
        parts: Vec<(String, Option<String>)>,
    ) -> Result<(), StoreError> {
        let what = format!("{}/{}", bucket, key);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_metadata(Some(to_hash_map(metadata)))
            .send()
            .await
            .map_err(|e| classify(what.clone(), e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| StoreError::rejected(what.clone(), "no upload id returned"))?
            .to_string();

        let result = self.copy_parts(bucket, key, &upload_id, parts).await;
        let completed = match result {
            Ok(completed) => completed,
            Err(e) => {
                warn!(object = %what, upload_id = %upload_id, error = %e, "aborting multipart upload");
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(object = %what, error = %DisplayErrorContext(&abort), "abort failed");
                }
                return Err(e);
            }
        };

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify(what, e))?;
        Ok(())
    }

    async fn copy_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(String, Option<String>)>,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let semaphore = Arc::new(Semaphore::new(self.copy_concurrency));
        let mut handles = Vec::with_capacity(parts.len());

        for (index, (source, range)) in parts.into_iter().enumerate() {
            let part_number = index as i32 + 1;
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let (bucket, key, upload_id) = (bucket.to_string(), key.to_string(), upload_id.to_string());

            handles.push(task::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| StoreError::rejected(key.clone(), e.to_string()))?;
                let what = format!("{} part {}", key, part_number);
                let output = client
                    .upload_part_copy()
                    .bucket(bucket)
                    .key(&key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .copy_source(source)
                    .set_copy_source_range(range)
                    .send()
                    .await
                    .map_err(|e| classify(what.clone(), e))?;
                let etag = output
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .ok_or_else(|| StoreError::rejected(what, "no part etag returned"))?;
                Ok::<_, StoreError>(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(etag)
                        .build(),
                )
            }));
        }

        let mut completed = Vec::with_capacity(handles.len());
        for handle in handles {
            let part = handle
                .await
                .map_err(|e| StoreError::rejected(key, format!("part task failed: {}", e)))??;
            completed.push(part);
        }
        completed.sort_by_key(|p| p.part_number());
        Ok(completed)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let tenants: BTreeSet<String> = self
            .bucket_names()
            .await?
            .iter()
            .map(|b| split_bucket(b, self.tenant_delimiter, &self.default_tenant).0)
            .collect();
        Ok(tenants.into_iter().map(|t| Tenant::new(t.clone(), t)).collect())
    }

    async fn list_containers(&self, tenant: &str) -> Result<Vec<ContainerEntry>, StoreError> {
        let mut containers = Vec::new();
        for bucket in self.bucket_names().await? {
            let (owner, container) = split_bucket(&bucket, self.tenant_delimiter, &self.default_tenant);
            if owner != tenant {
                continue;
            }
            let objects = self.list_keys(&bucket, None).await?;
            containers.push(ContainerEntry {
                name: container,
                object_count: objects.len() as u64,
                bytes: objects.iter().map(|o| o.size).sum(),
            });
        }
        Ok(containers)
    }

    async fn stat_container(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Option<ContainerStat>, StoreError> {
        let bucket = self.bucket(tenant, container);
        if let Err(e) = self.client.head_bucket().bucket(&bucket).send().await {
            return match classify(bucket.as_str(), e) {
                err if err.is_not_found() => Ok(None),
                err => Err(err),
            };
        }

        let metadata = match self.client.get_bucket_tagging().bucket(&bucket).send().await {
            Ok(output) => output
                .tag_set()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect(),
            Err(e) if e.as_service_error().and_then(|s| s.code()) == Some("NoSuchTagSet") => {
                Metadata::new()
            }
            Err(e) => return Err(classify(bucket.as_str(), e)),
        };
        Ok(Some(ContainerStat { metadata }))
    }

    async fn create_container(
        &self,
        tenant: &str,
        container: &str,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let bucket = self.bucket(tenant, container);
        let mut request = self.client.create_bucket().bucket(&bucket);
        if let Some(region) = self.region.as_deref()
            && region != "us-east-1"
        {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => debug!(bucket = %bucket, "bucket created"),
            Err(e)
                if e.as_service_error().and_then(|s| s.code())
                    == Some("BucketAlreadyOwnedByYou") =>
            {
                return Ok(());
            }
            Err(e) => return Err(classify(bucket.as_str(), e)),
        }

        if metadata.is_empty() {
            return Ok(());
        }
        let tags = metadata
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::rejected(bucket.clone(), e.to_string()))?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tags))
            .build()
            .map_err(|e| StoreError::rejected(bucket.clone(), e.to_string()))?;
        self.client
            .put_bucket_tagging()
            .bucket(&bucket)
            .tagging(tagging)
            .send()
            .await
            .map_err(|e| classify(bucket.as_str(), e))?;
        Ok(())
    }

    async fn delete_container(&self, tenant: &str, container: &str) -> Result<(), StoreError> {
        let bucket = self.bucket(tenant, container);
        self.client
            .delete_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|e| classify(bucket.as_str(), e))?;
        Ok(())
    }

    async fn list_objects(
        &self,
        tenant: &str,
        container: &str,
    ) -> Result<Vec<ObjectEntry>, StoreError> {
        self.list_keys(&self.bucket(tenant, container), None).await
    }

    async fn stat_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<Option<ObjectStat>, StoreError> {
        self.head_object(&self.bucket(tenant, container), object)
            .await
    }

    async fn get_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<ObjectReader, StoreError> {
        let bucket = self.bucket(tenant, container);
        let output = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(object)
            .send()
            .await
            .map_err(|e| classify(format!("{}/{}", bucket, object), e))?;
        Ok(Box::new(Box::pin(output.body.into_async_read())))
    }

    async fn put_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        body: ObjectBody,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let bucket = self.bucket(tenant, container);
        let what = format!("{}/{}", bucket, object);
        let length = body.len();
        let stream = match body {
            ObjectBody::Memory(bytes) => ByteStream::from(bytes),
            ObjectBody::File {
                path,
                offset,
                length,
            } => ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| StoreError::io(what.clone(), io::Error::other(e)))?,
        };

        self.client
            .put_object()
            .bucket(&bucket)
            .key(object)
            .content_length(length as i64)
            .set_metadata(Some(to_hash_map(metadata)))
            .body(stream)
            .send()
            .await
            .map_err(|e| classify(what, e))?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
        manifest: &ManifestRef,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let segments_bucket = self.bucket(tenant, &manifest.segments_container);
        let parts = manifest
            .segments
            .iter()
            .map(|segment| (copy_source(&segments_bucket, segment), None))
            .collect();

        let mut metadata = metadata.clone();
        metadata.insert(MANIFEST_KEY.to_string(), manifest.pointer());
        self.compose(&self.bucket(tenant, container), object, &metadata, parts)
            .await
    }

    async fn copy_object(
        &self,
        tenant: &str,
        src_container: &str,
        object: &str,
        dst_container: &str,
    ) -> Result<(), StoreError> {
        let src_bucket = self.bucket(tenant, src_container);
        let dst_bucket = self.bucket(tenant, dst_container);
        let what = format!("{}/{}", src_bucket, object);
        let source = self
            .head_object(&src_bucket, object)
            .await?
            .ok_or_else(|| StoreError::not_found(what.clone()))?;

        if source.size < MAX_SINGLE_COPY {
            self.client
                .copy_object()
                .bucket(&dst_bucket)
                .key(object)
                .copy_source(copy_source(&src_bucket, object))
                .send()
                .await
                .map_err(|e| classify(what, e))?;
            return Ok(());
        }

        let parts = copy_ranges(source.size, self.copy_part_size)
            .into_iter()
            .map(|range| (copy_source(&src_bucket, object), Some(range)))
            .collect();
        self.compose(&dst_bucket, object, &source.metadata, parts)
            .await
    }

    async fn delete_object(
        &self,
        tenant: &str,
        container: &str,
        object: &str,
    ) -> Result<(), StoreError> {
        let bucket = self.bucket(tenant, container);
        let what = format!("{}/{}", bucket, object);
        let stat = self
            .head_object(&bucket, object)
            .await?
            .ok_or_else(|| StoreError::not_found(what.clone()))?;

        self.client
            .delete_object()
            .bucket(&bucket)
            .key(object)
            .send()
            .await
            .map_err(|e| classify(what, e))?;

        let Some((segments_container, prefix)) = stat
            .metadata
            .get(MANIFEST_KEY)
            .and_then(|p| ManifestRef::parse_pointer(p))
        else {
            return Ok(());
        };
        let segments_bucket = self.bucket(tenant, segments_container);
        let prefix = format!("{}/", prefix);
        let keys: Vec<String> = self
            .list_keys(&segments_bucket, Some(&prefix))
            .await?
            .into_iter()
            .map(|o| o.name)
            .collect();
        debug!(bucket = %segments_bucket, prefix = %prefix, segments = keys.len(), "deleting manifest segments");
        self.delete_keys(&segments_bucket, keys).await
    }
}

/// Maps an SDK failure onto the store error taxonomy.
fn classify<E>(what: impl Into<String>, err: SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let what = what.into();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::transient(what, DisplayErrorContext(&err).to_string())
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = service.err().code();
            if status == 404 || matches!(code, Some("NoSuchKey" | "NoSuchBucket" | "NotFound")) {
                StoreError::not_found(what)
            } else if status == 429 || status >= 500 || code == Some("SlowDown") {
                StoreError::transient(what, DisplayErrorContext(&err).to_string())
            } else {
                StoreError::rejected(
                    what,
                    format!(
                        "{}: {}",
                        code.unwrap_or("unknown"),
                        service.err().message().unwrap_or("no message")
                    ),
                )
            }
        }
        _ => StoreError::rejected(what, DisplayErrorContext(&err).to_string()),
    }
}

fn bucket_name(tenant: &str, container: &str, delimiter: char, default_tenant: &str) -> String {
    if tenant == default_tenant {
        container.to_string()
    } else {
        format!("{}{}{}", tenant, delimiter, container)
    }
}

fn split_bucket(bucket: &str, delimiter: char, default_tenant: &str) -> (String, String) {
    match bucket.split_once(delimiter) {
        Some((tenant, container)) => (tenant.to_string(), container.to_string()),
        None => (default_tenant.to_string(), bucket.to_string()),
    }
}

fn copy_source(bucket: &str, key: &str) -> String {
    format!("{}/{}", bucket, urlencoding::encode(key))
}

/// Inclusive `bytes=a-b` ranges covering `size` bytes.
fn copy_ranges(size: u64, part_size: u64) -> Vec<String> {
    let part_size = part_size.max(1);
    (0..size.div_ceil(part_size))
        .map(|i| {
            let start = i * part_size;
            let end = (start + part_size).min(size) - 1;
            format!("bytes={}-{}", start, end)
        })
        .collect()
}

fn to_hash_map(metadata: &Metadata) -> HashMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn to_chrono(dt: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}
