//! Object store capability
//!
//! The engine drives everything through [`ObjectStore`]; the concrete wire
//! protocol lives behind it (`s3_store` for real endpoints, `mem_store` for
//! tests and local smoke runs). [`InstrumentedStore`] decorates any
//! implementation with the per-operation counters and latency histograms.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::data::DataReader;
use crate::metrics::{MetricsSink, OpStatus};
use crate::scheduler::OpKind;
use crate::verify::Metadata;

/// A completed GET: the full body plus the object's user metadata.
#[derive(Debug)]
pub struct GetResult {
    pub body: Bytes,
    pub metadata: Metadata,
    pub size: u64,
}

/// ETag handle for one uploaded part of a multipart upload.
#[derive(Debug, Clone)]
pub struct PartETag {
    pub part_number: i32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if absent; "already exists/owned" is not an error.
    async fn ensure_bucket(&self) -> Result<()>;

    /// Enable or suspend bucket versioning. Best effort.
    async fn set_versioning(&self, enabled: bool) -> Result<()>;

    async fn put(&self, key: &str, body: DataReader, size: u64, metadata: Metadata) -> Result<()>;

    async fn get(&self, key: &str) -> Result<GetResult>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Copy `src_key` to `dst_key`, optionally into a different bucket.
    async fn copy(&self, src_key: &str, dst_key: &str, dst_bucket: Option<&str>) -> Result<()>;

    async fn head(&self, key: &str) -> Result<(Metadata, u64)>;

    async fn list(&self, prefix: &str, max_keys: i32) -> Result<Vec<String>>;

    async fn create_upload(&self, key: &str, metadata: Metadata) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: DataReader,
        length: u64,
    ) -> Result<PartETag>;

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<PartETag>)
        -> Result<()>;

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Scan all objects under `prefix` (paged), HEAD each, and delete only
    /// those whose metadata has `meta_key == meta_value`. Returns the number
    /// of objects deleted.
    async fn cleanup_by_metadata(
        &self,
        prefix: &str,
        meta_key: &str,
        meta_value: &str,
    ) -> Result<usize>;
}

/// Records an op counter (labelled op/status), a latency observation, and
/// bytes transferred around every data operation of the wrapped store.
/// Multipart primitives pass through untimed; the coordinator owns the
/// `multipart_put` observation spanning the whole upload.
pub struct InstrumentedStore {
    inner: Arc<dyn ObjectStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl InstrumentedStore {
    pub fn new(inner: Arc<dyn ObjectStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        InstrumentedStore { inner, metrics }
    }

    fn record(&self, op: OpKind, start: Instant, ok: bool) {
        let status = if ok { OpStatus::Success } else { OpStatus::Error };
        self.metrics.record_op(op, status, start.elapsed());
    }
}

#[async_trait]
impl ObjectStore for InstrumentedStore {
    async fn ensure_bucket(&self) -> Result<()> {
        self.inner.ensure_bucket().await
    }

    async fn set_versioning(&self, enabled: bool) -> Result<()> {
        self.inner.set_versioning(enabled).await
    }

    async fn put(&self, key: &str, body: DataReader, size: u64, metadata: Metadata) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.put(key, body, size, metadata).await;
        self.record(OpKind::Put, start, result.is_ok());
        if result.is_ok() {
            self.metrics.record_bytes_written(size);
        }
        result
    }

    async fn get(&self, key: &str) -> Result<GetResult> {
        let start = Instant::now();
        let result = self.inner.get(key).await;
        self.record(OpKind::Get, start, result.is_ok());
        if let Ok(got) = &result {
            self.metrics.record_bytes_read(got.size);
        }
        result
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.delete(key).await;
        self.record(OpKind::Delete, start, result.is_ok());
        result
    }

    async fn copy(&self, src_key: &str, dst_key: &str, dst_bucket: Option<&str>) -> Result<()> {
        let start = Instant::now();
        let result = self.inner.copy(src_key, dst_key, dst_bucket).await;
        self.record(OpKind::Copy, start, result.is_ok());
        result
    }

    async fn head(&self, key: &str) -> Result<(Metadata, u64)> {
        let start = Instant::now();
        let result = self.inner.head(key).await;
        self.record(OpKind::Head, start, result.is_ok());
        result
    }

    async fn list(&self, prefix: &str, max_keys: i32) -> Result<Vec<String>> {
        let start = Instant::now();
        let result = self.inner.list(prefix, max_keys).await;
        self.record(OpKind::List, start, result.is_ok());
        result
    }

    async fn create_upload(&self, key: &str, metadata: Metadata) -> Result<String> {
        self.inner.create_upload(key, metadata).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: DataReader,
        length: u64,
    ) -> Result<PartETag> {
        self.inner
            .upload_part(key, upload_id, part_number, body, length)
            .await
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartETag>,
    ) -> Result<()> {
        self.inner.complete_upload(key, upload_id, parts).await
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.inner.abort_upload(key, upload_id).await
    }

    async fn cleanup_by_metadata(
        &self,
        prefix: &str,
        meta_key: &str,
        meta_value: &str,
    ) -> Result<usize> {
        self.inner
            .cleanup_by_metadata(prefix, meta_key, meta_value)
            .await
    }
}
