//! Multipart upload coordination
//!
//! Splits a logical PUT into parts and uploads them with bounded concurrency.
//! Each part re-derives its own payload reader from (key, offset, length), so
//! no seekable source is ever shared between part tasks. Any part failure
//! aborts the upload; abort failures are logged, never fatal.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::data::Generator;
use crate::metrics::{MetricsSink, OpStatus};
use crate::scheduler::OpKind;
use crate::store::{ObjectStore, PartETag};
use crate::verify::Metadata;

/// S3 floor for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Hard S3 limit on the number of parts in one upload.
const MAX_PART_COUNT: u64 = 10_000;

pub struct MultipartCoordinator {
    store: Arc<dyn ObjectStore>,
    metrics: Arc<dyn MetricsSink>,
    part_size: u64,
    max_concurrency: usize,
}

impl MultipartCoordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metrics: Arc<dyn MetricsSink>,
        part_size: u64,
        max_concurrency: usize,
    ) -> Self {
        MultipartCoordinator {
            store,
            metrics,
            part_size: part_size.max(MIN_PART_SIZE),
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Upload the deterministic payload for (key, size) as a multipart
    /// object. Records one `multipart_put` observation spanning the whole
    /// protocol, from CreateUpload to CompleteUpload or abort.
    pub async fn upload(
        &self,
        key: &str,
        generator: Arc<Generator>,
        size: u64,
        metadata: Metadata,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self.upload_inner(key, generator, size, metadata).await;

        let status = if result.is_ok() {
            OpStatus::Success
        } else {
            OpStatus::Error
        };
        self.metrics
            .record_op(OpKind::MultipartPut, status, start.elapsed());
        if result.is_ok() {
            self.metrics.record_bytes_written(size);
        }
        result
    }

    async fn upload_inner(
        &self,
        key: &str,
        generator: Arc<Generator>,
        size: u64,
        metadata: Metadata,
    ) -> Result<()> {
        let num_parts = size.div_ceil(self.part_size);
        if num_parts == 0 {
            return Err(anyhow!("multipart upload of empty object"));
        }
        if num_parts > MAX_PART_COUNT {
            return Err(anyhow!(
                "object of {} bytes needs {} parts of {} bytes, exceeding the {}-part limit",
                size,
                num_parts,
                self.part_size,
                MAX_PART_COUNT
            ));
        }

        let upload_id = self
            .store
            .create_upload(key, metadata)
            .await
            .context("failed to initiate multipart upload")?;

        debug!(key, upload_id, num_parts, "multipart upload started");

        let sem = Arc::new(Semaphore::new(self.max_concurrency));
        let mut futs = FuturesUnordered::new();

        for part_number in 1..=num_parts {
            let sem = sem.clone();
            let store = self.store.clone();
            let generator = generator.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            let part_size = self.part_size;

            futs.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore never closed");

                let offset = (part_number - 1) * part_size;
                let length = part_size.min(size - offset);
                let reader = generator.reader_range(&key, offset, length);

                store
                    .upload_part(&key, &upload_id, part_number as i32, reader, length)
                    .await
            }));
        }

        let mut parts: Vec<PartETag> = Vec::with_capacity(num_parts as usize);
        let mut errors: Vec<anyhow::Error> = Vec::new();
        while let Some(joined) = futs.next().await {
            match joined {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(anyhow!("part upload task panicked: {}", e)),
            }
        }

        if !errors.is_empty() {
            if let Err(abort_err) = self.store.abort_upload(key, &upload_id).await {
                warn!(key, upload_id, error = %abort_err, "failed to abort multipart upload");
            }
            return Err(anyhow!(
                "multipart upload failed with {} errors: {:#}",
                errors.len(),
                errors[0]
            ));
        }

        parts.sort_by_key(|p| p.part_number);
        self.store
            .complete_upload(key, &upload_id, parts)
            .await
            .context("failed to complete multipart upload")?;

        debug!(key, upload_id, size, "multipart upload completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataReader;
    use crate::mem_store::MemoryStore;
    use crate::metrics::PrometheusSink;
    use crate::store::GetResult;
    use crate::verify::compute_hash;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MIB: u64 = 1024 * 1024;

    fn coordinator(
        store: Arc<dyn ObjectStore>,
        part_size: u64,
        concurrency: usize,
    ) -> (MultipartCoordinator, Arc<PrometheusSink>) {
        let metrics = Arc::new(PrometheusSink::new());
        (
            MultipartCoordinator::new(store, metrics.clone(), part_size, concurrency),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_upload_non_multiple_of_part_size() {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(Generator::new("random:42").unwrap());
        let (mp, metrics) = coordinator(store.clone(), 5 * MIB, 2);

        let size = 12 * MIB;
        mp.upload("big.bin", generator.clone(), size, Metadata::new())
            .await
            .unwrap();

        let got = store.get("big.bin").await.unwrap();
        assert_eq!(got.size, size);

        // Reassembled object hashes identically to the logical payload.
        let (_, expected) = generator.generate_and_hash("big.bin", size).unwrap();
        let actual = compute_hash(Cursor::new(&got.body)).unwrap();
        assert_eq!(actual, expected);

        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(
            metrics
                .ops_total
                .with_label_values(&["multipart_put", "success"])
                .get(),
            1
        );
        assert_eq!(metrics.bytes_written.get(), size);
    }

    #[tokio::test]
    async fn test_upload_exact_multiple() {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(Generator::new("random:7").unwrap());
        let (mp, _) = coordinator(store.clone(), 5 * MIB, 4);

        mp.upload("even.bin", generator.clone(), 10 * MIB, Metadata::new())
            .await
            .unwrap();

        let got = store.get("even.bin").await.unwrap();
        assert_eq!(got.size, 10 * MIB);
        let (_, expected) = generator.generate_and_hash("even.bin", 10 * MIB).unwrap();
        assert_eq!(compute_hash(Cursor::new(&got.body)).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_metadata_attached_to_completed_object() {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(Generator::new("fixed:ab").unwrap());
        let (mp, _) = coordinator(store.clone(), 5 * MIB, 2);

        let mut md = Metadata::new();
        md.insert("created-by".to_string(), "s3-workload".to_string());
        mp.upload("tagged.bin", generator, 6 * MIB, md).await.unwrap();

        let (metadata, _) = store.head("tagged.bin").await.unwrap();
        assert_eq!(metadata.get("created-by").unwrap(), "s3-workload");
    }

    /// Store whose nth part upload fails, for abort-path coverage.
    struct FailingPartStore {
        inner: MemoryStore,
        fail_part: i32,
        aborts: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FailingPartStore {
        async fn ensure_bucket(&self) -> Result<()> {
            self.inner.ensure_bucket().await
        }
        async fn set_versioning(&self, enabled: bool) -> Result<()> {
            self.inner.set_versioning(enabled).await
        }
        async fn put(
            &self,
            key: &str,
            body: DataReader,
            size: u64,
            metadata: Metadata,
        ) -> Result<()> {
            self.inner.put(key, body, size, metadata).await
        }
        async fn get(&self, key: &str) -> Result<GetResult> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn copy(&self, src: &str, dst: &str, bucket: Option<&str>) -> Result<()> {
            self.inner.copy(src, dst, bucket).await
        }
        async fn head(&self, key: &str) -> Result<(Metadata, u64)> {
            self.inner.head(key).await
        }
        async fn list(&self, prefix: &str, max_keys: i32) -> Result<Vec<String>> {
            self.inner.list(prefix, max_keys).await
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
            if part_number == self.fail_part {
                return Err(anyhow!("InternalError: injected part failure"));
            }
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
            self.aborts.fetch_add(1, Ordering::SeqCst);
            self.inner.abort_upload(key, upload_id).await
        }
        async fn cleanup_by_metadata(&self, p: &str, k: &str, v: &str) -> Result<usize> {
            self.inner.cleanup_by_metadata(p, k, v).await
        }
    }

    #[tokio::test]
    async fn test_part_failure_aborts_upload() {
        let store = Arc::new(FailingPartStore {
            inner: MemoryStore::new(),
            fail_part: 2,
            aborts: AtomicU32::new(0),
        });
        let generator = Arc::new(Generator::new("random:1").unwrap());
        let (mp, metrics) = coordinator(store.clone(), 5 * MIB, 2);

        let err = mp
            .upload("doomed.bin", generator, 12 * MIB, Metadata::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("multipart upload failed"));

        assert_eq!(store.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.pending_uploads(), 0);
        assert!(!store.inner.contains("doomed.bin"));
        assert_eq!(
            metrics
                .ops_total
                .with_label_values(&["multipart_put", "error"])
                .get(),
            1
        );
        assert_eq!(metrics.bytes_written.get(), 0);
    }

    #[tokio::test]
    async fn test_part_count_limit() {
        let store = Arc::new(MemoryStore::new());
        let generator = Arc::new(Generator::new("random:1").unwrap());
        let (mp, _) = coordinator(store, 5 * MIB, 2);

        // 10_001 parts worth of data must be rejected before any call.
        let size = 5 * MIB * 10_000 + 1;
        let err = mp
            .upload("huge.bin", generator, size, Metadata::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("part limit"));
    }
}
