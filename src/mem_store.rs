//! In-memory object store
//!
//! A single-bucket store that keeps whole objects in a map. Used by the test
//! suite and for store-less smoke runs; it honors the same contract the real
//! backend does, including metadata round-tripping and multipart sessions.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use crate::data::DataReader;
use crate::store::{GetResult, ObjectStore, PartETag};
use crate::verify::Metadata;

#[derive(Clone)]
struct StoredObject {
    data: Bytes,
    metadata: Metadata,
}

struct PendingUpload {
    key: String,
    metadata: Metadata,
    parts: BTreeMap<i32, (String, Vec<u8>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    bucket_created: AtomicBool,
    versioning: Mutex<Option<bool>>,
    next_upload_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object directly, bypassing the PUT path. Test seeding.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, metadata: Metadata) {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                metadata,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of multipart uploads that were started but neither completed
    /// nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn versioning_status(&self) -> Option<bool> {
        *self.versioning.lock().unwrap()
    }
}

fn read_body(mut body: DataReader, size: u64) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size as usize);
    let mut buf = [0u8; 8192];
    loop {
        let n = body.read(&mut buf).context("failed to read body")?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self) -> Result<()> {
        self.bucket_created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn set_versioning(&self, enabled: bool) -> Result<()> {
        *self.versioning.lock().unwrap() = Some(enabled);
        Ok(())
    }

    async fn put(&self, key: &str, body: DataReader, size: u64, metadata: Metadata) -> Result<()> {
        let data = read_body(body, size)?;
        if data.len() as u64 != size {
            return Err(anyhow!(
                "body length {} does not match declared size {}",
                data.len(),
                size
            ));
        }
        self.insert(key, data, metadata);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<GetResult> {
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(key)
            .ok_or_else(|| anyhow!("NoSuchKey: {}", key))?;
        Ok(GetResult {
            body: obj.data.clone(),
            metadata: obj.metadata.clone(),
            size: obj.data.len() as u64,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        // Deleting an absent key succeeds, matching S3 semantics.
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str, _dst_bucket: Option<&str>) -> Result<()> {
        // Single-namespace store: a destination bucket maps onto the same map.
        let mut objects = self.objects.lock().unwrap();
        let src = objects
            .get(src_key)
            .ok_or_else(|| anyhow!("NoSuchKey: {}", src_key))?
            .clone();
        objects.insert(dst_key.to_string(), src);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<(Metadata, u64)> {
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(key)
            .ok_or_else(|| anyhow!("NoSuchKey: {}", key))?;
        Ok((obj.metadata.clone(), obj.data.len() as u64))
    }

    async fn list(&self, prefix: &str, max_keys: i32) -> Result<Vec<String>> {
        let objects = self.objects.lock().unwrap();
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        if max_keys > 0 {
            keys.truncate(max_keys as usize);
        }
        Ok(keys)
    }

    async fn create_upload(&self, key: &str, metadata: Metadata) -> Result<String> {
        let id = format!("upload-{}", self.next_upload_id.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().unwrap().insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: DataReader,
        length: u64,
    ) -> Result<PartETag> {
        let data = read_body(body, length)?;
        if data.len() as u64 != length {
            return Err(anyhow!(
                "part {} length {} does not match declared {}",
                part_number,
                data.len(),
                length
            ));
        }
        let etag = format!("\"part-{}-{}\"", part_number, data.len());

        let mut uploads = self.uploads.lock().unwrap();
        let upload = uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow!("NoSuchUpload: {}", upload_id))?;
        upload.parts.insert(part_number, (etag.clone(), data));

        Ok(PartETag { part_number, etag })
    }

    async fn complete_upload(
        &self,
        _key: &str,
        upload_id: &str,
        parts: Vec<PartETag>,
    ) -> Result<()> {
        let upload = self
            .uploads
            .lock()
            .unwrap()
            .remove(upload_id)
            .ok_or_else(|| anyhow!("NoSuchUpload: {}", upload_id))?;

        let mut data = Vec::new();
        for part in &parts {
            let (etag, bytes) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| anyhow!("InvalidPart: part {} was not uploaded", part.part_number))?;
            if etag != &part.etag {
                return Err(anyhow!("InvalidPart: etag mismatch for part {}", part.part_number));
            }
            data.extend_from_slice(bytes);
        }

        self.insert(&upload.key, data, upload.metadata);
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.uploads.lock().unwrap().remove(upload_id);
        Ok(())
    }

    async fn cleanup_by_metadata(
        &self,
        prefix: &str,
        meta_key: &str,
        meta_value: &str,
    ) -> Result<usize> {
        let mut objects = self.objects.lock().unwrap();
        let doomed: Vec<String> = objects
            .iter()
            .filter(|(k, obj)| {
                k.starts_with(prefix)
                    && obj.metadata.get(meta_key).map(String::as_str) == Some(meta_value)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            objects.remove(key);
        }
        Ok(doomed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Generator;
    use crate::verify::{prepare_metadata, METADATA_KEY_CREATED_BY, METADATA_VALUE_CREATED_BY};

    fn generator() -> Generator {
        Generator::new("random:42").unwrap()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let store = MemoryStore::new();
        let g = generator();
        let (reader, hash) = g.generate_and_hash("k1", 4096).unwrap();

        store
            .put("k1", reader, 4096, prepare_metadata(&hash, ""))
            .await
            .unwrap();

        let got = store.get("k1").await.unwrap();
        assert_eq!(got.size, 4096);
        assert_eq!(got.metadata.get("sha256").unwrap(), &hash);

        let expected: Vec<u8> = {
            let mut buf = Vec::new();
            g.reader("k1", 4096).read_to_end(&mut buf).unwrap();
            buf
        };
        assert_eq!(&got.body[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = MemoryStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.to_string().contains("NoSuchKey"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.insert("k", vec![1u8, 2, 3], Metadata::new());
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(!store.contains("k"));
    }

    #[tokio::test]
    async fn test_copy() {
        let store = MemoryStore::new();
        store.insert("src", vec![9u8; 100], Metadata::new());
        store.copy("src", "dst", None).await.unwrap();
        assert!(store.contains("dst"));
        assert_eq!(store.get("dst").await.unwrap().size, 100);
        assert!(store.copy("missing", "x", None).await.is_err());
    }

    #[tokio::test]
    async fn test_list_prefix_and_cap() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert(&format!("a/obj-{}", i), vec![0u8], Metadata::new());
        }
        store.insert("b/other", vec![0u8], Metadata::new());

        let keys = store.list("a/", 1000).await.unwrap();
        assert_eq!(keys.len(), 5);
        let keys = store.list("a/", 2).await.unwrap();
        assert_eq!(keys.len(), 2);
        let keys = store.list("", 1000).await.unwrap();
        assert_eq!(keys.len(), 6);
    }

    #[tokio::test]
    async fn test_multipart_assembly() {
        let store = MemoryStore::new();
        let g = generator();
        let id = store.create_upload("big", Metadata::new()).await.unwrap();

        let p2 = store
            .upload_part("big", &id, 2, g.reader_range("big", 100, 50), 50)
            .await
            .unwrap();
        let p1 = store
            .upload_part("big", &id, 1, g.reader_range("big", 0, 100), 100)
            .await
            .unwrap();

        store.complete_upload("big", &id, vec![p1, p2]).await.unwrap();
        assert_eq!(store.pending_uploads(), 0);

        let got = store.get("big").await.unwrap();
        assert_eq!(got.size, 150);
        let expected: Vec<u8> = {
            let mut buf = Vec::new();
            g.reader("big", 150).read_to_end(&mut buf).unwrap();
            buf
        };
        assert_eq!(&got.body[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_multipart_abort_discards() {
        let store = MemoryStore::new();
        let g = generator();
        let id = store.create_upload("big", Metadata::new()).await.unwrap();
        store
            .upload_part("big", &id, 1, g.reader_range("big", 0, 10), 10)
            .await
            .unwrap();
        store.abort_upload("big", &id).await.unwrap();
        assert_eq!(store.pending_uploads(), 0);
        assert!(!store.contains("big"));
    }

    #[tokio::test]
    async fn test_cleanup_by_metadata_scope() {
        let store = MemoryStore::new();
        let tagged = prepare_metadata("h", "");
        store.insert("bench/mine-1", vec![0u8], tagged.clone());
        store.insert("bench/mine-2", vec![0u8], tagged);
        store.insert("bench/foreign", vec![0u8], Metadata::new());
        store.insert("other/mine", vec![0u8], {
            let mut m = Metadata::new();
            m.insert(
                METADATA_KEY_CREATED_BY.to_string(),
                METADATA_VALUE_CREATED_BY.to_string(),
            );
            m
        });

        let deleted = store
            .cleanup_by_metadata("bench/", METADATA_KEY_CREATED_BY, METADATA_VALUE_CREATED_BY)
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(store.contains("bench/foreign"));
        assert!(store.contains("other/mine"));
    }
}
