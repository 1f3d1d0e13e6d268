//! AWS SDK implementation of the object store capability
//!
//! Speaks to any S3-compatible endpoint (AWS, MinIO, Ceph RGW) via
//! aws-sdk-s3. All errors are flattened through `DisplayErrorContext` so the
//! service error code (SlowDown, ServiceUnavailable, ...) stays visible to
//! the retry classifier.

use std::io::Read;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketVersioningStatus, CompletedMultipartUpload, CompletedPart, VersioningConfiguration,
};
use aws_sdk_s3::Client;
use tracing::{debug, warn};

use crate::data::DataReader;
use crate::store::{GetResult, ObjectStore, PartETag};
use crate::verify::Metadata;

/// Connection settings for [`S3Store`].
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
    pub skip_tls_verify: bool,
}

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(cfg: S3Config) -> Result<Self> {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(cfg.region.clone()));

        if !cfg.access_key.is_empty() && !cfg.secret_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                cfg.access_key.clone(),
                cfg.secret_key.clone(),
                None,
                None,
                "static",
            ));
        }

        let shared = loader.load().await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(cfg.path_style);
        if !cfg.endpoint.is_empty() {
            builder = builder.endpoint_url(&cfg.endpoint);
        }
        if cfg.skip_tls_verify {
            // The SDK's rustls stack does not expose an insecure mode.
            warn!("skip-tls-verify requested but not supported by the TLS stack; ignoring");
        }

        Ok(S3Store {
            client: Client::from_conf(builder.build()),
            bucket: cfg.bucket,
        })
    }

    /// Read a payload reader fully into memory for the SDK's rewindable
    /// request body. Bounded by the multipart threshold for single-shot PUTs
    /// and by the part size for multipart parts.
    fn buffer_body(mut body: DataReader, size_hint: u64) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(size_hint as usize);
        body.read_to_end(&mut data)
            .context("failed to generate request body")?;
        Ok(data)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self) -> Result<()> {
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(bucket = %self.bucket, "bucket created");
                Ok(())
            }
            Err(err) => {
                if let Some(svc) = err.as_service_error() {
                    if svc.is_bucket_already_exists() || svc.is_bucket_already_owned_by_you() {
                        debug!(bucket = %self.bucket, "bucket already present");
                        return Ok(());
                    }
                }
                Err(anyhow!(
                    "failed to create bucket: {}",
                    DisplayErrorContext(err)
                ))
            }
        }
    }

    async fn set_versioning(&self, enabled: bool) -> Result<()> {
        let status = if enabled {
            BucketVersioningStatus::Enabled
        } else {
            BucketVersioningStatus::Suspended
        };
        self.client
            .put_bucket_versioning()
            .bucket(&self.bucket)
            .versioning_configuration(
                VersioningConfiguration::builder().status(status).build(),
            )
            .send()
            .await
            .map_err(|e| anyhow!("failed to set versioning: {}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn put(&self, key: &str, body: DataReader, size: u64, metadata: Metadata) -> Result<()> {
        let data = Self::buffer_body(body, size)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_length(size as i64)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| anyhow!("put failed: {}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<GetResult> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("get failed: {}", DisplayErrorContext(e)))?;

        let metadata = resp.metadata().cloned().unwrap_or_default();
        let body = resp
            .body
            .collect()
            .await
            .context("failed to read get body")?
            .into_bytes();
        let size = body.len() as u64;

        Ok(GetResult {
            body,
            metadata,
            size,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("delete failed: {}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str, dst_bucket: Option<&str>) -> Result<()> {
        let dst_bucket = dst_bucket.unwrap_or(&self.bucket);
        self.client
            .copy_object()
            .bucket(dst_bucket)
            .key(dst_key)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .send()
            .await
            .map_err(|e| anyhow!("copy failed: {}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<(Metadata, u64)> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("head failed: {}", DisplayErrorContext(e)))?;

        let metadata = resp.metadata().cloned().unwrap_or_default();
        let size = resp.content_length().unwrap_or(0).max(0) as u64;
        Ok((metadata, size))
    }

    async fn list(&self, prefix: &str, max_keys: i32) -> Result<Vec<String>> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(max_keys)
            .send()
            .await
            .map_err(|e| anyhow!("list failed: {}", DisplayErrorContext(e)))?;

        Ok(resp
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(str::to_string))
            .collect())
    }

    async fn create_upload(&self, key: &str, metadata: Metadata) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| anyhow!("failed to initiate multipart upload: {}", DisplayErrorContext(e)))?;

        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("multipart upload id missing from response"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: DataReader,
        length: u64,
    ) -> Result<PartETag> {
        let data = Self::buffer_body(body, length)?;
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .content_length(length as i64)
            .send()
            .await
            .map_err(|e| anyhow!("failed to upload part {}: {}", part_number, DisplayErrorContext(e)))?;

        let etag = resp
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("etag missing for part {}", part_number))?;
        Ok(PartETag { part_number, etag })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<PartETag>,
    ) -> Result<()> {
        let completed: Vec<CompletedPart> = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| anyhow!("failed to complete multipart upload: {}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| anyhow!("failed to abort multipart upload: {}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn cleanup_by_metadata(
        &self,
        prefix: &str,
        meta_key: &str,
        meta_value: &str,
    ) -> Result<usize> {
        let mut deleted = 0usize;
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.as_deref() {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| anyhow!("list failed: {}", DisplayErrorContext(e)))?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };

                let head = match self
                    .client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                {
                    Ok(head) => head,
                    Err(e) => {
                        warn!(key, error = %DisplayErrorContext(e), "failed to head object during cleanup");
                        continue;
                    }
                };

                let matches = head
                    .metadata()
                    .and_then(|md| md.get(meta_key))
                    .map(String::as_str)
                    == Some(meta_value);
                if !matches {
                    continue;
                }

                match self.delete(key).await {
                    Ok(()) => deleted += 1,
                    Err(e) => {
                        warn!(key, error = %e, "failed to delete object during cleanup");
                    }
                }
            }

            match resp.next_continuation_token() {
                Some(token) if !token.is_empty() => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(deleted)
    }
}
