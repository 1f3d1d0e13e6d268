//! Data integrity verification
//!
//! A GET body is verified by streaming it through SHA-256 and comparing the
//! digest against either the `sha256` metadata written at PUT time or a
//! recomputation from the deterministic data model. Verification failures
//! are terminal for the operation and are never retried.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::data::Generator;

/// Metadata key holding the payload's lowercase hex SHA-256 digest.
pub const METADATA_KEY_SHA256: &str = "sha256";

/// Metadata key marking objects created by this tool.
pub const METADATA_KEY_CREATED_BY: &str = "created-by";

/// Sentinel value for [`METADATA_KEY_CREATED_BY`]; cleanup deletes only
/// objects carrying exactly this marker.
pub const METADATA_VALUE_CREATED_BY: &str = "s3-workload";

pub type Metadata = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("no sha256 hash found in object metadata")]
    MissingHash,

    #[error("failed to hash body: {0}")]
    Io(#[from] std::io::Error),
}

/// Compute the lowercase hex SHA-256 digest of a reader's contents.
pub fn compute_hash<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub struct Verifier {
    generator: Arc<Generator>,
}

impl Verifier {
    pub fn new(generator: Arc<Generator>) -> Self {
        Verifier { generator }
    }

    /// Stream `reader` through SHA-256 and compare against `expected`.
    pub fn verify<R: Read>(&self, reader: R, expected: &str) -> Result<(), VerifyError> {
        let actual = compute_hash(reader)?;
        if actual != expected {
            return Err(VerifyError::HashMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Verify against the `sha256` value stored in object metadata.
    pub fn verify_with_metadata<R: Read>(
        &self,
        reader: R,
        metadata: &Metadata,
    ) -> Result<(), VerifyError> {
        let expected = metadata
            .get(METADATA_KEY_SHA256)
            .ok_or(VerifyError::MissingHash)?;
        self.verify(reader, expected)
    }

    /// Verify against the digest recomputed from the data model for
    /// (key, size), without consulting metadata.
    pub fn verify_key<R: Read>(&self, reader: R, key: &str, size: u64) -> Result<()> {
        let expected = compute_hash(self.generator.reader(key, size))
            .context("failed to compute expected hash")?;
        self.verify(reader, &expected)?;
        Ok(())
    }
}

/// Build the metadata attached to every PUT: the payload digest, the
/// created-by sentinel, and any `k=v` pairs from the namespace tag string.
pub fn prepare_metadata(hash: &str, namespace_tag: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(METADATA_KEY_SHA256.to_string(), hash.to_string());
    metadata.insert(
        METADATA_KEY_CREATED_BY.to_string(),
        METADATA_VALUE_CREATED_BY.to_string(),
    );

    for pair in namespace_tag.split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            let k = k.trim();
            let v = v.trim();
            if !k.is_empty() {
                metadata.insert(k.to_string(), v.to_string());
            }
        }
    }

    metadata
}
