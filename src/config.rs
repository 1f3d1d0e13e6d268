//! Run configuration
//!
//! Deserialized from YAML; flags a thin CLI layer may override land in the
//! same struct. `validate()` is the single normalization point: it checks the
//! bounds the engine relies on and rescales the operation mix to 100.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Deserializer};

use crate::multipart::MIN_PART_SIZE;
use crate::scheduler::OpKind;
use crate::size_parser::parse_size;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // S3 connection
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub path_style: bool,
    #[serde(default)]
    pub skip_tls_verify: bool,

    // Bucket management
    #[serde(default)]
    pub create_bucket: bool,
    #[serde(default)]
    pub versioning: Versioning,

    // Workload
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_mix")]
    pub mix: HashMap<String, u32>,
    /// Total wall time to run; zero means unlimited.
    #[serde(default = "default_duration", with = "humantime_serde")]
    pub duration: Duration,
    /// Total operation cap; zero means unlimited.
    #[serde(default)]
    pub operations: u64,

    // Object
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_keys")]
    pub keys: usize,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_key_template")]
    pub key_template: String,
    #[serde(default = "default_true")]
    pub random_keys: bool,

    // Data pattern & verification
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default = "default_verify_rate")]
    pub verify_rate: f64,

    // Rate limiting
    #[serde(default)]
    pub rate_type: RateType,
    /// QPS for fixed, lambda for poisson; zero means unlimited.
    #[serde(default)]
    pub rate_limit: f64,

    // Timeouts & retries
    #[serde(default = "default_op_timeout", with = "humantime_serde")]
    pub op_timeout: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    // Copy
    #[serde(default)]
    pub copy_dst_bucket: Option<String>,

    // Safety & cleanup
    #[serde(default)]
    pub namespace_tag: String,
    #[serde(default)]
    pub keep_data: bool,
    #[serde(default)]
    pub cleanup: bool,
    #[serde(default)]
    pub dry_run: bool,

    // Multipart
    #[serde(default)]
    pub multipart_enabled: bool,
    #[serde(default = "default_multipart_threshold", deserialize_with = "de_size")]
    pub multipart_threshold: u64,
    #[serde(default = "default_multipart_part_size", deserialize_with = "de_size")]
    pub multipart_part_size: u64,
    /// Maximum part uploads in flight per multipart object.
    #[serde(default = "default_multipart_max_parts")]
    pub multipart_max_parts: usize,

    /// Optional base seed for the scheduler and size distribution; unset
    /// means seed from entropy.
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Versioning {
    On,
    Off,
    #[default]
    Keep,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateType {
    #[default]
    Fixed,
    Poisson,
}

impl RateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateType::Fixed => "fixed",
            RateType::Poisson => "poisson",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreakerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_breaker_failures")]
    pub max_failures: u32,
    #[serde(default = "default_breaker_reset", with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            enabled: false,
            max_failures: default_breaker_failures(),
            reset_timeout: default_breaker_reset(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: String::new(),
            region: default_region(),
            bucket: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            path_style: false,
            skip_tls_verify: false,
            create_bucket: false,
            versioning: Versioning::Keep,
            concurrency: default_concurrency(),
            mix: default_mix(),
            duration: default_duration(),
            operations: 0,
            size: default_size(),
            keys: default_keys(),
            prefix: String::new(),
            key_template: default_key_template(),
            random_keys: true,
            pattern: default_pattern(),
            verify_rate: default_verify_rate(),
            rate_type: RateType::Fixed,
            rate_limit: 0.0,
            op_timeout: default_op_timeout(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            copy_dst_bucket: None,
            namespace_tag: String::new(),
            keep_data: false,
            cleanup: false,
            dry_run: false,
            multipart_enabled: false,
            multipart_threshold: default_multipart_threshold(),
            multipart_part_size: default_multipart_part_size(),
            multipart_max_parts: default_multipart_max_parts(),
            seed: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl Config {
    /// Read and validate a YAML config file.
    pub fn load(path: &str) -> Result<Self> {
        let buf = std::fs::read(path).with_context(|| format!("read {}", path))?;
        let mut cfg: Config =
            serde_yaml::from_slice(&buf).with_context(|| format!("parse {}", path))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate bounds and normalize the operation mix to sum to 100.
    pub fn validate(&mut self) -> Result<()> {
        if self.endpoint.is_empty() {
            bail!("endpoint is required");
        }
        if self.bucket.is_empty() {
            bail!("bucket is required");
        }
        self.validate_workload()
    }

    /// The workload-side checks, independent of the connection settings.
    pub fn validate_workload(&mut self) -> Result<()> {
        if self.concurrency < 1 {
            bail!("concurrency must be >= 1");
        }
        if self.keys < 1 {
            bail!("keys must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.verify_rate) {
            bail!("verify-rate must be between 0.0 and 1.0");
        }
        if self.rate_limit < 0.0 {
            bail!("rate-limit must be >= 0");
        }

        if self.mix.is_empty() {
            bail!("operation mix cannot be empty");
        }
        let mut total = 0u64;
        for (op, weight) in &self.mix {
            op.parse::<OpKind>()
                .map_err(|e| anyhow!("invalid operation mix: {}", e))?;
            total += u64::from(*weight);
        }
        if total == 0 {
            bail!("operation mix weights sum to zero");
        }

        // Rescale to percentages; zero entries drop out.
        if total != 100 {
            let factor = 100.0 / total as f64;
            self.mix = self
                .mix
                .iter()
                .filter(|(_, w)| **w > 0)
                .map(|(op, w)| (op.clone(), ((f64::from(*w) * factor).round() as u32).max(1)))
                .collect();
        } else {
            self.mix.retain(|_, w| *w > 0);
        }

        if self.multipart_enabled {
            if self.multipart_threshold < MIN_PART_SIZE {
                bail!("multipart-threshold must be at least 5 MiB");
            }
            if self.multipart_part_size < MIN_PART_SIZE {
                bail!("multipart-part-size must be at least 5 MiB");
            }
            if !(1..=10_000).contains(&self.multipart_max_parts) {
                bail!("multipart-max-parts must be in 1..=10000");
            }
        }

        Ok(())
    }
}

fn de_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeValue {
        Number(u64),
        Text(String),
    }

    match SizeValue::deserialize(deserializer)? {
        SizeValue::Number(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_concurrency() -> usize {
    32
}

fn default_mix() -> HashMap<String, u32> {
    HashMap::from([("put".to_string(), 50), ("get".to_string(), 50)])
}

fn default_duration() -> Duration {
    Duration::from_secs(600)
}

fn default_size() -> String {
    "fixed:1MiB".to_string()
}

fn default_keys() -> usize {
    10_000
}

fn default_key_template() -> String {
    "obj-{seq:08}.bin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_pattern() -> String {
    "random:42".to_string()
}

fn default_verify_rate() -> f64 {
    0.1
}

fn default_op_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_multipart_threshold() -> u64 {
    16 * 1024 * 1024
}

fn default_multipart_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_multipart_max_parts() -> usize {
    4
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_reset() -> Duration {
    Duration::from_secs(30)
}
