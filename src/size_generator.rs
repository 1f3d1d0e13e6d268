//! Object size generation with support for realistic distributions
//!
//! A size spec string selects the generator:
//! - `fixed:1MiB` — every object is exactly that size
//! - `dist:lognormal:mean=1MiB,std=0.5` — log-normal sizes; `std` is a
//!   fraction of the mean (defaults to 0.5 when omitted)
//! - `uniform:min=1KB,max=10MB` — inclusive uniform draw

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};

use crate::size_parser::parse_size;

/// Generator for object sizes. `next()` is safe to call from many workers;
/// the distribution PRNG sits behind a mutex.
pub struct SizeGenerator {
    kind: SizeKind,
    rng: Mutex<StdRng>,
}

enum SizeKind {
    Fixed(u64),
    LogNormal { dist: LogNormal<f64>, mean: f64 },
    Uniform { min: u64, max: u64 },
}

impl SizeGenerator {
    /// Parse a size spec string into a generator seeded for deterministic draws.
    pub fn parse(spec: &str, seed: u64) -> Result<Self> {
        let (kind_str, rest) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid size spec, expected 'type:value': {}", spec))?;

        let kind = match kind_str {
            "fixed" => {
                let size = parse_size(rest).context("invalid fixed size")?;
                if size == 0 {
                    return Err(anyhow!("fixed size must be greater than 0"));
                }
                SizeKind::Fixed(size)
            }
            "dist" => {
                let (dist_type, param_str) = rest
                    .split_once(':')
                    .ok_or_else(|| anyhow!("invalid distribution spec: {}", rest))?;
                match dist_type {
                    "lognormal" => {
                        let params = parse_params(param_str);
                        let mean_str = params
                            .get("mean")
                            .ok_or_else(|| anyhow!("lognormal distribution requires 'mean'"))?;
                        let mean = parse_size(mean_str).context("invalid mean")? as f64;
                        if mean < 1.0 {
                            return Err(anyhow!("lognormal mean must be at least 1 byte"));
                        }
                        let std_frac: f64 = match params.get("std") {
                            Some(s) => s.parse().map_err(|_| anyhow!("invalid std: {}", s))?,
                            None => 0.5,
                        };
                        // The configured std is a fraction of the mean; convert the
                        // linear-space (mean, stddev) pair to log-space parameters.
                        let stddev = std_frac * mean;
                        let phi_squared = (1.0 + (stddev * stddev) / (mean * mean)).ln();
                        let dist = LogNormal::new(mean.ln() - phi_squared / 2.0, phi_squared.sqrt())
                            .map_err(|e| anyhow!("invalid lognormal parameters: {}", e))?;
                        SizeKind::LogNormal { dist, mean }
                    }
                    other => return Err(anyhow!("unknown distribution type: {}", other)),
                }
            }
            "uniform" => {
                let params = parse_params(rest);
                let min_str = params
                    .get("min")
                    .ok_or_else(|| anyhow!("uniform distribution requires 'min'"))?;
                let max_str = params
                    .get("max")
                    .ok_or_else(|| anyhow!("uniform distribution requires 'max'"))?;
                let min = parse_size(min_str).context("invalid min")?;
                let max = parse_size(max_str).context("invalid max")?;
                if min == 0 {
                    return Err(anyhow!("uniform min must be > 0"));
                }
                if min > max {
                    return Err(anyhow!("uniform min ({}) > max ({})", min, max));
                }
                SizeKind::Uniform { min, max }
            }
            other => return Err(anyhow!("unknown size spec type: {}", other)),
        };

        Ok(SizeGenerator {
            kind,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Draw the next object size in bytes. Always >= 1.
    pub fn next(&self) -> u64 {
        match &self.kind {
            SizeKind::Fixed(size) => *size,
            SizeKind::LogNormal { dist, .. } => {
                let sample = {
                    let mut rng = self.rng.lock().unwrap();
                    dist.sample(&mut *rng)
                };
                (sample.round() as u64).max(1)
            }
            SizeKind::Uniform { min, max } => {
                if min == max {
                    return *min;
                }
                let mut rng = self.rng.lock().unwrap();
                rng.random_range(*min..=*max)
            }
        }
    }

    /// Human-readable description for startup logging.
    pub fn description(&self) -> String {
        match &self.kind {
            SizeKind::Fixed(size) => format!("fixed {} bytes", size),
            SizeKind::LogNormal { mean, .. } => {
                format!("lognormal (mean ~{} bytes)", mean.round() as u64)
            }
            SizeKind::Uniform { min, max } => format!("uniform {}-{} bytes", min, max),
        }
    }
}

fn parse_params(s: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in s.split(',') {
        if let Some((k, v)) = pair.split_once('=') {
            params.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_size() {
        let generator = SizeGenerator::parse("fixed:1MiB", 0).unwrap();
        for _ in 0..100 {
            assert_eq!(generator.next(), 1_048_576);
        }
    }

    #[test]
    fn test_uniform_distribution() {
        let generator = SizeGenerator::parse("uniform:min=1KiB,max=10KiB", 1).unwrap();
        for _ in 0..1000 {
            let size = generator.next();
            assert!(size >= 1024, "size {} below minimum", size);
            assert!(size <= 10240, "size {} above maximum", size);
        }
    }

    #[test]
    fn test_uniform_min_equals_max() {
        let generator = SizeGenerator::parse("uniform:min=4096,max=4096", 7).unwrap();
        for _ in 0..10 {
            assert_eq!(generator.next(), 4096);
        }
    }

    #[test]
    fn test_lognormal_distribution() {
        let generator = SizeGenerator::parse("dist:lognormal:mean=1MiB,std=0.5", 42).unwrap();

        let samples: Vec<u64> = (0..2000).map(|_| generator.next()).collect();
        assert!(samples.iter().all(|&s| s >= 1));

        let mean: f64 = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
        assert!(
            mean >= 800_000.0 && mean <= 1_300_000.0,
            "mean {} outside expected range for lognormal",
            mean
        );

        // Characteristic lognormal shape: most samples sit below the mean.
        let below = samples.iter().filter(|&&s| (s as f64) < mean).count();
        assert!(below as f64 / samples.len() as f64 > 0.5);
    }

    #[test]
    fn test_lognormal_default_std() {
        let generator = SizeGenerator::parse("dist:lognormal:mean=4096", 3).unwrap();
        for _ in 0..100 {
            assert!(generator.next() >= 1);
        }
    }

    #[test]
    fn test_deterministic_sequence() {
        let g1 = SizeGenerator::parse("uniform:min=1KiB,max=10KiB", 42).unwrap();
        let g2 = SizeGenerator::parse("uniform:min=1KiB,max=10KiB", 42).unwrap();
        for _ in 0..100 {
            assert_eq!(g1.next(), g2.next());
        }
    }

    #[test]
    fn test_invalid_specs() {
        assert!(SizeGenerator::parse("fixed", 0).is_err());
        assert!(SizeGenerator::parse("fixed:0", 0).is_err());
        assert!(SizeGenerator::parse("fixed:banana", 0).is_err());
        assert!(SizeGenerator::parse("uniform:min=10KB,max=1KB", 0).is_err());
        assert!(SizeGenerator::parse("uniform:min=1KB", 0).is_err());
        assert!(SizeGenerator::parse("dist:lognormal:std=0.5", 0).is_err());
        assert!(SizeGenerator::parse("dist:pareto:mean=1MiB", 0).is_err());
        assert!(SizeGenerator::parse("gaussian:mean=1MiB", 0).is_err());
    }
}
