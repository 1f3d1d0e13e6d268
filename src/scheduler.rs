//! Weighted operation scheduling
//!
//! The scheduler owns the run's operation mix: each call to [`Scheduler::next`]
//! draws an operation kind with probability proportional to its configured
//! weight, and [`Scheduler::next_key`] draws a uniform key index. Verification
//! sampling deliberately uses a caller-supplied PRNG so it cannot perturb the
//! op-selection sequence.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// The closed set of operation kinds the generator can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Put,
    Get,
    Delete,
    Copy,
    List,
    Head,
    MultipartPut,
}

impl OpKind {
    pub const ALL: [OpKind; 7] = [
        OpKind::Put,
        OpKind::Get,
        OpKind::Delete,
        OpKind::Copy,
        OpKind::List,
        OpKind::Head,
        OpKind::MultipartPut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Put => "put",
            OpKind::Get => "get",
            OpKind::Delete => "delete",
            OpKind::Copy => "copy",
            OpKind::List => "list",
            OpKind::Head => "head",
            OpKind::MultipartPut => "multipart_put",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "put" => Ok(OpKind::Put),
            "get" => Ok(OpKind::Get),
            "delete" => Ok(OpKind::Delete),
            "copy" => Ok(OpKind::Copy),
            "list" => Ok(OpKind::List),
            "head" => Ok(OpKind::Head),
            "multipart_put" => Ok(OpKind::MultipartPut),
            other => Err(anyhow!("unknown operation kind: {}", other)),
        }
    }
}

/// Draws the next operation and key index for a worker.
pub struct Scheduler {
    ops: Vec<OpKind>,
    /// Cumulative weight bounds, parallel to `ops`.
    cumulative: Vec<u32>,
    total_weight: u32,
    total_keys: usize,
    rng: Mutex<StdRng>,
}

impl Scheduler {
    /// Build a scheduler from an op→weight mix. Zero-weight entries are
    /// dropped; an empty or all-zero mix is rejected.
    pub fn new(mix: &HashMap<String, u32>, total_keys: usize, seed: u64) -> Result<Self> {
        if mix.is_empty() {
            return Err(anyhow!("operation mix cannot be empty"));
        }

        let mut entries: Vec<(OpKind, u32)> = Vec::with_capacity(mix.len());
        for (op_str, weight) in mix {
            let op = op_str.parse::<OpKind>()?;
            if *weight > 0 {
                entries.push((op, *weight));
            }
        }
        if entries.is_empty() {
            return Err(anyhow!("operation mix weights sum to zero"));
        }
        // Stable draw order regardless of map iteration order.
        entries.sort_by_key(|(op, _)| *op);

        let mut ops = Vec::with_capacity(entries.len());
        let mut cumulative = Vec::with_capacity(entries.len());
        let mut total = 0u32;
        for (op, weight) in entries {
            ops.push(op);
            total += weight;
            cumulative.push(total);
        }

        Ok(Scheduler {
            ops,
            cumulative,
            total_weight: total,
            total_keys,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    /// Draw the next operation kind, weighted by the mix.
    pub fn next(&self) -> OpKind {
        if self.ops.len() == 1 {
            return self.ops[0];
        }
        let r = {
            let mut rng = self.rng.lock().unwrap();
            rng.random_range(0..self.total_weight)
        };
        for (i, bound) in self.cumulative.iter().enumerate() {
            if r < *bound {
                return self.ops[i];
            }
        }
        self.ops[self.ops.len() - 1]
    }

    /// Draw a uniform key index from [0, total_keys).
    pub fn next_key(&self) -> usize {
        let mut rng = self.rng.lock().unwrap();
        rng.random_range(0..self.total_keys)
    }
}

/// Decide whether this GET should be verified, given the configured rate.
/// Uses a worker-local PRNG so sampling does not consume scheduler draws.
pub fn should_verify(verify_rate: f64, rng: &mut impl Rng) -> bool {
    if verify_rate <= 0.0 {
        return false;
    }
    if verify_rate >= 1.0 {
        return true;
    }
    rng.random::<f64>() < verify_rate
}
