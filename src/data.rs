//! Deterministic payload generation
//!
//! Every payload is a pure function of (pattern, key, byte offset), which is
//! what makes read-after-write verification possible: the GET side can
//! recompute exactly what the PUT side uploaded without any shared state.
//!
//! Two pattern families are supported:
//! - `random:<seed>` — pseudo-random bytes from a per-key seeded PRNG. The
//!   effective seed is `seed XOR first-8-bytes(SHA-256(key))`.
//! - `fixed:<hex>` — the given byte sequence repeated to the requested length.

use std::io::{self, Read, Seek, SeekFrom};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Block size for the internal PRNG buffer. Reads of any granularity are
/// served from whole blocks so the byte stream does not depend on the
/// caller's chunk size.
const BLOCK_SIZE: usize = 8192;

/// Validation failures when parsing a data pattern spec.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid pattern format, expected 'type:value'")]
    MissingSeparator,
    #[error("unknown pattern type: {0}")]
    UnknownType(String),
    #[error("invalid random seed: {0}")]
    InvalidSeed(String),
    #[error("invalid fixed hex data: {0}")]
    InvalidHex(String),
    #[error("fixed data cannot be empty")]
    EmptyFixed,
}

/// Factory for deterministic payload readers.
pub struct Generator {
    pattern: Pattern,
}

enum Pattern {
    Random { seed: u64 },
    Fixed { data: Vec<u8> },
}

impl Generator {
    /// Parse a pattern spec of the form `random:<seed>` or `fixed:<hex>`.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let (kind, value) = pattern
            .split_once(':')
            .ok_or(PatternError::MissingSeparator)?;

        let pattern = match kind {
            "random" => {
                let seed: i64 = value
                    .parse()
                    .map_err(|_| PatternError::InvalidSeed(value.to_string()))?;
                Pattern::Random { seed: seed as u64 }
            }
            "fixed" => {
                if value.is_empty() {
                    return Err(PatternError::EmptyFixed);
                }
                let data =
                    hex::decode(value).map_err(|e| PatternError::InvalidHex(e.to_string()))?;
                Pattern::Fixed { data }
            }
            other => return Err(PatternError::UnknownType(other.to_string())),
        };

        Ok(Generator { pattern })
    }

    /// Reader over the full payload for `key` of length `size`.
    pub fn reader(&self, key: &str, size: u64) -> DataReader {
        self.reader_range(key, 0, size)
    }

    /// Reader over the byte window `[offset, offset+len)` of the payload for
    /// `key`. Windows taken at different offsets concatenate to the same
    /// stream a single full reader produces.
    pub fn reader_range(&self, key: &str, offset: u64, len: u64) -> DataReader {
        match &self.pattern {
            Pattern::Random { seed } => {
                DataReader::Random(RandomReader::new(key_seed(*seed, key), offset, offset + len))
            }
            Pattern::Fixed { data } => {
                DataReader::Fixed(FixedReader::new(data.clone(), offset, offset + len))
            }
        }
    }

    /// Generate the payload for (key, size), returning its lowercase hex
    /// SHA-256 digest alongside a reader reset to offset 0.
    pub fn generate_and_hash(&self, key: &str, size: u64) -> Result<(DataReader, String)> {
        let mut reader = self.reader(key, size);

        let mut hasher = Sha256::new();
        let mut buf = [0u8; BLOCK_SIZE];
        loop {
            let n = reader.read(&mut buf).context("failed to generate payload")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hex::encode(hasher.finalize());

        reader
            .seek(SeekFrom::Start(0))
            .context("failed to reset payload reader")?;
        Ok((reader, digest))
    }
}

/// Mix the key into the base seed so each key gets its own byte stream.
fn key_seed(base_seed: u64, key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut first8 = [0u8; 8];
    first8.copy_from_slice(&digest[..8]);
    base_seed ^ u64::from_le_bytes(first8)
}

/// A positioned, seekable payload reader.
pub enum DataReader {
    Random(RandomReader),
    Fixed(FixedReader),
}

impl DataReader {
    /// Remaining bytes until EOF.
    pub fn remaining(&self) -> u64 {
        match self {
            DataReader::Random(r) => r.end.saturating_sub(r.position),
            DataReader::Fixed(r) => r.end.saturating_sub(r.position),
        }
    }
}

impl Read for DataReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DataReader::Random(r) => r.read(buf),
            DataReader::Fixed(r) => r.read(buf),
        }
    }
}

impl Seek for DataReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            DataReader::Random(r) => r.seek(pos),
            DataReader::Fixed(r) => r.seek(pos),
        }
    }
}

/// Deterministic pseudo-random reader.
///
/// The PRNG emits an unbounded byte stream in fixed-size blocks; `position`
/// addresses that stream absolutely. Seeking backwards re-seeds and
/// regenerates up to the target block, which is cheap relative to network
/// I/O and keeps the bytes a pure function of position.
pub struct RandomReader {
    seed: u64,
    rng: StdRng,
    block: Box<[u8; BLOCK_SIZE]>,
    /// Index of the block currently in `block`, or u64::MAX before first fill.
    block_index: u64,
    /// Index of the next block the PRNG will produce.
    next_block: u64,
    position: u64,
    end: u64,
}

impl RandomReader {
    fn new(seed: u64, start: u64, end: u64) -> Self {
        RandomReader {
            seed,
            rng: StdRng::seed_from_u64(seed),
            block: Box::new([0u8; BLOCK_SIZE]),
            block_index: u64::MAX,
            next_block: 0,
            position: start,
            end,
        }
    }

    fn load_block(&mut self, index: u64) {
        if self.block_index == index {
            return;
        }
        if index < self.next_block {
            // Target block already consumed: rewind by re-seeding.
            self.rng = StdRng::seed_from_u64(self.seed);
            self.next_block = 0;
        }
        while self.next_block <= index {
            self.rng.fill_bytes(&mut self.block[..]);
            self.next_block += 1;
        }
        self.block_index = index;
    }
}

impl Read for RandomReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.end || buf.is_empty() {
            return Ok(0);
        }
        let block = self.position / BLOCK_SIZE as u64;
        self.load_block(block);

        let off = (self.position % BLOCK_SIZE as u64) as usize;
        let in_block = BLOCK_SIZE - off;
        let remaining = (self.end - self.position) as usize;
        let n = buf.len().min(in_block).min(remaining);
        buf[..n].copy_from_slice(&self.block[off..off + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for RandomReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = resolve_seek(pos, self.position, self.end)?;
        // Clamp forward overshoot to EOF; the block loads lazily on read.
        self.position = new_pos.min(self.end);
        Ok(self.position)
    }
}

/// Repeating fixed-byte-pattern reader. Byte at absolute position `p` is
/// `pattern[p % pattern.len()]`.
pub struct FixedReader {
    pattern: Vec<u8>,
    position: u64,
    end: u64,
}

impl FixedReader {
    fn new(pattern: Vec<u8>, start: u64, end: u64) -> Self {
        FixedReader {
            pattern,
            position: start,
            end,
        }
    }
}

impl Read for FixedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.end || buf.is_empty() {
            return Ok(0);
        }
        let remaining = (self.end - self.position) as usize;
        let n = buf.len().min(remaining);
        let pattern_len = self.pattern.len() as u64;
        for (i, b) in buf[..n].iter_mut().enumerate() {
            *b = self.pattern[((self.position + i as u64) % pattern_len) as usize];
        }
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for FixedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = resolve_seek(pos, self.position, self.end)?;
        if new_pos > self.end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "position beyond size",
            ));
        }
        self.position = new_pos;
        Ok(self.position)
    }
}

fn resolve_seek(pos: SeekFrom, current: u64, end: u64) -> io::Result<u64> {
    let new_pos = match pos {
        SeekFrom::Start(offset) => offset as i64,
        SeekFrom::Current(offset) => current as i64 + offset,
        SeekFrom::End(offset) => end as i64 + offset,
    };
    if new_pos < 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "negative position",
        ));
    }
    Ok(new_pos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(reader: &mut DataReader, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_random_determinism() {
        let g1 = Generator::new("random:42").unwrap();
        let g2 = Generator::new("random:42").unwrap();

        let bytes1 = read_all(&mut g1.reader("obj-0001.bin", 65536), 8192);
        let bytes2 = read_all(&mut g2.reader("obj-0001.bin", 65536), 8192);
        assert_eq!(bytes1, bytes2);

        let (_, h1) = g1.generate_and_hash("obj-0001.bin", 65536).unwrap();
        let (_, h2) = g2.generate_and_hash("obj-0001.bin", 65536).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_random_keys_differ() {
        let g = Generator::new("random:42").unwrap();
        let a = read_all(&mut g.reader("key-a", 4096), 4096);
        let b = read_all(&mut g.reader("key-b", 4096), 4096);
        assert_ne!(a, b);
    }

    #[test]
    fn test_seeds_differ() {
        let a = read_all(
            &mut Generator::new("random:1").unwrap().reader("k", 4096),
            4096,
        );
        let b = read_all(
            &mut Generator::new("random:2").unwrap().reader("k", 4096),
            4096,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn test_chunk_size_independence() {
        let g = Generator::new("random:7").unwrap();
        let whole = read_all(&mut g.reader("obj", 20_000), 20_000);
        let small = read_all(&mut g.reader("obj", 20_000), 7);
        let medium = read_all(&mut g.reader("obj", 20_000), 1000);
        assert_eq!(whole, small);
        assert_eq!(whole, medium);
    }

    #[test]
    fn test_seek_back_restores_stream() {
        let g = Generator::new("random:42").unwrap();
        let mut reader = g.reader("obj", 32768);

        let mut first = vec![0u8; 10_000];
        reader.read_exact(&mut first).unwrap();

        reader.seek(SeekFrom::Start(0)).unwrap();
        let mut second = vec![0u8; 10_000];
        reader.read_exact(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_seek_arbitrary_position() {
        let g = Generator::new("random:11").unwrap();
        let full = read_all(&mut g.reader("obj", 30_000), 8192);

        let mut reader = g.reader("obj", 30_000);
        reader.seek(SeekFrom::Start(12_345)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(&full[12_345..], &tail[..]);
    }

    #[test]
    fn test_range_reader_matches_full_stream() {
        let g = Generator::new("random:99").unwrap();
        let full = read_all(&mut g.reader("obj", 50_000), 8192);

        let part1 = read_all(&mut g.reader_range("obj", 0, 20_000), 4096);
        let part2 = read_all(&mut g.reader_range("obj", 20_000, 20_000), 4096);
        let part3 = read_all(&mut g.reader_range("obj", 40_000, 10_000), 4096);

        let mut joined = part1;
        joined.extend(part2);
        joined.extend(part3);
        assert_eq!(full, joined);
    }

    #[test]
    fn test_fixed_pattern_repeats() {
        let g = Generator::new("fixed:deadbeef").unwrap();
        let bytes = read_all(&mut g.reader("anything", 10), 3);
        assert_eq!(bytes, vec![0xde, 0xad, 0xbe, 0xef, 0xde, 0xad, 0xbe, 0xef, 0xde, 0xad]);
    }

    #[test]
    fn test_fixed_range_offset_into_pattern() {
        let g = Generator::new("fixed:0102030405").unwrap();
        // Window starting at absolute offset 3 begins mid-pattern.
        let bytes = read_all(&mut g.reader_range("k", 3, 4), 2);
        assert_eq!(bytes, vec![0x04, 0x05, 0x01, 0x02]);
    }

    #[test]
    fn test_generate_and_hash_resets_reader() {
        let g = Generator::new("random:5").unwrap();
        let (mut reader, digest) = g.generate_and_hash("obj", 12_000).unwrap();

        let bytes = read_all(&mut reader, 8192);
        assert_eq!(bytes.len(), 12_000);

        let manual = hex::encode(Sha256::digest(&bytes));
        assert_eq!(digest, manual);
    }

    #[test]
    fn test_pattern_errors() {
        assert!(matches!(
            Generator::new("random42"),
            Err(PatternError::MissingSeparator)
        ));
        assert!(matches!(
            Generator::new("blah:42"),
            Err(PatternError::UnknownType(_))
        ));
        assert!(matches!(
            Generator::new("random:abc"),
            Err(PatternError::InvalidSeed(_))
        ));
        assert!(matches!(
            Generator::new("fixed:"),
            Err(PatternError::EmptyFixed)
        ));
        assert!(matches!(
            Generator::new("fixed:xyz"),
            Err(PatternError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_negative_seed_allowed() {
        assert!(Generator::new("random:-7").is_ok());
    }

    #[test]
    fn test_zero_seed_still_mixes_key() {
        let g = Generator::new("random:0").unwrap();
        let a = read_all(&mut g.reader("key-a", 1024), 1024);
        let b = read_all(&mut g.reader("key-b", 1024), 1024);
        assert_ne!(a, b);
    }
}
