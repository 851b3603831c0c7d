//! Approximate distinct counting.
//!
//! [`HyperLogLog`] estimates the number of distinct values it has seen in
//! constant memory, `2^precision` one-byte registers, with a relative standard
//! error of roughly `1.04 / sqrt(2^precision)`. Sketches of equal precision
//! merge losslessly, so sketches of the same group taken by different
//! processes can be combined downstream.
//!
//! [`SketchGroup`] pairs a sketch with the exact record count of one
//! statistics group within one window.
//!
//! # Wire format
//!
//! ```text
//! [version: u8 = 1][precision: u8][encoding: u8]
//! encoding 0, sparse: [n: u32 BE] then n * ([index: u32 BE][rank: u8])
//! encoding 1, dense:  2^precision register bytes
//! ```
//!
//! The sparse form is used whenever it is smaller than the dense form.

use xxhash_rust::xxh64::xxh64;

use crate::{
    record::{Attributes, Signal},
    stats::{Phase, StatRecord},
};

/// Default precision, 16 KiB of registers and ~0.8% standard error.
pub const DEFAULT_PRECISION: u8 = 14;
/// Smallest supported precision.
pub const MIN_PRECISION: u8 = 4;
/// Largest supported precision.
pub const MAX_PRECISION: u8 = 18;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 3;
const SPARSE: u8 = 0;
const DENSE: u8 = 1;
const SPARSE_ENTRY_LEN: usize = 5;
const HASH_SEED: u64 = 0;

/// Errors produced by [`HyperLogLog`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Precision outside of `MIN_PRECISION..=MAX_PRECISION`
    #[error("precision {0} is outside of the supported range")]
    Precision(u8),
    /// Merge of two sketches with differing precision
    #[error("cannot merge sketches of precision {ours} and {theirs}")]
    PrecisionMismatch {
        /// Precision of the receiving sketch
        ours: u8,
        /// Precision of the merged sketch
        theirs: u8,
    },
    /// Encoded sketch is shorter than its header claims
    #[error("encoded sketch is truncated")]
    Truncated,
    /// Encoded sketch has trailing bytes
    #[error("encoded sketch has {0} trailing bytes")]
    Trailing(usize),
    /// Unknown format version
    #[error("unknown sketch version {0}")]
    Version(u8),
    /// Unknown register encoding
    #[error("unknown sketch encoding {0}")]
    Encoding(u8),
    /// A sparse entry addresses a register that does not exist
    #[error("sparse register index {0} out of range")]
    Index(u32),
}

/// A HyperLogLog distinct-value sketch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            registers: vec![0; 1 << DEFAULT_PRECISION],
        }
    }
}

impl HyperLogLog {
    /// Create an empty sketch with `2^precision` registers.
    ///
    /// # Errors
    ///
    /// Fails if `precision` is outside of `MIN_PRECISION..=MAX_PRECISION`.
    pub fn new(precision: u8) -> Result<Self, Error> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(Error::Precision(precision));
        }
        Ok(Self {
            precision,
            registers: vec![0; 1 << precision],
        })
    }

    /// The precision of this sketch.
    #[must_use]
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Whether no value has been inserted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|r| *r == 0)
    }

    /// Observe `value`.
    pub fn insert(&mut self, value: &[u8]) {
        self.insert_hash(xxh64(value, HASH_SEED));
    }

    #[allow(clippy::cast_possible_truncation)]
    fn insert_hash(&mut self, hash: u64) {
        let p = u32::from(self.precision);
        let index = (hash >> (64 - p)) as usize;
        // The guard bit caps the rank at 64 - p + 1 when the remaining bits
        // are all zero.
        let rest = (hash << p) | (1 << (p - 1));
        let rank = (rest.leading_zeros() + 1) as u8;
        if rank > self.registers[index] {
            self.registers[index] = rank;
        }
    }

    /// Estimate the number of distinct values observed. Does not mutate the
    /// sketch.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;
        let mut sum = 0.0;
        let mut zeros = 0usize;
        for r in &self.registers {
            sum += 2f64.powi(-i32::from(*r));
            if *r == 0 {
                zeros += 1;
            }
        }
        let raw = alpha(self.registers.len()) * m * m / sum;
        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting is far more accurate in the small range.
            m * (m / zeros as f64).ln()
        } else {
            raw
        }
    }

    /// Fold `other` into this sketch, the result estimates the union.
    ///
    /// # Errors
    ///
    /// Fails if the two sketches differ in precision.
    pub fn merge(&mut self, other: &HyperLogLog) -> Result<(), Error> {
        if self.precision != other.precision {
            return Err(Error::PrecisionMismatch {
                ours: self.precision,
                theirs: other.precision,
            });
        }
        for (ours, theirs) in self.registers.iter_mut().zip(&other.registers) {
            *ours = (*ours).max(*theirs);
        }
        Ok(())
    }

    /// Encode this sketch in its compact wire form.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> Vec<u8> {
        let populated = self.registers.iter().filter(|r| **r != 0).count();
        let sparse_len = 4 + populated * SPARSE_ENTRY_LEN;

        if sparse_len < self.registers.len() {
            let mut buf = Vec::with_capacity(HEADER_LEN + sparse_len);
            buf.extend_from_slice(&[VERSION, self.precision, SPARSE]);
            buf.extend_from_slice(&(populated as u32).to_be_bytes());
            for (index, rank) in self.registers.iter().enumerate().filter(|(_, r)| **r != 0) {
                buf.extend_from_slice(&(index as u32).to_be_bytes());
                buf.push(*rank);
            }
            buf
        } else {
            let mut buf = Vec::with_capacity(HEADER_LEN + self.registers.len());
            buf.extend_from_slice(&[VERSION, self.precision, DENSE]);
            buf.extend_from_slice(&self.registers);
            buf
        }
    }

    /// Decode a sketch from its compact wire form.
    ///
    /// # Errors
    ///
    /// Fails if `bytes` is not a well-formed encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let [version, precision, encoding, body @ ..] = bytes else {
            return Err(Error::Truncated);
        };
        if *version != VERSION {
            return Err(Error::Version(*version));
        }
        let mut sketch = Self::new(*precision)?;

        match *encoding {
            DENSE => {
                let m = sketch.registers.len();
                if body.len() < m {
                    return Err(Error::Truncated);
                }
                if body.len() > m {
                    return Err(Error::Trailing(body.len() - m));
                }
                sketch.registers.copy_from_slice(body);
            }
            SPARSE => {
                let Some((count, entries)) = body.split_first_chunk::<4>() else {
                    return Err(Error::Truncated);
                };
                let count = u32::from_be_bytes(*count) as usize;
                let expected = count
                    .checked_mul(SPARSE_ENTRY_LEN)
                    .ok_or(Error::Truncated)?;
                if entries.len() < expected {
                    return Err(Error::Truncated);
                }
                if entries.len() > expected {
                    return Err(Error::Trailing(entries.len() - expected));
                }
                for entry in entries.chunks_exact(SPARSE_ENTRY_LEN) {
                    let index = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]);
                    let register = sketch
                        .registers
                        .get_mut(index as usize)
                        .ok_or(Error::Index(index))?;
                    *register = entry[4];
                }
            }
            other => return Err(Error::Encoding(other)),
        }
        Ok(sketch)
    }
}

fn alpha(m: usize) -> f64 {
    match m {
        16 => 0.673,
        32 => 0.697,
        64 => 0.709,
        _ => 0.7213 / (1.0 + 1.079 / m as f64),
    }
}

/// The statistics of one group within one window: descriptive fields, an
/// exact record count and a sketch of the distinct tag values seen.
#[derive(Debug, Clone)]
pub struct SketchGroup {
    /// Signal of the group
    pub signal: Signal,
    /// Metric name, log fingerprint or span name
    pub signal_name: String,
    /// Namespaced attribute key
    pub tag_name: String,
    /// Emitting service
    pub service_name: String,
    /// Pipeline phase
    pub phase: Phase,
    /// Vendor identifier
    pub vendor_id: String,
    /// Enrichment tags of the first record seen for the group
    pub tags: Attributes,
    count: i64,
    sketch: HyperLogLog,
}

impl SketchGroup {
    /// Create an empty group described by `stat`.
    #[must_use]
    pub fn new(stat: &StatRecord) -> Self {
        Self {
            signal: stat.signal,
            signal_name: stat.signal_name.clone(),
            tag_name: stat.tag_name.clone(),
            service_name: stat.service_name.clone(),
            phase: stat.phase,
            vendor_id: stat.vendor_id.clone(),
            tags: stat.tags.clone(),
            count: 0,
            sketch: HyperLogLog::default(),
        }
    }

    /// Whether `stat` belongs to this group.
    #[must_use]
    pub fn matches(&self, stat: &StatRecord) -> bool {
        self.signal == stat.signal
            && self.signal_name == stat.signal_name
            && self.tag_name == stat.tag_name
            && self.service_name == stat.service_name
            && self.phase == stat.phase
            && self.vendor_id == stat.vendor_id
    }

    /// Fold one observation of `value`, standing for `count` records, into the
    /// group.
    pub fn observe(&mut self, value: &str, count: i64) {
        self.count = self.count.saturating_add(count);
        self.sketch.insert(value.as_bytes());
    }

    /// Total records observed.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.count
    }

    /// Estimated number of distinct tag values observed.
    #[must_use]
    pub fn estimate_cardinality(&self) -> f64 {
        self.sketch.estimate()
    }

    /// The group's sketch.
    #[must_use]
    pub fn sketch(&self) -> &HyperLogLog {
        &self.sketch
    }

    /// Compact encoding of the group's sketch.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        self.sketch.to_bytes()
    }
}
