//! HyperLogLog cardinality estimator.
//!
//! Fixed precision of 14 bits: 16384 one-byte registers per estimator, a
//! standard error of `1.04 / sqrt(16384) ≈ 0.81%`, and linear counting for
//! small cardinalities. Members are hashed with SipHash-1-3 under fixed keys
//! so estimators built in different processes agree.

use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};

pub const PRECISION: u32 = 14;
pub const REGISTERS: usize = 1 << PRECISION;

const HASH_KEYS: (u64, u64) = (0x6576_656e_7473_7472, 0x6561_6d5f_686c_6c00);

#[derive(Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    registers: Box<[u8]>,
}

impl std::fmt::Debug for HyperLogLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperLogLog")
            .field("precision", &PRECISION)
            .field("estimate", &self.count())
            .finish()
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperLogLog {
    pub fn new() -> Self {
        Self {
            registers: vec![0u8; REGISTERS].into_boxed_slice(),
        }
    }

    fn hash<T: Hash + ?Sized>(member: &T) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(HASH_KEYS.0, HASH_KEYS.1);
        member.hash(&mut hasher);
        hasher.finish()
    }

    /// Adds a member. Returns true when an internal register changed, which
    /// is how callers learn that the estimate may have moved.
    pub fn insert<T: Hash + ?Sized>(&mut self, member: &T) -> bool {
        let hash = Self::hash(member);
        let index = (hash >> (64 - PRECISION)) as usize;
        // Guard bit bounds the rank at 64 - PRECISION + 1.
        let rest = (hash << PRECISION) | (1 << (PRECISION - 1));
        let rank = rest.leading_zeros() as u8 + 1;

        if rank > self.registers[index] {
            self.registers[index] = rank;
            true
        } else {
            false
        }
    }

    /// Estimated number of distinct members added so far.
    pub fn count(&self) -> u64 {
        let m = REGISTERS as f64;
        let alpha = 0.7213 / (1.0 + 1.079 / m);

        let mut zeros = 0usize;
        let mut sum = 0.0f64;
        for &register in self.registers.iter() {
            if register == 0 {
                zeros += 1;
            }
            sum += 1.0 / (1u64 << register) as f64;
        }

        let raw = alpha * m * m / sum;
        if raw <= 2.5 * m && zeros > 0 {
            (m * (m / zeros as f64).ln()).round() as u64
        } else {
            raw.round() as u64
        }
    }
}
