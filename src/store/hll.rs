//! HyperLogLog distinct-count estimator.
//!
//! `add` follows Redis `PFADD`: it reports whether any register changed.
//! A changed register means the element was certainly not seen before; an
//! unchanged one means it was probably seen. The UV counter admits only
//! changes, so it under-counts rather than double-counts.

/// Precision: 2^P registers.
const P: u32 = 14;

/// Number of registers (16384, one byte each).
pub const REGISTERS: usize = 1 << P;

/// Bits left after taking the register index.
const HASH_BITS: u32 = 64 - P;

/// alpha_m = 0.7213 / (1 + 1.079 / m)
const ALPHA_M: f64 = 0.7213 / (1.0 + 1.079 / REGISTERS as f64);

/// Relative error the UV counts are expected to stay within at the
/// cardinalities a day of traffic produces. The standard error at P=14 is
/// 1.04 / sqrt(2^14), about 0.81%.
pub const UV_ERROR_BOUND: f64 = 0.02;

#[derive(Clone, PartialEq, Eq)]
pub struct HyperLogLog {
    registers: Vec<u8>,
}

impl std::fmt::Debug for HyperLogLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperLogLog")
            .field("estimate", &self.count())
            .finish()
    }
}

impl Default for HyperLogLog {
    fn default() -> Self {
        Self::new()
    }
}

fn hash(element: &str) -> u64 {
    let digest = md5::compute(element.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.0[..8]);
    u64::from_be_bytes(head)
}

impl HyperLogLog {
    pub fn new() -> Self {
        Self {
            registers: vec![0; REGISTERS],
        }
    }

    /// Restore from [`HyperLogLog::as_bytes`]; `None` if the length is wrong.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == REGISTERS).then(|| Self {
            registers: bytes.to_vec(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.registers
    }

    /// Insert `element`, returning true if the estimator changed.
    pub fn add(&mut self, element: &str) -> bool {
        let hash = hash(element);
        let index = (hash >> HASH_BITS) as usize;
        // Sentinel bit caps the run length at HASH_BITS + 1.
        let remaining = (hash << P) | (1 << (P - 1));
        let rank = remaining.leading_zeros() as u8 + 1;
        if rank > self.registers[index] {
            self.registers[index] = rank;
            true
        } else {
            false
        }
    }

    /// Estimated number of distinct elements added.
    pub fn count(&self) -> u64 {
        let mut sum = 0.0_f64;
        let mut zeros = 0u32;
        for &reg in &self.registers {
            sum += f64::exp2(-f64::from(reg));
            if reg == 0 {
                zeros += 1;
            }
        }

        let m = REGISTERS as f64;
        let raw = ALPHA_M * m * m / sum;
        if raw <= 2.5 * m && zeros > 0 {
            // Linear counting for the small range.
            return (m * (m / f64::from(zeros)).ln()).round() as u64;
        }
        raw.round() as u64
    }
}
