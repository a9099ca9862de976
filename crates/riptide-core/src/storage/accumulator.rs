//! Per-key accumulation over serialized values.

use super::Codec;

/// Combines serialized values of equal keys during insertion and merge.
///
/// The storage layer applies `combine` pairwise in insertion order: first to
/// the existing slot value and each newly inserted value, and again when
/// equal keys meet at the merge frontier of a spilled sort. A
/// non-associative combine function is therefore applied in a defined order,
/// but producing a meaningful result from one is the caller's contract.
pub trait Accumulator: Send + Sync {
    /// Combines `existing` and `incoming` into `out`.
    ///
    /// `out` is cleared by the caller before the call.
    fn combine(&self, existing: &[u8], incoming: &[u8], out: &mut Vec<u8>);
}

/// Sums 64-bit integer values.
///
/// Values are 8-byte integers in the owning store's configured endianness.
#[derive(Debug, Clone, Copy)]
pub struct IntSumAccumulator {
    codec: Codec,
}

impl IntSumAccumulator {
    /// Creates a summing accumulator matching the store's endianness.
    #[must_use]
    pub fn new(use_big_endian: bool) -> Self {
        Self {
            codec: Codec::new(use_big_endian),
        }
    }

    /// Encodes a value the way this accumulator expects it.
    #[must_use]
    pub fn encode(&self, value: i64) -> [u8; 8] {
        let mut out = [0u8; 8];
        self.codec.write_i64(&mut out, value);
        out
    }

    /// Decodes a value produced by this accumulator.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> i64 {
        self.codec.read_i64(bytes)
    }
}

impl Accumulator for IntSumAccumulator {
    fn combine(&self, existing: &[u8], incoming: &[u8], out: &mut Vec<u8>) {
        let sum = self
            .codec
            .read_i64(existing)
            .wrapping_add(self.codec.read_i64(incoming));
        let mut buf = [0u8; 8];
        self.codec.write_i64(&mut buf, sum);
        out.extend_from_slice(&buf);
    }
}
