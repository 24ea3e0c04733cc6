//! Block-structured cache storage.
//!
//! - [`dtype`]: element-type vocabulary and scalar dispatch helpers
//! - [`fp8`]: software FP8 E4M3 encode/decode
//! - [`layout`]: split and flat cache geometry and address arithmetic
//! - [`buffer`]: externally owned cache buffer handles

pub mod buffer;
pub mod dtype;
pub mod fp8;
pub mod layout;

/// Index of a physical block within a cache buffer.
pub type BlockIndex = u32;

/// Per-token destination slot, `block_index * block_size + offset`.
/// Negative entries mean "discard this token" and are skipped without
/// error.
pub type SlotIndex = i64;

/// Debug-only check that a mapping never names one destination twice.
/// Duplicate destinations are last-write-wins with unspecified order.
pub(crate) fn debug_assert_unique_destinations(_mapping: &[(BlockIndex, BlockIndex)]) {
    #[cfg(debug_assertions)]
    {
        let mut seen = std::collections::HashSet::with_capacity(_mapping.len());
        for &(_, dst) in _mapping {
            debug_assert!(seen.insert(dst), "duplicate destination block {dst} in mapping");
        }
    }
}
