//! Bulk block transfer between cache buffers.
//!
//! Copies whole blocks between a device-resident buffer and a host
//! buffer (either direction), or between two buffers on the same
//! device. Copies are enqueued in mapping order on the device-side
//! stream; the call returns before any byte moves, so the caller must
//! synchronize the device before reading the destination. The mapping
//! table itself is a host slice: addresses are computed on the
//! invoking thread.

use std::sync::Arc;

use tracing::debug;

use crate::block::buffer::{CacheBuffer, Location};
use crate::block::{debug_assert_unique_destinations, BlockIndex};
use crate::error::EngineError;

/// Copies `block_bytes` of the source (element size times elements per
/// block) from each mapped source block into the mapped destination
/// block. Mutates the destination only.
///
/// Duplicate destinations in one mapping are last-write-wins with
/// unspecified order; debug builds assert uniqueness.
pub fn transfer_blocks(
    source: &CacheBuffer,
    destination: &CacheBuffer,
    block_mapping: &[(BlockIndex, BlockIndex)],
) -> Result<(), EngineError> {
    let (device, direction) = match (source.location(), destination.location()) {
        (Location::Device(src), Location::Device(dst)) => {
            if src != dst {
                return Err(EngineError::DeviceMismatch {
                    src: src.id(),
                    dst: dst.id(),
                });
            }
            (src, "d2d")
        }
        (Location::Device(src), Location::Host) => (src, "d2h"),
        (Location::Host, Location::Device(dst)) => (dst, "h2d"),
        (Location::Host, Location::Host) => return Err(EngineError::NoDeviceSide),
    };

    let block_bytes = source.block_bytes();
    if destination.block_bytes() < block_bytes {
        return Err(EngineError::ShapeMismatch {
            context: "destination blocks are smaller than source blocks",
            left: source.shape().to_vec(),
            right: destination.shape().to_vec(),
        });
    }
    for &(src, dst) in block_mapping {
        if (src as usize) >= source.num_blocks() {
            return Err(EngineError::BlockOutOfRange {
                index: src,
                num_blocks: source.num_blocks(),
            });
        }
        if (dst as usize) >= destination.num_blocks() {
            return Err(EngineError::BlockOutOfRange {
                index: dst,
                num_blocks: destination.num_blocks(),
            });
        }
    }
    debug_assert_unique_destinations(block_mapping);

    let dst_stride = destination.block_bytes();
    for &(src, dst) in block_mapping {
        let src_start = src as usize * block_bytes;
        let dst_start = dst as usize * dst_stride;
        let src_storage = Arc::clone(source.storage());
        let dst_storage = Arc::clone(destination.storage());
        device.stream().enqueue(move || {
            if Arc::ptr_eq(&src_storage, &dst_storage) {
                // Same storage on both sides: an in-buffer move.
                dst_storage.with_mut(|bytes| {
                    bytes.copy_within(src_start..src_start + block_bytes, dst_start)
                });
            } else {
                src_storage.with(|src_bytes| {
                    dst_storage.with_mut(|dst_bytes| {
                        dst_bytes[dst_start..dst_start + block_bytes]
                            .copy_from_slice(&src_bytes[src_start..src_start + block_bytes]);
                    })
                });
            }
            Ok(())
        });
    }

    device.record_op(block_mapping.len() * block_bytes);
    debug!(
        direction,
        pairs = block_mapping.len(),
        block_bytes,
        "enqueued block transfer"
    );
    Ok(())
}
