//! Copy-on-write block replication.
//!
//! After two sequences diverge from a shared block, the scheduler
//! issues one replication call to materialize an independent physical
//! copy. The same (src, dst) block mapping is applied in place to
//! every layer's key and value cache, independently for key and value.
//! Targets are disjoint by contract, so units indexed by
//! (layer, pair, element) carry no cross-unit ordering dependency.

use std::sync::Arc;

use bytemuck::Pod;
use half::{bf16, f16};
use tracing::debug;

use crate::block::buffer::{CacheBuffer, Location, Storage};
use crate::block::dtype::DType;
use crate::block::{debug_assert_unique_destinations, BlockIndex};
use crate::error::EngineError;
use crate::exec::device::Device;

/// Copies every element of block `src` into block `dst` for each
/// mapping pair, in every layer's key and value cache. Empty layer
/// lists and empty mappings are no-op successes.
pub fn replicate_blocks(
    key_layers: &[CacheBuffer],
    value_layers: &[CacheBuffer],
    block_mapping: &[(BlockIndex, BlockIndex)],
) -> Result<(), EngineError> {
    if key_layers.len() != value_layers.len() {
        return Err(EngineError::LayerCountMismatch {
            keys: key_layers.len(),
            values: value_layers.len(),
        });
    }
    if key_layers.is_empty() || block_mapping.is_empty() {
        return Ok(());
    }

    let device = match key_layers[0].location() {
        Location::Device(d) => d.clone(),
        Location::Host => {
            return Err(EngineError::DeviceOnly {
                op: "block replication",
            })
        }
    };
    check_layer_set(key_layers, "key layers", &device)?;
    check_layer_set(value_layers, "value layers", &device)?;
    if key_layers[0].dtype() != value_layers[0].dtype() {
        return Err(EngineError::DtypeMismatch {
            context: "key and value caches",
            left: key_layers[0].dtype(),
            right: value_layers[0].dtype(),
        });
    }

    let num_blocks = key_layers[0].num_blocks();
    if value_layers[0].num_blocks() != num_blocks {
        return Err(EngineError::ShapeMismatch {
            context: "key and value caches have different block counts",
            left: key_layers[0].shape().to_vec(),
            right: value_layers[0].shape().to_vec(),
        });
    }
    for &(src, dst) in block_mapping {
        for index in [src, dst] {
            if (index as usize) >= num_blocks {
                return Err(EngineError::BlockOutOfRange { index, num_blocks });
            }
        }
    }
    debug_assert_unique_destinations(block_mapping);

    // Per-layer indirection table: base storage handles, built once
    // per call and moved into a single kernel.
    let key_bases: Vec<Arc<Storage>> = key_layers
        .iter()
        .map(|layer| Arc::clone(layer.storage()))
        .collect();
    let value_bases: Vec<Arc<Storage>> = value_layers
        .iter()
        .map(|layer| Arc::clone(layer.storage()))
        .collect();
    let dtype = key_layers[0].dtype();
    let key_epb = key_layers[0].elems_per_block();
    let value_epb = value_layers[0].elems_per_block();
    let pairs: Vec<(BlockIndex, BlockIndex)> = block_mapping.to_vec();

    device.record_op(
        key_layers.len()
            * pairs.len()
            * (key_layers[0].block_bytes() + value_layers[0].block_bytes()),
    );
    debug!(
        layers = key_layers.len(),
        pairs = pairs.len(),
        "enqueued block replication"
    );

    device.stream().enqueue(move || {
        for (key_base, value_base) in key_bases.iter().zip(value_bases.iter()) {
            for &(src, dst) in &pairs {
                copy_block(key_base, dtype, key_epb, src as usize, dst as usize);
                copy_block(value_base, dtype, value_epb, src as usize, dst as usize);
            }
        }
        Ok(())
    });
    Ok(())
}

fn check_layer_set(
    layers: &[CacheBuffer],
    what: &'static str,
    device: &Device,
) -> Result<(), EngineError> {
    let first = &layers[0];
    for layer in layers {
        match layer.location() {
            Location::Device(d) if d == device => {}
            Location::Device(d) => {
                return Err(EngineError::DeviceMismatch {
                    src: device.id(),
                    dst: d.id(),
                })
            }
            Location::Host => {
                return Err(EngineError::DeviceOnly {
                    op: "block replication",
                })
            }
        }
        if layer.shape() != first.shape() {
            return Err(EngineError::ShapeMismatch {
                context: what,
                left: first.shape().to_vec(),
                right: layer.shape().to_vec(),
            });
        }
        if layer.dtype() != first.dtype() {
            return Err(EngineError::DtypeMismatch {
                context: what,
                left: first.dtype(),
                right: layer.dtype(),
            });
        }
    }
    Ok(())
}

/// Plain-assignment copy of one block within a layer's storage,
/// dispatched over the supported element types. No conversion.
fn copy_block(storage: &Storage, dtype: DType, elems_per_block: usize, src: usize, dst: usize) {
    match dtype {
        DType::F32 => copy_typed::<f32>(storage, elems_per_block, src, dst),
        DType::F16 => copy_typed::<f16>(storage, elems_per_block, src, dst),
        DType::Bf16 => copy_typed::<bf16>(storage, elems_per_block, src, dst),
        DType::U8 => copy_typed::<u8>(storage, elems_per_block, src, dst),
    }
}

fn copy_typed<T: Pod>(storage: &Storage, elems_per_block: usize, src: usize, dst: usize) {
    storage.with_mut(|bytes| {
        let elems: &mut [T] = bytemuck::cast_slice_mut(bytes);
        elems.copy_within(
            src * elems_per_block..(src + 1) * elems_per_block,
            dst * elems_per_block,
        );
    });
}
