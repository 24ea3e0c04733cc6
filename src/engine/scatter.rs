//! Token scatter into block-major cache layouts.
//!
//! Converts newly produced token-major key/value vectors (shape
//! `[tokens, heads, head_size]`) into the physical cache layout, one
//! unit per token with sub-parallel channel writes. Tokens whose slot
//! entry is negative are discarded without error, so batched calls
//! over padded sequences need no filtering. Duplicate valid slots are
//! last-write-wins with unspecified order.

use std::sync::Arc;

use tracing::debug;

use crate::block::buffer::CacheBuffer;
use crate::block::dtype::{float_reader, CacheFormat, DType, ReadScalar};
use crate::block::fp8;
use crate::block::layout::{FlatLayout, SplitLayout};
use crate::block::SlotIndex;
use crate::engine::common_device;
use crate::error::EngineError;

/// Store path resolved once at the API boundary; kernels never
/// re-dispatch on dtype.
#[derive(Clone, Copy)]
enum StorePath {
    /// Same-dtype elementwise copy.
    Direct { width: usize },
    /// Per-scalar FP8 E4M3 quantization through the conversion
    /// formula, with the caller's scale.
    Quantize { read: ReadScalar, scale: f32 },
}

/// Scatters token vectors into split-layout caches, quantizing each
/// scalar when the cache dtype differs from the input dtype under the
/// `Fp8` cache format.
pub fn scatter_split(
    keys: &CacheBuffer,
    values: &CacheBuffer,
    key_cache: &CacheBuffer,
    value_cache: &CacheBuffer,
    slot_mapping: &[SlotIndex],
    cache_format: CacheFormat,
    scale: f32,
) -> Result<(), EngineError> {
    let layout = SplitLayout::from_shapes(key_cache.shape(), value_cache.shape())?;
    let device = common_device(&[keys, values, key_cache, value_cache], "cache scatter")?;
    check_token_inputs(keys, values, layout.heads, layout.head_size, slot_mapping)?;
    check_slots(slot_mapping, layout.num_slots())?;
    let path = resolve_store_path(
        keys.dtype(),
        key_cache.dtype(),
        value_cache.dtype(),
        cache_format,
        scale,
    )?;

    let channels = layout.channels();
    let slots: Vec<SlotIndex> = slot_mapping.to_vec();
    let k_src = Arc::clone(keys.storage());
    let v_src = Arc::clone(values.storage());
    let k_dst = Arc::clone(key_cache.storage());
    let v_dst = Arc::clone(value_cache.storage());

    let live = slots.iter().filter(|&&slot| slot >= 0).count();
    device.record_op(live * channels * keys.dtype().size() * 2);
    debug!(
        tokens = slots.len(),
        live, channels, "enqueued split-layout scatter"
    );

    device.stream().enqueue(move || {
        k_src.with(|ks| {
            v_src.with(|vs| {
                k_dst.with_mut(|kc| {
                    v_dst.with_mut(|vc| {
                        for (token, &slot) in slots.iter().enumerate() {
                            if slot < 0 {
                                continue;
                            }
                            let slot = slot as usize;
                            for i in 0..channels {
                                let src = token * channels + i;
                                store(path, ks, kc, src, layout.key_offset(slot, i));
                                store(path, vs, vc, src, layout.value_offset(slot, i));
                            }
                        }
                    })
                })
            })
        });
        Ok(())
    });
    Ok(())
}

/// Scatters token vectors into flat-layout caches. The flat path never
/// quantizes; requesting the `Fp8` cache format is an unsupported
/// operation, not a silent fallback to direct copy.
pub fn scatter_flat(
    keys: &CacheBuffer,
    values: &CacheBuffer,
    key_cache: &CacheBuffer,
    value_cache: &CacheBuffer,
    slot_mapping: &[SlotIndex],
    cache_format: CacheFormat,
) -> Result<(), EngineError> {
    let layout = FlatLayout::from_shapes(key_cache.shape(), value_cache.shape())?;
    let device = common_device(&[keys, values, key_cache, value_cache], "cache scatter")?;
    check_token_inputs(keys, values, layout.heads, layout.head_size, slot_mapping)?;
    check_slots(slot_mapping, layout.num_slots())?;
    if cache_format == CacheFormat::Fp8 {
        return Err(EngineError::FlatLayoutQuantization);
    }
    let path = resolve_store_path(
        keys.dtype(),
        key_cache.dtype(),
        value_cache.dtype(),
        CacheFormat::Native,
        1.0,
    )?;

    let channels = layout.channels();
    let slots: Vec<SlotIndex> = slot_mapping.to_vec();
    let k_src = Arc::clone(keys.storage());
    let v_src = Arc::clone(values.storage());
    let k_dst = Arc::clone(key_cache.storage());
    let v_dst = Arc::clone(value_cache.storage());

    let live = slots.iter().filter(|&&slot| slot >= 0).count();
    device.record_op(live * channels * keys.dtype().size() * 2);
    debug!(
        tokens = slots.len(),
        live, channels, "enqueued flat-layout scatter"
    );

    device.stream().enqueue(move || {
        k_src.with(|ks| {
            v_src.with(|vs| {
                k_dst.with_mut(|kc| {
                    v_dst.with_mut(|vc| {
                        for (token, &slot) in slots.iter().enumerate() {
                            if slot < 0 {
                                continue;
                            }
                            let slot = slot as usize;
                            for i in 0..channels {
                                let src = token * channels + i;
                                let off = layout.offset(slot, i);
                                store(path, ks, kc, src, off);
                                store(path, vs, vc, src, off);
                            }
                        }
                    })
                })
            })
        });
        Ok(())
    });
    Ok(())
}

#[inline]
fn store(path: StorePath, src: &[u8], dst: &mut [u8], src_idx: usize, dst_idx: usize) {
    match path {
        StorePath::Direct { width } => {
            dst[dst_idx * width..(dst_idx + 1) * width]
                .copy_from_slice(&src[src_idx * width..(src_idx + 1) * width]);
        }
        StorePath::Quantize { read, scale } => {
            dst[dst_idx] = fp8::quantize(read(src, src_idx), scale);
        }
    }
}

fn resolve_store_path(
    input: DType,
    key_cache: DType,
    value_cache: DType,
    format: CacheFormat,
    scale: f32,
) -> Result<StorePath, EngineError> {
    if key_cache != value_cache {
        return Err(EngineError::DtypeMismatch {
            context: "key and value caches",
            left: key_cache,
            right: value_cache,
        });
    }
    // Equal dtypes are a direct copy under either format tag; the
    // quantizing path only exists for wide inputs landing in a byte
    // cache under the Fp8 tag.
    if input == key_cache {
        return Ok(StorePath::Direct {
            width: input.size(),
        });
    }
    match format {
        CacheFormat::Fp8 if key_cache == DType::U8 => {
            let read = float_reader(input).ok_or(EngineError::UnsupportedScatter {
                input,
                cache: key_cache,
                format,
            })?;
            if !(scale > 0.0) {
                return Err(EngineError::NonPositiveScale { scale });
            }
            Ok(StorePath::Quantize { read, scale })
        }
        _ => Err(EngineError::UnsupportedScatter {
            input,
            cache: key_cache,
            format,
        }),
    }
}

fn check_token_inputs(
    keys: &CacheBuffer,
    values: &CacheBuffer,
    heads: usize,
    head_size: usize,
    slot_mapping: &[SlotIndex],
) -> Result<(), EngineError> {
    if keys.shape() != values.shape() {
        return Err(EngineError::ShapeMismatch {
            context: "key and value token buffers",
            left: keys.shape().to_vec(),
            right: values.shape().to_vec(),
        });
    }
    if keys.dtype() != values.dtype() {
        return Err(EngineError::DtypeMismatch {
            context: "key and value token buffers",
            left: keys.dtype(),
            right: values.dtype(),
        });
    }
    let shape = keys.shape();
    if shape.len() != 3 || shape[1] != heads || shape[2] != head_size {
        return Err(EngineError::ShapeMismatch {
            context: "token buffers must be [tokens, heads, head_size] matching the cache",
            left: shape.to_vec(),
            right: vec![slot_mapping.len(), heads, head_size],
        });
    }
    if shape[0] != slot_mapping.len() {
        return Err(EngineError::TokenCountMismatch {
            tokens: shape[0],
            slots: slot_mapping.len(),
        });
    }
    Ok(())
}

fn check_slots(slot_mapping: &[SlotIndex], num_slots: usize) -> Result<(), EngineError> {
    for &slot in slot_mapping {
        if slot >= 0 && slot as usize >= num_slots {
            return Err(EngineError::SlotOutOfRange { slot, num_slots });
        }
    }
    Ok(())
}
