//! Precision conversion between cache buffers.
//!
//! Re-encodes every element of a block-structured source buffer into a
//! destination buffer of a different numeric width, using one scale
//! factor shared across the whole call. Passthrough is a
//! bit-reinterpretation between a wide float buffer and an opaque-byte
//! buffer of equal total width (implicit scale 1, exactly invertible);
//! ScaledFp8 is the lossy E4M3 encoding, invertible only
//! approximately. Writes every destination element and touches nothing
//! outside the declared buffers.

use std::sync::Arc;

use tracing::debug;

use crate::block::buffer::CacheBuffer;
use crate::block::dtype::{float_reader, float_writer, DType, Encoding, ReadScalar, WriteScalar};
use crate::block::fp8;
use crate::engine::common_device;
use crate::error::EngineError;

/// Conversion kernel resolved once at the API boundary.
enum ConvertKernel {
    /// Bit-for-bit copy between equal-width buffers.
    Bitcopy,
    /// Wide float elements narrowed to FP8 E4M3 bytes.
    Narrow { read: ReadScalar },
    /// FP8 E4M3 bytes widened back to float elements.
    Widen { write: WriteScalar },
}

/// Re-encodes `source` into `destination` under `encoding`. Both
/// buffers must be device-resident on one device with matching block
/// structure.
pub fn convert_precision(
    destination: &CacheBuffer,
    source: &CacheBuffer,
    scale: f32,
    encoding: Encoding,
) -> Result<(), EngineError> {
    let device = common_device(&[destination, source], "precision conversion")?;
    if destination.num_blocks() != source.num_blocks() {
        return Err(EngineError::ShapeMismatch {
            context: "source and destination block counts",
            left: source.shape().to_vec(),
            right: destination.shape().to_vec(),
        });
    }

    let kernel = match encoding {
        Encoding::Passthrough => {
            let wide_byte_pair = (source.dtype().is_float() && destination.dtype() == DType::U8)
                || (source.dtype() == DType::U8 && destination.dtype().is_float());
            if !wide_byte_pair {
                return Err(EngineError::UnsupportedConversion {
                    src: source.dtype(),
                    dst: destination.dtype(),
                    encoding,
                });
            }
            if destination.block_bytes() != source.block_bytes() {
                return Err(EngineError::ShapeMismatch {
                    context: "passthrough requires equal per-block widths",
                    left: source.shape().to_vec(),
                    right: destination.shape().to_vec(),
                });
            }
            ConvertKernel::Bitcopy
        }
        Encoding::ScaledFp8 => {
            if !(scale > 0.0) {
                return Err(EngineError::NonPositiveScale { scale });
            }
            if destination.elems_per_block() != source.elems_per_block() {
                return Err(EngineError::ShapeMismatch {
                    context: "scaled conversion requires equal per-block element counts",
                    left: source.shape().to_vec(),
                    right: destination.shape().to_vec(),
                });
            }
            match (source.dtype(), destination.dtype()) {
                (src, DType::U8) => match float_reader(src) {
                    Some(read) => ConvertKernel::Narrow { read },
                    None => {
                        return Err(EngineError::UnsupportedConversion {
                            src,
                            dst: DType::U8,
                            encoding,
                        })
                    }
                },
                (DType::U8, dst) => match float_writer(dst) {
                    Some(write) => ConvertKernel::Widen { write },
                    None => {
                        return Err(EngineError::UnsupportedConversion {
                            src: DType::U8,
                            dst,
                            encoding,
                        })
                    }
                },
                (src, dst) => {
                    return Err(EngineError::UnsupportedConversion { src, dst, encoding })
                }
            }
        }
    };

    let elems = source.num_elems();
    let src_storage = Arc::clone(source.storage());
    let dst_storage = Arc::clone(destination.storage());

    device.record_op(source.len_bytes().max(destination.len_bytes()));
    debug!(?encoding, elems, "enqueued precision conversion");

    device.stream().enqueue(move || {
        src_storage.with(|src| {
            dst_storage.with_mut(|dst| match kernel {
                ConvertKernel::Bitcopy => dst.copy_from_slice(src),
                ConvertKernel::Narrow { read } => {
                    for i in 0..elems {
                        dst[i] = fp8::quantize(read(src, i), scale);
                    }
                }
                ConvertKernel::Widen { write } => {
                    for i in 0..elems {
                        write(dst, i, fp8::dequantize(src[i], scale));
                    }
                }
            })
        });
        Ok(())
    });
    Ok(())
}
