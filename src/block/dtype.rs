//! Element types stored in cache buffers.
//!
//! The vocabulary is closed: three wide floating representations plus
//! one opaque byte type for already-quantized storage. Engines resolve
//! (dtype, format, encoding) combinations into concrete store/convert
//! paths once at the API boundary; the helpers here supply the typed
//! scalar accessors those paths are built from.

use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// Numeric representation of a single cache element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit IEEE float.
    F32,
    /// 16-bit IEEE float.
    F16,
    /// 16-bit brain float (f32 exponent range, truncated mantissa).
    Bf16,
    /// Opaque byte, used for already-quantized (FP8) storage.
    U8,
}

impl DType {
    /// Element width in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::Bf16 => 2,
            DType::U8 => 1,
        }
    }

    /// Whether this is one of the wide floating representations.
    pub fn is_float(&self) -> bool {
        !matches!(self, DType::U8)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::Bf16 => write!(f, "bf16"),
            DType::U8 => write!(f, "u8"),
        }
    }
}

/// Interpretation of cache storage when token vectors are scattered
/// into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheFormat {
    /// Cache elements share the incoming vectors' dtype; direct copy.
    Native,
    /// Cache stores FP8 E4M3 bits; wide inputs are quantized on write.
    Fp8,
}

/// Re-encoding applied by the precision conversion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// Bit-for-bit copy between equal-width buffers, implicit scale 1.
    Passthrough,
    /// Scaled FP8 E4M3 narrowing, or the widening back.
    ScaledFp8,
}

/// Reads element `i` of a raw byte buffer as f32.
pub(crate) type ReadScalar = fn(&[u8], usize) -> f32;

/// Writes f32 `v` into element `i` of a raw byte buffer.
pub(crate) type WriteScalar = fn(&mut [u8], usize, f32);

/// Scalar reader for a wide floating dtype; `None` for `U8`.
pub(crate) fn float_reader(dtype: DType) -> Option<ReadScalar> {
    match dtype {
        DType::F32 => Some(|b, i| bytemuck::cast_slice::<u8, f32>(b)[i]),
        DType::F16 => Some(|b, i| bytemuck::cast_slice::<u8, f16>(b)[i].to_f32()),
        DType::Bf16 => Some(|b, i| bytemuck::cast_slice::<u8, bf16>(b)[i].to_f32()),
        DType::U8 => None,
    }
}

/// Scalar writer for a wide floating dtype; `None` for `U8`.
pub(crate) fn float_writer(dtype: DType) -> Option<WriteScalar> {
    match dtype {
        DType::F32 => Some(|b, i, v| bytemuck::cast_slice_mut::<u8, f32>(b)[i] = v),
        DType::F16 => Some(|b, i, v| bytemuck::cast_slice_mut::<u8, f16>(b)[i] = f16::from_f32(v)),
        DType::Bf16 => {
            Some(|b, i, v| bytemuck::cast_slice_mut::<u8, bf16>(b)[i] = bf16::from_f32(v))
        }
        DType::U8 => None,
    }
}
