//! Software FP8 E4M3 encode/decode.
//!
//! The "fn" variant: 4 exponent bits (bias 7), 3 mantissa bits, no
//! infinities; `S.1111.111` encodes NaN and the largest finite
//! magnitude is 448. Encoding rounds to nearest, ties to even, and
//! saturates out-of-range magnitudes to the largest finite value, the
//! same contract as the device intrinsics.
//!
//! Both the cache scatter engine (quantized split-layout writes) and
//! the precision conversion engine go through the scaled formulas
//! here: store `e4m3(x / scale)`, load `scale * f32(e4m3)`.

/// Largest finite E4M3 magnitude.
pub const MAX: f32 = 448.0;

/// NaN bit pattern (positive sign).
pub const NAN: u8 = 0x7f;

const EXP_BIAS: i32 = 7;
/// Normal numbers start at 2^-6; below that the encoding is subnormal
/// with a fixed 2^-9 quantum.
const MIN_NORMAL: f32 = 0.015625;
const SUBNORMAL_SCALE: f32 = 512.0;

/// Encodes an f32 into E4M3 bits, round-to-nearest-even, saturating.
pub fn from_f32(x: f32) -> u8 {
    let bits = x.to_bits();
    let sign = ((bits >> 24) & 0x80) as u8;
    if x.is_nan() {
        return sign | NAN;
    }
    let mag = f32::from_bits(bits & 0x7fff_ffff);
    if mag >= MAX {
        return sign | 0x7e;
    }
    if mag < MIN_NORMAL {
        // Subnormal: magnitude is a whole number of 2^-9 quanta. A
        // result of 8 lands exactly on the smallest normal encoding.
        let quanta = (mag * SUBNORMAL_SCALE).round_ties_even() as u32;
        return sign | quanta as u8;
    }
    // Normal: exponent is in [-6, 8], take the top three mantissa bits
    // with round-to-nearest-even. Saturation above caps the rounded
    // result at 0x7e, so the NaN pattern is unreachable here.
    let exp = ((bits >> 23) & 0xff) as i32 - 127;
    let mant = bits & 0x7f_ffff;
    let mut code = (((exp + EXP_BIAS) as u32) << 3) | (mant >> 20);
    let round_bit = (mant >> 19) & 1;
    let sticky = mant & 0x7_ffff;
    if round_bit == 1 && (sticky != 0 || (code & 1) == 1) {
        code += 1;
    }
    sign | code as u8
}

/// Decodes E4M3 bits into f32. Exact for every code point.
pub fn to_f32(bits: u8) -> f32 {
    let sign = if bits & 0x80 != 0 { -1.0f32 } else { 1.0f32 };
    let exp = ((bits >> 3) & 0x0f) as i32;
    let mant = (bits & 0x07) as f32;
    if exp == 0x0f && (bits & 0x07) == 0x07 {
        return f32::NAN;
    }
    let mag = if exp == 0 {
        mant / SUBNORMAL_SCALE
    } else {
        (1.0 + mant / 8.0) * ((exp - EXP_BIAS) as f32).exp2()
    };
    sign * mag
}

/// Quantizes through a symmetric scale: `e4m3(x / scale)`.
#[inline]
pub fn quantize(x: f32, scale: f32) -> u8 {
    from_f32(x / scale)
}

/// Dequantizes through a symmetric scale: `scale * f32(e4m3)`.
#[inline]
pub fn dequantize(bits: u8, scale: f32) -> f32 {
    scale * to_f32(bits)
}
