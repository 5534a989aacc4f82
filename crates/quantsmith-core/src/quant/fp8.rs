//! 8-bit float encoding and decoding.
//!
//! `E4M3Fn` has no infinities and a single NaN mantissa pattern; `E5M2`
//! follows IEEE-754 conventions. Encoding rounds to nearest, ties to even,
//! and saturates finite values to the largest representable magnitude.

use crate::types::LowBitFormat;

struct Layout {
    man_bits: u32,
    bias: i32,
    /// Largest finite bit pattern, sign excluded.
    max_bits: u8,
    /// NaN bit pattern, sign excluded.
    nan_bits: u8,
}

const E4M3FN: Layout = Layout {
    man_bits: 3,
    bias: 7,
    max_bits: 0x7E,
    nan_bits: 0x7F,
};

const E5M2: Layout = Layout {
    man_bits: 2,
    bias: 15,
    max_bits: 0x7B,
    nan_bits: 0x7E,
};

fn layout(format: LowBitFormat) -> &'static Layout {
    match format {
        LowBitFormat::E4m3Fn => &E4M3FN,
        LowBitFormat::E5m2 => &E5M2,
    }
}

/// Largest finite magnitude of a format.
pub fn max_finite(format: LowBitFormat) -> f32 {
    decode(layout(format).max_bits, format)
}

/// Encode one value.
pub fn encode(value: f32, format: LowBitFormat) -> u8 {
    let l = layout(format);
    let sign: u8 = if value.is_sign_negative() { 0x80 } else { 0 };
    if value.is_nan() {
        return sign | l.nan_bits;
    }

    let a = f64::from(value.abs());
    if a == 0.0 {
        return sign;
    }
    if a >= f64::from(decode(l.max_bits, format)) {
        return sign | l.max_bits;
    }

    let implicit = 1u32 << l.man_bits;
    let min_normal_exp = 1 - l.bias;
    let exp = a.log2().floor() as i32;

    let bits = if exp < min_normal_exp {
        // Subnormal: mantissa counts quanta of the smallest subnormal step. A
        // result of `implicit` is exactly the smallest normal's bit pattern.
        let quantum = 2f64.powi(min_normal_exp - l.man_bits as i32);
        (a / quantum).round_ties_even() as u32
    } else {
        let quantum = 2f64.powi(exp - l.man_bits as i32);
        let mut m = (a / quantum).round_ties_even() as u32;
        let mut e = exp;
        if m >= implicit << 1 {
            m = implicit;
            e += 1;
        }
        (((e + l.bias) as u32) << l.man_bits) | (m - implicit)
    };

    let bits = (bits as u8).min(l.max_bits);
    sign | bits
}

/// Decode one value.
pub fn decode(byte: u8, format: LowBitFormat) -> f32 {
    let l = layout(format);
    let negative = byte & 0x80 != 0;
    let bits = byte & 0x7F;
    let exp_field = i32::from(bits >> l.man_bits);
    let man = u32::from(bits) & ((1 << l.man_bits) - 1);

    let magnitude = match format {
        LowBitFormat::E4m3Fn if bits == l.nan_bits => f32::NAN,
        LowBitFormat::E5m2 if exp_field == 0x1F => {
            if man == 0 {
                f32::INFINITY
            } else {
                f32::NAN
            }
        }
        _ if exp_field == 0 => {
            (f64::from(man) * 2f64.powi(1 - l.bias - l.man_bits as i32)) as f32
        }
        _ => {
            let frac = 1.0 + f64::from(man) / f64::from(1u32 << l.man_bits);
            (frac * 2f64.powi(exp_field - l.bias)) as f32
        }
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}
