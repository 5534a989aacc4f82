//! Catalog of known quantization targets.

use serde::{Deserialize, Serialize};

use crate::types::TargetFamily;

/// A quantization target the pipeline knows how to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantOption {
    /// Target name (e.g. "Q4_K_M", "FP8_E4M3")
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Approximate bits per weight
    pub bits_per_weight: f32,
    /// Whether this is a recommended default option
    pub recommended: bool,
    pub family: TargetFamily,
}

fn block(name: &str, description: &str, bits_per_weight: f32, recommended: bool) -> QuantOption {
    QuantOption {
        name: name.into(),
        description: description.into(),
        bits_per_weight,
        recommended,
        family: TargetFamily::BlockQuant,
    }
}

/// Full catalog, block-quant levels first.
pub fn quant_options() -> Vec<QuantOption> {
    vec![
        // Lossless / base types (copies of the converted source)
        block("F16", "Half-precision float 16-bit (no quality loss)", 16.0, false),
        block("BF16", "Brain float 16-bit (no quality loss)", 16.0, false),
        // Legacy quants
        block("Q4_0", "4-bit legacy quant", 4.55, false),
        block("Q5_0", "5-bit legacy quant", 5.54, false),
        block("Q8_0", "8-bit (near-lossless)", 8.50, false),
        // K-quants
        block("Q2_K", "2-bit K-quant (smallest, lowest quality)", 3.35, false),
        block("Q3_K_S", "3-bit K-quant small", 3.50, false),
        block("Q3_K_M", "3-bit K-quant medium", 3.91, false),
        block("Q3_K_L", "3-bit K-quant large", 4.27, false),
        block("Q4_K_S", "4-bit K-quant small", 4.58, false),
        block("Q4_K_M", "4-bit K-quant medium, best balance of size and quality", 4.85, true),
        block("Q5_K_S", "5-bit K-quant small", 5.54, false),
        block("Q5_K_M", "5-bit K-quant medium", 5.69, false),
        block("Q6_K", "6-bit K-quant (high quality, larger)", 6.56, false),
        // I-quants
        block("IQ2_XS", "2-bit importance quant extra-small", 2.31, false),
        block("IQ2_S", "2-bit importance quant small", 2.50, false),
        block("IQ3_XXS", "3-bit importance quant extra-extra-small", 3.06, false),
        block("IQ3_S", "3-bit importance quant small", 3.44, false),
        block("IQ3_M", "3-bit importance quant medium", 3.66, false),
        block("IQ4_NL", "4-bit non-linear importance quant", 4.50, false),
        block("IQ4_XS", "4-bit importance quant extra-small", 4.25, false),
        // Low-bit floats (in-process)
        QuantOption {
            name: "FP8_E4M3".into(),
            description: "8-bit float, 4 exponent / 3 mantissa bits (safetensors)".into(),
            bits_per_weight: 8.0,
            recommended: true,
            family: TargetFamily::LowBitFloat,
        },
        QuantOption {
            name: "FP8_E5M2".into(),
            description: "8-bit float, 5 exponent / 2 mantissa bits, wider range (safetensors)"
                .into(),
            bits_per_weight: 8.0,
            recommended: false,
            family: TargetFamily::LowBitFloat,
        },
    ]
}

/// Look up a catalog entry by name (case-insensitive).
pub fn find_option(name: &str) -> Option<QuantOption> {
    quant_options()
        .into_iter()
        .find(|o| o.name.eq_ignore_ascii_case(name))
}
