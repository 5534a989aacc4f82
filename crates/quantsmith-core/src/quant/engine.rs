//! In-process low-bit float quantization of a tensor collection.
//!
//! Per floating-point tensor, in order:
//! 1. outside the subnetwork prefix (restricted scope): passed through
//! 2. rank <= 1 or name matches a sensitivity keyword: kept at BF16/F16
//! 3. otherwise: symmetric 127-level rounding, then cast to the 8-bit format
//!
//! Non-float tensors always pass through.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::tensor::{DType, Tensor, TensorMap};
use crate::config::PipelineDefaults;
use crate::types::{LowBitFormat, TargetScope};
use crate::{QuantsmithError, Result};

/// Name fragments of tensors that stay at wide precision: normalization
/// layers, time/guidance embeddings, input and output projections.
pub const SENSITIVE_KEYWORDS: &[&str] = &[
    "norm",
    "time_embed",
    "time_embedding",
    "time_projection",
    "time_in",
    "guidance_in",
    "vector_in",
    "img_in",
    "txt_in",
    "patch_embedding",
    "text_embedding",
    "proj_out",
    "final_layer",
    "head.",
];

/// Dynamic-range divisor for E4M3 (its largest finite value).
pub const E4M3_DIVISOR: f32 = 448.0;

/// Dynamic-range divisor for E5M2 (its largest finite value).
pub const E5M2_DIVISOR: f32 = 57344.0;

/// Floor on the per-tensor scale.
pub const SCALE_EPSILON: f32 = 1e-12;

/// Symmetric rounding levels.
const LEVELS: f32 = 127.0;

fn divisor(format: LowBitFormat) -> f32 {
    match format {
        LowBitFormat::E4m3Fn => E4M3_DIVISOR,
        LowBitFormat::E5m2 => E5M2_DIVISOR,
    }
}

/// Engine options shared by every low-bit-float target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Tensor-name prefix of the subnetwork quantized under restricted scope.
    pub subnetwork_prefix: String,
    /// Check the stop predicate every this many tensors.
    pub check_interval: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            subnetwork_prefix: PipelineDefaults::SUBNETWORK_PREFIX.to_string(),
            check_interval: PipelineDefaults::TENSOR_CHECK_INTERVAL,
        }
    }
}

/// Per-run counters, logged by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuantizeStats {
    pub quantized: usize,
    pub preserved: usize,
    pub passed_through: usize,
}

/// Output of `quantize`.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizeOutput {
    pub tensors: TensorMap,
    pub stats: QuantizeStats,
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_KEYWORDS.iter().any(|k| name.contains(k))
}

/// Quantize a tensor collection to a low-bit float format.
///
/// `should_stop` is polled every `options.check_interval` tensors; when it
/// returns true the whole operation is abandoned with `Cancelled` and no
/// partial collection is returned.
pub fn quantize(
    tensors: TensorMap,
    format: LowBitFormat,
    scope: TargetScope,
    options: &EngineOptions,
    should_stop: &dyn Fn() -> bool,
) -> Result<QuantizeOutput> {
    let interval = options.check_interval.max(1);
    let mut stats = QuantizeStats::default();
    let mut out = TensorMap::new();

    for (index, (name, tensor)) in tensors.into_iter().enumerate() {
        if index % interval == 0 && should_stop() {
            info!("Quantization cancelled after {} tensors", index);
            return Err(QuantsmithError::Cancelled);
        }

        let in_scope = match scope {
            TargetScope::Full => true,
            TargetScope::RestrictedSubnetwork => name.starts_with(&options.subnetwork_prefix),
        };

        let converted = if !tensor.dtype.is_float() || !in_scope {
            stats.passed_through += 1;
            tensor
        } else if tensor.rank() <= 1 || is_sensitive(&name) {
            stats.preserved += 1;
            preserve_wide(tensor).map_err(|e| tensor_error(&name, e))?
        } else {
            stats.quantized += 1;
            quantize_tensor(&tensor, format).map_err(|e| tensor_error(&name, e))?
        };
        out.insert(name, converted);
    }

    debug!(
        "Quantized {} tensors ({} preserved, {} passed through)",
        stats.quantized, stats.preserved, stats.passed_through
    );
    Ok(QuantizeOutput {
        tensors: out,
        stats,
    })
}

fn tensor_error(name: &str, err: QuantsmithError) -> QuantsmithError {
    QuantsmithError::Other(format!("tensor '{name}': {err}"))
}

/// Keep a quality-sensitive tensor at 16 bits: F16/BF16 are untouched,
/// wider or FP8 inputs become BF16.
fn preserve_wide(tensor: Tensor) -> Result<Tensor> {
    match tensor.dtype {
        DType::F16 | DType::BF16 => Ok(tensor),
        _ => {
            let values = tensor.to_f32_vec()?;
            Tensor::from_f32(&values, DType::BF16, tensor.shape)
        }
    }
}

/// Symmetric 127-level rounding of one tensor, cast to `format`.
pub fn quantize_tensor(tensor: &Tensor, format: LowBitFormat) -> Result<Tensor> {
    let target = DType::for_low_bit(format);
    let values = tensor.to_f32_vec()?;

    let max_abs = values.iter().fold(0.0f32, |acc, v| acc.max(v.abs()));
    if max_abs == 0.0 {
        return Ok(Tensor::zeros(target, tensor.shape.clone()));
    }

    let scale = (max_abs / divisor(format)).max(SCALE_EPSILON);
    let rounded: Vec<f32> = values
        .iter()
        .map(|&v| (v / scale * LEVELS).round() / LEVELS * scale)
        .collect();
    Tensor::from_f32(&rounded, target, tensor.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn f32_tensor(values: &[f32], shape: Vec<usize>) -> Tensor {
        Tensor::from_f32(values, DType::F32, shape).unwrap()
    }

    fn never() -> bool {
        false
    }

    fn sample_map() -> TensorMap {
        let mut map = TensorMap::new();
        map.insert(
            "model.diffusion_model.blocks.0.attn.q.weight".into(),
            f32_tensor(&[0.5, -1.0, 2.0, 0.25], vec![2, 2]),
        );
        map.insert(
            "model.diffusion_model.blocks.0.norm1.weight".into(),
            f32_tensor(&[1.0, 1.0, 1.0, 1.0], vec![2, 2]),
        );
        map.insert(
            "model.diffusion_model.blocks.0.attn.q.bias".into(),
            f32_tensor(&[0.1, 0.2], vec![2]),
        );
        map.insert(
            "text_encoder.embed.weight".into(),
            f32_tensor(&[3.0, 4.0, 5.0, 6.0], vec![2, 2]),
        );
        map.insert("position_ids".into(), Tensor::zeros(DType::I64, vec![4]));
        map
    }

    #[test]
    fn test_full_scope_classifies_tensors() {
        let out = quantize(
            sample_map(),
            LowBitFormat::E4m3Fn,
            TargetScope::Full,
            &EngineOptions::default(),
            &never,
        )
        .unwrap();

        let t = &out.tensors;
        assert_eq!(t["model.diffusion_model.blocks.0.attn.q.weight"].dtype, DType::F8E4M3);
        assert_eq!(t["text_encoder.embed.weight"].dtype, DType::F8E4M3);
        assert_eq!(t["model.diffusion_model.blocks.0.norm1.weight"].dtype, DType::BF16);
        assert_eq!(t["model.diffusion_model.blocks.0.attn.q.bias"].dtype, DType::BF16);
        assert_eq!(t["position_ids"].dtype, DType::I64);
        assert_eq!(
            out.stats,
            QuantizeStats {
                quantized: 2,
                preserved: 2,
                passed_through: 1
            }
        );
    }

    #[test]
    fn test_restricted_scope_leaves_outside_tensors_untouched() {
        let input = sample_map();
        let out = quantize(
            input.clone(),
            LowBitFormat::E5m2,
            TargetScope::RestrictedSubnetwork,
            &EngineOptions::default(),
            &never,
        )
        .unwrap();

        for (name, tensor) in &input {
            if !name.starts_with("model.diffusion_model.") {
                assert_eq!(&out.tensors[name], tensor, "{name} changed");
            }
        }
        assert_eq!(
            out.tensors["model.diffusion_model.blocks.0.attn.q.weight"].dtype,
            DType::F8E5M2
        );
    }

    #[test]
    fn test_all_zero_tensor_stays_zero_in_target_dtype() {
        for format in [LowBitFormat::E4m3Fn, LowBitFormat::E5m2] {
            for scope in [TargetScope::Full, TargetScope::RestrictedSubnetwork] {
                let mut map = TensorMap::new();
                map.insert(
                    "model.diffusion_model.blocks.3.ffn.weight".into(),
                    f32_tensor(&[0.0; 6], vec![2, 3]),
                );
                let out = quantize(map, format, scope, &EngineOptions::default(), &never).unwrap();
                let t = &out.tensors["model.diffusion_model.blocks.3.ffn.weight"];
                assert_eq!(t.dtype, DType::for_low_bit(format));
                assert!(t.data.iter().all(|&b| b == 0));

                // Quantizing the result again is a no-op.
                let again = quantize_tensor(t, format).unwrap();
                assert_eq!(&again, t);
            }
        }
    }

    #[test]
    fn test_quantize_tensor_values() {
        // max_abs 2.0, scale 2/448: 127-level rounding of these values is exact
        // enough that the FP8 cast dominates.
        let t = f32_tensor(&[2.0, -1.0, 0.5, 0.0], vec![2, 2]);
        let q = quantize_tensor(&t, LowBitFormat::E4m3Fn).unwrap();
        assert_eq!(q.to_f32_vec().unwrap(), vec![2.0, -1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_preserve_keeps_half_precision_dtype() {
        let t = Tensor::from_f32(&[1.0, 2.0], DType::F16, vec![2]).unwrap();
        let mut map = TensorMap::new();
        map.insert("blocks.0.norm.weight".into(), t.clone());
        let out = quantize(
            map,
            LowBitFormat::E4m3Fn,
            TargetScope::Full,
            &EngineOptions::default(),
            &never,
        )
        .unwrap();
        assert_eq!(out.tensors["blocks.0.norm.weight"], t);
    }

    #[test]
    fn test_stop_predicate_aborts_without_output() {
        let mut map = TensorMap::new();
        for i in 0..10 {
            map.insert(format!("w{i:02}"), f32_tensor(&[1.0, 2.0, 3.0, 4.0], vec![2, 2]));
        }
        let polls = Cell::new(0);
        let stop_on_second_poll = || {
            polls.set(polls.get() + 1);
            polls.get() >= 2
        };
        let options = EngineOptions {
            check_interval: 4,
            ..EngineOptions::default()
        };

        let err = quantize(
            map,
            LowBitFormat::E4m3Fn,
            TargetScope::Full,
            &options,
            &stop_on_second_poll,
        )
        .unwrap_err();

        assert!(err.is_cancelled());
        // Polled at tensor 0 and tensor 4.
        assert_eq!(polls.get(), 2);
    }
}
