//! Shared types for quantization targets and produced artifacts.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which pipeline path produces a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFamily {
    /// Produced by the external block quantizer from the converted source.
    BlockQuant,
    /// Produced in-process by the quantization engine.
    LowBitFloat,
}

impl TargetFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetFamily::BlockQuant => "block-quant",
            TargetFamily::LowBitFloat => "low-bit-float",
        }
    }
}

impl std::fmt::Display for TargetFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Which tensors a low-bit-float target quantizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetScope {
    /// Every eligible tensor.
    #[default]
    Full,
    /// Only tensors under the configured subnetwork prefix.
    RestrictedSubnetwork,
}

/// Supported 8-bit floating-point encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowBitFormat {
    /// 4 exponent bits, 3 mantissa bits, no infinities.
    E4m3Fn,
    /// 5 exponent bits, 2 mantissa bits.
    E5m2,
}

impl LowBitFormat {
    /// Infer the format from a target name such as `FP8_E4M3`.
    pub fn from_target_name(name: &str) -> Option<Self> {
        let upper = name.to_ascii_uppercase();
        if upper.contains("E4M3") {
            Some(LowBitFormat::E4m3Fn)
        } else if upper.contains("E5M2") {
            Some(LowBitFormat::E5m2)
        } else {
            None
        }
    }
}

/// A fully resolved quantization target.
///
/// Built from a `TargetConfig`; family and low-bit format are always known
/// here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantTarget {
    /// Symbolic name, also used as the final file suffix (e.g. `Q4_K_M`).
    pub name: String,
    pub family: TargetFamily,
    pub scope: TargetScope,
    /// Set for low-bit-float targets only.
    pub low_bit_format: Option<LowBitFormat>,
    pub generate: bool,
    pub upload: bool,
    pub retain: bool,
}

impl QuantTarget {
    /// Whether this block-quant target is an unquantized 16-bit pass-through
    /// of the converted source.
    pub fn is_passthrough(&self) -> bool {
        self.family == TargetFamily::BlockQuant && is_passthrough_name(&self.name)
    }
}

/// `F16` and `BF16` are copies of the converted source rather than
/// quantizer outputs.
pub fn is_passthrough_name(name: &str) -> bool {
    name.eq_ignore_ascii_case("F16") || name.eq_ignore_ascii_case("BF16")
}

/// Lifecycle role of a file produced during a model run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    DequantizedSource,
    ConvertedSource,
    /// Shape-fix descriptor emitted by the converter, shared by all
    /// block-quant targets of one model.
    FixDescriptor,
    QuantizedUnfixed,
    QuantizedFixed,
    Final,
}

/// A file produced (or adopted) by a model run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    /// Owning target name; `None` for shared intermediates.
    pub target: Option<String>,
    pub path: PathBuf,
    /// Never deleted by retention: a pre-existing file adopted as this
    /// artifact, or a result left under its pre-final name by a collision.
    #[serde(default)]
    pub protected: bool,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, target: Option<&str>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            target: target.map(str::to_string),
            path: path.into(),
            protected: false,
        }
    }
}

/// Pipeline stage names used in outcomes and progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Dequantize,
    Convert,
    Quantize,
    Fix,
    Copy,
    LowBitQuantize,
    Rename,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Dequantize => "dequantize",
            Stage::Convert => "convert",
            Stage::Quantize => "quantize",
            Stage::Fix => "fix",
            Stage::Copy => "copy",
            Stage::LowBitQuantize => "low-bit quantize",
            Stage::Rename => "rename",
        };
        f.write_str(s)
    }
}

/// Result of generating one target for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TargetOutcome {
    /// Exactly one final artifact exists at `final_path`.
    Completed { final_path: PathBuf },
    Failed { stage: Stage, reason: String },
    /// The final name was occupied; `kept` still holds the result under its
    /// pre-final name and `existing` was left untouched.
    Collision { kept: PathBuf, existing: PathBuf },
    Cancelled,
}

impl TargetOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TargetOutcome::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_bit_format_from_name() {
        assert_eq!(LowBitFormat::from_target_name("FP8_E4M3"), Some(LowBitFormat::E4m3Fn));
        assert_eq!(LowBitFormat::from_target_name("fp8_e5m2"), Some(LowBitFormat::E5m2));
        assert_eq!(LowBitFormat::from_target_name("Q4_K_M"), None);
    }

    #[test]
    fn test_passthrough_names() {
        assert!(is_passthrough_name("F16"));
        assert!(is_passthrough_name("bf16"));
        assert!(!is_passthrough_name("Q8_0"));
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = TargetOutcome::Failed {
            stage: Stage::Quantize,
            reason: "exit 1".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["stage"], "quantize");
    }
}
