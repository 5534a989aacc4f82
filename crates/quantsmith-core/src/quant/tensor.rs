//! In-memory tensors as stored in safetensors files.

use std::collections::BTreeMap;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use super::fp8;
use crate::types::LowBitFormat;
use crate::{QuantsmithError, Result};

/// Tensor collection keyed by tensor name.
pub type TensorMap = BTreeMap<String, Tensor>;

/// Element types, named as in the safetensors header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "BOOL")]
    Bool,
    #[serde(rename = "U8")]
    U8,
    #[serde(rename = "I8")]
    I8,
    #[serde(rename = "I16")]
    I16,
    #[serde(rename = "U16")]
    U16,
    #[serde(rename = "I32")]
    I32,
    #[serde(rename = "U32")]
    U32,
    #[serde(rename = "I64")]
    I64,
    #[serde(rename = "U64")]
    U64,
    #[serde(rename = "F8_E4M3")]
    F8E4M3,
    #[serde(rename = "F8_E5M2")]
    F8E5M2,
    #[serde(rename = "F16")]
    F16,
    #[serde(rename = "BF16")]
    BF16,
    #[serde(rename = "F32")]
    F32,
    #[serde(rename = "F64")]
    F64,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 | DType::F8E4M3 | DType::F8E5M2 => 1,
            DType::I16 | DType::U16 | DType::F16 | DType::BF16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DType::F8E4M3 | DType::F8E5M2 | DType::F16 | DType::BF16 | DType::F32 | DType::F64
        )
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self, DType::F8E4M3 | DType::F8E5M2)
    }

    /// The dtype a low-bit format is stored as.
    pub fn for_low_bit(format: LowBitFormat) -> Self {
        match format {
            LowBitFormat::E4m3Fn => DType::F8E4M3,
            LowBitFormat::E5m2 => DType::F8E5M2,
        }
    }
}

/// A dense tensor with little-endian raw storage.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Tensor {
    /// Build a tensor, checking that the byte length matches the shape.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_bytes();
        if data.len() != expected {
            return Err(QuantsmithError::Other(format!(
                "tensor data is {} bytes, shape {:?} of {:?} needs {}",
                data.len(),
                shape,
                dtype,
                expected
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Decode floating-point elements to `f32`.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let values = match self.dtype {
            DType::F32 => self
                .data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DType::F64 => self
                .data
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b) as f32
                })
                .collect(),
            DType::F16 => self
                .data
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
            DType::F8E4M3 => self
                .data
                .iter()
                .map(|&b| fp8::decode(b, LowBitFormat::E4m3Fn))
                .collect(),
            DType::F8E5M2 => self
                .data
                .iter()
                .map(|&b| fp8::decode(b, LowBitFormat::E5m2))
                .collect(),
            other => {
                return Err(QuantsmithError::Other(format!(
                    "cannot decode {other:?} tensor as floating point"
                )))
            }
        };
        Ok(values)
    }

    /// Encode `f32` values into a floating-point dtype.
    pub fn from_f32(values: &[f32], dtype: DType, shape: Vec<usize>) -> Result<Self> {
        let data: Vec<u8> = match dtype {
            DType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            DType::F64 => values
                .iter()
                .flat_map(|&v| f64::from(v).to_le_bytes())
                .collect(),
            DType::F16 => values
                .iter()
                .flat_map(|&v| f16::from_f32(v).to_le_bytes())
                .collect(),
            DType::BF16 => values
                .iter()
                .flat_map(|&v| bf16::from_f32(v).to_le_bytes())
                .collect(),
            DType::F8E4M3 => values
                .iter()
                .map(|&v| fp8::encode(v, LowBitFormat::E4m3Fn))
                .collect(),
            DType::F8E5M2 => values
                .iter()
                .map(|&v| fp8::encode(v, LowBitFormat::E5m2))
                .collect(),
            other => {
                return Err(QuantsmithError::Other(format!(
                    "cannot encode floating point values as {other:?}"
                )))
            }
        };
        Tensor::new(dtype, shape, data)
    }

    /// An all-zero tensor. Zero is the all-zero bit pattern in every dtype.
    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_bytes();
        Self {
            dtype,
            shape,
            data: vec![0u8; len],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(Tensor::new(DType::F32, vec![2, 2], vec![0u8; 15]).is_err());
        assert!(Tensor::new(DType::F32, vec![2, 2], vec![0u8; 16]).is_ok());
        // Scalars hold one element.
        assert!(Tensor::new(DType::BF16, vec![], vec![0u8; 2]).is_ok());
    }

    #[test]
    fn test_f32_decode_encode() {
        let t = Tensor::from_f32(&[1.5, -2.0, 0.25], DType::F16, vec![3]).unwrap();
        assert_eq!(t.data.len(), 6);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.5, -2.0, 0.25]);

        let t = Tensor::from_f32(&[1.0, -448.0], DType::F8E4M3, vec![2]).unwrap();
        assert_eq!(t.data, vec![0x38, 0xFE]);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, -448.0]);
    }

    #[test]
    fn test_integer_tensor_is_not_decodable() {
        let t = Tensor::zeros(DType::I64, vec![4]);
        assert!(!t.dtype.is_float());
        assert!(t.to_f32_vec().is_err());
    }

    #[test]
    fn test_dtype_serde_names() {
        assert_eq!(serde_json::to_value(DType::F8E4M3).unwrap(), "F8_E4M3");
        let d: DType = serde_json::from_value(serde_json::json!("BF16")).unwrap();
        assert_eq!(d, DType::BF16);
    }
}
