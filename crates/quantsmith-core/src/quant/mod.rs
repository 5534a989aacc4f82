//! In-process tensor handling: the safetensors container, 8-bit float
//! codecs and the low-bit-float quantization engine.

pub mod engine;
pub mod fp8;
pub mod safetensors;
pub mod tensor;

pub use engine::{quantize, EngineOptions, QuantizeOutput, QuantizeStats};
pub use self::safetensors::TensorFile;
pub use tensor::{DType, Tensor, TensorMap};
