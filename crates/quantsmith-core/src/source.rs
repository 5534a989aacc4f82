//! Source model identification.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::naming::clean_model_name;
use crate::quant::safetensors;
use crate::{QuantsmithError, Result};

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Storage representation of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    /// Dense safetensors with 16/32-bit floats.
    Dense,
    /// Dense safetensors whose weights are stored as scaled FP8. Needs the
    /// dequantize stage before conversion.
    DenseScaledFp8,
    /// Already in the block-quant native format. Plays the role of the
    /// converted source.
    Gguf,
}

/// One input weight file. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceModel {
    pub path: PathBuf,
    /// File stem with status markers stripped.
    pub base_name: String,
    pub format: SourceFormat,
}

impl SourceModel {
    /// Inspect a source file and infer its format.
    ///
    /// The GGUF magic wins; anything else must parse as safetensors.
    pub fn read(path: &Path) -> Result<Self> {
        let format = detect_format(path)?;
        let base_name = clean_model_name(path);
        if base_name.is_empty() {
            return Err(QuantsmithError::InvalidSourceModel {
                path: path.to_path_buf(),
                message: "cannot derive a model name from the file name".into(),
            });
        }
        debug!("Source {} is {:?} (base name '{}')", path.display(), format, base_name);
        Ok(Self {
            path: path.to_path_buf(),
            base_name,
            format,
        })
    }

    pub fn needs_dequantize(&self) -> bool {
        self.format == SourceFormat::DenseScaledFp8
    }

    pub fn is_block_native(&self) -> bool {
        self.format == SourceFormat::Gguf
    }
}

fn detect_format(path: &Path) -> Result<SourceFormat> {
    let mut file =
        fs::File::open(path).map_err(|e| QuantsmithError::io("opening source model", path, e))?;
    let mut magic = [0u8; 4];
    let has_magic = file.read_exact(&mut magic).is_ok() && &magic == GGUF_MAGIC;
    if has_magic {
        return Ok(SourceFormat::Gguf);
    }

    let is_gguf_ext = path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("gguf"));
    if is_gguf_ext {
        return Err(QuantsmithError::InvalidSourceModel {
            path: path.to_path_buf(),
            message: "missing GGUF magic".into(),
        });
    }

    let dtypes = safetensors::read_dtypes(path).map_err(|e| QuantsmithError::InvalidSourceModel {
        path: path.to_path_buf(),
        message: format!("not a GGUF or safetensors file: {e}"),
    })?;
    if dtypes.values().any(|d| d.is_fp8()) {
        Ok(SourceFormat::DenseScaledFp8)
    } else {
        Ok(SourceFormat::Dense)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quant::{DType, Tensor, TensorFile};
    use tempfile::TempDir;

    fn write_safetensors(path: &Path, dtype: DType) {
        let mut file = TensorFile::default();
        file.tensors.insert(
            "blocks.0.weight".into(),
            Tensor::from_f32(&[1.0, 2.0], dtype, vec![2]).unwrap(),
        );
        safetensors::write_new(path, &file).unwrap();
    }

    #[test]
    fn test_dense_source() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wan2.1-t2v-F16.safetensors");
        write_safetensors(&path, DType::F16);

        let source = SourceModel::read(&path).unwrap();
        assert_eq!(source.format, SourceFormat::Dense);
        assert_eq!(source.base_name, "wan2.1-t2v");
        assert!(!source.needs_dequantize());
    }

    #[test]
    fn test_fp8_source_needs_dequantize() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("flux-fp8.safetensors");
        write_safetensors(&path, DType::F8E4M3);

        let source = SourceModel::read(&path).unwrap();
        assert_eq!(source.format, SourceFormat::DenseScaledFp8);
        assert!(source.needs_dequantize());
    }

    #[test]
    fn test_gguf_by_magic() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model-CONVERT.gguf");
        fs::write(&path, b"GGUF\x03\x00\x00\x00rest").unwrap();

        let source = SourceModel::read(&path).unwrap();
        assert_eq!(source.format, SourceFormat::Gguf);
        assert_eq!(source.base_name, "model");
        assert!(source.is_block_native());
    }

    #[test]
    fn test_invalid_sources() {
        let temp = TempDir::new().unwrap();
        let fake_gguf = temp.path().join("fake.gguf");
        fs::write(&fake_gguf, b"not gguf").unwrap();
        assert!(matches!(
            SourceModel::read(&fake_gguf),
            Err(QuantsmithError::InvalidSourceModel { .. })
        ));

        let junk = temp.path().join("junk.safetensors");
        fs::write(&junk, b"xx").unwrap();
        assert!(SourceModel::read(&junk).is_err());

        assert!(SourceModel::read(&temp.path().join("missing.safetensors")).is_err());
    }
}
