//! Safetensors container access.
//!
//! Full reads and writes go through the `safetensors` crate over a memory
//! map. [`read_dtypes`] only parses the header:
//! - 0-7: header size (u64, little-endian)
//! - 8..8+N: JSON header mapping tensor names to `{dtype, shape, data_offsets}`
//!   plus an optional `__metadata__` string map

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::Path;

use ::safetensors::tensor::{serialize_to_file, TensorView};
use ::safetensors::{Dtype, SafeTensors};
use memmap2::Mmap;
use serde::Deserialize;
use tracing::debug;

use super::tensor::{DType, Tensor, TensorMap};
use crate::naming::{self, TENSOR_FILE_EXT};
use crate::{QuantsmithError, Result};

/// Upper bound on the JSON header, matching what model tools accept.
const MAX_HEADER_SIZE: u64 = 100_000_000;

const METADATA_KEY: &str = "__metadata__";

/// Tensors plus free-form string metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorFile {
    pub tensors: TensorMap,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct HeaderEntry {
    dtype: DType,
}

fn invalid(path: &Path, message: impl Into<String>) -> QuantsmithError {
    QuantsmithError::InvalidTensorFile {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn read_header_json<R: Read>(reader: &mut R, path: &Path) -> Result<serde_json::Value> {
    let mut size_buf = [0u8; 8];
    reader
        .read_exact(&mut size_buf)
        .map_err(|e| QuantsmithError::io("reading safetensors header size", path, e))?;
    let header_size = u64::from_le_bytes(size_buf);
    if header_size == 0 || header_size > MAX_HEADER_SIZE {
        return Err(invalid(path, format!("implausible header size {header_size}")));
    }

    let mut header_buf = vec![0u8; header_size as usize];
    reader
        .read_exact(&mut header_buf)
        .map_err(|e| QuantsmithError::io("reading safetensors header", path, e))?;

    let header: serde_json::Value = serde_json::from_slice(&header_buf)
        .map_err(|e| invalid(path, format!("header is not JSON: {e}")))?;
    if !header.is_object() {
        return Err(invalid(path, "header is not a JSON object"));
    }
    Ok(header)
}

/// Read only the header and return each tensor's dtype.
pub fn read_dtypes(path: &Path) -> Result<BTreeMap<String, DType>> {
    let mut file =
        fs::File::open(path).map_err(|e| QuantsmithError::io("opening tensor file", path, e))?;
    let header = read_header_json(&mut file, path)?;

    let mut dtypes = BTreeMap::new();
    if let Some(obj) = header.as_object() {
        for (name, entry) in obj {
            if name == METADATA_KEY {
                continue;
            }
            let entry: HeaderEntry = serde_json::from_value(entry.clone())
                .map_err(|e| invalid(path, format!("tensor '{name}': {e}")))?;
            dtypes.insert(name.clone(), entry.dtype);
        }
    }
    Ok(dtypes)
}

/// Map a file read-only.
#[allow(unsafe_code)]
fn map_file(path: &Path) -> Result<Mmap> {
    let file =
        fs::File::open(path).map_err(|e| QuantsmithError::io("opening tensor file", path, e))?;
    // SAFETY: read-only mapping. Sources are never written while a model
    // run reads them; truncation by another process would fault, not corrupt.
    unsafe { Mmap::map(&file) }.map_err(|e| QuantsmithError::io("mapping tensor file", path, e))
}

fn from_st_dtype(dtype: Dtype) -> Option<DType> {
    Some(match dtype {
        Dtype::BOOL => DType::Bool,
        Dtype::U8 => DType::U8,
        Dtype::I8 => DType::I8,
        Dtype::I16 => DType::I16,
        Dtype::U16 => DType::U16,
        Dtype::I32 => DType::I32,
        Dtype::U32 => DType::U32,
        Dtype::I64 => DType::I64,
        Dtype::U64 => DType::U64,
        Dtype::F8_E4M3 => DType::F8E4M3,
        Dtype::F8_E5M2 => DType::F8E5M2,
        Dtype::F16 => DType::F16,
        Dtype::BF16 => DType::BF16,
        Dtype::F32 => DType::F32,
        Dtype::F64 => DType::F64,
        _ => return None,
    })
}

fn to_st_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::Bool => Dtype::BOOL,
        DType::U8 => Dtype::U8,
        DType::I8 => Dtype::I8,
        DType::I16 => Dtype::I16,
        DType::U16 => Dtype::U16,
        DType::I32 => Dtype::I32,
        DType::U32 => Dtype::U32,
        DType::I64 => Dtype::I64,
        DType::U64 => Dtype::U64,
        DType::F8E4M3 => Dtype::F8_E4M3,
        DType::F8E5M2 => Dtype::F8_E5M2,
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
        DType::F32 => Dtype::F32,
        DType::F64 => Dtype::F64,
    }
}

/// Read a safetensors file.
///
/// The file is memory-mapped; each tensor's bytes are copied out once, so
/// the mapping is released before the caller starts converting.
pub fn read(path: &Path) -> Result<TensorFile> {
    let mmap = map_file(path)?;
    let st = SafeTensors::deserialize(&mmap).map_err(|e| invalid(path, e.to_string()))?;
    let (_, header) = SafeTensors::read_metadata(&mmap).map_err(|e| invalid(path, e.to_string()))?;

    let mut out = TensorFile {
        metadata: header.metadata().clone().unwrap_or_default().into_iter().collect(),
        ..Default::default()
    };
    for (name, view) in st.tensors() {
        let dtype = from_st_dtype(view.dtype())
            .ok_or_else(|| invalid(path, format!("tensor '{name}' has unsupported dtype {:?}", view.dtype())))?;
        let tensor = Tensor::new(dtype, view.shape().to_vec(), view.data().to_vec())
            .map_err(|e| invalid(path, format!("tensor '{name}': {e}")))?;
        out.tensors.insert(name, tensor);
    }

    debug!("Read {} tensors from {}", out.tensors.len(), path.display());
    Ok(out)
}

/// Write a tensor file to a path that must not exist yet.
///
/// Serializes into a temp file next to `path`, then moves it into place
/// without replacing anything. Returns `NameCollision` if `path` is occupied;
/// the temp file is removed on any failure.
pub fn write_new(path: &Path, file: &TensorFile) -> Result<()> {
    let collision = || QuantsmithError::NameCollision {
        from: path.to_path_buf(),
        to: path.to_path_buf(),
    };
    if path.exists() {
        return Err(collision());
    }

    let views = file
        .tensors
        .iter()
        .map(|(name, t)| {
            TensorView::new(to_st_dtype(t.dtype), t.shape.clone(), &t.data)
                .map(|view| (name.as_str(), view))
                .map_err(|e| invalid(path, format!("tensor '{name}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;
    let metadata: Option<HashMap<String, String>> = (!file.metadata.is_empty())
        .then(|| file.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect());

    let temp_path = path.with_extension(format!("{TENSOR_FILE_EXT}.{}.tmp", std::process::id()));
    if let Err(e) = serialize_to_file(views, &metadata, &temp_path) {
        fs::remove_file(&temp_path).ok();
        return Err(invalid(path, format!("serializing: {e}")));
    }

    match naming::rename_no_clobber(&temp_path, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            fs::remove_file(&temp_path).ok();
            match e {
                QuantsmithError::NameCollision { .. } => Err(collision()),
                other => Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> TensorFile {
        let mut file = TensorFile::default();
        file.metadata.insert("format".into(), "pt".into());
        file.tensors.insert(
            "blocks.0.weight".into(),
            Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], DType::F32, vec![2, 2]).unwrap(),
        );
        file.tensors.insert(
            "blocks.0.norm.weight".into(),
            Tensor::from_f32(&[0.5, 0.5], DType::BF16, vec![2]).unwrap(),
        );
        file.tensors
            .insert("step".into(), Tensor::zeros(DType::I64, vec![]));
        file
    }

    #[test]
    fn test_write_then_read_preserves_tensors_and_metadata() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");
        let file = sample();

        write_new(&path, &file).unwrap();
        let loaded = read(&path).unwrap();

        assert_eq!(loaded, file);
    }

    #[test]
    fn test_write_new_leaves_no_temp_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");
        write_new(&path, &sample()).unwrap();

        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("model.safetensors")]);

        let bytes = fs::read(&path).unwrap();
        let header_size = u64::from_le_bytes(bytes[..8].try_into().unwrap());
        assert_eq!(bytes[8], b'{');
        assert!(header_size as usize + 8 < bytes.len());
    }

    #[test]
    fn test_read_dtypes_skips_metadata() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");
        write_new(&path, &sample()).unwrap();

        let dtypes = read_dtypes(&path).unwrap();
        assert_eq!(dtypes.len(), 3);
        assert_eq!(dtypes["blocks.0.norm.weight"], DType::BF16);
        assert_eq!(dtypes["step"], DType::I64);
    }

    #[test]
    fn test_write_new_refuses_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.safetensors");
        fs::write(&path, b"occupied").unwrap();

        let err = write_new(&path, &sample()).unwrap_err();
        assert!(matches!(err, QuantsmithError::NameCollision { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"occupied");
    }

    #[test]
    fn test_read_rejects_truncated_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.safetensors");
        write_new(&path, &sample()).unwrap();
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 4);
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            read(&path),
            Err(QuantsmithError::InvalidTensorFile { .. })
        ));
    }
}
