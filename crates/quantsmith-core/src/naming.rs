//! File naming and no-clobber file moves.
//!
//! Every artifact of a model lives at `{dir}/{base}-{suffix}.{ext}`. Kinds
//! are tracked in the ledger; names are only a presentation concern.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::types::{ArtifactKind, QuantTarget, TargetFamily};
use crate::{QuantsmithError, Result};

/// Extension of converter and block-quantizer outputs.
pub const BLOCK_QUANT_EXT: &str = "gguf";

/// Extension of dense tensor files (dequantized sources, low-bit-float outputs).
pub const TENSOR_FILE_EXT: &str = "safetensors";

fn status_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)-(f16|bf16|convert|unfixed|fixed|dequant)$").expect("valid regex")
    })
}

/// Infer a model's base name from its file name.
///
/// Drops the extension and one trailing status marker
/// (`-F16`, `-BF16`, `-CONVERT`, `-UnFixed`, `-FIXED`, `-dequant`).
pub fn clean_model_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    status_suffix_re().replace(&stem, "").trim().to_string()
}

/// Path builder for one model's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    dir: PathBuf,
    base: String,
}

impl ArtifactLayout {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base: base.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn file(&self, suffix: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.{}", self.base, suffix, ext))
    }

    /// `{base}-dequant.safetensors`
    pub fn dequantized(&self) -> PathBuf {
        self.file("dequant", TENSOR_FILE_EXT)
    }

    /// `{base}-CONVERT.gguf`
    pub fn converted(&self) -> PathBuf {
        self.file("CONVERT", BLOCK_QUANT_EXT)
    }

    /// `{base}-{quant}-UnFixed.gguf` / `{base}-{quant}-FIXED.gguf`
    pub fn quantized(&self, quant_name: &str, kind: ArtifactKind) -> PathBuf {
        let marker = match kind {
            ArtifactKind::QuantizedFixed => "FIXED",
            _ => "UnFixed",
        };
        self.file(&format!("{quant_name}-{marker}"), BLOCK_QUANT_EXT)
    }

    /// Canonical final name: bare `{base}-{quant}` with the family's extension.
    pub fn final_path(&self, target: &QuantTarget) -> PathBuf {
        let ext = match target.family {
            TargetFamily::BlockQuant => BLOCK_QUANT_EXT,
            TargetFamily::LowBitFloat => TENSOR_FILE_EXT,
        };
        self.file(&target.name, ext)
    }

    /// Model-owned copy of a converter-emitted fix descriptor.
    pub fn fix_descriptor(&self, descriptor_file_name: &str) -> PathBuf {
        self.dir.join(format!("{}-{}", self.base, descriptor_file_name))
    }
}

/// Move `from` to `to`, refusing to replace an existing destination.
///
/// Uses a hard link + unlink so the "destination exists" check and the move
/// are one atomic step. Falls back to a checked rename on filesystems
/// without hard links. On collision both files are left untouched.
pub fn rename_no_clobber(from: &Path, to: &Path) -> Result<()> {
    match fs::hard_link(from, to) {
        Ok(()) => {
            fs::remove_file(from)
                .map_err(|e| QuantsmithError::io("removing pre-final name", from, e))?;
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(QuantsmithError::NameCollision {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(QuantsmithError::io("renaming artifact", from, e))
        }
        Err(e) => {
            debug!("hard link unavailable ({}), using checked rename", e);
            if to.exists() {
                return Err(QuantsmithError::NameCollision {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                });
            }
            fs::rename(from, to).map_err(|e| QuantsmithError::io("renaming artifact", from, e))
        }
    }
}

/// Copy `from` to `to`, refusing to replace an existing destination.
///
/// A partially written destination is removed on failure.
pub fn copy_no_clobber(from: &Path, to: &Path) -> Result<u64> {
    let mut src =
        fs::File::open(from).map_err(|e| QuantsmithError::io("opening copy source", from, e))?;
    let mut dst = match OpenOptions::new().write(true).create_new(true).open(to) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(QuantsmithError::NameCollision {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            })
        }
        Err(e) => return Err(QuantsmithError::io("creating copy destination", to, e)),
    };

    match io::copy(&mut src, &mut dst).and_then(|n| dst.sync_all().map(|_| n)) {
        Ok(n) => Ok(n),
        Err(e) => {
            drop(dst);
            fs::remove_file(to).ok();
            Err(QuantsmithError::io("copying artifact", to, e))
        }
    }
}

/// Move a file, falling back to copy + delete across filesystems.
/// Replaces an existing destination.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| QuantsmithError::io("copying file", from, e))?;
    fs::remove_file(from).map_err(|e| QuantsmithError::io("removing moved file", from, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetScope;
    use tempfile::TempDir;

    fn target(name: &str, family: TargetFamily) -> QuantTarget {
        QuantTarget {
            name: name.into(),
            family,
            scope: TargetScope::Full,
            low_bit_format: None,
            generate: true,
            upload: false,
            retain: true,
        }
    }

    #[test]
    fn test_clean_model_name_strips_one_status_marker() {
        assert_eq!(clean_model_name(Path::new("/m/wan2.1-t2v-F16.gguf")), "wan2.1-t2v");
        assert_eq!(clean_model_name(Path::new("flux-dev-CONVERT.gguf")), "flux-dev");
        assert_eq!(clean_model_name(Path::new("flux-dev-q4_k_m-unfixed.gguf")), "flux-dev-q4_k_m");
        assert_eq!(clean_model_name(Path::new("plain.safetensors")), "plain");
        assert_eq!(clean_model_name(Path::new("x-FIXED.gguf")), "x");
    }

    #[test]
    fn test_layout_paths() {
        let layout = ArtifactLayout::new("/out", "model");
        assert_eq!(layout.dequantized(), PathBuf::from("/out/model-dequant.safetensors"));
        assert_eq!(layout.converted(), PathBuf::from("/out/model-CONVERT.gguf"));
        assert_eq!(
            layout.quantized("Q4_K_M", ArtifactKind::QuantizedUnfixed),
            PathBuf::from("/out/model-Q4_K_M-UnFixed.gguf")
        );
        assert_eq!(
            layout.quantized("Q4_K_M", ArtifactKind::QuantizedFixed),
            PathBuf::from("/out/model-Q4_K_M-FIXED.gguf")
        );
        assert_eq!(
            layout.final_path(&target("Q4_K_M", TargetFamily::BlockQuant)),
            PathBuf::from("/out/model-Q4_K_M.gguf")
        );
        assert_eq!(
            layout.final_path(&target("FP8_E4M3", TargetFamily::LowBitFloat)),
            PathBuf::from("/out/model-FP8_E4M3.safetensors")
        );
        assert_eq!(
            layout.fix_descriptor("fix_5d_tensors_wan.safetensors"),
            PathBuf::from("/out/model-fix_5d_tensors_wan.safetensors")
        );
    }

    #[test]
    fn test_rename_no_clobber_moves_file() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("a-Q8_0-UnFixed.gguf");
        let to = temp.path().join("a-Q8_0.gguf");
        fs::write(&from, b"quantized").unwrap();

        rename_no_clobber(&from, &to).unwrap();

        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"quantized");
    }

    #[test]
    fn test_rename_no_clobber_keeps_both_files_on_collision() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("a-Q8_0-FIXED.gguf");
        let to = temp.path().join("a-Q8_0.gguf");
        fs::write(&from, b"new").unwrap();
        fs::write(&to, b"old").unwrap();

        let err = rename_no_clobber(&from, &to).unwrap_err();

        assert!(matches!(err, QuantsmithError::NameCollision { .. }));
        assert_eq!(fs::read(&from).unwrap(), b"new");
        assert_eq!(fs::read(&to).unwrap(), b"old");
    }

    #[test]
    fn test_copy_no_clobber() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("a-CONVERT.gguf");
        let to = temp.path().join("a-F16.gguf");
        fs::write(&from, b"f16 weights").unwrap();

        assert_eq!(copy_no_clobber(&from, &to).unwrap(), 11);
        assert!(from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"f16 weights");

        let err = copy_no_clobber(&from, &to).unwrap_err();
        assert!(matches!(err, QuantsmithError::NameCollision { .. }));
    }
}
