//! External conversion collaborators.
//!
//! The pipeline only talks to the [`Toolchain`] trait. [`ExternalToolchain`]
//! maps each operation onto a command line (Python scripts for dequantize,
//! convert and shape-fix; the block quantizer binary for quantize) and runs
//! it through the [`StageRunner`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PipelineDefaults;
use crate::runner::{CommandLine, StageRunner};
use crate::Result;

/// Element type the dequantizer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequantDtype {
    #[default]
    Fp16,
    Bf16,
    Fp32,
}

impl DequantDtype {
    pub fn as_arg(&self) -> &'static str {
        match self {
            DequantDtype::Fp16 => "fp16",
            DequantDtype::Bf16 => "bf16",
            DequantDtype::Fp32 => "fp32",
        }
    }
}

/// Options passed to the dequantizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DequantizeOptions {
    /// Drop the per-tensor scale tensors and FP8 markers from the output.
    pub strip_fp8_markers: bool,
    pub dtype: DequantDtype,
}

impl Default for DequantizeOptions {
    fn default() -> Self {
        Self {
            strip_fp8_markers: true,
            dtype: DequantDtype::Fp16,
        }
    }
}

/// The external tools one model run may invoke.
///
/// Every method succeeds only if the tool exited zero; whether the expected
/// output file exists is checked by the caller.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Whether a dequantizer is configured.
    fn has_dequantizer(&self) -> bool;

    /// Directory the converter runs in. Shape-fix descriptors appear here.
    fn work_dir(&self) -> PathBuf;

    async fn dequantize(&self, src: &Path, dst: &Path, options: &DequantizeOptions) -> Result<()>;

    async fn convert(&self, src: &Path, dst: &Path) -> Result<()>;

    async fn quantize(&self, src: &Path, dst: &Path, quant_name: &str) -> Result<()>;

    async fn fix(&self, src: &Path, dst: &Path, descriptor: &Path, overwrite: bool) -> Result<()>;
}

/// Where the external tools live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Python interpreter for the conversion scripts.
    pub python: PathBuf,
    /// Directory holding the scripts (and usually the quantizer binary).
    /// Relative script paths are resolved against it, and the converter
    /// runs with it as working directory. Defaults to the process's
    /// current directory.
    pub tools_dir: Option<PathBuf>,
    /// `None` disables the dequantize stage.
    pub dequantize_script: Option<PathBuf>,
    pub convert_script: PathBuf,
    pub fix_script: PathBuf,
    /// `None` picks the platform's default binary name.
    pub quantize_binary: Option<PathBuf>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            python: PathBuf::from(PipelineDefaults::PYTHON),
            tools_dir: None,
            dequantize_script: Some(PathBuf::from(PipelineDefaults::DEQUANTIZE_SCRIPT)),
            convert_script: PathBuf::from(PipelineDefaults::CONVERT_SCRIPT),
            fix_script: PathBuf::from(PipelineDefaults::FIX_SCRIPT),
            quantize_binary: None,
        }
    }
}

impl ToolchainConfig {
    pub fn work_dir(&self) -> PathBuf {
        self.tools_dir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.tools_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// The block quantizer: the configured path, else a copy next to the
    /// scripts, else the bare name looked up on `PATH`.
    pub fn quantize_program(&self) -> PathBuf {
        if let Some(binary) = &self.quantize_binary {
            return self.resolve(binary);
        }
        let local = self.work_dir().join(PipelineDefaults::QUANTIZE_BINARY);
        if local.is_file() {
            local
        } else {
            PathBuf::from(PipelineDefaults::QUANTIZE_BINARY)
        }
    }
}

/// [`Toolchain`] backed by real processes.
#[derive(Debug, Clone)]
pub struct ExternalToolchain {
    config: ToolchainConfig,
    runner: StageRunner,
}

impl ExternalToolchain {
    pub fn new(config: ToolchainConfig, runner: StageRunner) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    fn python_script(&self, label: &str, script: &Path) -> CommandLine {
        CommandLine::new(label, &self.config.python).arg(self.config.resolve(script))
    }

    /// `python dequantize_fp8v2.py --src S --dst D [--strip-fp8] --dtype fp16`
    pub fn dequantize_command(
        &self,
        src: &Path,
        dst: &Path,
        options: &DequantizeOptions,
    ) -> Option<CommandLine> {
        let script = self.config.dequantize_script.as_ref()?;
        let mut cmd = self
            .python_script("dequantize", script)
            .arg("--src")
            .arg(src)
            .arg("--dst")
            .arg(dst);
        if options.strip_fp8_markers {
            cmd = cmd.arg("--strip-fp8");
        }
        Some(cmd.arg("--dtype").arg(options.dtype.as_arg()))
    }

    /// `python convert.py --src S --dst D`, run inside the work directory.
    pub fn convert_command(&self, src: &Path, dst: &Path) -> CommandLine {
        self.python_script("convert", &self.config.convert_script)
            .arg("--src")
            .arg(src)
            .arg("--dst")
            .arg(dst)
            .current_dir(self.config.work_dir())
    }

    /// `llama-quantize S D QUANT`
    pub fn quantize_command(&self, src: &Path, dst: &Path, quant_name: &str) -> CommandLine {
        CommandLine::new("quantize", self.config.quantize_program())
            .arg(src)
            .arg(dst)
            .arg(quant_name)
    }

    /// `python fix_5d_tensors.py --src S --dst D --fix DESCRIPTOR [--overwrite]`
    pub fn fix_command(
        &self,
        src: &Path,
        dst: &Path,
        descriptor: &Path,
        overwrite: bool,
    ) -> CommandLine {
        let cmd = self
            .python_script("fix", &self.config.fix_script)
            .arg("--src")
            .arg(src)
            .arg("--dst")
            .arg(dst)
            .arg("--fix")
            .arg(descriptor)
            .current_dir(self.config.work_dir());
        if overwrite {
            cmd.arg("--overwrite")
        } else {
            cmd
        }
    }
}

#[async_trait]
impl Toolchain for ExternalToolchain {
    fn has_dequantizer(&self) -> bool {
        self.config.dequantize_script.is_some()
    }

    fn work_dir(&self) -> PathBuf {
        self.config.work_dir()
    }

    async fn dequantize(&self, src: &Path, dst: &Path, options: &DequantizeOptions) -> Result<()> {
        let Some(cmd) = self.dequantize_command(src, dst, options) else {
            return Err(crate::QuantsmithError::config("no dequantizer configured"));
        };
        self.runner.run_checked(&cmd).await
    }

    async fn convert(&self, src: &Path, dst: &Path) -> Result<()> {
        self.runner.run_checked(&self.convert_command(src, dst)).await
    }

    async fn quantize(&self, src: &Path, dst: &Path, quant_name: &str) -> Result<()> {
        self.runner
            .run_checked(&self.quantize_command(src, dst, quant_name))
            .await
    }

    async fn fix(&self, src: &Path, dst: &Path, descriptor: &Path, overwrite: bool) -> Result<()> {
        self.runner
            .run_checked(&self.fix_command(src, dst, descriptor, overwrite))
            .await
    }
}
