//! Pipeline configuration.
//!
//! `PipelineConfig` is the on-disk JSON document a batch runs from.
//! `PipelineDefaults` holds the fixed names and constants the pipeline uses
//! when the configuration is silent.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog;
use crate::quant::EngineOptions;
use crate::retention::{KeepSet, RetentionTiming};
use crate::toolchain::{DequantizeOptions, ToolchainConfig};
use crate::types::{LowBitFormat, QuantTarget, TargetFamily, TargetScope};
use crate::upload::RoutingConfig;
use crate::{QuantsmithError, Result};

/// Fixed names and tuning constants.
pub struct PipelineDefaults;

impl PipelineDefaults {
    pub const PYTHON: &'static str = "python";
    pub const DEQUANTIZE_SCRIPT: &'static str = "dequantize_fp8v2.py";
    pub const CONVERT_SCRIPT: &'static str = "convert.py";
    pub const FIX_SCRIPT: &'static str = "fix_5d_tensors.py";
    pub const QUANTIZE_BINARY: &'static str = if cfg!(windows) {
        "llama-quantize.exe"
    } else {
        "llama-quantize"
    };
    pub const UPLOAD_CLI: &'static str = "huggingface-cli";

    /// File names of shape-fix descriptors the converter drops into its
    /// working directory.
    pub const FIX_DESCRIPTOR_PATTERN: &'static str = r"^fix_5d_tensors_.*\.safetensors$";

    pub const SUBNETWORK_PREFIX: &'static str = "model.diffusion_model.";
    pub const TENSOR_CHECK_INTERVAL: usize = 128;

    pub const HUB_ENDPOINT: &'static str = "https://huggingface.co";
    pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Where a model's files go under the output root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// Everything directly in the output root.
    #[default]
    Flat,
    /// One `{root}/{base}/` folder per model.
    PerModel,
}

fn default_true() -> bool {
    true
}

/// One requested target as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    /// Inferred from the name when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<TargetFamily>,
    #[serde(default)]
    pub scope: TargetScope,
    #[serde(default = "default_true")]
    pub generate: bool,
    #[serde(default)]
    pub upload: bool,
    #[serde(default = "default_true")]
    pub retain: bool,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: None,
            scope: TargetScope::Full,
            generate: true,
            upload: false,
            retain: true,
        }
    }

    /// Fill in family and low-bit format.
    pub fn resolve(&self) -> Result<QuantTarget> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(QuantsmithError::config("target name is empty"));
        }
        let format = LowBitFormat::from_target_name(name);
        let family = self
            .family
            .or_else(|| catalog::find_option(name).map(|o| o.family))
            .unwrap_or(if format.is_some() {
                TargetFamily::LowBitFloat
            } else {
                TargetFamily::BlockQuant
            });

        let low_bit_format = match family {
            TargetFamily::LowBitFloat => Some(format.ok_or_else(|| {
                QuantsmithError::config(format!(
                    "low-bit-float target '{name}' does not name a format (E4M3 or E5M2)"
                ))
            })?),
            TargetFamily::BlockQuant => None,
        };

        Ok(QuantTarget {
            name: name.to_string(),
            family,
            scope: self.scope,
            low_bit_format,
            generate: self.generate,
            upload: self.upload,
            retain: self.retain,
        })
    }
}

/// A whole batch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output root. Defaults to each source's own directory.
    pub output_dir: Option<PathBuf>,
    pub layout: OutputLayout,
    pub targets: Vec<TargetConfig>,
    pub keep: KeepSet,
    pub retention: RetentionTiming,
    pub dequantize: DequantizeOptions,
    pub engine: EngineOptions,
    pub toolchain: ToolchainConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<RoutingConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            layout: OutputLayout::Flat,
            targets: vec![TargetConfig::new("Q4_K_M")],
            keep: KeepSet::default(),
            retention: RetentionTiming::PerModel,
            dequantize: DequantizeOptions::default(),
            engine: EngineOptions::default(),
            toolchain: ToolchainConfig::default(),
            upload: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| QuantsmithError::io("reading pipeline config", path, e))?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| QuantsmithError::Json {
            message: format!("Failed to parse {}: {}", path.display(), e),
            source: Some(e),
        })?;
        debug!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    /// Write atomically: temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| QuantsmithError::io("creating config directory", parent, e))?;
        }
        let serialized = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(serialized.as_bytes())?;
            file.sync_all()
        };
        if let Err(e) = write() {
            fs::remove_file(&temp_path).ok();
            return Err(QuantsmithError::io("writing pipeline config", &temp_path, e));
        }
        fs::rename(&temp_path, path).map_err(|e| {
            fs::remove_file(&temp_path).ok();
            QuantsmithError::io("replacing pipeline config", path, e)
        })
    }

    /// Resolve every target, rejecting duplicates.
    pub fn resolved_targets(&self) -> Result<Vec<QuantTarget>> {
        let mut seen = HashSet::new();
        let mut targets = Vec::with_capacity(self.targets.len());
        for t in &self.targets {
            let target = t.resolve()?;
            if !seen.insert(target.name.to_ascii_uppercase()) {
                return Err(QuantsmithError::config(format!(
                    "target '{}' is listed twice",
                    target.name
                )));
            }
            targets.push(target);
        }
        Ok(targets)
    }

    /// Check the configuration before any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(QuantsmithError::config("no targets configured"));
        }
        let targets = self.resolved_targets()?;
        if !targets.iter().any(|t| t.generate) {
            return Err(QuantsmithError::config("no target has generate enabled"));
        }

        for family in [TargetFamily::BlockQuant, TargetFamily::LowBitFloat] {
            let wants_upload = targets
                .iter()
                .any(|t| t.family == family && t.generate && t.upload);
            let routed = self
                .upload
                .as_ref()
                .and_then(|r| r.route(family))
                .is_some();
            if wants_upload && !routed {
                return Err(QuantsmithError::config(format!(
                    "{family} targets request upload but no {family} repository is configured"
                )));
            }
        }

        if self.engine.subnetwork_prefix.is_empty()
            && targets
                .iter()
                .any(|t| t.scope == TargetScope::RestrictedSubnetwork)
        {
            return Err(QuantsmithError::config(
                "restricted-subnetwork targets need a subnetwork prefix",
            ));
        }
        Ok(())
    }

    /// Output directory for one model.
    pub fn model_output_dir(&self, source: &Path, base_name: &str) -> PathBuf {
        let root = self
            .output_dir
            .clone()
            .or_else(|| source.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        match self.layout {
            OutputLayout::Flat => root,
            OutputLayout::PerModel => root.join(base_name),
        }
    }
}
