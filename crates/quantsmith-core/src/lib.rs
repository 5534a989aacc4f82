//! Quantsmith - headless pipeline for converting, quantizing and publishing
//! model weight files.
//!
//! A batch of source files (dense safetensors, scaled-FP8 safetensors or GGUF)
//! is turned into one output file per requested target. Block-quant targets go
//! through an external conversion/quantization toolchain; low-bit-float targets
//! are produced in process. Results can be uploaded to a model repository and
//! intermediates are cleaned up according to the retention policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quantsmith::{CancellationToken, ExternalToolchain, Pipeline, PipelineConfig, StageRunner};
//!
//! #[tokio::main]
//! async fn main() -> quantsmith::Result<()> {
//!     let config = PipelineConfig::load("quantsmith.json".as_ref())?;
//!     let cancel = CancellationToken::new();
//!     let runner = StageRunner::with_tracing(cancel.clone());
//!     let toolchain = ExternalToolchain::new(config.toolchain.clone(), runner);
//!
//!     let pipeline = Pipeline::new(config, Arc::new(toolchain), cancel)?;
//!     let report = pipeline.run_batch(&["wan2.1-t2v.safetensors".into()]).await;
//!     println!("all done: {}", report.all_done());
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod hub;
pub mod ledger;
pub mod naming;
pub mod pipeline;
pub mod progress;
pub mod quant;
pub mod report;
pub mod retention;
pub mod runner;
pub mod source;
pub mod toolchain;
pub mod types;
pub mod upload;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use catalog::{find_option, quant_options, QuantOption};
pub use config::{OutputLayout, PipelineConfig, PipelineDefaults, TargetConfig};
pub use error::{QuantsmithError, Result};
pub use hub::HfHubClient;
pub use ledger::Ledger;
pub use pipeline::{BatchContext, Pipeline};
pub use progress::{ModelProgress, ModelStage, ProgressTracker};
pub use report::{BatchReport, ModelReport, StageWarning, TargetResult};
pub use retention::{KeepSet, RetentionTiming};
pub use runner::{CommandLine, OutputSink, StageRunner, TracingSink};
pub use source::{SourceFormat, SourceModel};
pub use toolchain::{DequantDtype, DequantizeOptions, ExternalToolchain, Toolchain, ToolchainConfig};
pub use types::{
    Artifact, ArtifactKind, LowBitFormat, QuantTarget, Stage, TargetFamily, TargetOutcome,
    TargetScope,
};
pub use upload::{RepoRoute, RepoType, RepositoryClient, RoutingConfig, UploadCoordinator, UploadRecord, UploadStatus};
