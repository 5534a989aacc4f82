//! Pipeline orchestrator.
//!
//! Drives each source model through
//! `Ready -> DequantizedIfNeeded -> ConvertedIfNeeded -> per target -> Done | PartialFailure`,
//! recording every produced file in the model's ledger, then uploads and
//! applies retention either per model or once for the whole batch.
//!
//! Models run one at a time and share nothing but the upload session. The
//! shape-fix descriptor lives in the [`BatchContext`] of the model that
//! produced it, never in a shared working directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{OutputLayout, PipelineConfig, PipelineDefaults};
use crate::naming::{self, clean_model_name, ArtifactLayout};
use crate::progress::{ModelStage, ProgressTracker};
use crate::quant::{self, safetensors, QuantizeStats, TensorFile};
use crate::report::{BatchReport, ModelReport, TargetResult};
use crate::retention::{apply_deletions, compute_deletions, RetentionTiming};
use crate::source::{SourceFormat, SourceModel};
use crate::toolchain::Toolchain;
use crate::types::{
    Artifact, ArtifactKind, QuantTarget, Stage, TargetFamily, TargetOutcome,
};
use crate::upload::{UploadCandidate, UploadCoordinator};
use crate::{QuantsmithError, Result};

/// Per-batch state handed to each model run.
#[derive(Debug, Default)]
pub struct BatchContext {
    /// Shape-fix descriptor of the model currently running. Cleared when a
    /// model starts.
    pub fix_descriptor: Option<PathBuf>,
    /// Models started so far.
    pub models_started: usize,
}

/// Why a step did not produce its output.
enum StepError {
    Cancelled,
    Failed(String),
}

impl From<QuantsmithError> for StepError {
    fn from(err: QuantsmithError) -> Self {
        match err {
            QuantsmithError::Cancelled => StepError::Cancelled,
            other => StepError::Failed(other.to_string()),
        }
    }
}

impl StepError {
    fn into_outcome(self, stage: Stage) -> TargetOutcome {
        match self {
            StepError::Cancelled => TargetOutcome::Cancelled,
            StepError::Failed(reason) => TargetOutcome::Failed { stage, reason },
        }
    }
}

/// A tool that exited zero but left no output is still a failed stage.
fn require_output(path: &Path) -> std::result::Result<(), StepError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(StepError::Failed(format!(
            "expected output {} was not created",
            path.display()
        )))
    }
}

/// Working state of one model run.
struct ModelRun<'a> {
    source: SourceModel,
    layout: ArtifactLayout,
    report: &'a mut ModelReport,
    /// Input for in-process quantization: dequantized file if any, else the source.
    tensor_source: PathBuf,
    /// Input for the block quantizer, once conversion succeeded.
    converted: std::result::Result<PathBuf, StepError>,
}

/// Orchestrates batches of source models.
pub struct Pipeline {
    config: PipelineConfig,
    targets: Vec<QuantTarget>,
    toolchain: Arc<dyn Toolchain>,
    uploader: Option<UploadCoordinator>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
    descriptor_re: Regex,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("targets", &self.targets)
            .field("uploader", &self.uploader)
            .finish()
    }
}

impl Pipeline {
    /// Validate the configuration and build a pipeline.
    pub fn new(
        config: PipelineConfig,
        toolchain: Arc<dyn Toolchain>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let targets = config.resolved_targets()?;
        let descriptor_re = Regex::new(PipelineDefaults::FIX_DESCRIPTOR_PATTERN)
            .map_err(|e| QuantsmithError::config(format!("bad descriptor pattern: {e}")))?;
        Ok(Self {
            config,
            targets,
            toolchain,
            uploader: None,
            progress: Arc::new(ProgressTracker::new()),
            cancel,
            descriptor_re,
        })
    }

    pub fn with_uploader(mut self, uploader: UploadCoordinator) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Share a tracker, e.g. one also used as the runner's output sink.
    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.progress
    }

    pub fn targets(&self) -> &[QuantTarget] {
        &self.targets
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run every source, then apply batch-end upload and retention if
    /// configured.
    pub async fn run_batch(&self, sources: &[PathBuf]) -> BatchReport {
        let mut report = BatchReport::start();
        let mut ctx = BatchContext::default();
        info!("Starting batch of {} model(s)", sources.len());

        for source in sources {
            if self.cancel.is_cancelled() {
                let mut skipped = ModelReport::new(source, clean_model_name(source));
                skipped.state = ModelStage::Cancelled;
                report.models.push(skipped);
                continue;
            }
            let model = self.run_model(&mut ctx, source).await;
            report.models.push(model);
        }

        if self.config.retention == RetentionTiming::BatchEnd {
            self.finish_batch(&mut report.models).await;
        }

        report.finish();
        info!(
            "Batch finished: {}/{} model(s) done",
            report
                .models
                .iter()
                .filter(|m| m.state == ModelStage::Done)
                .count(),
            report.models.len()
        );
        report
    }

    /// Run one source model end to end. Under per-model retention this
    /// includes its uploads and cleanup.
    pub async fn run_model(&self, ctx: &mut BatchContext, source_path: &Path) -> ModelReport {
        ctx.models_started += 1;
        ctx.fix_descriptor = None;

        let mut report = ModelReport::new(source_path, clean_model_name(source_path));
        self.progress.begin_model(&report.base_name);

        let source = match SourceModel::read(source_path).and_then(Self::anchor) {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping {}: {}", source_path.display(), e);
                report.error = Some(e.to_string());
                self.finish_state(&mut report, ModelStage::Skipped);
                return report;
            }
        };
        report.base_name = source.base_name.clone();
        report.format = Some(source.format);

        let out_dir = self
            .config
            .model_output_dir(&source.path, &source.base_name);
        let out_dir = match std::path::absolute(&out_dir) {
            Ok(dir) => dir,
            Err(e) => {
                report.error = Some(format!("cannot resolve output directory: {e}"));
                self.finish_state(&mut report, ModelStage::Skipped);
                return report;
            }
        };
        if let Err(e) = fs::create_dir_all(&out_dir) {
            warn!("Skipping {}: cannot create {}: {}", source_path.display(), out_dir.display(), e);
            report.error = Some(format!("cannot create output directory: {e}"));
            self.finish_state(&mut report, ModelStage::Skipped);
            return report;
        }

        info!("Processing {} ({:?})", source.path.display(), source.format);
        let mut run = ModelRun {
            layout: ArtifactLayout::new(&out_dir, &source.base_name),
            tensor_source: source.path.clone(),
            converted: Err(StepError::Failed("not converted".into())),
            source,
            report: &mut report,
        };

        self.dequantize_if_needed(&mut run).await;
        self.convert_if_needed(ctx, &mut run).await;

        for target in self.targets.iter().filter(|t| t.generate) {
            let outcome = if self.cancel.is_cancelled() {
                TargetOutcome::Cancelled
            } else {
                match target.family {
                    TargetFamily::BlockQuant => self.block_quant_target(ctx, &mut run, target).await,
                    TargetFamily::LowBitFloat => self.low_bit_target(&mut run, target).await,
                }
            };
            match &outcome {
                TargetOutcome::Completed { final_path } => {
                    info!("{} {} -> {}", run.source.base_name, target.name, final_path.display())
                }
                TargetOutcome::Failed { stage, reason } => {
                    error!("{} {} failed at {}: {}", run.source.base_name, target.name, stage, reason)
                }
                TargetOutcome::Collision { kept, existing } => warn!(
                    "{} {}: {} already exists, result kept as {}",
                    run.source.base_name,
                    target.name,
                    existing.display(),
                    kept.display()
                ),
                TargetOutcome::Cancelled => {}
            }
            run.report.targets.push(TargetResult {
                target: target.name.clone(),
                outcome,
            });
        }
        drop(run);

        let state = if self.cancel.is_cancelled()
            || report
                .targets
                .iter()
                .any(|t| t.outcome == TargetOutcome::Cancelled)
        {
            ModelStage::Cancelled
        } else if report.targets.iter().all(|t| t.outcome.is_completed()) {
            ModelStage::Done
        } else {
            ModelStage::PartialFailure
        };

        if state != ModelStage::Cancelled && self.config.retention == RetentionTiming::PerModel {
            self.upload_models(std::slice::from_mut(&mut report)).await;
            self.apply_retention(&mut report);
        }
        self.finish_state(&mut report, state);
        report
    }

    /// External tools run from their own working directory, so every path
    /// handed to them must be absolute.
    fn anchor(mut source: SourceModel) -> Result<SourceModel> {
        source.path = std::path::absolute(&source.path)
            .map_err(|e| QuantsmithError::io("resolving source path", &source.path, e))?;
        Ok(source)
    }

    fn finish_state(&self, report: &mut ModelReport, state: ModelStage) {
        report.state = state;
        self.progress.set_stage(&report.base_name, state, None);
    }

    // -- Shared stages --

    async fn dequantize_if_needed(&self, run: &mut ModelRun<'_>) {
        if !run.source.needs_dequantize() {
            return;
        }
        if !self.toolchain.has_dequantizer() {
            info!("{} holds FP8 weights but no dequantizer is configured", run.source.base_name);
            return;
        }

        self.progress
            .set_stage(&run.source.base_name, ModelStage::Dequantizing, None);
        let dst = run.layout.dequantized();
        let result = match self
            .toolchain
            .dequantize(&run.source.path, &dst, &self.config.dequantize)
            .await
        {
            Ok(()) => require_output(&dst),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => {
                run.report
                    .ledger
                    .record(Artifact::new(ArtifactKind::DequantizedSource, None, &dst));
                run.tensor_source = dst;
            }
            Err(StepError::Cancelled) => {}
            Err(StepError::Failed(reason)) => {
                warn!(
                    "Dequantize failed for {}, continuing with the original file: {}",
                    run.source.base_name, reason
                );
                run.report.warn(Stage::Dequantize, None, reason);
            }
        }
    }

    async fn convert_if_needed(&self, ctx: &mut BatchContext, run: &mut ModelRun<'_>) {
        let needs_block_quant = self
            .targets
            .iter()
            .any(|t| t.generate && t.family == TargetFamily::BlockQuant);
        if !needs_block_quant {
            return;
        }
        if run.source.format == SourceFormat::Gguf {
            run.converted = Ok(run.source.path.clone());
            return;
        }
        if self.cancel.is_cancelled() {
            run.converted = Err(StepError::Cancelled);
            return;
        }

        self.progress
            .set_stage(&run.source.base_name, ModelStage::Converting, None);
        let work_dir = self.toolchain.work_dir();
        self.purge_descriptors(&work_dir);

        let dst = run.layout.converted();
        let result = match self.toolchain.convert(&run.tensor_source, &dst).await {
            Ok(()) => require_output(&dst),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            run.converted = Err(e);
            return;
        }

        run.report
            .ledger
            .record(Artifact::new(ArtifactKind::ConvertedSource, None, &dst));
        run.converted = Ok(dst);

        match self.claim_descriptor(&work_dir, &run.layout) {
            Ok(Some(descriptor)) => {
                info!("Shape-fix descriptor for {}: {}", run.source.base_name, descriptor.display());
                run.report
                    .ledger
                    .record(Artifact::new(ArtifactKind::FixDescriptor, None, &descriptor));
                ctx.fix_descriptor = Some(descriptor);
            }
            Ok(None) => {}
            Err(e) => warn!("Could not relocate shape-fix descriptor: {}", e),
        }
    }

    fn descriptor_files(&self, dir: &Path) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut found: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter(|e| self.descriptor_re.is_match(&e.file_name().to_string_lossy()))
            .map(|e| e.path())
            .collect();
        found.sort();
        found
    }

    /// Remove descriptors left in the converter's working directory by an
    /// earlier run.
    fn purge_descriptors(&self, work_dir: &Path) {
        for stale in self.descriptor_files(work_dir) {
            match fs::remove_file(&stale) {
                Ok(()) => info!("Removed stale shape-fix descriptor {}", stale.display()),
                Err(e) => warn!("Could not remove stale descriptor {}: {}", stale.display(), e),
            }
        }
    }

    /// Move a freshly emitted descriptor next to the model's other files.
    fn claim_descriptor(&self, work_dir: &Path, layout: &ArtifactLayout) -> Result<Option<PathBuf>> {
        let Some(emitted) = self.descriptor_files(work_dir).into_iter().next() else {
            return Ok(None);
        };
        let file_name = emitted
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let dest = layout.fix_descriptor(&file_name);
        naming::move_file(&emitted, &dest)?;
        Ok(Some(dest))
    }

    // -- Per-target stages --

    async fn block_quant_target(
        &self,
        ctx: &BatchContext,
        run: &mut ModelRun<'_>,
        target: &QuantTarget,
    ) -> TargetOutcome {
        let converted = match &run.converted {
            Ok(path) => path.clone(),
            Err(StepError::Cancelled) => return TargetOutcome::Cancelled,
            Err(StepError::Failed(reason)) => {
                return TargetOutcome::Failed {
                    stage: Stage::Convert,
                    reason: reason.clone(),
                }
            }
        };
        let final_path = run.layout.final_path(target);
        let model = run.source.base_name.clone();

        if target.is_passthrough() {
            return self.copy_passthrough(run, target, &converted, &final_path);
        }

        self.progress
            .set_stage(&model, ModelStage::Quantizing, Some(target.name.as_str()));
        let unfixed = run
            .layout
            .quantized(&target.name, ArtifactKind::QuantizedUnfixed);
        let quantized = match self
            .toolchain
            .quantize(&converted, &unfixed, &target.name)
            .await
        {
            Ok(()) => require_output(&unfixed),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = quantized {
            return e.into_outcome(Stage::Quantize);
        }
        run.report.ledger.record(Artifact::new(
            ArtifactKind::QuantizedUnfixed,
            Some(target.name.as_str()),
            &unfixed,
        ));

        let mut candidate = unfixed.clone();
        if let Some(descriptor) = &ctx.fix_descriptor {
            self.progress
                .set_stage(&model, ModelStage::Fixing, Some(target.name.as_str()));
            let fixed = run
                .layout
                .quantized(&target.name, ArtifactKind::QuantizedFixed);
            let result = match self.toolchain.fix(&unfixed, &fixed, descriptor, true).await {
                Ok(()) => require_output(&fixed),
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {
                    run.report.ledger.record(Artifact::new(
                        ArtifactKind::QuantizedFixed,
                        Some(target.name.as_str()),
                        &fixed,
                    ));
                    candidate = fixed;
                }
                Err(StepError::Cancelled) => return TargetOutcome::Cancelled,
                Err(StepError::Failed(reason)) => {
                    warn!("Shape fix failed for {} {}, keeping unfixed result: {}", model, target.name, reason);
                    run.report.warn(Stage::Fix, Some(target.name.as_str()), reason);
                }
            }
        }

        self.progress
            .set_stage(&model, ModelStage::Renaming, Some(target.name.as_str()));
        match naming::rename_no_clobber(&candidate, &final_path) {
            Ok(()) => {
                run.report.ledger.promote_to_final(&candidate, &final_path);
                TargetOutcome::Completed { final_path }
            }
            Err(QuantsmithError::NameCollision { .. }) => {
                run.report.ledger.protect(&candidate);
                TargetOutcome::Collision {
                    kept: candidate,
                    existing: final_path,
                }
            }
            Err(e) => TargetOutcome::Failed {
                stage: Stage::Rename,
                reason: e.to_string(),
            },
        }
    }

    /// F16/BF16: the converted file already is the result.
    fn copy_passthrough(
        &self,
        run: &mut ModelRun<'_>,
        target: &QuantTarget,
        converted: &Path,
        final_path: &Path,
    ) -> TargetOutcome {
        if converted == final_path {
            let mut adopted = Artifact::new(ArtifactKind::Final, Some(target.name.as_str()), final_path);
            adopted.protected = true;
            run.report.ledger.record(adopted);
            return TargetOutcome::Completed {
                final_path: final_path.to_path_buf(),
            };
        }

        self.progress
            .set_stage(&run.source.base_name, ModelStage::Quantizing, Some(target.name.as_str()));
        match naming::copy_no_clobber(converted, final_path) {
            Ok(_) => {
                run.report.ledger.record(Artifact::new(
                    ArtifactKind::Final,
                    Some(target.name.as_str()),
                    final_path,
                ));
                TargetOutcome::Completed {
                    final_path: final_path.to_path_buf(),
                }
            }
            Err(QuantsmithError::NameCollision { .. }) => {
                run.report.ledger.protect(converted);
                TargetOutcome::Collision {
                    kept: converted.to_path_buf(),
                    existing: final_path.to_path_buf(),
                }
            }
            Err(e) => TargetOutcome::Failed {
                stage: Stage::Copy,
                reason: e.to_string(),
            },
        }
    }

    async fn low_bit_target(&self, run: &mut ModelRun<'_>, target: &QuantTarget) -> TargetOutcome {
        let stage = Stage::LowBitQuantize;
        if run.source.format == SourceFormat::Gguf {
            return TargetOutcome::Failed {
                stage,
                reason: "low-bit-float targets need a safetensors source".into(),
            };
        }
        let Some(format) = target.low_bit_format else {
            return TargetOutcome::Failed {
                stage,
                reason: format!("target '{}' has no low-bit format", target.name),
            };
        };
        let final_path = run.layout.final_path(target);
        if final_path.exists() {
            return TargetOutcome::Failed {
                stage,
                reason: format!("{} already exists; refusing to overwrite", final_path.display()),
            };
        }

        self.progress
            .set_stage(&run.source.base_name, ModelStage::Quantizing, Some(target.name.as_str()));
        let input = run.tensor_source.clone();
        let output = final_path.clone();
        let scope = target.scope;
        let options = self.config.engine.clone();
        let token = self.cancel.clone();
        let name = target.name.clone();

        let joined = tokio::task::spawn_blocking(move || -> Result<QuantizeStats> {
            let file = safetensors::read(&input)?;
            let should_stop = || token.is_cancelled();
            let out = quant::quantize(file.tensors, format, scope, &options, &should_stop)?;
            let mut metadata = file.metadata;
            metadata.insert("quantization".to_string(), name);
            safetensors::write_new(
                &output,
                &TensorFile {
                    tensors: out.tensors,
                    metadata,
                },
            )?;
            Ok(out.stats)
        })
        .await;

        match joined {
            Ok(Ok(stats)) => {
                info!(
                    "{} {}: {} quantized, {} kept wide, {} passed through",
                    run.source.base_name,
                    target.name,
                    stats.quantized,
                    stats.preserved,
                    stats.passed_through
                );
                run.report.ledger.record(Artifact::new(
                    ArtifactKind::Final,
                    Some(target.name.as_str()),
                    &final_path,
                ));
                TargetOutcome::Completed { final_path }
            }
            Ok(Err(e)) => StepError::from(e).into_outcome(stage),
            Err(e) => TargetOutcome::Failed {
                stage,
                reason: format!("quantization task failed: {e}"),
            },
        }
    }

    // -- Upload and retention --

    fn candidates(&self, owner: usize, report: &ModelReport) -> Vec<UploadCandidate> {
        self.targets
            .iter()
            .map(|t| UploadCandidate {
                owner,
                model: report.base_name.clone(),
                target: t.clone(),
                outcome: report.outcome(&t.name).cloned(),
            })
            .collect()
    }

    async fn upload_models(&self, models: &mut [ModelReport]) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        let candidates: Vec<UploadCandidate> = models
            .iter()
            .enumerate()
            .filter(|(_, m)| m.state != ModelStage::Skipped && m.format.is_some())
            .flat_map(|(owner, m)| self.candidates(owner, m))
            .collect();
        if candidates.is_empty() {
            return;
        }
        for model in models.iter() {
            self.progress
                .set_stage(&model.base_name, ModelStage::Uploading, None);
        }

        let per_model = self.config.layout == OutputLayout::PerModel;
        let records = uploader.upload(&candidates, per_model).await;
        for record in records {
            if let Some(model) = models.get_mut(record.owner) {
                model.uploads.push(record);
            }
        }
    }

    fn apply_retention(&self, report: &mut ModelReport) {
        self.progress
            .set_stage(&report.base_name, ModelStage::CleaningUp, None);
        let deletions = compute_deletions(
            &report.ledger,
            &self.config.keep,
            &self.targets,
            &report.uploads,
        );
        report.deleted.extend(apply_deletions(&deletions));
    }

    /// Batch-end uploads and retention. Skipped entirely once the batch was
    /// cancelled, leaving every file in place.
    async fn finish_batch(&self, models: &mut [ModelReport]) {
        if self.cancel.is_cancelled() {
            info!("Batch cancelled, skipping uploads and cleanup");
            return;
        }
        let mut active: Vec<&mut ModelReport> = models
            .iter_mut()
            .filter(|m| matches!(m.state, ModelStage::Done | ModelStage::PartialFailure))
            .collect();
        if active.is_empty() {
            return;
        }

        let mut owned: Vec<ModelReport> = active.iter().map(|m| (**m).clone()).collect();
        self.upload_models(&mut owned).await;
        for (slot, updated) in active.iter_mut().zip(owned) {
            slot.uploads = updated.uploads;
        }
        for model in active {
            let state = model.state;
            self.apply_retention(model);
            self.progress.set_stage(&model.base_name, state, None);
        }
    }
}
