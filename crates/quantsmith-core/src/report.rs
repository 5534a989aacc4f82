//! Batch results.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;
use crate::progress::ModelStage;
use crate::source::SourceFormat;
use crate::types::{Stage, TargetOutcome};
use crate::upload::UploadRecord;
use crate::{QuantsmithError, Result};

/// Outcome of one target of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetResult {
    pub target: String,
    #[serde(flatten)]
    pub outcome: TargetOutcome,
}

/// A stage that failed without failing its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageWarning {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub message: String,
}

/// Everything that happened to one source model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReport {
    pub source: PathBuf,
    pub base_name: String,
    pub format: Option<SourceFormat>,
    pub state: ModelStage,
    /// Why the model was skipped, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub targets: Vec<TargetResult>,
    /// Recoverable stage failures, e.g. a shape fix that fell back to the
    /// unfixed file.
    #[serde(default)]
    pub warnings: Vec<StageWarning>,
    pub ledger: Ledger,
    pub uploads: Vec<UploadRecord>,
    pub deleted: Vec<PathBuf>,
}

impl ModelReport {
    pub fn new(source: &Path, base_name: impl Into<String>) -> Self {
        Self {
            source: source.to_path_buf(),
            base_name: base_name.into(),
            format: None,
            state: ModelStage::Ready,
            error: None,
            targets: Vec::new(),
            warnings: Vec::new(),
            ledger: Ledger::new(source),
            uploads: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn warn(&mut self, stage: Stage, target: Option<&str>, message: impl Into<String>) {
        self.warnings.push(StageWarning {
            stage,
            target: target.map(str::to_string),
            message: message.into(),
        });
    }

    pub fn outcome(&self, target: &str) -> Option<&TargetOutcome> {
        self.targets
            .iter()
            .find(|t| t.target == target)
            .map(|t| &t.outcome)
    }

    /// Ledger files still on disk.
    pub fn surviving_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .ledger
            .artifacts()
            .iter()
            .map(|a| a.path.clone())
            .filter(|p| p.exists())
            .collect();
        files.dedup();
        files
    }
}

/// A whole batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub models: Vec<ModelReport>,
}

impl BatchReport {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            models: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn model(&self, base_name: &str) -> Option<&ModelReport> {
        self.models.iter().find(|m| m.base_name == base_name)
    }

    /// True when every model reached `Done`.
    pub fn all_done(&self) -> bool {
        self.models.iter().all(|m| m.state == ModelStage::Done)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| QuantsmithError::io("writing batch report", path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Artifact, ArtifactKind, Stage};

    #[test]
    fn test_report_json_shape() {
        let mut model = ModelReport::new(Path::new("/m/a.safetensors"), "a");
        model.state = ModelStage::PartialFailure;
        model.targets.push(TargetResult {
            target: "Q8_0".into(),
            outcome: TargetOutcome::Failed {
                stage: Stage::Quantize,
                reason: "exited with status: 1".into(),
            },
        });
        model.warn(Stage::Fix, Some("Q4_K_M"), "fix tool exited with status: 1");
        let mut report = BatchReport::start();
        report.models.push(model);
        report.finish();

        let json = serde_json::to_value(&report).unwrap();
        let warning = &json["models"][0]["warnings"][0];
        assert_eq!(warning["stage"], "fix");
        assert_eq!(warning["target"], "Q4_K_M");
        let target = &json["models"][0]["targets"][0];
        assert_eq!(target["target"], "Q8_0");
        assert_eq!(target["status"], "failed");
        assert_eq!(json["models"][0]["state"], "partial_failure");
        assert!(json["finishedAt"].is_string());
        assert!(!report.all_done());
    }

    #[test]
    fn test_surviving_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let kept = temp.path().join("a-F16.gguf");
        std::fs::write(&kept, b"x").unwrap();
        let mut model = ModelReport::new(Path::new("/m/a.safetensors"), "a");
        model
            .ledger
            .record(Artifact::new(ArtifactKind::Final, Some("F16"), &kept));
        model.ledger.record(Artifact::new(
            ArtifactKind::ConvertedSource,
            None,
            temp.path().join("a-CONVERT.gguf"),
        ));

        assert_eq!(model.surviving_files(), vec![kept]);
    }
}
