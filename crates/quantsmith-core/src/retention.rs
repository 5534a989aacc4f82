//! Retention policy: which of a model's artifacts to delete once it is done.
//!
//! `compute_deletions` is a pure function of the ledger, the keep set, the
//! targets and the model's upload records, so running it per model or once at
//! batch end selects the same files.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ledger::Ledger;
use crate::types::{Artifact, ArtifactKind, QuantTarget};
use crate::upload::{UploadRecord, UploadStatus};

/// Intermediate kinds to keep on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepSet {
    pub dequantized: bool,
    pub converted: bool,
    /// Keep `-UnFixed` files of retained targets that never reached a final
    /// artifact. One superseded by a final is always deleted.
    pub unfixed: bool,
    /// Same rule for `-FIXED` files.
    pub fixed: bool,
    pub fix_descriptor: bool,
}

/// When retention runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionTiming {
    /// After each model's uploads.
    #[default]
    PerModel,
    /// Once, after every model's uploads.
    BatchEnd,
}

fn target_retains(targets: &[QuantTarget], name: Option<&str>) -> bool {
    name.and_then(|n| targets.iter().find(|t| t.name == n))
        .is_some_and(|t| t.retain)
}

/// An intermediate whose target already has a final artifact is superseded.
fn superseded(ledger: &Ledger, artifact: &Artifact) -> bool {
    artifact
        .target
        .as_deref()
        .is_some_and(|t| ledger.final_for(t).is_some())
}

/// A final whose upload was requested but never succeeded is the only copy.
fn upload_pending(targets: &[QuantTarget], uploads: &[UploadRecord], name: Option<&str>) -> bool {
    let Some(target) = name.and_then(|n| targets.iter().find(|t| t.name == n)) else {
        return false;
    };
    target.generate
        && target.upload
        && !uploads.iter().any(|r| {
            r.target == target.name && matches!(r.status, UploadStatus::Uploaded { .. })
        })
}

fn should_keep(
    ledger: &Ledger,
    artifact: &Artifact,
    keep: &KeepSet,
    targets: &[QuantTarget],
    uploads: &[UploadRecord],
) -> bool {
    if artifact.protected {
        return true;
    }
    let retains = || target_retains(targets, artifact.target.as_deref());
    match artifact.kind {
        ArtifactKind::DequantizedSource => keep.dequantized,
        ArtifactKind::ConvertedSource => keep.converted,
        ArtifactKind::FixDescriptor => keep.fix_descriptor,
        ArtifactKind::QuantizedUnfixed => {
            keep.unfixed && retains() && !superseded(ledger, artifact)
        }
        ArtifactKind::QuantizedFixed => keep.fixed && retains() && !superseded(ledger, artifact),
        ArtifactKind::Final => {
            retains() || upload_pending(targets, uploads, artifact.target.as_deref())
        }
    }
}

/// Artifacts of one ledger to delete, in creation order, without duplicate
/// paths. `uploads` are the upload records of the ledger's model.
pub fn compute_deletions(
    ledger: &Ledger,
    keep: &KeepSet,
    targets: &[QuantTarget],
    uploads: &[UploadRecord],
) -> Vec<Artifact> {
    let protected: HashSet<&PathBuf> = ledger
        .artifacts()
        .iter()
        .filter(|a| a.protected)
        .map(|a| &a.path)
        .collect();
    let mut seen = HashSet::new();
    ledger
        .artifacts()
        .iter()
        .filter(|a| !should_keep(ledger, a, keep, targets, uploads))
        .filter(|a| !protected.contains(&a.path))
        .filter(|a| seen.insert(a.path.clone()))
        .cloned()
        .collect()
}

/// Delete the given artifacts. Missing files are skipped silently; other
/// failures are logged. Returns the paths actually removed.
pub fn apply_deletions(artifacts: &[Artifact]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for artifact in artifacts {
        match fs::remove_file(&artifact.path) {
            Ok(()) => {
                info!("Deleted {:?} artifact {}", artifact.kind, artifact.path.display());
                removed.push(artifact.path.clone());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete {}: {}", artifact.path.display(), e),
        }
    }
    removed
}
