//! Per-model record of produced artifacts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Artifact, ArtifactKind};

/// Ordered artifacts created during one model's run, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    source: PathBuf,
    artifacts: Vec<Artifact>,
}

impl Ledger {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            artifacts: Vec::new(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn record(&mut self, artifact: Artifact) {
        self.artifacts.push(artifact);
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Latest shared artifact of a kind (no owning target).
    pub fn shared(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .rev()
            .find(|a| a.kind == kind && a.target.is_none())
    }

    pub fn for_target<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a Artifact> + 'a {
        self.artifacts
            .iter()
            .filter(move |a| a.target.as_deref() == Some(target))
    }

    /// The target's final artifact, if one exists.
    pub fn final_for(&self, target: &str) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.kind == ArtifactKind::Final && a.target.as_deref() == Some(target))
    }

    /// Re-tag the artifact at `from` as the final artifact at `to`. The old
    /// entry is superseded, not duplicated. Returns false if no entry has
    /// that path.
    pub fn promote_to_final(&mut self, from: &Path, to: &Path) -> bool {
        match self.artifacts.iter_mut().find(|a| a.path == from) {
            Some(artifact) => {
                artifact.kind = ArtifactKind::Final;
                artifact.path = to.to_path_buf();
                true
            }
            None => false,
        }
    }

    /// Mark the artifact at `path` as never to be deleted.
    pub fn protect(&mut self, path: &Path) -> bool {
        match self.artifacts.iter_mut().find(|a| a.path == path) {
            Some(artifact) => {
                artifact.protected = true;
                true
            }
            None => false,
        }
    }
}
