//! Thread-safe progress tracking for batch runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runner::OutputSink;

/// Where a model is in its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStage {
    Ready,
    Dequantizing,
    Converting,
    Quantizing,
    Fixing,
    Renaming,
    Uploading,
    CleaningUp,
    Done,
    PartialFailure,
    Cancelled,
    /// Source could not be read; nothing was attempted.
    Skipped,
}

impl ModelStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModelStage::Done | ModelStage::PartialFailure | ModelStage::Cancelled | ModelStage::Skipped
        )
    }
}

/// Snapshot of one model's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProgress {
    pub model: String,
    pub stage: ModelStage,
    pub current_target: Option<String>,
    pub tensors_completed: Option<u32>,
    pub tensors_total: Option<u32>,
    pub current_tensor: Option<String>,
    /// Fraction of the current step, 0.0 to 1.0.
    pub progress: Option<f32>,
}

impl ModelProgress {
    fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            stage: ModelStage::Ready,
            current_target: None,
            tensors_completed: None,
            tensors_total: None,
            current_tensor: None,
            progress: None,
        }
    }
}

/// Block-quantizer progress line: `[  12/ 345]  blk.0.attn_k.weight - ...`
fn quantize_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\s*(\d+)/\s*(\d+)\]\s+(\S+)").expect("valid regex"))
}

/// Parse `(completed, total, tensor name)` from a quantizer output line.
pub fn parse_quantize_line(line: &str) -> Option<(u32, u32, String)> {
    let caps = quantize_line_re().captures(line)?;
    let done = caps[1].parse().ok()?;
    let total = caps[2].parse().ok()?;
    Some((done, total, caps[3].to_string()))
}

#[derive(Debug, Default)]
struct State {
    models: HashMap<String, ModelProgress>,
    order: Vec<String>,
    active: Option<String>,
}

/// Tracks every model of a batch. Also an [`OutputSink`]: quantizer output
/// updates the tensor counters of the active model.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<State>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a model and make it the active one.
    pub fn begin_model(&self, model: &str) {
        let mut state = self.lock();
        if !state.models.contains_key(model) {
            state.order.push(model.to_string());
        }
        state.models.insert(model.to_string(), ModelProgress::new(model));
        state.active = Some(model.to_string());
    }

    /// Move a model to a new stage, resetting per-step counters.
    pub fn set_stage(&self, model: &str, stage: ModelStage, target: Option<&str>) {
        let mut state = self.lock();
        if let Some(p) = state.models.get_mut(model) {
            p.stage = stage;
            p.current_target = target.map(str::to_string);
            p.tensors_completed = None;
            p.tensors_total = None;
            p.current_tensor = None;
            p.progress = if stage.is_terminal() { Some(1.0) } else { Some(0.0) };
        }
        if stage.is_terminal() && state.active.as_deref() == Some(model) {
            state.active = None;
        }
    }

    pub fn update_tensor_progress(&self, model: &str, completed: u32, total: u32, tensor: &str) {
        let mut state = self.lock();
        if let Some(p) = state.models.get_mut(model) {
            p.tensors_completed = Some(completed);
            p.tensors_total = Some(total);
            p.current_tensor = Some(tensor.to_string());
            if total > 0 {
                p.progress = Some(completed as f32 / total as f32);
            }
        }
    }

    pub fn get(&self, model: &str) -> Option<ModelProgress> {
        self.lock().models.get(model).cloned()
    }

    /// All models in registration order.
    pub fn list_all(&self) -> Vec<ModelProgress> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|m| state.models.get(m).cloned())
            .collect()
    }

    pub fn active_model(&self) -> Option<String> {
        self.lock().active.clone()
    }
}

impl OutputSink for ProgressTracker {
    fn line(&self, label: &str, line: &str) {
        if label == "quantize" {
            if let Some((done, total, tensor)) = parse_quantize_line(line) {
                if let Some(model) = self.active_model() {
                    self.update_tensor_progress(&model, done, total, &tensor);
                }
                return;
            }
        }
        debug!("[{}] {}", label, line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantize_line() {
        let line = "[  12/ 345]            blk.0.attn_k.weight - [ 4096,  4096,     1,     1], type =    f16";
        assert_eq!(
            parse_quantize_line(line),
            Some((12, 345, "blk.0.attn_k.weight".to_string()))
        );
        assert_eq!(parse_quantize_line("llama_model_quantize_internal: meta size"), None);
    }

    #[test]
    fn test_stage_transitions() {
        let tracker = ProgressTracker::new();
        tracker.begin_model("wan");
        tracker.set_stage("wan", ModelStage::Quantizing, Some("Q4_K_M"));
        tracker.update_tensor_progress("wan", 5, 10, "blk.1.ffn_up.weight");

        let p = tracker.get("wan").unwrap();
        assert_eq!(p.stage, ModelStage::Quantizing);
        assert_eq!(p.current_target.as_deref(), Some("Q4_K_M"));
        assert_eq!(p.progress, Some(0.5));

        tracker.set_stage("wan", ModelStage::Done, None);
        let p = tracker.get("wan").unwrap();
        assert_eq!(p.tensors_completed, None);
        assert!(tracker.active_model().is_none());
    }

    #[test]
    fn test_sink_updates_active_model() {
        let tracker = ProgressTracker::new();
        tracker.begin_model("a");
        tracker.begin_model("b");
        tracker.set_stage("b", ModelStage::Quantizing, Some("Q8_0"));

        tracker.line("quantize", "[ 3/ 4] blk.2.attn_q.weight - [...]");
        tracker.line("convert", "[ 1/ 4] ignored.for.convert");

        assert_eq!(tracker.get("b").unwrap().tensors_completed, Some(3));
        assert_eq!(tracker.get("a").unwrap().tensors_completed, None);
        let order: Vec<String> = tracker.list_all().into_iter().map(|p| p.model).collect();
        assert_eq!(order, vec!["a", "b"]);
    }
}
