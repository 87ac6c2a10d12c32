//! Workflow model: steps, configuration, and execution state
//!
//! A workflow is an ordered pipeline of AI processing steps; each step's
//! output feeds the next step's input. Processing modes form a closed enum
//! with one config shape per variant, validated when the workflow is
//! constructed rather than at call time.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use photoflow_entitlements::{generate_id, Credits, Timestamp};

use crate::error::{Result, WorkflowError};

/// Opaque reference to an image artifact (original input or step output)
pub type ArtifactRef = String;

/// One AI transformation, with its per-variant configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ProcessingMode {
    /// General quality enhancement; `strength` in 1..=100
    Enhance { strength: u8 },
    RemoveBackground,
    /// Super-resolution upscale
    Upscale { factor: UpscaleFactor },
    /// Re-render in a named style preset
    StyleTransfer { style: String },
    /// Colorize a monochrome photo
    Colorize,
    /// Erase the region described by the mask artifact
    RemoveObject { mask_uri: ArtifactRef },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpscaleFactor {
    X2,
    X4,
}

impl ProcessingMode {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingMode::Enhance { .. } => "enhance",
            ProcessingMode::RemoveBackground => "remove_background",
            ProcessingMode::Upscale { .. } => "upscale",
            ProcessingMode::StyleTransfer { .. } => "style_transfer",
            ProcessingMode::Colorize => "colorize",
            ProcessingMode::RemoveObject { .. } => "remove_object",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            ProcessingMode::Enhance { strength } if !(1..=100).contains(strength) => Err(
                WorkflowError::InvalidConfig(format!("enhance strength {strength} out of range")),
            ),
            ProcessingMode::StyleTransfer { style } if style.is_empty() => Err(
                WorkflowError::InvalidConfig("style transfer requires a style preset".into()),
            ),
            ProcessingMode::RemoveObject { mask_uri } if mask_uri.is_empty() => Err(
                WorkflowError::InvalidConfig("remove object requires a mask artifact".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// One step of a workflow pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub mode: ProcessingMode,
    /// Credits reserved before the step runs and spent on success
    pub estimated_cost: Credits,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, mode: ProcessingMode, estimated_cost: Credits) -> Self {
        WorkflowStep {
            id: id.into(),
            mode,
            estimated_cost,
        }
    }
}

/// Validated, ordered list of workflow steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowConfig {
    /// Build a workflow, rejecting invalid configurations up front
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(WorkflowError::InvalidConfig(
                "workflow needs at least one step".into(),
            ));
        }
        let mut seen = HashSet::new();
        for step in &steps {
            if step.id.is_empty() {
                return Err(WorkflowError::InvalidConfig("step id is empty".into()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(WorkflowError::InvalidConfig(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
            if step.estimated_cost == 0 {
                return Err(WorkflowError::InvalidConfig(format!(
                    "step {} has zero cost",
                    step.id
                )));
            }
            step.mode.validate()?;
        }
        Ok(WorkflowConfig {
            name: name.into(),
            steps,
        })
    }

    pub fn total_cost(&self) -> Credits {
        self.steps.iter().map(|s| s.estimated_cost).sum()
    }
}

/// Workflow execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    /// The current step failed; caller chooses retry, save-partial, or abort
    StepFailed,
    Complete,
    /// Terminated by save-partial; the last successful output is the
    /// final artifact
    Abandoned,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Complete | WorkflowStatus::Abandoned | WorkflowStatus::Aborted
        )
    }
}

/// Terminal outcome of one step; append-only, never mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStepResult {
    pub step_id: String,
    pub output_uri: Option<ArtifactRef>,
    pub success: bool,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

/// Resumable execution state: index plus accumulated results.
///
/// Serializable so an interrupted workflow can be persisted and re-entered
/// after a crash or app restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub current_step_index: usize,
    pub step_results: Vec<WorkflowStepResult>,
    pub status: WorkflowStatus,
    pub started_at: Timestamp,
    /// Error from the most recent failed attempt, pending retry/save/abort
    #[serde(default)]
    pub last_error: Option<String>,
}

impl WorkflowExecution {
    pub fn new() -> Self {
        WorkflowExecution {
            workflow_id: generate_id(),
            current_step_index: 0,
            step_results: Vec::new(),
            status: WorkflowStatus::Pending,
            started_at: Timestamp::now(),
            last_error: None,
        }
    }

    /// Output of the most recent successful step
    pub fn last_output(&self) -> Option<&ArtifactRef> {
        self.step_results
            .iter()
            .rev()
            .filter(|r| r.success)
            .find_map(|r| r.output_uri.as_ref())
    }
}

impl Default for WorkflowExecution {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, cost: Credits) -> WorkflowStep {
        WorkflowStep::new(id, ProcessingMode::Colorize, cost)
    }

    #[test]
    fn test_config_validation() {
        assert!(WorkflowConfig::new("empty", vec![]).is_err());
        assert!(WorkflowConfig::new("dup", vec![step("a", 1), step("a", 1)]).is_err());
        assert!(WorkflowConfig::new("free", vec![step("a", 0)]).is_err());

        let bad_mode = WorkflowStep::new("e", ProcessingMode::Enhance { strength: 0 }, 1);
        assert!(WorkflowConfig::new("bad", vec![bad_mode]).is_err());

        let config = WorkflowConfig::new("ok", vec![step("a", 2), step("b", 3)]).unwrap();
        assert_eq!(config.total_cost(), 5);
    }

    #[test]
    fn test_mode_serde_shape() {
        let mode = ProcessingMode::Upscale {
            factor: UpscaleFactor::X2,
        };
        let json = serde_json::to_value(&mode).unwrap();
        assert_eq!(json["mode"], "upscale");
        assert_eq!(json["factor"], "x2");

        let back: ProcessingMode = serde_json::from_value(json).unwrap();
        assert_eq!(back, mode);
    }

    #[test]
    fn test_last_output_skips_failures() {
        let mut execution = WorkflowExecution::new();
        execution.step_results.push(WorkflowStepResult {
            step_id: "a".into(),
            output_uri: Some("out-a".into()),
            success: true,
            processing_time_ms: 10,
            error: None,
        });
        execution.step_results.push(WorkflowStepResult {
            step_id: "b".into(),
            output_uri: None,
            success: false,
            processing_time_ms: 5,
            error: Some("boom".into()),
        });
        assert_eq!(execution.last_output(), Some(&"out-a".to_string()));
    }
}
