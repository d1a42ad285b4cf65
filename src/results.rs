//! Per-step results and the aggregator that turns a run's bookkeeping into
//! exactly one result per step.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::step::Step;

/// Error text of steps the run never reached.
pub const NOT_EXECUTED: &str = "not executed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    TimedOut,
    PromptUnanswered,
    Cancelled,
    NotExecuted,
}

impl StepOutcome {
    pub fn label(self) -> &'static str {
        match self {
            Self::Succeeded => "ok",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
            Self::PromptUnanswered => "prompt unanswered",
            Self::Cancelled => "cancelled",
            Self::NotExecuted => "not executed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub success: bool,
    pub output: String,
    /// Empty on success.
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Exit status when the transport or a marker reported one.
    pub exit_code: Option<i32>,
    pub outcome: StepOutcome,
}

impl StepResult {
    pub fn succeeded(step_name: &str, output: String, duration_ms: u64, exit_code: Option<i32>) -> Self {
        Self {
            step_name: step_name.to_string(),
            success: true,
            output,
            error: None,
            duration_ms,
            exit_code,
            outcome: StepOutcome::Succeeded,
        }
    }

    /// A step that ran and failed. The outcome is derived from the error.
    pub fn failed(step_name: &str, output: String, duration_ms: u64, error: &EngineError) -> Self {
        let (outcome, exit_code) = match error {
            EngineError::Timeout { .. } => (StepOutcome::TimedOut, None),
            EngineError::PromptResolution { .. } => (StepOutcome::PromptUnanswered, None),
            EngineError::Aborted => (StepOutcome::Cancelled, None),
            EngineError::StepExecution { code, .. } => (StepOutcome::Failed, Some(*code)),
            _ => (StepOutcome::Failed, None),
        };
        Self {
            step_name: step_name.to_string(),
            success: false,
            output,
            error: Some(error.to_string()),
            duration_ms,
            exit_code,
            outcome,
        }
    }

    pub fn not_executed(step_name: &str) -> Self {
        Self::placeholder(step_name, PadReason::NotExecuted)
    }

    pub fn cancelled(step_name: &str) -> Self {
        Self::placeholder(step_name, PadReason::Cancelled)
    }

    fn placeholder(step_name: &str, reason: PadReason) -> Self {
        let (outcome, error) = match reason {
            PadReason::NotExecuted => (StepOutcome::NotExecuted, NOT_EXECUTED.to_string()),
            PadReason::Cancelled => (StepOutcome::Cancelled, EngineError::Aborted.to_string()),
        };
        Self {
            step_name: step_name.to_string(),
            success: false,
            output: String::new(),
            error: Some(error),
            duration_ms: 0,
            exit_code: None,
            outcome,
        }
    }
}

/// Why trailing steps were never attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadReason {
    NotExecuted,
    Cancelled,
}

/// Produce exactly one result per step, padding unreached steps with
/// "not executed". Pure and index-stable.
pub fn finalize(pending: &[StepResult], steps: &[Step]) -> Vec<StepResult> {
    finalize_with(pending, steps, PadReason::NotExecuted)
}

pub fn finalize_with(pending: &[StepResult], steps: &[Step], reason: PadReason) -> Vec<StepResult> {
    let mut results: Vec<StepResult> = pending.iter().take(steps.len()).cloned().collect();
    for step in &steps[results.len()..] {
        results.push(StepResult::placeholder(&step.name, reason));
    }
    results
}

/// Counts over a finished result list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_executed: usize,
    pub cancelled: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

pub fn summarize(results: &[StepResult]) -> RunSummary {
    let mut summary = RunSummary {
        total: results.len(),
        ..RunSummary::default()
    };
    for result in results {
        summary.duration_ms += result.duration_ms;
        match result.outcome {
            StepOutcome::Succeeded => summary.succeeded += 1,
            StepOutcome::NotExecuted => summary.not_executed += 1,
            StepOutcome::Cancelled => summary.cancelled += 1,
            StepOutcome::Failed | StepOutcome::TimedOut | StepOutcome::PromptUnanswered => {
                summary.failed += 1
            }
        }
    }
    summary
}
