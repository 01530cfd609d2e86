use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Decision;

/// A compressed image ready for the decision client, base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub media_type: String,
    pub data: String,
}

impl EncodedImage {
    pub fn jpeg(data: String) -> Self {
        Self {
            media_type: "image/jpeg".to_string(),
            data,
        }
    }
}

/// An executed decision plus the marked screenshot shown to the next step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub decision: Decision,
    #[serde(skip)]
    pub marked: Option<EncodedImage>,
}

/// What happened during one loop iteration.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: usize,
    pub decision: Option<Decision>,
    pub decision_time: Duration,
    pub execution_time: Duration,
    pub success: bool,
    pub error: Option<String>,
}

impl StepResult {
    pub fn started(step: usize) -> Self {
        Self {
            step,
            decision: None,
            decision_time: Duration::ZERO,
            execution_time: Duration::ZERO,
            success: false,
            error: None,
        }
    }

    pub fn fail(&mut self, error: impl fmt::Display) {
        self.success = false;
        self.error = Some(error.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_million: 5.0,
            output_per_million: 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn cost(&self, pricing: &Pricing) -> f64 {
        self.input_tokens as f64 / 1_000_000.0 * pricing.input_per_million
            + self.output_tokens as f64 / 1_000_000.0 * pricing.output_per_million
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum AbortReason {
    MaxStepsReached,
    UserInterrupt,
    CaptureFailed(String),
    DecisionFailed(String),
    ExecutionFailed(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::MaxStepsReached => f.write_str("reached maximum steps without completion"),
            AbortReason::UserInterrupt => f.write_str("interrupted by user"),
            AbortReason::CaptureFailed(e) => write!(f, "screenshot capture failed: {e}"),
            AbortReason::DecisionFailed(e) => write!(f, "no valid decision: {e}"),
            AbortReason::ExecutionFailed(e) => write!(f, "action execution failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    Aborted(AbortReason),
}

/// Per-step wall time statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StepTimes {
    pub average: Duration,
    pub fastest: Duration,
    pub slowest: Duration,
}

impl StepTimes {
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        let fastest = samples.iter().min().copied()?;
        let slowest = samples.iter().max().copied()?;
        let total: Duration = samples.iter().sum();
        Some(Self {
            average: total / samples.len() as u32,
            fastest,
            slowest,
        })
    }
}

/// Produced for every run, whether it finished, failed or was interrupted.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub task: String,
    pub outcome: RunOutcome,
    pub success: bool,
    pub steps: usize,
    pub elapsed: Duration,
    pub step_times: Option<StepTimes>,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub history: Vec<HistoryEntry>,
    pub results: Vec<StepResult>,
    pub log_file: Option<PathBuf>,
}

impl RunSummary {
    pub fn is_interrupted(&self) -> bool {
        self.outcome == RunOutcome::Aborted(AbortReason::UserInterrupt)
    }
}
