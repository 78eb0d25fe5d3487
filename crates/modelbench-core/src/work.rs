//! The boundary to the externally supplied work units.
//!
//! Each benchmark kind has one input shape and one outcome shape. The
//! implementations behind [`WorkUnits`] are opaque: they receive a working
//! directory, model options and a streaming callback, and report back an
//! outcome or an error.

use crate::{BenchmarkKind, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationInput {
    /// Name of a registered operation, e.g. `parse-prd`.
    pub operation: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl OperationInput {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl TaskInput {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            tag: None,
            params: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopInput {
    pub max_iterations: u32,
    /// Restrict the loop to these tasks; empty means whatever the loop picks.
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl LoopInput {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            task_ids: Vec::new(),
            tag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prd_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_tasks: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

impl WorkflowInput {
    pub fn from_path(prd_path: impl Into<String>) -> Self {
        Self {
            prd_path: Some(prd_path.into()),
            prd_content: None,
            num_tasks: None,
            max_iterations: None,
        }
    }

    pub fn from_content(prd_content: impl Into<String>) -> Self {
        Self {
            prd_path: None,
            prd_content: Some(prd_content.into()),
            num_tasks: None,
            max_iterations: None,
        }
    }

    pub fn has_prd(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.prd_path) || present(&self.prd_content)
    }
}

/// Parameters of one benchmark, one variant per work-unit kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkInput {
    Operation(OperationInput),
    Task(TaskInput),
    Loop(LoopInput),
    Workflow(WorkflowInput),
}

impl WorkInput {
    pub fn kind(&self) -> BenchmarkKind {
        match self {
            Self::Operation(_) => BenchmarkKind::Operation,
            Self::Task(_) => BenchmarkKind::Task,
            Self::Loop(_) => BenchmarkKind::Loop,
            Self::Workflow(_) => BenchmarkKind::Workflow,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopOutcome {
    pub iterations: u32,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    #[serde(default)]
    pub output: serde_json::Value,
}

impl LoopOutcome {
    pub fn has_failures(&self) -> bool {
        self.tasks_failed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowOutcome {
    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| !s.success).count()
    }
}

/// Token usage reported by a work unit when it finishes streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// A single chunk emitted while a work unit streams.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A content text delta.
    ContentDelta(String),
    /// A reasoning/thinking text delta.
    ReasoningDelta(String),
    /// Usage for a finished model call. A work unit may make several calls.
    Usage(TokenUsage),
}

pub type StreamCallback = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// Per-model AI invocation options.
#[derive(Clone, PartialEq, Eq)]
pub struct ModelOptions {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub reasoning_tokens: Option<u32>,
}

impl fmt::Debug for ModelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelOptions")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("reasoning_tokens", &self.reasoning_tokens)
            .finish()
    }
}

pub struct WorkContext {
    pub working_dir: PathBuf,
    pub model: ModelOptions,
    pub stream: StreamCallback,
}

impl WorkContext {
    pub fn emit(&self, chunk: StreamChunk) {
        (self.stream)(chunk);
    }
}

/// The four opaque work units plus the operation registry.
pub trait WorkUnits: Send + Sync {
    fn has_operation(&self, name: &str) -> bool;

    fn run_operation(&self, cx: &WorkContext, input: &OperationInput)
    -> Result<serde_json::Value>;

    fn run_task(&self, cx: &WorkContext, input: &TaskInput) -> Result<TaskOutcome>;

    fn run_loop(&self, cx: &WorkContext, input: &LoopInput) -> Result<LoopOutcome>;

    fn run_workflow(&self, cx: &WorkContext, input: &WorkflowInput) -> Result<WorkflowOutcome>;
}
