use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod config;
pub mod doc;
pub mod error;
pub mod naming;
pub mod shell;
pub mod work;

pub use config::BenchConfig;
pub use doc::JsonDocument;
pub use error::BenchError;
pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};
pub use work::{
    LoopInput, LoopOutcome, ModelOptions, OperationInput, StreamCallback, StreamChunk, TaskInput,
    TaskOutcome, TokenUsage, WorkContext, WorkInput, WorkUnits, WorkflowInput, WorkflowOutcome,
    WorkflowStep,
};

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".modelbench")
}

/// One model under benchmark. `model_id()` is the key used everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    /// Reasoning effort/budget hint forwarded to the work unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u32>,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            reasoning_tokens: None,
        }
    }

    pub fn with_reasoning_tokens(mut self, budget: u32) -> Self {
        self.reasoning_tokens = Some(budget);
        self
    }

    pub fn model_id(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

/// An isolated, branch-backed working copy owned by the worktree manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub run_id: String,
    pub model_id: String,
    pub base_commit: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkKind {
    Operation,
    Task,
    Loop,
    Workflow,
}

impl BenchmarkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::Task => "task",
            Self::Loop => "loop",
            Self::Workflow => "workflow",
        }
    }

    /// Short prefix embedded in run ids.
    pub fn id_prefix(self) -> &'static str {
        match self {
            Self::Operation => "op",
            Self::Task => "task",
            Self::Loop => "loop",
            Self::Workflow => "wf",
        }
    }
}

impl fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BenchmarkKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "operation" | "op" => Ok(Self::Operation),
            "task" => Ok(Self::Task),
            "loop" => Ok(Self::Loop),
            "workflow" | "wf" => Ok(Self::Workflow),
            other => Err(anyhow::anyhow!("unknown benchmark type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    /// The work unit ran and reported success.
    Success,
    /// The work unit ran to completion but reported a logical failure.
    Failed,
    /// The work unit or its harness raised before producing an outcome.
    Error,
}

/// Per-run settings supplied with a benchmark request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub models: Vec<ModelConfig>,
    /// Maximum models executing at once; `Some(0)` means unbounded, `None` takes the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Base revision override; defaults to the source repository's HEAD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit: Option<String>,
    #[serde(default = "default_keep_worktrees")]
    pub keep_worktrees: bool,
    #[serde(default)]
    pub verification_commands: Vec<String>,
}

fn default_keep_worktrees() -> bool {
    true
}

impl RunConfig {
    pub fn new(models: Vec<ModelConfig>) -> Self {
        Self {
            models,
            concurrency: None,
            base_commit: None,
            keep_worktrees: true,
            verification_commands: Vec::new(),
        }
    }

    /// Fill unset fields from the loaded configuration.
    pub fn with_defaults(mut self, cfg: &BenchConfig) -> Self {
        if self.concurrency.is_none() {
            self.concurrency = Some(cfg.pool.max_concurrency);
        }
        if self.verification_commands.is_empty() {
            self.verification_commands = cfg.verification.commands.clone();
        }
        self
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_output_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl From<TokenUsage> for TokenMetrics {
    fn from(usage: TokenUsage) -> Self {
        Self {
            prompt: usage.prompt_tokens,
            completion: usage.completion_tokens,
            total: usage.total(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMetrics {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_changed: u64,
    pub new_files: Vec<String>,
    pub modified_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandResult {
    pub fn passed(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationMetrics {
    pub tests_run: u64,
    pub tests_passed: u64,
    pub tests_failed: u64,
    pub build_success: bool,
    pub command_results: Vec<CommandResult>,
}

impl Default for VerificationMetrics {
    fn default() -> Self {
        Self {
            tests_run: 0,
            tests_passed: 0,
            tests_failed: 0,
            build_success: true,
            command_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    pub timing: Timing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<CodeMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationMetrics>,
    /// Estimated USD cost; not billing truth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl BenchmarkMetrics {
    pub fn timing_only(timing: Timing) -> Self {
        Self {
            timing,
            tokens: None,
            code: None,
            verification: None,
            cost: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub model_id: String,
    /// Snapshot of the worktree used; absent when creation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<Worktree>,
    pub status: ModelStatus,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: BenchmarkMetrics,
    pub timestamp: DateTime<Utc>,
}

impl ModelResult {
    /// Result for a model that never reached its work unit.
    pub fn harness_error(
        model_id: impl Into<String>,
        worktree: Option<Worktree>,
        error: impl Into<String>,
        timing: Timing,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            worktree,
            status: ModelStatus::Error,
            duration_ms: timing.duration_ms,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            metrics: BenchmarkMetrics::timing_only(timing),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub model_id: String,
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub scored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scored_by: Option<String>,
}

impl Score {
    pub const MIN: i64 = 1;
    pub const MAX: i64 = 5;

    pub fn new(
        model_id: impl Into<String>,
        score: i64,
        notes: Option<String>,
        scored_by: Option<String>,
    ) -> std::result::Result<Self, BenchError> {
        if !(Self::MIN..=Self::MAX).contains(&score) {
            return Err(BenchError::InvalidScore(score));
        }
        Ok(Self {
            model_id: model_id.into(),
            score: score as u8,
            notes,
            scored_at: Utc::now(),
            scored_by,
        })
    }

    pub fn validate(&self) -> std::result::Result<(), BenchError> {
        let value = i64::from(self.score);
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(())
        } else {
            Err(BenchError::InvalidScore(value))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRun {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BenchmarkKind,
    pub input: WorkInput,
    pub config: RunConfig,
    pub base_commit: String,
    #[serde(default)]
    pub results: Vec<ModelResult>,
    #[serde(default)]
    pub scores: Vec<Score>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

impl BenchmarkRun {
    pub fn new(id: String, input: WorkInput, config: RunConfig, base_commit: String) -> Self {
        Self {
            id,
            kind: input.kind(),
            input,
            config,
            base_commit,
            results: Vec::new(),
            scores: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Running,
        }
    }

    pub fn result_for(&self, model_id: &str) -> Option<&ModelResult> {
        self.results.iter().find(|r| r.model_id == model_id)
    }

    pub fn score_for(&self, model_id: &str) -> Option<&Score> {
        self.scores.iter().find(|s| s.model_id == model_id)
    }

    /// Terminal status implied by a finished set of model results.
    ///
    /// Errored and logically failed models both yield `Partial`; the per-model
    /// statuses keep the distinction.
    pub fn status_from_results(results: &[ModelResult]) -> RunStatus {
        if results.iter().all(|r| r.status == ModelStatus::Success) {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        }
    }

    /// Insert or replace the current score for a model.
    pub fn upsert_score(&mut self, score: Score) {
        self.scores.retain(|s| s.model_id != score.model_id);
        self.scores.push(score);
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary {
            total: self.results.len(),
            ..RunSummary::default()
        };
        for result in &self.results {
            match result.status {
                ModelStatus::Success => summary.succeeded += 1,
                ModelStatus::Failed => summary.failed += 1,
                ModelStatus::Error => summary.errored += 1,
            }
            if let Some(cost) = result.metrics.cost {
                summary.total_cost += cost;
            }
        }
        let successes = || {
            self.results
                .iter()
                .filter(|r| r.status == ModelStatus::Success)
        };
        summary.fastest = successes()
            .min_by_key(|r| r.duration_ms)
            .map(|r| r.model_id.clone());
        summary.cheapest = successes()
            .filter_map(|r| r.metrics.cost.map(|c| (c, r)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, r)| r.model_id.clone());
        summary
    }
}

/// Aggregate view over one run's model results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
    pub fastest: Option<String>,
    pub cheapest: Option<String>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Start,
    Progress,
    Complete,
    Error,
}

/// Run-level progress notification handed to callers of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub message: String,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(&ProgressEvent) + Send + Sync);
