//! Runs a single work unit for one model inside its worktree and turns the
//! outcome into a [`ModelResult`].

use anyhow::Result;
use chrono::Utc;
use modelbench_core::{
    BenchConfig, BenchmarkMetrics, LoopInput, LoopOutcome, ModelConfig, ModelOptions, ModelResult,
    ModelStatus, OperationInput, StreamCallback, StreamChunk, TaskInput, TaskOutcome, Timing,
    TokenMetrics, TokenUsage, WorkContext, WorkInput, WorkUnits, WorkflowInput, WorkflowOutcome,
    Worktree,
};
use modelbench_metrics::MetricsCollector;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

/// How a finished work unit is judged.
struct Verdict {
    success: bool,
    error: Option<String>,
    output: Value,
}

impl Verdict {
    fn from_outcome<O: serde::Serialize>(outcome: &O, error: Option<String>) -> Self {
        Self {
            success: error.is_none(),
            error,
            output: serde_json::to_value(outcome).unwrap_or_default(),
        }
    }
}

/// Observes the stream of one work unit: time to first output and token usage.
struct StreamTracker {
    started: Instant,
    first_output_ms: OnceLock<u64>,
    usage: Mutex<TokenUsage>,
}

impl StreamTracker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            first_output_ms: OnceLock::new(),
            usage: Mutex::new(TokenUsage::default()),
        })
    }

    fn callback(self: &Arc<Self>) -> StreamCallback {
        let tracker = Arc::clone(self);
        Arc::new(move |chunk| tracker.observe(chunk))
    }

    fn observe(&self, chunk: StreamChunk) {
        match chunk {
            StreamChunk::ContentDelta(_) | StreamChunk::ReasoningDelta(_) => {
                let _ = self
                    .first_output_ms
                    .get_or_init(|| self.started.elapsed().as_millis() as u64);
            }
            StreamChunk::Usage(usage) => {
                let mut total = self
                    .usage
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *total += usage;
            }
        }
    }

    fn usage(&self) -> TokenUsage {
        *self
            .usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct BenchmarkExecutor {
    work_units: Arc<dyn WorkUnits>,
    metrics: Arc<MetricsCollector>,
    /// Lowercased provider name → environment variable holding its API key.
    credentials: HashMap<String, String>,
    verification_commands: Vec<String>,
}

impl BenchmarkExecutor {
    pub fn new(work_units: Arc<dyn WorkUnits>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            work_units,
            metrics,
            credentials: HashMap::new(),
            verification_commands: Vec::new(),
        }
    }

    pub fn from_config(
        cfg: &BenchConfig,
        work_units: Arc<dyn WorkUnits>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let credentials = cfg
            .providers
            .iter()
            .map(|(name, cred)| (name.to_ascii_lowercase(), cred.api_key_env.clone()))
            .collect();
        Self::new(work_units, metrics)
            .with_credentials(credentials)
            .with_verification_commands(cfg.verification.commands.clone())
    }

    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = credentials
            .into_iter()
            .map(|(provider, env)| (provider.to_ascii_lowercase(), env))
            .collect();
        self
    }

    /// Commands run after task, loop and workflow benchmarks.
    pub fn with_verification_commands(mut self, commands: Vec<String>) -> Self {
        self.verification_commands = commands;
        self
    }

    pub fn work_units(&self) -> &Arc<dyn WorkUnits> {
        &self.work_units
    }

    pub fn verification_commands(&self) -> &[String] {
        &self.verification_commands
    }

    pub fn execute(
        &self,
        input: &WorkInput,
        worktree: &Worktree,
        model: &ModelConfig,
        base: &str,
    ) -> ModelResult {
        match input {
            WorkInput::Operation(op) => self.execute_operation(worktree, model, op, base),
            WorkInput::Task(task) => self.execute_task(worktree, model, task, base),
            WorkInput::Loop(lp) => self.execute_loop(worktree, model, lp, base),
            WorkInput::Workflow(wf) => self.execute_workflow(worktree, model, wf, base),
        }
    }

    pub fn execute_operation(
        &self,
        worktree: &Worktree,
        model: &ModelConfig,
        input: &OperationInput,
        base: &str,
    ) -> ModelResult {
        self.run_unit(
            worktree,
            model,
            base,
            &[],
            |cx| {
                if !self.work_units.has_operation(&input.operation) {
                    anyhow::bail!("unknown operation: {}", input.operation);
                }
                self.work_units.run_operation(cx, input)
            },
            |output: Value| Verdict {
                success: true,
                error: None,
                output,
            },
        )
    }

    pub fn execute_task(
        &self,
        worktree: &Worktree,
        model: &ModelConfig,
        input: &TaskInput,
        base: &str,
    ) -> ModelResult {
        self.run_unit(
            worktree,
            model,
            base,
            &self.verification_commands,
            |cx| self.work_units.run_task(cx, input),
            |outcome: TaskOutcome| {
                let error = (!outcome.success).then(|| {
                    outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("task {} reported failure", input.task_id))
                });
                Verdict::from_outcome(&outcome, error)
            },
        )
    }

    pub fn execute_loop(
        &self,
        worktree: &Worktree,
        model: &ModelConfig,
        input: &LoopInput,
        base: &str,
    ) -> ModelResult {
        self.run_unit(
            worktree,
            model,
            base,
            &self.verification_commands,
            |cx| self.work_units.run_loop(cx, input),
            |outcome: LoopOutcome| {
                let error = outcome.has_failures().then(|| {
                    format!(
                        "{} of {} tasks failed",
                        outcome.tasks_failed,
                        outcome.tasks_failed + outcome.tasks_completed
                    )
                });
                Verdict::from_outcome(&outcome, error)
            },
        )
    }

    pub fn execute_workflow(
        &self,
        worktree: &Worktree,
        model: &ModelConfig,
        input: &WorkflowInput,
        base: &str,
    ) -> ModelResult {
        self.run_unit(
            worktree,
            model,
            base,
            &self.verification_commands,
            |cx| self.work_units.run_workflow(cx, input),
            |outcome: WorkflowOutcome| {
                let failed: Vec<&str> = outcome
                    .steps
                    .iter()
                    .filter(|s| !s.success)
                    .map(|s| s.name.as_str())
                    .collect();
                let error =
                    (!failed.is_empty()).then(|| format!("failed steps: {}", failed.join(", ")));
                Verdict::from_outcome(&outcome, error)
            },
        )
    }

    fn run_unit<O>(
        &self,
        worktree: &Worktree,
        model: &ModelConfig,
        base: &str,
        commands: &[String],
        run: impl FnOnce(&WorkContext) -> Result<O>,
        judge: impl FnOnce(O) -> Verdict,
    ) -> ModelResult {
        let model_id = model.model_id();
        let tracker = StreamTracker::new();
        let cx = WorkContext {
            working_dir: worktree.path.clone(),
            model: self.model_options(model),
            stream: tracker.callback(),
        };

        let started_at = Utc::now();
        let outcome = run(&cx);
        let completed_at = Utc::now();
        let duration_ms = tracker.started.elapsed().as_millis() as u64;
        let timing = Timing {
            started_at,
            completed_at,
            duration_ms,
            time_to_first_output_ms: tracker.first_output_ms.get().copied(),
        };

        let verdict = match outcome {
            Ok(outcome) => judge(outcome),
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(model_id = %model_id, worktree = %worktree.name, error = %message, "work unit failed");
                return ModelResult {
                    model_id,
                    worktree: Some(worktree.clone()),
                    status: ModelStatus::Error,
                    duration_ms,
                    output: Value::Null,
                    error: Some(message),
                    metrics: BenchmarkMetrics::timing_only(timing),
                    timestamp: Utc::now(),
                };
            }
        };

        let usage = tracker.usage();
        let tokens = (!usage.is_empty()).then(|| TokenMetrics::from(usage));
        let metrics = self
            .metrics
            .collect_all(&worktree.path, base, timing, tokens, commands);

        ModelResult {
            model_id,
            worktree: Some(worktree.clone()),
            status: if verdict.success {
                ModelStatus::Success
            } else {
                ModelStatus::Failed
            },
            duration_ms,
            output: verdict.output,
            error: verdict.error,
            metrics,
            timestamp: Utc::now(),
        }
    }

    fn model_options(&self, model: &ModelConfig) -> ModelOptions {
        ModelOptions {
            provider: model.provider.clone(),
            model: model.model.clone(),
            api_key: self.resolve_api_key(&model.provider),
            reasoning_tokens: model.reasoning_tokens,
        }
    }

    fn resolve_api_key(&self, provider: &str) -> Option<String> {
        let env = self.credentials.get(&provider.to_ascii_lowercase())?;
        std::env::var(env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelbench_core::ShellRunResult;
    use modelbench_testkit::{ScriptedShell, StubBehavior, StubWorkUnits};
    use std::path::Path;

    fn worktree(dir: &Path, model_id: &str) -> Worktree {
        Worktree {
            name: "run-1-wt".to_string(),
            path: dir.to_path_buf(),
            branch: "bench/run-1/wt".to_string(),
            run_id: "run-1".to_string(),
            model_id: model_id.to_string(),
            base_commit: "base".to_string(),
            created_at: Utc::now(),
        }
    }

    fn executor(stub: StubWorkUnits, shell: ScriptedShell) -> (Arc<StubWorkUnits>, BenchmarkExecutor) {
        let stub = Arc::new(stub);
        let metrics = Arc::new(MetricsCollector::new(Arc::new(shell)));
        let executor = BenchmarkExecutor::new(stub.clone(), metrics)
            .with_verification_commands(vec!["cargo test".to_string()]);
        (stub, executor)
    }

    fn diff_shell() -> ScriptedShell {
        ScriptedShell::new()
            .stdout("diff --numstat", "3\t1\tsrc/lib.rs\n")
            .stdout("--diff-filter=M", "src/lib.rs\n")
            .stdout("diff --name-only base", "src/lib.rs\n")
            .stdout("cargo test", "test result: ok. 4 passed; 0 failed; 0 ignored\n")
    }

    #[test]
    fn successful_task_collects_full_metrics() {
        let temp = tempfile::tempdir().unwrap();
        let model = ModelConfig::new("test", "fast");
        let (_stub, executor) = executor(
            StubWorkUnits::new()
                .with_chunks(&["hello", " world"])
                .with_usage(1_000, 200),
            diff_shell(),
        );

        let result = executor.execute(
            &WorkInput::Task(TaskInput::new("7")),
            &worktree(temp.path(), &model.model_id()),
            &model,
            "base",
        );

        assert_eq!(result.status, ModelStatus::Success);
        assert!(result.error.is_none());
        let metrics = &result.metrics;
        assert!(metrics.timing.time_to_first_output_ms.is_some());
        assert_eq!(metrics.tokens.map(|t| t.total), Some(1_200));
        assert!(metrics.cost.is_some_and(|c| c > 0.0));
        assert_eq!(metrics.code.as_ref().map(|c| c.lines_added), Some(3));
        let verification = metrics.verification.as_ref().unwrap();
        assert_eq!(verification.tests_passed, 4);
        assert_eq!(result.output["task_id"], "7");
    }

    #[test]
    fn operations_skip_verification() {
        let temp = tempfile::tempdir().unwrap();
        let model = ModelConfig::new("test", "fast");
        let shell = diff_shell();
        let (_stub, executor) = executor(StubWorkUnits::new(), shell);

        let result = executor.execute_operation(
            &worktree(temp.path(), &model.model_id()),
            &model,
            &OperationInput::new("parse-prd"),
            "base",
        );
        assert_eq!(result.status, ModelStatus::Success);
        assert!(result.metrics.verification.is_none());
        assert!(result.metrics.code.is_some());
        assert!(result.metrics.timing.time_to_first_output_ms.is_none());
    }

    #[test]
    fn unknown_operation_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let model = ModelConfig::new("test", "fast");
        let (stub, executor) = executor(StubWorkUnits::new(), ScriptedShell::new());
        let result = executor.execute_operation(
            &worktree(temp.path(), &model.model_id()),
            &model,
            &OperationInput::new("summon-dragons"),
            "base",
        );
        assert_eq!(result.status, ModelStatus::Error);
        assert!(stub.calls().is_empty());
    }

    #[test]
    fn logical_failures_are_failed_not_error() {
        let temp = tempfile::tempdir().unwrap();
        let model = ModelConfig::new("test", "sloppy");
        let (_stub, executor) = executor(
            StubWorkUnits::new().behave(&model.model_id(), StubBehavior::LogicalFailure),
            diff_shell(),
        );
        let wt = worktree(temp.path(), &model.model_id());

        for input in [
            WorkInput::Task(TaskInput::new("1")),
            WorkInput::Loop(LoopInput::new(2)),
            WorkInput::Workflow(WorkflowInput::from_content("# PRD")),
        ] {
            let result = executor.execute(&input, &wt, &model, "base");
            assert_eq!(result.status, ModelStatus::Failed, "{input:?}");
            assert!(result.error.is_some());
            assert!(result.metrics.code.is_some(), "metrics still collected");
        }
    }

    #[test]
    fn work_unit_error_keeps_only_timing() {
        let temp = tempfile::tempdir().unwrap();
        let model = ModelConfig::new("test", "broken");
        let (_stub, executor) = executor(
            StubWorkUnits::new()
                .with_usage(10, 10)
                .behave(&model.model_id(), StubBehavior::Fail("rate limited".into())),
            ScriptedShell::new().on("diff", ShellRunResult::failed(1, "unexpected")),
        );
        let result = executor.execute(
            &WorkInput::Loop(LoopInput::new(1)),
            &worktree(temp.path(), &model.model_id()),
            &model,
            "base",
        );
        assert_eq!(result.status, ModelStatus::Error);
        assert_eq!(result.error.as_deref(), Some("rate limited"));
        assert!(result.metrics.tokens.is_none());
        assert!(result.metrics.code.is_none());
        assert!(result.metrics.verification.is_none());
    }

    #[test]
    fn api_key_is_read_from_mapped_env_var() {
        let temp = tempfile::tempdir().unwrap();
        let model = ModelConfig::new("Acme", "m1").with_reasoning_tokens(2048);
        let (stub, executor) = executor(StubWorkUnits::new(), ScriptedShell::new());
        let executor = executor.with_credentials(HashMap::from([(
            "acme".to_string(),
            "MODELBENCH_EXECUTOR_TEST_KEY".to_string(),
        )]));
        unsafe { std::env::set_var("MODELBENCH_EXECUTOR_TEST_KEY", "sk-acme") };

        executor.execute_task(
            &worktree(temp.path(), &model.model_id()),
            &model,
            &TaskInput::new("1"),
            "base",
        );
        let calls = stub.calls();
        assert_eq!(calls[0].api_key.as_deref(), Some("sk-acme"));
        assert_eq!(calls[0].working_dir, temp.path());
    }
}
