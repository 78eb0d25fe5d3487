//! Top-level benchmark runs: validate, fan out to the pool, aggregate and
//! persist.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use modelbench_core::naming::generate_run_id;
use modelbench_core::{
    BenchConfig, BenchError, BenchmarkRun, ModelResult, PlatformShellRunner, ProgressCallback,
    ProgressEvent, ProgressKind, RunConfig, RunStatus, Score, ShellRunner, Timing, WorkInput,
    WorkUnits,
};
use modelbench_executor::BenchmarkExecutor;
use modelbench_metrics::MetricsCollector;
use modelbench_observe::Observer;
use modelbench_pool::{ExecutionPool, PoolEvent, PoolEventKind};
use modelbench_store::{BenchmarkStore, RunFilter};
use modelbench_worktree::{CleanupReport, WorktreeManager};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

pub struct BenchmarkOrchestrator {
    worktrees: Arc<WorktreeManager>,
    executor: BenchmarkExecutor,
    store: BenchmarkStore,
    observer: Option<Observer>,
    defaults: BenchConfig,
}

impl BenchmarkOrchestrator {
    pub fn new(
        worktrees: Arc<WorktreeManager>,
        executor: BenchmarkExecutor,
        store: BenchmarkStore,
    ) -> Self {
        Self {
            worktrees,
            executor,
            store,
            observer: None,
            defaults: BenchConfig::default(),
        }
    }

    /// Wire every component for the repository at `repo` from `cfg`, running
    /// git and verification commands through the platform shell.
    pub fn from_config(
        repo: &Path,
        cfg: BenchConfig,
        work_units: Arc<dyn WorkUnits>,
    ) -> Result<Self> {
        Self::from_config_with_shell(repo, cfg, work_units, Arc::new(PlatformShellRunner))
    }

    pub fn from_config_with_shell(
        repo: &Path,
        cfg: BenchConfig,
        work_units: Arc<dyn WorkUnits>,
        shell: Arc<dyn ShellRunner>,
    ) -> Result<Self> {
        let worktrees = Arc::new(WorktreeManager::from_config(repo, &cfg, Arc::clone(&shell)));
        let metrics = Arc::new(MetricsCollector::from_config(&cfg, shell));
        let executor = BenchmarkExecutor::from_config(&cfg, work_units, metrics);
        let store = BenchmarkStore::from_config(repo, &cfg);
        let observer = Observer::new(&cfg.root_path(repo))?;
        Ok(Self::new(worktrees, executor, store)
            .with_observer(observer)
            .with_defaults(cfg))
    }

    /// Load layered settings for `repo` and build from them.
    pub fn load(repo: &Path, work_units: Arc<dyn WorkUnits>) -> Result<Self> {
        let cfg = BenchConfig::load(repo)?;
        Self::from_config(repo, cfg, work_units)
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Echo run milestones and warnings to stderr as well as the event log.
    pub fn set_verbose(&mut self, verbose: bool) {
        if let Some(observer) = &mut self.observer {
            observer.set_verbose(verbose);
        }
    }

    /// Defaults applied to run configs that leave concurrency or
    /// verification commands unset.
    pub fn with_defaults(mut self, cfg: BenchConfig) -> Self {
        self.defaults = cfg;
        self
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn store(&self) -> &BenchmarkStore {
        &self.store
    }

    /// Benchmark `input` across every model in `config`.
    ///
    /// Invalid requests fail before anything is written. Once the run is
    /// recorded as `running`, per-model failures only affect that model's
    /// result; a failure of the run itself is persisted as `failed` and
    /// then returned.
    pub fn run(
        &self,
        input: WorkInput,
        config: RunConfig,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<BenchmarkRun> {
        let config = config.with_defaults(&self.defaults);
        self.validate(&input, &config)?;

        let run_id = generate_run_id(input.kind());
        let base = match config.base_commit.as_deref().map(str::trim) {
            Some(rev) if !rev.is_empty() => rev.to_string(),
            _ => self.worktrees.current_revision()?,
        };
        if base.is_empty() {
            anyhow::bail!(
                "could not resolve a base revision for {}",
                self.worktrees.repo().display()
            );
        }
        let mut run = BenchmarkRun::new(run_id, input, config, base);
        self.store.save(&run)?;
        tracing::debug!(
            run_id = %run.id,
            kind = %run.kind,
            models = run.config.models.len(),
            "run started"
        );
        if let Some(observer) = &self.observer {
            observer.verbose_log(&format!(
                "{} started on {} with {} model(s)",
                run.id,
                run.base_commit,
                run.config.models.len()
            ));
        }

        match self.execute(&mut run, on_progress) {
            Ok(()) => {
                self.record_run(&run);
                if let Some(observer) = &self.observer {
                    observer.verbose_log(&format!("{} finished: {}", run.id, run.status));
                }
                Ok(run)
            }
            Err(err) => {
                self.mark_failed(&mut run, &err);
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        run: &mut BenchmarkRun,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<()> {
        let pool = ExecutionPool::new(
            Arc::clone(&self.worktrees),
            run.config.effective_concurrency(),
        );
        tracing::debug!(run_id = %run.id, concurrency = pool.concurrency(), "dispatching models");
        let executor = self
            .executor
            .clone()
            .with_verification_commands(run.config.verification_commands.clone());
        let run_id = run.id.clone();
        let input = &run.input;
        let base = run.base_commit.as_str();

        let relay = |event: &PoolEvent| {
            let progress = progress_event(&run_id, event);
            if let Some(observer) = &self.observer
                && let Err(err) = observer.record_event(&progress)
            {
                tracing::warn!(
                    run_id = %run_id,
                    error = %format!("{err:#}"),
                    "event log write failed"
                );
            }
            if let Some(cb) = on_progress {
                cb(&progress);
            }
        };

        let mut outcomes = pool.execute_parallel(
            &run_id,
            &run.config.models,
            |worktree, model| Ok(executor.execute(input, worktree, model, base)),
            Some(&relay),
            Some(base),
        )?;

        let mut results = Vec::with_capacity(run.config.models.len());
        for model in &run.config.models {
            let model_id = model.model_id();
            let result = match outcomes.shift_remove(&model_id) {
                Some(outcome) => match outcome.result {
                    Some(result) => result,
                    None => ModelResult::harness_error(
                        &model_id,
                        outcome.worktree,
                        outcome.error.unwrap_or_else(|| "no result".to_string()),
                        elapsed_timing(outcome.duration_ms),
                    ),
                },
                None => ModelResult::harness_error(
                    &model_id,
                    None,
                    "model was not executed",
                    elapsed_timing(0),
                ),
            };
            results.push(result);
        }

        run.status = BenchmarkRun::status_from_results(&results);
        run.results = results;
        run.completed_at = Some(Utc::now());

        if !run.config.keep_worktrees {
            match self.worktrees.cleanup_run(&run.id) {
                Ok(report) => self.log_cleanup(&report),
                Err(err) => self.warn(&format!("worktree cleanup for {} failed: {err:#}", run.id)),
            }
        }

        self.store.save(run)
    }

    fn mark_failed(&self, run: &mut BenchmarkRun, err: &anyhow::Error) {
        tracing::warn!(run_id = %run.id, error = %format!("{err:#}"), "run failed");
        run.status = RunStatus::Failed;
        run.completed_at = Some(Utc::now());
        if let Err(save_err) = self.store.save(run) {
            self.warn(&format!(
                "could not persist failed status for {}: {save_err:#}",
                run.id
            ));
        }
        self.record_run(run);
    }

    fn record_run(&self, run: &BenchmarkRun) {
        if let Some(observer) = &self.observer
            && let Err(err) = observer.record_run(run)
        {
            tracing::warn!(run_id = %run.id, error = %format!("{err:#}"), "event log write failed");
        }
    }

    fn validate(&self, input: &WorkInput, config: &RunConfig) -> Result<(), BenchError> {
        if config.models.is_empty() {
            return Err(BenchError::validation("at least one model is required"));
        }
        let mut seen = HashSet::new();
        for model in &config.models {
            if model.provider.trim().is_empty() || model.model.trim().is_empty() {
                return Err(BenchError::validation(
                    "every model needs a provider and a model name",
                ));
            }
            let id = model.model_id();
            if !seen.insert(id.clone()) {
                return Err(BenchError::validation(format!("duplicate model id: {id}")));
            }
        }

        match input {
            WorkInput::Operation(op) => {
                if op.operation.trim().is_empty() {
                    return Err(BenchError::validation("operation name is required"));
                }
                if !self.executor.work_units().has_operation(&op.operation) {
                    return Err(BenchError::validation(format!(
                        "unknown operation: {}",
                        op.operation
                    )));
                }
            }
            WorkInput::Task(task) => {
                if task.task_id.trim().is_empty() {
                    return Err(BenchError::validation("task id is required"));
                }
            }
            WorkInput::Loop(lp) => {
                if lp.max_iterations < 1 {
                    return Err(BenchError::validation("max_iterations must be at least 1"));
                }
            }
            WorkInput::Workflow(wf) => {
                if !wf.has_prd() {
                    return Err(BenchError::validation(
                        "workflow needs a PRD path or inline content",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Record a 1-5 score for one model of a finished run, replacing any
    /// earlier score for that model.
    pub fn score_model(
        &self,
        run_id: &str,
        model_id: &str,
        score: i64,
        notes: Option<String>,
        scored_by: Option<String>,
    ) -> Result<Score> {
        let score = Score::new(model_id, score, notes, scored_by)?;
        let run = self
            .store
            .get(run_id)?
            .ok_or_else(|| BenchError::RunNotFound(run_id.to_string()))?;
        if !run.config.models.iter().any(|m| m.model_id() == model_id) {
            return Err(BenchError::validation(format!(
                "model {model_id} is not part of run {run_id}"
            ))
            .into());
        }
        self.store.add_score(run_id, score.clone())?;
        Ok(score)
    }

    pub fn cleanup_run(&self, run_id: &str) -> Result<CleanupReport> {
        let report = self.worktrees.cleanup_run(run_id)?;
        self.log_cleanup(&report);
        Ok(report)
    }

    /// Delete the run record, its results and scores; optionally its
    /// worktrees too. Returns whether a record existed.
    pub fn delete_run(&self, run_id: &str, cleanup_worktrees: bool) -> Result<bool> {
        if cleanup_worktrees {
            self.cleanup_run(run_id)?;
        }
        self.store.delete(run_id, true)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<BenchmarkRun>> {
        self.store.get(run_id)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<BenchmarkRun>> {
        self.store.list(filter)
    }

    fn log_cleanup(&self, report: &CleanupReport) {
        for warning in &report.warnings {
            self.warn(&format!("cleanup {}: {warning}", report.run_id));
        }
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }
}

fn progress_event(run_id: &str, event: &PoolEvent) -> ProgressEvent {
    let (kind, message) = match event.kind {
        PoolEventKind::WorktreeCreated => (
            ProgressKind::Progress,
            match &event.worktree {
                Some(wt) => format!("worktree ready: {}", wt.name),
                None => "worktree ready".to_string(),
            },
        ),
        PoolEventKind::ExecutionStarted => {
            (ProgressKind::Start, format!("running {}", event.model_id))
        }
        PoolEventKind::ExecutionCompleted => (
            ProgressKind::Complete,
            format!("{} finished", event.model_id),
        ),
        PoolEventKind::ExecutionFailed => (
            ProgressKind::Error,
            format!(
                "{} failed: {}",
                event.model_id,
                event.error.as_deref().unwrap_or("unknown error")
            ),
        ),
    };
    ProgressEvent {
        kind,
        model_id: event.model_id.clone(),
        run_id: Some(run_id.to_string()),
        duration_ms: event.duration_ms,
        error: event.error.clone(),
        message,
    }
}

fn elapsed_timing(duration_ms: u64) -> Timing {
    let completed_at = Utc::now();
    Timing {
        started_at: completed_at - ChronoDuration::milliseconds(duration_ms as i64),
        completed_at,
        duration_ms,
        time_to_first_output_ms: None,
    }
}
