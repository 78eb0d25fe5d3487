//! Runs one unit of work per model, each in its own worktree, under a
//! concurrency ceiling.

use anyhow::Result;
use indexmap::IndexMap;
use modelbench_core::{BenchError, ModelConfig, Worktree};
use modelbench_worktree::WorktreeManager;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolEventKind {
    WorktreeCreated,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEvent {
    #[serde(rename = "type")]
    pub kind: PoolEventKind,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<Worktree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PoolEvent {
    fn new(kind: PoolEventKind, model_id: &str, worktree: Option<&Worktree>) -> Self {
        Self {
            kind,
            model_id: model_id.to_string(),
            worktree: worktree.cloned(),
            duration_ms: None,
            error: None,
        }
    }
}

pub type PoolCallback<'a> = &'a (dyn Fn(&PoolEvent) + Sync);

/// Outcome for one model. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult<T> {
    pub model_id: String,
    pub worktree: Option<Worktree>,
    pub result: Option<T>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl<T> ExecutionResult<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(model_id: &str, worktree: Option<Worktree>, error: String, duration_ms: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            worktree,
            result: None,
            error: Some(error),
            duration_ms,
        }
    }
}

pub struct ExecutionPool {
    worktrees: Arc<WorktreeManager>,
    concurrency: usize,
}

impl ExecutionPool {
    /// `concurrency == 0` runs every model at once.
    pub fn new(worktrees: Arc<WorktreeManager>, concurrency: usize) -> Self {
        Self {
            worktrees,
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Create a worktree per model, then run `executor` in each on a bounded
    /// set of worker threads.
    ///
    /// Worktrees are created one at a time before any work starts; a model
    /// whose worktree cannot be created gets an error entry and is skipped.
    /// An `Err` or panic from `executor` is confined to that model's entry.
    /// The returned map is in `models` order.
    pub fn execute_parallel<T, F>(
        &self,
        run_id: &str,
        models: &[ModelConfig],
        executor: F,
        on_progress: Option<PoolCallback<'_>>,
        base: Option<&str>,
    ) -> Result<IndexMap<String, ExecutionResult<T>>>
    where
        T: Send,
        F: Fn(&Worktree, &ModelConfig) -> Result<T> + Sync,
    {
        if run_id.trim().is_empty() {
            return Err(BenchError::validation("run id must be non-empty").into());
        }
        let mut seen = HashSet::new();
        for model in models {
            let id = model.model_id();
            if !seen.insert(id.clone()) {
                return Err(BenchError::validation(format!("duplicate model id: {id}")).into());
            }
        }
        let base = match base {
            Some(rev) => rev.to_string(),
            None => self.worktrees.current_revision()?,
        };
        let emit = |event: PoolEvent| {
            if let Some(cb) = on_progress {
                cb(&event);
            }
        };

        let mut slots: Vec<Option<ExecutionResult<T>>> = models.iter().map(|_| None).collect();
        let mut tasks: Vec<(usize, &ModelConfig, Worktree)> = Vec::with_capacity(models.len());

        for (index, model) in models.iter().enumerate() {
            let model_id = model.model_id();
            let started = Instant::now();
            match self.worktrees.create(run_id, &model_id, &base) {
                Ok(worktree) => {
                    emit(PoolEvent::new(
                        PoolEventKind::WorktreeCreated,
                        &model_id,
                        Some(&worktree),
                    ));
                    tasks.push((index, model, worktree));
                }
                Err(err) => {
                    let message = format!("worktree creation failed: {err:#}");
                    tracing::warn!(run_id, model_id = %model_id, error = %message, "skipping model");
                    let duration_ms = elapsed_ms(started);
                    emit(PoolEvent {
                        duration_ms: Some(duration_ms),
                        error: Some(message.clone()),
                        ..PoolEvent::new(PoolEventKind::ExecutionFailed, &model_id, None)
                    });
                    slots[index] = Some(ExecutionResult::failed(
                        &model_id,
                        None,
                        message,
                        duration_ms,
                    ));
                }
            }
        }

        let workers = match self.concurrency {
            0 => tasks.len(),
            limit => limit.min(tasks.len()),
        };
        tracing::debug!(run_id, tasks = tasks.len(), workers, "pool: dispatch");

        let next = AtomicUsize::new(0);
        let finished: Mutex<Vec<(usize, ExecutionResult<T>)>> = Mutex::new(Vec::new());
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some((index, model, worktree)) = tasks.get(i) else {
                            break;
                        };
                        let outcome = run_one(model, worktree, &executor, &emit);
                        finished
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .push((*index, outcome));
                    }
                });
            }
        });

        for (index, outcome) in finished
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            slots[index] = Some(outcome);
        }

        let mut out = IndexMap::with_capacity(models.len());
        for (model, slot) in models.iter().zip(slots) {
            let model_id = model.model_id();
            let entry = slot.unwrap_or_else(|| {
                ExecutionResult::failed(&model_id, None, "execution did not complete".into(), 0)
            });
            out.insert(model_id, entry);
        }
        Ok(out)
    }
}

fn run_one<T, F>(
    model: &ModelConfig,
    worktree: &Worktree,
    executor: &F,
    emit: &(dyn Fn(PoolEvent) + Sync),
) -> ExecutionResult<T>
where
    F: Fn(&Worktree, &ModelConfig) -> Result<T> + Sync,
{
    let model_id = model.model_id();
    emit(PoolEvent::new(
        PoolEventKind::ExecutionStarted,
        &model_id,
        Some(worktree),
    ));
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor(worktree, model)));
    let duration_ms = elapsed_ms(started);

    let error = match outcome {
        Ok(Ok(value)) => {
            emit(PoolEvent {
                duration_ms: Some(duration_ms),
                ..PoolEvent::new(PoolEventKind::ExecutionCompleted, &model_id, Some(worktree))
            });
            return ExecutionResult {
                model_id,
                worktree: Some(worktree.clone()),
                result: Some(value),
                error: None,
                duration_ms,
            };
        }
        Ok(Err(err)) => format!("{err:#}"),
        Err(payload) => format!("executor panicked: {}", panic_message(payload.as_ref())),
    };

    tracing::warn!(model_id = %model_id, error = %error, "execution failed");
    emit(PoolEvent {
        duration_ms: Some(duration_ms),
        error: Some(error.clone()),
        ..PoolEvent::new(PoolEventKind::ExecutionFailed, &model_id, Some(worktree))
    });
    ExecutionResult::failed(&model_id, Some(worktree.clone()), error, duration_ms)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
