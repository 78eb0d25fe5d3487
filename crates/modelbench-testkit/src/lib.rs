//! Test doubles shared by the modelbench crates: a scripted shell, stub work
//! units and a throwaway git repository.

use anyhow::{Result, anyhow};
use modelbench_core::{
    LoopInput, LoopOutcome, OperationInput, ShellRunResult, ShellRunner, StreamChunk, TaskInput,
    TaskOutcome, TokenUsage, WorkContext, WorkUnits, WorkflowInput, WorkflowOutcome, WorkflowStep,
};
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// ── ScriptedShell ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCall {
    pub cmd: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
enum Reply {
    Result(ShellRunResult),
    SpawnError(String),
}

#[derive(Debug)]
struct Rule {
    needle: String,
    reply: Reply,
    once: bool,
    used: bool,
}

/// A [`ShellRunner`] answering from canned rules matched by substring.
///
/// One-shot rules are consulted first in insertion order; sticky rules after
/// them, most recently added first. Unmatched commands succeed with empty
/// output. With [`ScriptedShell::materializing_worktrees`] the shell also
/// creates and removes worktree directories the way git would.
#[derive(Debug, Default)]
pub struct ScriptedShell {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<ShellCall>>,
    materialize: bool,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn materializing_worktrees(mut self) -> Self {
        self.materialize = true;
        self
    }

    pub fn on(self, needle: &str, result: ShellRunResult) -> Self {
        self.push(needle, Reply::Result(result), false);
        self
    }

    pub fn once(self, needle: &str, result: ShellRunResult) -> Self {
        self.push(needle, Reply::Result(result), true);
        self
    }

    pub fn spawn_error(self, needle: &str, message: &str) -> Self {
        self.push(needle, Reply::SpawnError(message.to_string()), false);
        self
    }

    pub fn stdout(self, needle: &str, stdout: &str) -> Self {
        self.on(needle, ShellRunResult::ok(stdout))
    }

    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.cmd).collect()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    fn push(&self, needle: &str, reply: Reply, once: bool) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                needle: needle.to_string(),
                reply,
                once,
                used: false,
            });
        }
    }

    fn reply_for(&self, cmd: &str) -> Option<Reply> {
        let mut rules = self.rules.lock().ok()?;
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.once && !r.used && cmd.contains(&r.needle))
        {
            rule.used = true;
            return Some(rule.reply.clone());
        }
        rules
            .iter()
            .rev()
            .find(|r| !r.once && cmd.contains(&r.needle))
            .map(|r| r.reply.clone())
    }

    fn emulate_git(&self, cmd: &str) {
        let Ok(words) = shell_words::split(cmd) else {
            return;
        };
        let args: Vec<&str> = words.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["git", "worktree", "add", "-b", _branch, path, ..] => {
                let _ = fs::create_dir_all(path);
            }
            ["git", "worktree", "remove", "--force", path] => {
                let _ = fs::remove_dir_all(path);
            }
            _ => {}
        }
    }
}

impl ShellRunner for ScriptedShell {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ShellCall {
                cmd: cmd.to_string(),
                cwd: cwd.to_path_buf(),
                timeout,
            });
        }
        let result = match self.reply_for(cmd) {
            Some(Reply::SpawnError(message)) => return Err(anyhow!(message)),
            Some(Reply::Result(result)) => result,
            None => ShellRunResult::ok(""),
        };
        if self.materialize && result.success() {
            self.emulate_git(cmd);
        }
        Ok(result)
    }
}

// ── StubWorkUnits ──

#[derive(Debug, Clone, PartialEq)]
pub enum StubBehavior {
    Succeed,
    /// Complete, but report an unsuccessful outcome.
    LogicalFailure,
    Fail(String),
    Panic(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubCall {
    pub model_id: String,
    pub working_dir: PathBuf,
    pub api_key: Option<String>,
    pub unit: &'static str,
}

/// Scriptable [`WorkUnits`] recording every call and the peak number of
/// concurrent calls.
#[derive(Debug)]
pub struct StubWorkUnits {
    operations: Vec<String>,
    behaviors: HashMap<String, StubBehavior>,
    delays: HashMap<String, Duration>,
    default_delay: Duration,
    chunks: Vec<String>,
    usage: Option<TokenUsage>,
    file: Option<(String, String)>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<StubCall>>,
}

impl Default for StubWorkUnits {
    fn default() -> Self {
        Self {
            operations: vec!["parse-prd".to_string()],
            behaviors: HashMap::new(),
            delays: HashMap::new(),
            default_delay: Duration::ZERO,
            chunks: Vec::new(),
            usage: None,
            file: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl StubWorkUnits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, name: &str) -> Self {
        self.operations.push(name.to_string());
        self
    }

    pub fn behave(mut self, model_id: &str, behavior: StubBehavior) -> Self {
        self.behaviors.insert(model_id.to_string(), behavior);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_model_delay(mut self, model_id: &str, delay: Duration) -> Self {
        self.delays.insert(model_id.to_string(), delay);
        self
    }

    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_usage(mut self, prompt_tokens: u64, completion_tokens: u64) -> Self {
        self.usage = Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
        });
        self
    }

    /// Write `content` to `rel_path` inside the working directory on every call.
    pub fn writing_file(mut self, rel_path: &str, content: &str) -> Self {
        self.file = Some((rel_path.to_string(), content.to_string()));
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn enter(&self, cx: &WorkContext, unit: &'static str) -> Result<StubBehavior> {
        let model_id = format!("{}:{}", cx.model.provider, cx.model.model);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(StubCall {
                model_id: model_id.clone(),
                working_dir: cx.working_dir.clone(),
                api_key: cx.model.api_key.clone(),
                unit,
            });
        }
        let _slot = InFlight::enter(&self.in_flight, &self.max_in_flight);

        let delay = self
            .delays
            .get(&model_id)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        for chunk in &self.chunks {
            cx.emit(StreamChunk::ContentDelta(chunk.clone()));
        }
        if let Some(usage) = self.usage {
            cx.emit(StreamChunk::Usage(usage));
        }
        if let Some((rel, content)) = &self.file {
            let target = cx.working_dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, content)?;
        }

        let behavior = self
            .behaviors
            .get(&model_id)
            .cloned()
            .unwrap_or(StubBehavior::Succeed);
        match behavior {
            StubBehavior::Fail(message) => Err(anyhow!(message)),
            StubBehavior::Panic(message) => panic!("{message}"),
            other => Ok(other),
        }
    }
}

struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkUnits for StubWorkUnits {
    fn has_operation(&self, name: &str) -> bool {
        self.operations.iter().any(|op| op == name)
    }

    fn run_operation(
        &self,
        cx: &WorkContext,
        input: &OperationInput,
    ) -> Result<serde_json::Value> {
        self.enter(cx, "operation")?;
        Ok(json!({"operation": input.operation, "ok": true}))
    }

    fn run_task(&self, cx: &WorkContext, input: &TaskInput) -> Result<TaskOutcome> {
        let behavior = self.enter(cx, "task")?;
        let success = behavior == StubBehavior::Succeed;
        Ok(TaskOutcome {
            success,
            output: json!({"task_id": input.task_id}),
            error: (!success).then(|| "task reported failure".to_string()),
        })
    }

    fn run_loop(&self, cx: &WorkContext, input: &LoopInput) -> Result<LoopOutcome> {
        let behavior = self.enter(cx, "loop")?;
        let failed = u32::from(behavior == StubBehavior::LogicalFailure);
        Ok(LoopOutcome {
            iterations: input.max_iterations,
            tasks_completed: input.max_iterations.saturating_sub(failed),
            tasks_failed: failed,
            output: json!({}),
        })
    }

    fn run_workflow(&self, cx: &WorkContext, _input: &WorkflowInput) -> Result<WorkflowOutcome> {
        let behavior = self.enter(cx, "workflow")?;
        let mut steps = vec![WorkflowStep {
            name: "parse-prd".to_string(),
            success: true,
            output: json!({}),
            error: None,
        }];
        steps.push(WorkflowStep {
            name: "execute".to_string(),
            success: behavior == StubBehavior::Succeed,
            output: json!({}),
            error: None,
        });
        Ok(WorkflowOutcome { steps })
    }
}

// ── Git fixtures ──

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

pub fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output()?;
    if !output.status.success() {
        return Err(anyhow!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// A throwaway repository with one initial commit.
pub struct GitRepo {
    dir: TempDir,
}

impl GitRepo {
    pub fn init() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path();
        git(path, &["init", "-q"])?;
        git(path, &["config", "user.email", "bench@example.test"])?;
        git(path, &["config", "user.name", "Modelbench"])?;
        git(path, &["config", "commit.gpgsign", "false"])?;
        fs::write(path.join("README.md"), "# fixture\n")?;
        fs::write(path.join("app.txt"), "one\ntwo\nthree\n")?;
        git(path, &["add", "."])?;
        git(path, &["commit", "-q", "-m", "initial"])?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn head(&self) -> Result<String> {
        git(self.path(), &["rev-parse", "HEAD"])
    }

    pub fn commit_file(&self, rel: &str, content: &str, message: &str) -> Result<String> {
        let target = self.path().join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, content)?;
        git(self.path(), &["add", rel])?;
        git(self.path(), &["commit", "-q", "-m", message])?;
        self.head()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot_rules_win_then_fall_back_to_sticky_ones() {
        let shell = ScriptedShell::new()
            .stdout("rev-parse", "sticky\n")
            .once("rev-parse", ShellRunResult::ok("first\n"));
        let cwd = Path::new(".");
        let timeout = Duration::from_secs(1);

        let first = shell.run("git rev-parse HEAD", cwd, timeout).unwrap();
        let second = shell.run("git rev-parse HEAD", cwd, timeout).unwrap();
        let other = shell.run("git status", cwd, timeout).unwrap();

        assert_eq!(first.stdout, "first\n");
        assert_eq!(second.stdout, "sticky\n");
        assert!(other.success());
        assert_eq!(shell.count_matching("rev-parse"), 2);
    }

    #[test]
    fn materialized_worktrees_follow_add_and_remove() {
        let temp = tempfile::tempdir().unwrap();
        let wt = temp.path().join("wt-one");
        let shell = ScriptedShell::new().materializing_worktrees();
        let quoted = shell_words::quote(&wt.to_string_lossy()).into_owned();
        let timeout = Duration::from_secs(1);

        shell
            .run(
                &format!("git worktree add -b bench/r/m {quoted} abc123"),
                temp.path(),
                timeout,
            )
            .unwrap();
        assert!(wt.is_dir());

        shell
            .run(&format!("git worktree remove --force {quoted}"), temp.path(), timeout)
            .unwrap();
        assert!(!wt.exists());
    }
}
