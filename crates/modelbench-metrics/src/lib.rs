//! Objective metrics read back from a worktree after a model has run in it.

mod parse;

pub use parse::{TestCounts, is_build_command, is_test_command, parse_numstat, parse_test_counts};

use anyhow::Result;
use modelbench_core::config::{UsageConfig, VerificationConfig};
use modelbench_core::shell::{command_line, run_checked};
use modelbench_core::{
    BenchConfig, BenchmarkMetrics, CodeMetrics, CommandResult, ShellRunner, Timing, TokenMetrics,
    VerificationMetrics,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exit code recorded for a verification command killed at its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code recorded for a verification command that could not be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Linear USD estimate over prompt and completion tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self::from_config(&UsageConfig::default())
    }
}

impl CostModel {
    pub fn new(prompt_per_million: f64, completion_per_million: f64) -> Self {
        Self {
            prompt_per_million,
            completion_per_million,
        }
    }

    pub fn from_config(usage: &UsageConfig) -> Self {
        Self::new(usage.cost_per_million_prompt, usage.cost_per_million_completion)
    }

    /// `None` when no tokens were reported.
    pub fn estimate(&self, tokens: &TokenMetrics) -> Option<f64> {
        if tokens.prompt == 0 && tokens.completion == 0 {
            return None;
        }
        Some(
            (tokens.prompt as f64 * self.prompt_per_million
                + tokens.completion as f64 * self.completion_per_million)
                / 1_000_000.0,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOptions {
    pub cwd: PathBuf,
    pub timeout: Duration,
    pub continue_on_error: bool,
}

impl VerificationOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            timeout: DEFAULT_VERIFICATION_TIMEOUT,
            continue_on_error: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn halt_on_error(mut self) -> Self {
        self.continue_on_error = false;
        self
    }
}

pub struct MetricsCollector {
    shell: Arc<dyn ShellRunner>,
    cost: CostModel,
    git_timeout: Duration,
    verification_timeout: Duration,
    continue_on_error: bool,
}

impl MetricsCollector {
    pub fn new(shell: Arc<dyn ShellRunner>) -> Self {
        Self {
            shell,
            cost: CostModel::default(),
            git_timeout: DEFAULT_GIT_TIMEOUT,
            verification_timeout: DEFAULT_VERIFICATION_TIMEOUT,
            continue_on_error: true,
        }
    }

    pub fn from_config(cfg: &BenchConfig, shell: Arc<dyn ShellRunner>) -> Self {
        Self::new(shell)
            .with_cost_model(CostModel::from_config(&cfg.usage))
            .with_git_timeout(cfg.git.timeout())
            .with_verification(&cfg.verification)
    }

    pub fn with_cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_git_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn with_verification(mut self, cfg: &VerificationConfig) -> Self {
        self.verification_timeout = cfg.timeout();
        self.continue_on_error = cfg.continue_on_error;
        self
    }

    pub fn estimate_cost(&self, tokens: &TokenMetrics) -> Option<f64> {
        self.cost.estimate(tokens)
    }

    /// Diff the worktree at `path` against `base`. Failures degrade to empty
    /// metrics.
    pub fn collect_code_metrics(&self, path: &Path, base: &str) -> CodeMetrics {
        match self.try_collect_code_metrics(path, base) {
            Ok(metrics) => metrics,
            Err(err) => {
                tracing::warn!(path = %path.display(), base, error = %format!("{err:#}"), "code metrics unavailable");
                CodeMetrics::default()
            }
        }
    }

    fn try_collect_code_metrics(&self, path: &Path, base: &str) -> Result<CodeMetrics> {
        // Untracked files only show up in `git diff` once they are in the index.
        if let Err(err) = self.git(path, &["add", "--intent-to-add", "--all"]) {
            tracing::debug!(error = %err, "intent-to-add failed");
        }

        let numstat = self.git(path, &["diff", "--numstat", base])?;
        let (lines_added, lines_removed) = parse_numstat(&numstat);
        let new_files = file_list(&self.git(path, &["diff", "--name-only", "--diff-filter=A", base])?);
        let modified_files =
            file_list(&self.git(path, &["diff", "--name-only", "--diff-filter=M", base])?);
        let changed = file_list(&self.git(path, &["diff", "--name-only", base])?);

        Ok(CodeMetrics {
            lines_added,
            lines_removed,
            files_changed: changed.len() as u64,
            new_files,
            modified_files,
        })
    }

    /// Run `commands` in order under `opts.cwd`, scanning test output for
    /// pass/fail counts and tracking build failures.
    pub fn run_verification(
        &self,
        commands: &[String],
        opts: &VerificationOptions,
    ) -> VerificationMetrics {
        let mut metrics = VerificationMetrics::default();
        for command in commands {
            let result = self.run_command(command, opts);
            let passed = result.passed();

            if is_test_command(command) {
                let combined = format!("{}\n{}", result.stdout, result.stderr);
                if let Some(counts) = parse_test_counts(&combined) {
                    metrics.tests_passed += counts.passed;
                    metrics.tests_failed += counts.failed;
                    metrics.tests_run += counts.total;
                }
            }
            if is_build_command(command) && !passed {
                metrics.build_success = false;
            }
            metrics.command_results.push(result);

            if !passed && !opts.continue_on_error {
                tracing::debug!(command = %command, "verification halted on failure");
                break;
            }
        }
        metrics
    }

    fn run_command(&self, command: &str, opts: &VerificationOptions) -> CommandResult {
        let started = Instant::now();
        match self.shell.run(command, &opts.cwd, opts.timeout) {
            Ok(out) => {
                let exit_code = if out.timed_out {
                    TIMEOUT_EXIT_CODE
                } else {
                    out.status.unwrap_or(SPAWN_FAILURE_EXIT_CODE)
                };
                CommandResult {
                    command: command.to_string(),
                    exit_code,
                    stdout: out.stdout,
                    stderr: out.stderr,
                    duration_ms: elapsed_ms(started),
                    timed_out: out.timed_out,
                }
            }
            Err(err) => {
                tracing::warn!(command, error = %err, "verification command failed to start");
                CommandResult {
                    command: command.to_string(),
                    exit_code: SPAWN_FAILURE_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    duration_ms: elapsed_ms(started),
                    timed_out: false,
                }
            }
        }
    }

    /// Everything measurable after a run: code diff, verification, tokens
    /// and cost. Verification is skipped when `commands` is empty.
    pub fn collect_all(
        &self,
        path: &Path,
        base: &str,
        timing: Timing,
        tokens: Option<TokenMetrics>,
        commands: &[String],
    ) -> BenchmarkMetrics {
        let code = self.collect_code_metrics(path, base);
        let verification = if commands.is_empty() {
            None
        } else {
            let opts = VerificationOptions {
                cwd: path.to_path_buf(),
                timeout: self.verification_timeout,
                continue_on_error: self.continue_on_error,
            };
            Some(self.run_verification(commands, &opts))
        };
        let tokens = tokens.filter(|t| t.total > 0 || t.prompt > 0 || t.completion > 0);
        let cost = tokens.as_ref().and_then(|t| self.estimate_cost(t));
        BenchmarkMetrics {
            timing,
            tokens,
            code: Some(code),
            verification,
            cost,
        }
    }

    fn git(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        let cmd = command_line(std::iter::once("git").chain(args.iter().copied()));
        run_checked(self.shell.as_ref(), &cmd, cwd, self.git_timeout)
    }
}

fn file_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelbench_core::{PlatformShellRunner, ShellRunResult};
    use modelbench_testkit::{GitRepo, ScriptedShell, git_available};
    use std::fs;

    fn collector(shell: ScriptedShell) -> MetricsCollector {
        MetricsCollector::new(Arc::new(shell))
    }

    #[test]
    fn code_metrics_from_numstat_and_name_lists() {
        let shell = ScriptedShell::new()
            .stdout("diff --numstat", "50\t10\tfile.ts\n100\t0\tnew.ts\n")
            .stdout("--diff-filter=A", "new.ts\n")
            .stdout("--diff-filter=M", "file.ts\n")
            .stdout("diff --name-only base", "file.ts\nnew.ts\n");
        let metrics = collector(shell).collect_code_metrics(Path::new("."), "base");

        assert_eq!(metrics.lines_added, 150);
        assert_eq!(metrics.lines_removed, 10);
        assert_eq!(metrics.files_changed, 2);
        assert_eq!(metrics.new_files, vec!["new.ts".to_string()]);
        assert_eq!(metrics.modified_files, vec!["file.ts".to_string()]);
    }

    #[test]
    fn empty_diff_yields_zero_metrics() {
        let metrics = collector(ScriptedShell::new()).collect_code_metrics(Path::new("."), "base");
        assert_eq!(metrics, CodeMetrics::default());
    }

    #[test]
    fn diff_failure_degrades_to_zero_metrics() {
        let shell = ScriptedShell::new()
            .on("diff --numstat", ShellRunResult::failed(128, "fatal: bad revision"));
        let metrics = collector(shell).collect_code_metrics(Path::new("."), "nope");
        assert_eq!(metrics, CodeMetrics::default());
    }

    #[test]
    fn verification_sums_test_counts_and_flags_build_failure() {
        let shell = ScriptedShell::new()
            .stdout(
                "npm test",
                "Tests:       2 failed, 10 passed, 12 total\n",
            )
            .on("npm run build", ShellRunResult::failed(2, "error TS2304"))
            .stdout(
                "cargo test",
                "test result: ok. 3 passed; 0 failed; 0 ignored\n",
            );
        let commands = vec![
            "npm test".to_string(),
            "npm run build".to_string(),
            "cargo test".to_string(),
        ];
        let metrics = collector(shell)
            .run_verification(&commands, &VerificationOptions::new("."));

        assert_eq!(metrics.tests_passed, 13);
        assert_eq!(metrics.tests_failed, 2);
        assert_eq!(metrics.tests_run, 15);
        assert!(!metrics.build_success);
        assert_eq!(metrics.command_results.len(), 3);
        assert_eq!(metrics.command_results[1].exit_code, 2);
    }

    #[test]
    fn halt_on_error_stops_at_first_failure() {
        let shell = ScriptedShell::new().on("make lint", ShellRunResult::failed(1, "bad"));
        let commands = vec!["make lint".to_string(), "make test".to_string()];
        let metrics = collector(shell)
            .run_verification(&commands, &VerificationOptions::new(".").halt_on_error());
        assert_eq!(metrics.command_results.len(), 1);
    }

    #[test]
    fn spawn_failure_records_minus_one() {
        let shell = ScriptedShell::new().spawn_error("missing-tool", "no such file");
        let metrics = collector(shell)
            .run_verification(&["missing-tool --check".to_string()], &VerificationOptions::new("."));
        let result = &metrics.command_results[0];
        assert_eq!(result.exit_code, SPAWN_FAILURE_EXIT_CODE);
        assert!(result.stderr.contains("no such file"));
    }

    #[cfg(unix)]
    #[test]
    fn timed_out_command_records_124_and_partial_output() {
        let collector = MetricsCollector::new(Arc::new(PlatformShellRunner));
        let opts = VerificationOptions::new(".").with_timeout(Duration::from_millis(200));
        let metrics = collector.run_verification(&["echo started; sleep 5".to_string()], &opts);
        let result = &metrics.command_results[0];
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.timed_out);
        assert!(result.stdout.contains("started"));
    }

    #[test]
    fn cost_only_when_tokens_present() {
        let model = CostModel::new(3.0, 15.0);
        assert_eq!(model.estimate(&TokenMetrics::default()), None);
        let cost = model
            .estimate(&TokenMetrics {
                prompt: 1_000_000,
                completion: 100_000,
                total: 1_100_000,
            })
            .unwrap();
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn configured_pricing_prices_collected_tokens() {
        let mut cfg = BenchConfig::default();
        cfg.usage.cost_per_million_prompt = 2.0;
        cfg.usage.cost_per_million_completion = 10.0;
        let collector = MetricsCollector::from_config(&cfg, Arc::new(ScriptedShell::new()));
        let tokens = TokenMetrics {
            prompt: 500_000,
            completion: 200_000,
            total: 700_000,
        };
        let expected = collector.estimate_cost(&tokens).unwrap();
        assert!((expected - 3.0).abs() < 1e-9);

        let now = chrono::Utc::now();
        let timing = Timing {
            started_at: now,
            completed_at: now,
            duration_ms: 5,
            time_to_first_output_ms: None,
        };
        let metrics = collector.collect_all(Path::new("."), "base", timing, Some(tokens), &[]);
        assert_eq!(metrics.cost, Some(expected));
    }

    #[test]
    fn collect_all_skips_verification_without_commands() {
        let now = chrono::Utc::now();
        let timing = Timing {
            started_at: now,
            completed_at: now,
            duration_ms: 5,
            time_to_first_output_ms: None,
        };
        let metrics = collector(ScriptedShell::new()).collect_all(
            Path::new("."),
            "base",
            timing,
            Some(TokenMetrics::default()),
            &[],
        );
        assert!(metrics.verification.is_none());
        assert!(metrics.tokens.is_none());
        assert!(metrics.cost.is_none());
        assert_eq!(metrics.code, Some(CodeMetrics::default()));
    }

    #[test]
    fn real_repository_counts_new_and_modified_files() {
        if !git_available() {
            return;
        }
        let repo = GitRepo::init().unwrap();
        let base = repo.head().unwrap();
        fs::write(repo.path().join("app.txt"), "one\nTWO\nthree\nfour\n").unwrap();
        fs::write(repo.path().join("added.txt"), "a\nb\n").unwrap();

        let collector = MetricsCollector::new(Arc::new(PlatformShellRunner));
        let metrics = collector.collect_code_metrics(repo.path(), &base);

        assert_eq!(metrics.files_changed, 2);
        assert_eq!(metrics.new_files, vec!["added.txt".to_string()]);
        assert_eq!(metrics.modified_files, vec!["app.txt".to_string()]);
        assert_eq!(metrics.lines_added, 4);
        assert_eq!(metrics.lines_removed, 1);
    }
}
