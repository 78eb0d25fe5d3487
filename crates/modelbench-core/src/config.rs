use crate::{Result, runtime_dir};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Directory holding worktrees and benchmark records. Relative paths are
    /// resolved against the source repository.
    pub root_dir: String,
    pub pool: PoolConfig,
    pub git: GitConfig,
    pub verification: VerificationConfig,
    pub usage: UsageConfig,
    /// Provider name → credential source.
    pub providers: HashMap<String, ProviderCredential>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            root_dir: ".modelbench".to_string(),
            pool: PoolConfig::default(),
            git: GitConfig::default(),
            verification: VerificationConfig::default(),
            usage: UsageConfig::default(),
            providers: default_providers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Default ceiling on models executing at once. 0 means unbounded.
    pub max_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_concurrency: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub timeout_seconds: u64,
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 60,
            branch_prefix: "bench".to_string(),
        }
    }
}

impl GitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Commands run after task, loop and workflow benchmarks when the run
    /// itself does not list any.
    pub commands: Vec<String>,
    pub timeout_seconds: u64,
    pub continue_on_error: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_seconds: 120,
            continue_on_error: true,
        }
    }
}

impl VerificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub cost_per_million_prompt: f64,
    pub cost_per_million_completion: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            cost_per_million_prompt: 3.0,
            cost_per_million_completion: 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredential {
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

fn default_providers() -> HashMap<String, ProviderCredential> {
    [
        ("anthropic", "ANTHROPIC_API_KEY"),
        ("openai", "OPENAI_API_KEY"),
        ("google", "GOOGLE_API_KEY"),
        ("perplexity", "PERPLEXITY_API_KEY"),
        ("xai", "XAI_API_KEY"),
        ("openrouter", "OPENROUTER_API_KEY"),
        ("mistral", "MISTRAL_API_KEY"),
        ("deepseek", "DEEPSEEK_API_KEY"),
    ]
    .into_iter()
    .map(|(name, env)| {
        (
            name.to_string(),
            ProviderCredential {
                api_key_env: env.to_string(),
            },
        )
    })
    .collect()
}

/// Environment variables applied after every file layer.
pub const ROOT_DIR_ENV: &str = "MODELBENCH_ROOT_DIR";
pub const MAX_CONCURRENCY_ENV: &str = "MODELBENCH_MAX_CONCURRENCY";
pub const VERIFY_TIMEOUT_ENV: &str = "MODELBENCH_VERIFY_TIMEOUT";

/// One config file. Every key is optional; present keys override the
/// layers below, absent ones leave them alone.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigOverlay {
    root_dir: Option<String>,
    pool: Option<PoolOverlay>,
    git: Option<GitOverlay>,
    verification: Option<VerificationOverlay>,
    usage: Option<UsageOverlay>,
    providers: HashMap<String, ProviderCredential>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PoolOverlay {
    max_concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GitOverlay {
    timeout_seconds: Option<u64>,
    branch_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct VerificationOverlay {
    commands: Option<Vec<String>>,
    timeout_seconds: Option<u64>,
    continue_on_error: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct UsageOverlay {
    cost_per_million_prompt: Option<f64>,
    cost_per_million_completion: Option<f64>,
}

impl BenchConfig {
    /// `~/.modelbench/config.toml`: machine-wide pricing and credentials.
    pub fn user_config_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".modelbench/config.toml"))
    }

    /// `<repo>/.modelbench/config.toml`: shared benchmark settings.
    pub fn project_config_path(repo: &Path) -> PathBuf {
        runtime_dir(repo).join("config.toml")
    }

    /// `<repo>/.modelbench/config.local.toml`: uncommitted overrides.
    pub fn local_config_path(repo: &Path) -> PathBuf {
        runtime_dir(repo).join("config.local.toml")
    }

    /// Defaults, then the user, project and local config files, then
    /// `MODELBENCH_*` environment overrides. Missing files are skipped;
    /// unknown keys are an error.
    pub fn load(repo: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        if let Some(user) = Self::user_config_path() {
            paths.push(user);
        }
        paths.push(Self::project_config_path(repo));
        paths.push(Self::local_config_path(repo));
        Self::load_layers(&paths, |key| std::env::var(key).ok())
    }

    fn load_layers(paths: &[PathBuf], env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        for path in paths {
            if !path.is_file() {
                continue;
            }
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let overlay: ConfigOverlay = toml::from_str(&raw)
                .with_context(|| format!("invalid config in {}", path.display()))?;
            cfg.apply(overlay);
        }
        cfg.apply_env(env)?;
        Ok(cfg)
    }

    fn apply(&mut self, overlay: ConfigOverlay) {
        if let Some(root_dir) = overlay.root_dir {
            self.root_dir = root_dir;
        }
        if let Some(n) = overlay.pool.and_then(|pool| pool.max_concurrency) {
            self.pool.max_concurrency = n;
        }
        if let Some(git) = overlay.git {
            if let Some(secs) = git.timeout_seconds {
                self.git.timeout_seconds = secs;
            }
            if let Some(prefix) = git.branch_prefix {
                self.git.branch_prefix = prefix;
            }
        }
        if let Some(verification) = overlay.verification {
            if let Some(commands) = verification.commands {
                self.verification.commands = commands;
            }
            if let Some(secs) = verification.timeout_seconds {
                self.verification.timeout_seconds = secs;
            }
            if let Some(flag) = verification.continue_on_error {
                self.verification.continue_on_error = flag;
            }
        }
        if let Some(usage) = overlay.usage {
            if let Some(rate) = usage.cost_per_million_prompt {
                self.usage.cost_per_million_prompt = rate;
            }
            if let Some(rate) = usage.cost_per_million_completion {
                self.usage.cost_per_million_completion = rate;
            }
        }
        for (provider, credential) in overlay.providers {
            self.providers.insert(provider.to_ascii_lowercase(), credential);
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root_dir) = env(ROOT_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            self.root_dir = root_dir;
        }
        if let Some(raw) = env(MAX_CONCURRENCY_ENV) {
            self.pool.max_concurrency = raw
                .trim()
                .parse()
                .with_context(|| format!("{MAX_CONCURRENCY_ENV} must be a number, got {raw:?}"))?;
        }
        if let Some(raw) = env(VERIFY_TIMEOUT_ENV) {
            self.verification.timeout_seconds = raw
                .trim()
                .parse()
                .with_context(|| format!("{VERIFY_TIMEOUT_ENV} must be seconds, got {raw:?}"))?;
        }
        Ok(())
    }

    /// Write the full config to the project config file.
    pub fn save(&self, repo: &Path) -> Result<()> {
        let path = Self::project_config_path(repo);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Absolute root for persisted state of the repository at `repo`.
    pub fn root_path(&self, repo: &Path) -> PathBuf {
        repo.join(&self.root_dir)
    }

    pub fn api_key_env(&self, provider: &str) -> Option<&str> {
        self.providers
            .get(&provider.to_ascii_lowercase())
            .map(|p| p.api_key_env.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = BenchConfig::default();
        assert_eq!(cfg.verification.timeout(), Duration::from_secs(120));
        assert!(cfg.verification.continue_on_error);
        assert_eq!(cfg.git.branch_prefix, "bench");
        assert_eq!(cfg.api_key_env("Anthropic"), Some("ANTHROPIC_API_KEY"));
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn later_files_override_only_the_keys_they_set() {
        let temp = tempfile::tempdir().expect("tempdir");
        let user = temp.path().join("user.toml");
        fs::write(
            &user,
            "[usage]\ncost_per_million_prompt = 1.5\n\n[providers.Acme]\napi_key_env = \"ACME_KEY\"\n",
        )
        .expect("user");
        let project = temp.path().join("config.toml");
        fs::write(
            &project,
            "root_dir = \".bench\"\n\n[pool]\nmax_concurrency = 8\n\n[verification]\ncommands = [\"cargo test\"]\n",
        )
        .expect("project");
        let local = temp.path().join("config.local.toml");
        fs::write(&local, "[pool]\nmax_concurrency = 2\n").expect("local");

        let cfg = BenchConfig::load_layers(&[user, project, local], no_env).expect("load");
        assert_eq!(cfg.root_dir, ".bench");
        assert_eq!(cfg.pool.max_concurrency, 2);
        assert_eq!(cfg.verification.commands, vec!["cargo test".to_string()]);
        assert_eq!(cfg.verification.timeout_seconds, 120);
        assert_eq!(cfg.usage.cost_per_million_prompt, 1.5);
        assert_eq!(cfg.usage.cost_per_million_completion, 15.0);
        assert_eq!(cfg.api_key_env("acme"), Some("ACME_KEY"));
        assert_eq!(cfg.api_key_env("openai"), Some("OPENAI_API_KEY"));
    }

    #[test]
    fn environment_overrides_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("config.toml");
        fs::write(&project, "[pool]\nmax_concurrency = 8\n").expect("project");

        let env = |key: &str| match key {
            MAX_CONCURRENCY_ENV => Some(" 5 ".to_string()),
            VERIFY_TIMEOUT_ENV => Some("30".to_string()),
            _ => None,
        };
        let cfg = BenchConfig::load_layers(&[project.clone()], env).expect("load");
        assert_eq!(cfg.pool.max_concurrency, 5);
        assert_eq!(cfg.verification.timeout(), Duration::from_secs(30));

        let bad = |key: &str| (key == MAX_CONCURRENCY_ENV).then(|| "lots".to_string());
        let err = BenchConfig::load_layers(&[project], bad).expect_err("bad number");
        assert!(format!("{err:#}").contains(MAX_CONCURRENCY_ENV));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("config.toml");
        fs::write(&project, "[pool]\nmax_concurency = 8\n").expect("project");

        let err = BenchConfig::load_layers(&[project], no_env).expect_err("typo");
        assert!(format!("{err:#}").contains("invalid config"));
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = BenchConfig::default();
        cfg.verification.commands = vec!["cargo test -q".to_string()];
        cfg.pool.max_concurrency = 6;
        cfg.save(temp.path()).expect("save");

        let path = BenchConfig::project_config_path(temp.path());
        let loaded = BenchConfig::load_layers(&[path], no_env).expect("load");
        assert_eq!(loaded, cfg);
    }
}
