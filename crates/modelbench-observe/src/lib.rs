use anyhow::Result;
use chrono::Utc;
use modelbench_core::{BenchmarkRun, ProgressEvent};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a `tracing` filter directive.
pub const LOG_ENV: &str = "MODELBENCH_LOG";

/// Install a stderr `fmt` subscriber. `MODELBENCH_LOG` wins over the
/// defaults (`warn`, or `debug` for our crates when `verbose`). Calling it
/// twice is harmless.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "warn,modelbench=debug"
    } else {
        "warn"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Appends run progress to `benchmarks/events.log` under the state root.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
    write_lock: Mutex<()>,
}

impl Observer {
    pub fn new(state_root: &Path) -> Result<Self> {
        let dir = state_root.join("benchmarks");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            log_path: dir.join("events.log"),
            verbose: false,
            write_lock: Mutex::new(()),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn record_event(&self, event: &ProgressEvent) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(event)?
        ))
    }

    /// One `RUN` line with the run's final status and summary.
    pub fn record_run(&self, run: &BenchmarkRun) -> Result<()> {
        let line = json!({
            "run_id": run.id,
            "type": run.kind,
            "status": run.status,
            "summary": run.summary(),
        });
        self.append_log_line(&format!("{} RUN {line}", Utc::now().to_rfc3339()))
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[modelbench] {msg}");
        }
    }

    /// Always written to the log file; echoed to stderr in verbose mode.
    pub fn warn_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[modelbench WARN] {msg}");
        }
        if let Err(err) = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339())) {
            tracing::warn!(path = %self.log_path.display(), error = %err, "event log write failed");
        }
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
