/// Domain failures callers are expected to branch on. Everything else travels
/// as a plain `anyhow::Error` with context attached.
#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    #[error("invalid benchmark request: {0}")]
    Validation(String),
    #[error("score must be an integer between 1 and 5, got {0}")]
    InvalidScore(i64),
    #[error("benchmark run not found: {0}")]
    RunNotFound(String),
    #[error("worktree not found: {0}")]
    WorktreeNotFound(String),
    #[error("branch already exists: {0}")]
    BranchExists(String),
    #[error("`{command}` failed (exit {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

impl BenchError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
