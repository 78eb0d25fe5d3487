//! Small JSON documents rewritten as a whole on every change.
//!
//! The worktree manifest and the benchmark index are both kept this way: load
//! the entire document, mutate it in memory, write it back atomically. A
//! reader never observes a half-written file, and a document that is missing
//! or unreadable loads as its default value.

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

pub struct JsonDocument<T> {
    path: PathBuf,
    guard: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current document. Absent or corrupt files yield `T::default()`.
    pub fn load(&self) -> T {
        match read_json::<T>(&self.path) {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "unreadable document, using empty default");
                T::default()
            }
        }
    }

    pub fn save(&self, value: &T) -> Result<()> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| anyhow!("document lock poisoned: {}", self.path.display()))?;
        let _lock = self.lock_file()?;
        write_json_atomic(&self.path, value)
    }

    /// Load, apply `f`, and rewrite the document while holding both the
    /// in-process mutex and an exclusive lock on the sidecar `.lock` file.
    /// Nothing is written when `f` fails.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| anyhow!("document lock poisoned: {}", self.path.display()))?;
        let _lock = self.lock_file()?;
        let mut value = self.load();
        let out = f(&mut value)?;
        write_json_atomic(&self.path, &value)?;
        Ok(out)
    }

    fn lock_file(&self) -> Result<File> {
        let lock_path = self.path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", lock_path.display()))?;
        Ok(file)
    }
}

/// Read and parse a JSON file; `Ok(None)` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Write pretty JSON to a temp file in the target directory, then rename it
/// over `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("invalid document path: {}", path.display()))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
