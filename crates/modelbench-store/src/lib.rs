//! Durable benchmark runs on disk.
//!
//! ```text
//! benchmarks/
//!   index.json                 newest run first
//!   runs/{id}/run.json         run metadata without results or scores
//!   runs/{id}/scores.json
//!   runs/{id}/results/{model}.json
//! ```

use anyhow::Result;
use chrono::{DateTime, Utc};
use modelbench_core::doc::{read_json, write_json_atomic};
use modelbench_core::naming::model_file_stem;
use modelbench_core::{
    BenchConfig, BenchError, BenchmarkKind, BenchmarkRun, JsonDocument, ModelResult, RunConfig,
    RunStatus, Score, WorkInput,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BenchmarkKind,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub model_count: usize,
}

impl IndexEntry {
    fn of(run: &BenchmarkRun) -> Self {
        Self {
            id: run.id.clone(),
            kind: run.kind,
            status: run.status,
            created_at: run.created_at,
            completed_at: run.completed_at,
            model_count: run.config.models.len(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BenchmarkIndex {
    #[serde(default)]
    runs: Vec<IndexEntry>,
}

/// `run.json`: the run without its results and scores, which live in
/// sibling files.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunMetadata {
    id: String,
    #[serde(rename = "type")]
    kind: BenchmarkKind,
    input: WorkInput,
    config: RunConfig,
    base_commit: String,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    status: RunStatus,
    #[serde(default)]
    result_models: Vec<String>,
}

impl RunMetadata {
    fn of(run: &BenchmarkRun) -> Self {
        Self {
            id: run.id.clone(),
            kind: run.kind,
            input: run.input.clone(),
            config: run.config.clone(),
            base_commit: run.base_commit.clone(),
            created_at: run.created_at,
            completed_at: run.completed_at,
            status: run.status,
            result_models: run.results.iter().map(|r| r.model_id.clone()).collect(),
        }
    }

    fn into_run(self, results: Vec<ModelResult>, scores: Vec<Score>) -> BenchmarkRun {
        BenchmarkRun {
            id: self.id,
            kind: self.kind,
            input: self.input,
            config: self.config,
            base_commit: self.base_commit,
            results,
            scores,
            created_at: self.created_at,
            completed_at: self.completed_at,
            status: self.status,
        }
    }

    fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            id: self.id.clone(),
            kind: self.kind,
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            model_count: self.config.models.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub kind: Option<BenchmarkKind>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl RunFilter {
    pub fn with_kind(mut self, kind: BenchmarkKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &IndexEntry) -> bool {
        self.kind.is_none_or(|k| k == entry.kind) && self.status.is_none_or(|s| s == entry.status)
    }
}

pub struct BenchmarkStore {
    root: PathBuf,
    index: JsonDocument<BenchmarkIndex>,
}

impl BenchmarkStore {
    /// Store runs under `state_root/benchmarks`.
    pub fn new(state_root: &Path) -> Self {
        let root = state_root.join("benchmarks");
        let index = JsonDocument::new(root.join("index.json"));
        Self { root, index }
    }

    pub fn from_config(repo: &Path, cfg: &BenchConfig) -> Self {
        Self::new(&cfg.root_path(repo))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the whole run, replacing any earlier copy, and upsert its index
    /// entry.
    pub fn save(&self, run: &BenchmarkRun) -> Result<()> {
        let dir = self.run_dir(&run.id)?;
        for result in &run.results {
            write_json_atomic(&self.result_path(&dir, &result.model_id), result)?;
        }
        write_json_atomic(&dir.join("scores.json"), &run.scores)?;
        write_json_atomic(&dir.join("run.json"), &RunMetadata::of(run))?;
        self.upsert_index(IndexEntry::of(run))
    }

    pub fn get(&self, run_id: &str) -> Result<Option<BenchmarkRun>> {
        let dir = self.run_dir(run_id)?;
        let Some(meta) = read_json::<RunMetadata>(&dir.join("run.json"))? else {
            return Ok(None);
        };

        let mut results = Vec::with_capacity(meta.result_models.len());
        for model_id in &meta.result_models {
            let path = self.result_path(&dir, model_id);
            match read_json::<ModelResult>(&path) {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {
                    tracing::warn!(run_id, model_id = %model_id, "result file missing, skipping")
                }
                Err(err) => {
                    tracing::warn!(run_id, model_id = %model_id, error = %format!("{err:#}"), "result file unreadable, skipping")
                }
            }
        }
        let scores = self.read_scores(&dir);
        Ok(Some(meta.into_run(results, scores)))
    }

    /// Full runs matching `filter`, newest first. A run whose record is
    /// missing or unreadable is logged and left out.
    pub fn list(&self, filter: &RunFilter) -> Result<Vec<BenchmarkRun>> {
        let mut runs = Vec::new();
        for entry in self.list_summaries(filter) {
            match self.get(&entry.id) {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => tracing::warn!(run_id = %entry.id, "indexed run has no record"),
                Err(err) => tracing::warn!(
                    run_id = %entry.id,
                    error = %format!("{err:#}"),
                    "run record unreadable, skipping"
                ),
            }
        }
        Ok(runs)
    }

    /// Index entries matching `filter`, newest first.
    pub fn list_summaries(&self, filter: &RunFilter) -> Vec<IndexEntry> {
        let matching = self
            .index
            .load()
            .runs
            .into_iter()
            .filter(|e| filter.matches(e))
            .skip(filter.offset);
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Number of runs matching the kind and status of `filter`; pagination
    /// is ignored.
    pub fn count(&self, filter: &RunFilter) -> usize {
        self.index
            .load()
            .runs
            .iter()
            .filter(|e| filter.matches(e))
            .count()
    }

    pub fn exists(&self, run_id: &str) -> bool {
        self.run_dir(run_id)
            .map(|dir| dir.join("run.json").is_file())
            .unwrap_or(false)
    }

    /// Record `score`, replacing any earlier score for the same model.
    /// Out-of-range scores are rejected before anything is written.
    pub fn add_score(&self, run_id: &str, score: Score) -> Result<()> {
        score.validate()?;
        let dir = self.existing_run_dir(run_id)?;
        let mut scores = self.read_scores(&dir);
        scores.retain(|s| s.model_id != score.model_id);
        scores.push(score);
        write_json_atomic(&dir.join("scores.json"), &scores)
    }

    pub fn add_result(&self, run_id: &str, result: &ModelResult) -> Result<()> {
        let dir = self.existing_run_dir(run_id)?;
        let mut meta = self.read_metadata(run_id, &dir)?;
        write_json_atomic(&self.result_path(&dir, &result.model_id), result)?;
        if !meta.result_models.contains(&result.model_id) {
            meta.result_models.push(result.model_id.clone());
            write_json_atomic(&dir.join("run.json"), &meta)?;
        }
        Ok(())
    }

    /// Set the run's status. Terminal statuses stamp `completed_at` when
    /// none is given.
    pub fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let dir = self.existing_run_dir(run_id)?;
        let mut meta = self.read_metadata(run_id, &dir)?;
        meta.status = status;
        meta.completed_at = match completed_at {
            Some(at) => Some(at),
            None if status.is_terminal() => Some(meta.completed_at.unwrap_or_else(Utc::now)),
            None => meta.completed_at,
        };
        write_json_atomic(&dir.join("run.json"), &meta)?;
        self.upsert_index(meta.index_entry())
    }

    /// Drop the run from the index and delete its `run.json`. With `cascade`
    /// the results and scores go too. Returns whether the run was known.
    pub fn delete(&self, run_id: &str, cascade: bool) -> Result<bool> {
        let dir = self.run_dir(run_id)?;
        let indexed = self.index.update(|index| {
            let before = index.runs.len();
            index.runs.retain(|e| e.id != run_id);
            Ok(index.runs.len() != before)
        })?;
        let had_record = dir.join("run.json").is_file();
        if cascade {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        } else if had_record {
            fs::remove_file(dir.join("run.json"))?;
        }
        Ok(indexed || had_record)
    }

    fn upsert_index(&self, entry: IndexEntry) -> Result<()> {
        self.index.update(|index| {
            match index.runs.iter_mut().find(|e| e.id == entry.id) {
                Some(existing) => *existing = entry,
                None => index.runs.insert(0, entry),
            }
            Ok(())
        })
    }

    fn read_scores(&self, dir: &Path) -> Vec<Score> {
        match read_json::<Vec<Score>>(&dir.join("scores.json")) {
            Ok(scores) => scores.unwrap_or_default(),
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %format!("{err:#}"), "scores unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    fn read_metadata(&self, run_id: &str, dir: &Path) -> Result<RunMetadata> {
        read_json::<RunMetadata>(&dir.join("run.json"))?
            .ok_or_else(|| BenchError::RunNotFound(run_id.to_string()).into())
    }

    fn existing_run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let dir = self.run_dir(run_id)?;
        if !dir.join("run.json").is_file() {
            return Err(BenchError::RunNotFound(run_id.to_string()).into());
        }
        Ok(dir)
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        let safe = !run_id.is_empty()
            && run_id != "."
            && run_id != ".."
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !safe {
            return Err(BenchError::validation(format!("invalid run id: {run_id:?}")).into());
        }
        Ok(self.root.join("runs").join(run_id))
    }

    fn result_path(&self, dir: &Path, model_id: &str) -> PathBuf {
        dir.join("results")
            .join(format!("{}.json", model_file_stem(model_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelbench_core::{
        BenchmarkMetrics, ModelConfig, ModelStatus, OperationInput, TaskInput, Timing,
    };
    use serde_json::json;

    fn run(id: &str, kind_input: WorkInput, models: &[&str]) -> BenchmarkRun {
        let configs = models
            .iter()
            .map(|m| {
                let (provider, model) = m.split_once(':').unwrap();
                ModelConfig::new(provider, model)
            })
            .collect();
        BenchmarkRun::new(
            id.to_string(),
            kind_input,
            RunConfig::new(configs),
            "deadbeef".to_string(),
        )
    }

    fn result(model_id: &str, status: ModelStatus) -> ModelResult {
        let now = Utc::now();
        ModelResult {
            model_id: model_id.to_string(),
            worktree: None,
            status,
            duration_ms: 42,
            output: json!({"ok": status == ModelStatus::Success}),
            error: None,
            metrics: BenchmarkMetrics::timing_only(Timing {
                started_at: now,
                completed_at: now,
                duration_ms: 42,
                time_to_first_output_ms: Some(7),
            }),
            timestamp: now,
        }
    }

    fn finished(mut run: BenchmarkRun, status: RunStatus) -> BenchmarkRun {
        run.status = status;
        run.completed_at = Some(Utc::now());
        run
    }

    #[test]
    fn save_then_get_round_trips_results_and_scores() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let mut r = run(
            "bench-task-1-aaaaaa",
            WorkInput::Task(TaskInput::new("3")),
            &["anthropic:claude", "openai:gpt-4o"],
        );
        r.results = vec![
            result("anthropic:claude", ModelStatus::Success),
            result("openai:gpt-4o", ModelStatus::Failed),
        ];
        r.upsert_score(Score::new("anthropic:claude", 4, Some("tidy".into()), None).unwrap());
        let r = finished(r, RunStatus::Partial);

        store.save(&r).unwrap();
        assert_eq!(store.get(&r.id).unwrap(), Some(r.clone()));
        let dir = store.root().join("runs/bench-task-1-aaaaaa");
        assert!(store.result_path(&dir, "anthropic:claude").is_file());
        let raw: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(store.root().join("runs/bench-task-1-aaaaaa/run.json")).unwrap(),
        )
        .unwrap();
        assert!(raw.get("results").is_none());
        assert_eq!(raw["result_models"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn index_is_newest_first_and_updated_in_place() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let first = run("run-a", WorkInput::Task(TaskInput::new("1")), &["a:b"]);
        let second = run("run-b", WorkInput::Task(TaskInput::new("1")), &["a:b"]);
        store.save(&first).unwrap();
        store.save(&second).unwrap();
        store.save(&finished(first, RunStatus::Completed)).unwrap();

        let ids: Vec<String> = store
            .list_summaries(&RunFilter::default())
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["run-b", "run-a"]);
        assert_eq!(
            store.list_summaries(&RunFilter::default())[1].status,
            RunStatus::Completed
        );
    }

    #[test]
    fn list_filters_by_status_and_kind_and_paginates() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let op = || WorkInput::Operation(OperationInput::new("parse-prd"));
        let task = || WorkInput::Task(TaskInput::new("1"));
        store.save(&finished(run("r1", op(), &["a:b"]), RunStatus::Completed)).unwrap();
        store.save(&run("r2", task(), &["a:b"])).unwrap();
        store.save(&finished(run("r3", task(), &["a:b"]), RunStatus::Completed)).unwrap();
        store.save(&finished(run("r4", op(), &["a:b"]), RunStatus::Partial)).unwrap();

        let completed = store
            .list(&RunFilter::default().with_status(RunStatus::Completed))
            .unwrap();
        let ids: Vec<&str> = completed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r1"]);

        let ops = RunFilter::default().with_kind(BenchmarkKind::Operation);
        assert_eq!(store.count(&ops), 2);
        let page = store.list_summaries(&RunFilter::default().page(1, 2));
        let ids: Vec<&str> = page.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
        assert_eq!(store.count(&RunFilter::default().page(1, 2)), 4);
    }

    #[test]
    fn add_score_rejects_out_of_range_before_writing() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let r = run("run-s", WorkInput::Task(TaskInput::new("1")), &["a:b"]);
        store.save(&r).unwrap();

        for bad in [0u8, 6] {
            let score = Score {
                model_id: "a:b".into(),
                score: bad,
                notes: None,
                scored_at: Utc::now(),
                scored_by: None,
            };
            let err = store.add_score(&r.id, score).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<BenchError>(),
                Some(BenchError::InvalidScore(_))
            ));
        }
        assert!(store.get(&r.id).unwrap().unwrap().scores.is_empty());
    }

    #[test]
    fn add_score_replaces_per_model() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let r = run("run-s", WorkInput::Task(TaskInput::new("1")), &["a:b", "a:c"]);
        store.save(&r).unwrap();
        store.add_score(&r.id, Score::new("a:b", 2, None, None).unwrap()).unwrap();
        store.add_score(&r.id, Score::new("a:c", 5, None, None).unwrap()).unwrap();
        store
            .add_score(&r.id, Score::new("a:b", 3, None, Some("reviewer".into())).unwrap())
            .unwrap();

        let loaded = store.get(&r.id).unwrap().unwrap();
        assert_eq!(loaded.scores.len(), 2);
        assert_eq!(loaded.score_for("a:b").map(|s| s.score), Some(3));
    }

    #[test]
    fn add_score_to_unknown_run_is_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let err = store
            .add_score("nope", Score::new("a:b", 3, None, None).unwrap())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BenchError>(),
            Some(BenchError::RunNotFound(id)) if id == "nope"
        ));
    }

    #[test]
    fn add_result_and_update_status() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let r = run("run-r", WorkInput::Task(TaskInput::new("1")), &["a:b"]);
        store.save(&r).unwrap();

        store.add_result(&r.id, &result("a:b", ModelStatus::Success)).unwrap();
        store.update_status(&r.id, RunStatus::Completed, None).unwrap();

        let loaded = store.get(&r.id).unwrap().unwrap();
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(
            store.list_summaries(&RunFilter::default())[0].status,
            RunStatus::Completed
        );
    }

    #[test]
    fn missing_result_file_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let mut r = run("run-m", WorkInput::Task(TaskInput::new("1")), &["a:b", "a:c"]);
        r.results = vec![
            result("a:b", ModelStatus::Success),
            result("a:c", ModelStatus::Success),
        ];
        store.save(&r).unwrap();
        fs::remove_file(store.result_path(&store.root().join("runs/run-m"), "a:c")).unwrap();

        let loaded = store.get(&r.id).unwrap().unwrap();
        assert_eq!(loaded.results.len(), 1);
        assert_eq!(loaded.results[0].model_id, "a:b");
    }

    #[test]
    fn model_ids_that_sanitize_alike_keep_separate_results() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let mut r = run("run-c", WorkInput::Task(TaskInput::new("1")), &["a:b_c", "a_b:c"]);
        r.results = vec![
            result("a:b_c", ModelStatus::Success),
            result("a_b:c", ModelStatus::Error),
        ];
        let r = finished(r, RunStatus::Partial);

        store.save(&r).unwrap();

        let back = store.get(&r.id).unwrap().unwrap();
        assert_eq!(back.results, r.results);
        let dir = store.root().join("runs/run-c");
        assert_ne!(store.result_path(&dir, "a:b_c"), store.result_path(&dir, "a_b:c"));
        assert_eq!(fs::read_dir(dir.join("results")).unwrap().count(), 2);
    }

    #[test]
    fn corrupt_run_record_does_not_hide_other_runs() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let a = finished(
            run("run-a", WorkInput::Task(TaskInput::new("1")), &["a:b"]),
            RunStatus::Completed,
        );
        let b = finished(
            run("run-b", WorkInput::Task(TaskInput::new("2")), &["a:b"]),
            RunStatus::Completed,
        );
        store.save(&a).unwrap();
        store.save(&b).unwrap();
        fs::write(store.root().join("runs/run-a/run.json"), "{ not json").unwrap();

        let runs = store.list(&RunFilter::default()).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, "run-b");
        assert!(store.get("run-a").is_err());
        assert_eq!(store.count(&RunFilter::default()), 2);
    }

    #[test]
    fn delete_with_and_without_cascade() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        let mut r = run("run-d", WorkInput::Task(TaskInput::new("1")), &["a:b"]);
        r.results = vec![result("a:b", ModelStatus::Success)];
        store.save(&r).unwrap();

        assert!(store.delete(&r.id, false).unwrap());
        assert!(!store.exists(&r.id));
        assert_eq!(store.get(&r.id).unwrap(), None);
        assert!(store.result_path(&store.root().join("runs/run-d"), "a:b").is_file());
        assert_eq!(store.count(&RunFilter::default()), 0);

        store.save(&r).unwrap();
        assert!(store.delete(&r.id, true).unwrap());
        assert!(!store.root().join("runs/run-d").exists());
        assert!(!store.delete(&r.id, true).unwrap());
    }

    #[test]
    fn path_like_run_ids_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let store = BenchmarkStore::new(temp.path());
        assert!(store.get("../escape").is_err());
        assert!(!store.exists(".."));
    }
}
