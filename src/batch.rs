//! Batch Orchestrator.
//!
//! Two-level resource model: `W` scoped worker threads pull jobs from a
//! crossbeam channel, and every job hands `T` threads to its decomposition.
//! Workers push tagged [`JobRecord`]s back over a second channel.  The end
//! of the thread scope is the barrier; the summary is written once, after
//! it, by the calling thread.
//!
//! Each subject owns `<output_root>/<subject>/`, so jobs share no mutable
//! state and take no locks.  A subject whose QC JSON already exists is not
//! recomputed when `skip_existing` is set, which makes an interrupted batch
//! restartable.
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam::channel;
use serde::{Deserialize, Serialize};

use crate::config::BatchConfig;
use crate::error::{CleanError, ErrorKind, Result, Stage};
use crate::io::{input_path, write_atomic, SubjectPaths};
use crate::job::{write_error_log, JobFailure, JobOutcome, JobRecord, JobStatus, Pipeline};
use crate::qc::QcReport;

pub const SUMMARY_SCHEMA: &str = "eegclean.batch/1";

/// One subject to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectSpec {
    pub id: String,
    pub input: PathBuf,
}

impl SubjectSpec {
    pub fn new(id: impl Into<String>, input: impl Into<PathBuf>) -> Self {
        Self { id: id.into(), input: input.into() }
    }

    /// `<input_dir>/<id>.safetensors` for every id.
    pub fn from_dir(input_dir: &Path, ids: &[String]) -> Vec<Self> {
        ids.iter().map(|id| Self::new(id.clone(), input_path(input_dir, id))).collect()
    }
}

/// Identifiers name output directories, so they must be plain path
/// components.
pub fn validate_subject_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CleanError::Input("empty subject identifier".into()));
    }
    if id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
        return Err(CleanError::Input(format!(
            "subject identifier '{id}' is not a plain file name"
        )));
    }
    Ok(())
}

/// Aggregated, run-level record of every job's terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub schema: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub workers: usize,
    pub threads_per_worker: usize,
    pub thread_budget: Option<usize>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub reused: usize,
    pub excluded: usize,
    pub jobs: Vec<JobRecord>,
}

impl BatchSummary {
    fn new(
        cfg: &BatchConfig,
        started_at: DateTime<Utc>,
        elapsed_secs: f64,
        jobs: Vec<JobRecord>,
    ) -> Self {
        let succeeded = jobs.iter().filter(|j| j.status == JobStatus::Success).count();
        let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
        let reused = jobs.iter().filter(|j| j.reused).count();
        let excluded = jobs.iter().filter(|j| j.qc.as_ref().is_some_and(|q| q.excluded)).count();
        Self {
            schema: SUMMARY_SCHEMA.to_string(),
            started_at,
            finished_at: Utc::now(),
            elapsed_secs,
            workers: cfg.workers,
            threads_per_worker: cfg.threads_per_worker,
            thread_budget: cfg.thread_budget,
            total: jobs.len(),
            succeeded,
            failed,
            reused,
            excluded,
            jobs,
        }
    }

    pub fn job(&self, subject: &str) -> Option<&JobRecord> {
        self.jobs.iter().find(|j| j.subject == subject)
    }

    pub fn to_text(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "Batch summary ({})", self.schema);
        let _ = writeln!(s, "Started: {}", self.started_at.to_rfc3339());
        let _ = writeln!(
            s,
            "Finished: {} ({:.1} s)",
            self.finished_at.to_rfc3339(),
            self.elapsed_secs
        );
        let _ = writeln!(s, "Workers: {} x {} thread(s)", self.workers, self.threads_per_worker);
        let _ = writeln!(
            s,
            "Subjects: {}, succeeded: {} ({} reused), failed: {}, excluded by QC: {}",
            self.total, self.succeeded, self.reused, self.failed, self.excluded
        );
        let _ = writeln!(s);
        for j in &self.jobs {
            match (&j.failure, &j.qc) {
                (Some(f), _) => {
                    let stage = f.stage.map_or("unknown", |st| st.as_str());
                    let _ = writeln!(
                        s,
                        "{:<12} failed   {stage}/{}: {}",
                        j.subject, f.kind, f.message
                    );
                }
                (None, Some(q)) => {
                    let opt = |v: Option<usize>| {
                        v.map_or_else(|| "n/a".to_string(), |n| n.to_string())
                    };
                    let retained = q
                        .samples_retained_percent
                        .map_or_else(|| "n/a".into(), |p| format!("{p:.1}%"));
                    let _ = writeln!(
                        s,
                        "{:<12} success  {:>8.1} s  bad channels: {}  ICs removed: {}  \
                         retained: {}{}{}",
                        j.subject,
                        j.elapsed_secs,
                        opt(q.bad_channels),
                        opt(q.components_removed),
                        retained,
                        if j.reused { "  (reused)" } else { "" },
                        if q.excluded { "  EXCLUDE" } else { "" }
                    );
                }
                (None, None) => {
                    let _ = writeln!(s, "{:<12} {:?}", j.subject, j.status);
                }
            }
        }
        s
    }

    /// `batch_summary.json` and `batch_summary.txt` under `root`.
    pub fn write(&self, root: &Path) -> Result<()> {
        write_atomic(&root.join("batch_summary.txt"), self.to_text().as_bytes())?;
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&root.join("batch_summary.json"), json.as_bytes())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

pub struct Orchestrator {
    pipeline: Pipeline,
    config: BatchConfig,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, config: BatchConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { pipeline, config })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Load the QC report of a finished subject, if any.
    fn existing(&self, paths: &SubjectPaths) -> Option<QcReport> {
        if !self.config.skip_existing || !paths.is_complete() {
            return None;
        }
        match QcReport::from_json_file(&paths.qc_json) {
            Ok(qc) => Some(qc),
            Err(e) => {
                log::warn!("{}: unreadable ({e}); recomputing", paths.qc_json.display());
                None
            }
        }
    }

    /// Process every subject and write the batch summary.
    ///
    /// Per-subject failures never abort the batch; only an unwritable
    /// output root does.
    pub fn run(&self, subjects: &[SubjectSpec]) -> Result<BatchSummary> {
        let started_at = Utc::now();
        let t0 = Instant::now();
        let root = &self.config.output_root;
        std::fs::create_dir_all(root)?;
        let threads = self.config.threads_per_worker;

        let mut records: Vec<JobRecord> = Vec::with_capacity(subjects.len());
        let mut queue: Vec<(usize, &SubjectSpec)> = Vec::new();
        for spec in subjects {
            let idx = records.len();
            let mut record = JobRecord::pending(spec.id.clone(), threads);
            let invalid = validate_subject_id(&spec.id).err().or_else(|| {
                subjects[..idx]
                    .iter()
                    .any(|s| s.id == spec.id)
                    .then(|| {
                        CleanError::Input(format!("duplicate subject identifier '{}'", spec.id))
                    })
            });
            if let Some(e) = invalid {
                log::error!("[{}] not dispatched: {e}", spec.id);
                let failure = JobFailure {
                    stage: Some(Stage::Load),
                    kind: e.kind(),
                    message: e.to_string(),
                };
                record.finish(&JobOutcome::Failure(failure), 0.0);
            } else if let Some(qc) = self.existing(&SubjectPaths::new(root, &spec.id)) {
                log::info!("[{}] outputs exist; skipping", spec.id);
                record.reuse(&qc);
            } else {
                queue.push((idx, spec));
            }
            records.push(record);
        }

        let workers = self.config.workers.min(queue.len()).max(1);
        log::info!(
            "batch: {} subject(s), {} to run on {workers} worker(s) x {threads} thread(s)",
            subjects.len(),
            queue.len()
        );

        let (job_tx, job_rx) = channel::unbounded::<(usize, &SubjectSpec, JobRecord)>();
        let (done_tx, done_rx) = channel::unbounded::<(usize, JobRecord)>();
        for &(idx, spec) in &queue {
            // Sending on an unbounded channel with a live receiver cannot fail.
            let _ = job_tx.send((idx, spec, records[idx].clone()));
        }
        drop(job_tx);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                scope.spawn(move || {
                    for (idx, spec, mut record) in job_rx.iter() {
                        record.start();
                        let t = Instant::now();
                        let outcome = self.run_one(spec, threads);
                        record.finish(&outcome, t.elapsed().as_secs_f64());
                        let _ = done_tx.send((idx, record));
                    }
                });
            }
        });
        drop(done_tx);

        for (idx, record) in done_rx.iter() {
            records[idx] = record;
        }
        if let Some(stuck) = records.iter().find(|r| !r.status.is_terminal()) {
            return Err(CleanError::Invariant(format!(
                "job '{}' is {:?} after the barrier",
                stuck.subject, stuck.status
            )));
        }

        let elapsed = t0.elapsed().as_secs_f64();
        let summary = BatchSummary::new(&self.config, started_at, elapsed, records);
        summary.write(root)?;
        log::info!(
            "batch finished: {} succeeded, {} failed, {} reused in {:.1} s",
            summary.succeeded,
            summary.failed,
            summary.reused,
            summary.elapsed_secs
        );
        Ok(summary)
    }

    /// Run one job, turning a panic into a failure.
    fn run_one(&self, spec: &SubjectSpec, threads: usize) -> JobOutcome {
        let paths = SubjectPaths::new(&self.config.output_root, &spec.id);
        let run = || self.pipeline.run_subject(&spec.id, &spec.input, &paths, threads);
        catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|payload| {
            let failure = JobFailure {
                stage: None,
                kind: ErrorKind::Panic,
                message: panic_message(payload.as_ref()),
            };
            log::error!("[{}] job panicked: {}", spec.id, failure.message);
            if let Err(e) = write_error_log(&paths, &spec.id, &failure) {
                log::warn!("[{}] could not write error log: {e}", spec.id);
            }
            JobOutcome::Failure(failure)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_ids() {
        assert!(validate_subject_id("P01").is_ok());
        assert!(validate_subject_id("sub-01_ses-1").is_ok());
        for bad in ["", "  ", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(validate_subject_id(bad), Err(CleanError::Input(_))), "{bad:?}");
        }
    }

    #[test]
    fn panic_payloads() {
        let p: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
        let p: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(p.as_ref()), "job panicked");
    }

    #[test]
    fn invalid_and_duplicate_ids_fail_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BatchConfig { output_root: dir.path().to_path_buf(), ..BatchConfig::default() };
        let orch = Orchestrator::new(Pipeline::new(Default::default()), cfg).unwrap();
        let subjects = vec![
            SubjectSpec::new("../escape", dir.path().join("x.safetensors")),
            SubjectSpec::new("P01", dir.path().join("missing.safetensors")),
            SubjectSpec::new("P01", dir.path().join("missing.safetensors")),
        ];
        let summary = orch.run(&subjects).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.jobs[0].failure.as_ref().unwrap().kind, ErrorKind::Input);
        assert!(summary.jobs[2].failure.as_ref().unwrap().message.contains("duplicate"));
        // The first P01 ran and failed on its missing input.
        assert_eq!(summary.jobs[1].failure.as_ref().unwrap().kind, ErrorKind::Io);
        assert!(dir.path().join("batch_summary.json").is_file());
        assert!(dir.path().join("batch_summary.txt").is_file());
    }

    #[test]
    fn zero_workers_is_config_error() {
        let cfg = BatchConfig { workers: 0, ..BatchConfig::default() };
        assert!(matches!(
            Orchestrator::new(Pipeline::new(Default::default()), cfg),
            Err(CleanError::Config(_))
        ));
    }
}
