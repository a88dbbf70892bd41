mod common;
use std::sync::Arc;

use common::{fast_config, init_logging, write_subjects, FailFor, PanicFor, LABELS};
use eegclean::io::{read_recording, read_weights, SubjectPaths};
use eegclean::{
    BatchConfig, BatchSummary, ErrorKind, HeuristicScorer, JobStatus, Orchestrator, Pipeline,
    QcReport, Stage,
};

fn batch(root: &std::path::Path, workers: usize, threads: usize) -> BatchConfig {
    BatchConfig {
        workers,
        threads_per_worker: threads,
        output_root: root.to_path_buf(),
        ..BatchConfig::default()
    }
}

#[test]
fn one_failing_subject_does_not_stop_the_others() {
    init_logging();
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let ids = ["S1", "S2", "S3", "S4", "S5"];
    let subjects = write_subjects(input.path(), &ids, 30.0);

    let pipeline = Pipeline::with_engines(
        fast_config(100, 2),
        Arc::new(FailFor("S3")),
        Arc::new(HeuristicScorer),
    );
    let orch = Orchestrator::new(pipeline, batch(output.path(), 2, 2)).unwrap();
    let summary = orch.run(&subjects).unwrap();

    assert_eq!(summary.total, 5);
    assert_eq!(summary.jobs.len(), 5);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);
    assert!(summary.jobs.iter().all(|j| j.status.is_terminal()));
    // Summary order follows input order, not completion order.
    let order: Vec<&str> = summary.jobs.iter().map(|j| j.subject.as_str()).collect();
    assert_eq!(order, ids);

    let s3 = summary.job("S3").unwrap();
    assert_eq!(s3.status, JobStatus::Failed);
    let failure = s3.failure.as_ref().unwrap();
    assert_eq!(failure.stage, Some(Stage::Decompose));
    assert_eq!(failure.kind, ErrorKind::Numerical);
    let paths = SubjectPaths::new(output.path(), "S3");
    let log = std::fs::read_to_string(&paths.error_log).unwrap();
    assert!(log.contains("stage: decompose") && log.contains("kind: numerical"), "{log}");
    assert!(!paths.weights.exists());
    assert!(!paths.qc_json.exists());

    for id in ["S1", "S2", "S4", "S5"] {
        let job = summary.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Success, "{id}: {:?}", job.failure);
        assert_eq!(job.threads, 2);
        assert!(job.started_at.is_some() && job.finished_at.is_some());

        let paths = SubjectPaths::new(output.path(), id);
        assert!(!paths.error_log.exists());
        let cleaned = read_recording(&paths.cleaned).unwrap();
        assert_eq!(cleaned.n_channels(), LABELS.len());
        let weights = read_weights(&paths.weights).unwrap();
        assert_eq!(weights.unmixing.dim(), (LABELS.len(), LABELS.len()));
        assert_eq!(weights.probabilities.nrows(), LABELS.len());
        assert!(!weights.trace.is_empty());
        let qc = QcReport::from_json_file(&paths.qc_json).unwrap();
        assert_eq!(qc.subject, id);
        assert_eq!(qc.n_samples, cleaned.n_samples());
        assert!(paths.qc_text.is_file());
    }

    let text = std::fs::read_to_string(output.path().join("batch_summary.json")).unwrap();
    let on_disk: BatchSummary = serde_json::from_str(&text).unwrap();
    assert_eq!(on_disk.jobs.len(), 5);
    assert_eq!(on_disk.failed, 1);
    assert!(output.path().join("batch_summary.txt").is_file());
}

#[test]
fn rerun_skips_finished_subjects() {
    init_logging();
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let subjects = write_subjects(input.path(), &["R1", "R2"], 20.0);
    let orch =
        Orchestrator::new(Pipeline::new(fast_config(60, 4)), batch(output.path(), 2, 1)).unwrap();

    let first = orch.run(&subjects).unwrap();
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.reused, 0);
    let qc_path = SubjectPaths::new(output.path(), "R1").qc_json;
    let stamp = std::fs::metadata(&qc_path).unwrap().modified().unwrap();

    let second = orch.run(&subjects).unwrap();
    assert_eq!(second.succeeded, 2);
    assert_eq!(second.reused, 2);
    assert!(second.jobs.iter().all(|j| j.reused && j.qc.is_some()));
    assert_eq!(std::fs::metadata(&qc_path).unwrap().modified().unwrap(), stamp);
    assert_eq!(
        second.job("R1").unwrap().qc.as_ref().unwrap().components_removed,
        first.job("R1").unwrap().qc.as_ref().unwrap().components_removed
    );
}

#[test]
fn skip_existing_off_recomputes() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let subjects = write_subjects(input.path(), &["N1"], 20.0);
    let cfg = BatchConfig { skip_existing: false, ..batch(output.path(), 1, 1) };
    let orch = Orchestrator::new(Pipeline::new(fast_config(40, 4)), cfg).unwrap();
    orch.run(&subjects).unwrap();
    let again = orch.run(&subjects).unwrap();
    assert_eq!(again.succeeded, 1);
    assert_eq!(again.reused, 0);
}

#[test]
fn panicking_job_is_isolated() {
    init_logging();
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let subjects = write_subjects(input.path(), &["P1", "P2", "P3"], 20.0);
    let pipeline = Pipeline::with_engines(
        fast_config(60, 4),
        Arc::new(PanicFor("P2")),
        Arc::new(HeuristicScorer),
    );
    let orch = Orchestrator::new(pipeline, batch(output.path(), 3, 1)).unwrap();
    let summary = orch.run(&subjects).unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
    let failure = summary.job("P2").unwrap().failure.as_ref().unwrap();
    assert_eq!(failure.kind, ErrorKind::Panic);
    assert_eq!(failure.stage, None);
    assert!(failure.message.contains("injected panic"));
    let log = std::fs::read_to_string(SubjectPaths::new(output.path(), "P2").error_log).unwrap();
    assert!(log.contains("kind: panic"));
}

#[test]
fn failed_rerun_drops_the_old_qc_report() {
    init_logging();
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let subjects = write_subjects(input.path(), &["Q1"], 20.0);
    let cfg = BatchConfig { skip_existing: false, ..batch(output.path(), 1, 1) };
    let paths = SubjectPaths::new(output.path(), "Q1");

    let first = Orchestrator::new(Pipeline::new(fast_config(40, 4)), cfg.clone()).unwrap();
    assert_eq!(first.run(&subjects).unwrap().succeeded, 1);
    assert!(paths.is_complete());

    let pipeline = Pipeline::with_engines(
        fast_config(40, 4),
        Arc::new(PanicFor("Q1")),
        Arc::new(HeuristicScorer),
    );
    let second = Orchestrator::new(pipeline, cfg).unwrap();
    let summary = second.run(&subjects).unwrap();
    assert_eq!(summary.failed, 1);
    assert!(!paths.qc_json.exists());
    assert!(paths.error_log.is_file());
}

#[test]
fn thread_budget_is_split_across_workers() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let subjects = write_subjects(input.path(), &["B1", "B2"], 20.0);
    let cfg = BatchConfig::from_budget(6, 2, output.path()).unwrap();
    assert_eq!(cfg.threads_per_worker, 3);
    let orch = Orchestrator::new(Pipeline::new(fast_config(40, 4)), cfg).unwrap();
    let summary = orch.run(&subjects).unwrap();
    assert_eq!(summary.thread_budget, Some(6));
    assert!(summary.jobs.iter().all(|j| j.threads == 3 && j.status == JobStatus::Success));
}

#[test]
fn oversubscribed_budget_is_rejected() {
    let cfg = BatchConfig {
        workers: 4,
        threads_per_worker: 4,
        thread_budget: Some(8),
        ..BatchConfig::default()
    };
    let err = Orchestrator::new(Pipeline::new(Default::default()), cfg).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(BatchConfig::from_budget(1, 2, "out").is_err());
}

#[test]
fn empty_batch_still_writes_a_summary() {
    let output = tempfile::tempdir().unwrap();
    let orch =
        Orchestrator::new(Pipeline::new(Default::default()), batch(output.path(), 4, 1)).unwrap();
    let summary = orch.run(&[]).unwrap();
    assert_eq!(summary.total, 0);
    assert!(output.path().join("batch_summary.json").is_file());
}
