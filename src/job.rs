//! Per-Subject Job.
//!
//! [`Pipeline::clean`] runs the fixed stage order
//! Filter → Detect → Decompose → Classify → Reconstruct → QC on one
//! recording and stops at the first stage that fails.  [`Pipeline::run_subject`]
//! adds the file handling around it: load the input, write the artifacts,
//! and on failure leave a per-subject error log behind.
//!
//! A [`JobRecord`] moves `pending → running → {success, failed}`; it is
//! created by the orchestrator, mutated only by the worker that runs it and
//! read back after the barrier.
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classify::{classify, Classification, ComponentScorer, HeuristicScorer};
use crate::config::PipelineConfig;
use crate::decompose::{Decomposer, Decomposition, Infomax};
use crate::detect::{detect_bad_channels, ChannelMask};
use crate::error::{AtStage, CleanError, ErrorKind, Stage, StageError};
use crate::filter::filter_recording;
use crate::io::{read_recording, write_atomic, write_recording, write_weights, SubjectPaths};
use crate::qc::{compute_qc, QcInputs, QcReport, SignalStats};
use crate::reconstruct::reconstruct;
use crate::recording::Recording;
use crate::template::ChannelTemplate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// Why a job failed.  `stage` is `None` only for panics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub stage: Option<Stage>,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StageError> for JobFailure {
    fn from(e: &StageError) -> Self {
        Self { stage: Some(e.stage), kind: e.kind(), message: e.source.to_string() }
    }
}

/// Terminal result of one job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success(Box<QcReport>),
    Failure(JobFailure),
}

/// Headline QC numbers carried into the batch summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcHeadline {
    pub bad_channels: Option<usize>,
    pub interpolated_percent: Option<f64>,
    pub components_removed: Option<usize>,
    pub components_removed_percent: Option<f64>,
    pub samples_retained_percent: Option<f64>,
    pub excluded: bool,
}

impl From<&QcReport> for QcHeadline {
    fn from(qc: &QcReport) -> Self {
        Self {
            bad_channels: qc.bad_channel_count,
            interpolated_percent: qc.interpolated_percent,
            components_removed: qc.components_removed,
            components_removed_percent: qc.components_removed_percent,
            samples_retained_percent: qc.samples_retained_percent,
            excluded: qc.is_excluded(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub subject: String,
    pub status: JobStatus,
    pub threads: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    /// Outputs from an earlier run were found and kept.
    pub reused: bool,
    pub failure: Option<JobFailure>,
    pub qc: Option<QcHeadline>,
}

impl JobRecord {
    pub fn pending(subject: impl Into<String>, threads: usize) -> Self {
        Self {
            subject: subject.into(),
            status: JobStatus::Pending,
            threads,
            started_at: None,
            finished_at: None,
            elapsed_secs: 0.0,
            reused: false,
            failure: None,
            qc: None,
        }
    }

    pub fn start(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, outcome: &JobOutcome, elapsed_secs: f64) {
        self.finished_at = Some(Utc::now());
        self.elapsed_secs = elapsed_secs;
        match outcome {
            JobOutcome::Success(qc) => {
                self.status = JobStatus::Success;
                self.qc = Some(QcHeadline::from(qc.as_ref()));
            }
            JobOutcome::Failure(f) => {
                self.status = JobStatus::Failed;
                self.failure = Some(f.clone());
            }
        }
    }

    /// Mark as done from a previous run's QC report.
    pub fn reuse(&mut self, qc: &QcReport) {
        self.status = JobStatus::Success;
        self.reused = true;
        self.finished_at = Some(Utc::now());
        self.qc = Some(QcHeadline::from(qc));
    }
}

/// Everything one successful cleaning run produces.
#[derive(Debug, Clone)]
pub struct CleanOutput {
    pub filtered: Recording,
    pub cleaned: Recording,
    pub mask: ChannelMask,
    pub decomposition: Decomposition,
    pub classification: Classification,
    pub interpolated: Vec<usize>,
    pub qc: QcReport,
}

/// One configuration plus the swappable engines, shared read-only by every
/// job of a batch.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    decomposer: Arc<dyn Decomposer>,
    scorer: Arc<dyn ComponentScorer>,
}

fn log_stats(subject: &str, at: &str, s: &SignalStats) {
    log::info!(
        "[{subject}] Stats {at}: min={:.4} max={:.4} mean={:.4} std={:.4}",
        s.min,
        s.max,
        s.mean,
        s.std
    );
}

impl Pipeline {
    /// Infomax decomposition and the heuristic scorer.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_engines(config, Arc::new(Infomax), Arc::new(HeuristicScorer))
    }

    pub fn with_engines(
        config: PipelineConfig,
        decomposer: Arc<dyn Decomposer>,
        scorer: Arc<dyn ComponentScorer>,
    ) -> Self {
        Self { config: Arc::new(config), decomposer, scorer }
    }

    /// Run every stage on `recording` with a decomposition budget of
    /// `threads`.
    pub fn clean(
        &self,
        subject: &str,
        recording: Recording,
        threads: usize,
    ) -> Result<CleanOutput, StageError> {
        let cfg = &*self.config;
        let params = crate::config::DecompositionConfig { threads, ..cfg.decomposition.clone() };
        params.validate().at(Stage::Decompose)?;

        let template = ChannelTemplate::from_channels(&recording.channels).at(Stage::Load)?;
        let mut recording = recording;
        template.apply(&mut recording).at(Stage::Load)?;

        let t0 = Instant::now();
        let filtered = filter_recording(&recording, subject, &cfg.filter).at(Stage::Filter)?;
        drop(recording);
        let after_filter = SignalStats::of(&filtered.data);
        log::info!(
            "[{subject}] filtered {} ch x {} samples at {} Hz in {:.2?}",
            filtered.n_channels(),
            filtered.n_samples(),
            filtered.sfreq,
            t0.elapsed()
        );
        log_stats(subject, "after filter", &after_filter);

        let mask = detect_bad_channels(&filtered, &template, cfg.filter.line_freq, &cfg.detector);
        log::info!("[{subject}] QC: {} bad channels", mask.count());
        if mask.count() > 0 {
            let labels: Vec<&str> = mask
                .bad_indices()
                .into_iter()
                .map(|i| template.channels()[i].label.as_str())
                .collect();
            log::info!("[{subject}] bad channels identified: {}", labels.join(", "));
        }

        let t0 = Instant::now();
        let data = filtered.data_f64();
        let decomposition =
            self.decomposer.decompose(subject, data.view(), &params).at(Stage::Decompose)?;
        log::info!(
            "[{subject}] decomposition: {} components, {} iterations, converged: {}, \
             final LL = {} ({:.2?}, {threads} thread(s))",
            decomposition.n_components(),
            decomposition.iterations,
            decomposition.converged,
            decomposition.final_ll().map_or_else(|| "n/a".into(), |v| format!("{v:.6}")),
            t0.elapsed()
        );
        if decomposition.n_components() != filtered.n_channels() {
            return Err(StageError::new(
                Stage::Decompose,
                CleanError::Numerical(format!(
                    "{} components for {} channels",
                    decomposition.n_components(),
                    filtered.n_channels()
                )),
            ));
        }

        let classification = classify(
            self.scorer.as_ref(),
            &decomposition,
            data.view(),
            &template.positions(),
            filtered.sfreq as f64,
            cfg.filter.line_freq.map(f64::from),
            &cfg.classifier,
        )
        .at(Stage::Classify)?;
        drop(data);
        let removed = classification.removed();
        log::info!("[{subject}] QC: {} ICs removed", removed.len());

        let rebuilt = reconstruct(&filtered, &template, &decomposition, &removed, &mask)
            .at(Stage::Reconstruct)?;
        if rebuilt.recording.n_samples() != filtered.n_samples()
            || rebuilt.recording.events != filtered.events
        {
            return Err(StageError::new(
                Stage::Reconstruct,
                CleanError::Invariant(format!(
                    "cleaned recording has {} samples and {} events, filtered had {} and {}",
                    rebuilt.recording.n_samples(),
                    rebuilt.recording.events.len(),
                    filtered.n_samples(),
                    filtered.events.len()
                )),
            ));
        }
        let at_save = SignalStats::of(&rebuilt.recording.data);
        log_stats(subject, "at save", &at_save);

        // No time windows are ever rejected; every sample is retained.
        let retained = vec![true; rebuilt.recording.n_samples()];
        let qc = compute_qc(
            &QcInputs {
                subject,
                recording: &rebuilt.recording,
                mask: Some(&mask),
                interpolated: Some(&rebuilt.interpolated),
                decomposition: Some(&decomposition),
                removed: Some(&classification.flags),
                retained: Some(&retained),
                stats: vec![("after_filter".into(), after_filter), ("at_save".into(), at_save)],
            },
            &cfg.qc,
        );
        for reason in &qc.exclusion_reasons {
            log::warn!("[{subject}] exclusion threshold breached: {reason}");
        }

        Ok(CleanOutput {
            filtered,
            cleaned: rebuilt.recording,
            mask,
            decomposition,
            classification,
            interpolated: rebuilt.interpolated,
            qc,
        })
    }

    fn execute(
        &self,
        subject: &str,
        input: &Path,
        paths: &SubjectPaths,
        threads: usize,
    ) -> Result<QcReport, StageError> {
        let recording = read_recording(input).at(Stage::Load)?;
        log::info!(
            "[{subject}] loaded {} ch x {} samples at {} Hz, {} events",
            recording.n_channels(),
            recording.n_samples(),
            recording.sfreq,
            recording.events.len()
        );
        let out = self.clean(subject, recording, threads)?;
        write_outputs(paths, &out).at(Stage::Write)?;
        Ok(out.qc)
    }

    /// Load, clean and persist one subject.  Never panics on bad input and
    /// never returns early: every failure becomes a [`JobOutcome::Failure`]
    /// with an error log on disk.
    pub fn run_subject(
        &self,
        subject: &str,
        input: &Path,
        paths: &SubjectPaths,
        threads: usize,
    ) -> JobOutcome {
        match self.execute(subject, input, paths, threads) {
            Ok(qc) => {
                log::info!(
                    "[{subject}] done: {} bad channel(s), {} IC(s) removed",
                    qc.bad_channel_count.unwrap_or(0),
                    qc.components_removed.unwrap_or(0)
                );
                JobOutcome::Success(Box::new(qc))
            }
            Err(e) => {
                log::error!("[{subject}] {e}");
                let failure = JobFailure::from(&e);
                if let Err(io) = write_error_log(paths, subject, &failure) {
                    log::warn!("[{subject}] could not write error log: {io}");
                }
                JobOutcome::Failure(failure)
            }
        }
    }
}

/// Write every artifact; the QC JSON goes last.
pub fn write_outputs(paths: &SubjectPaths, out: &CleanOutput) -> crate::error::Result<()> {
    std::fs::create_dir_all(&paths.dir)?;
    write_recording(&paths.cleaned, &out.cleaned)?;
    write_weights(
        &paths.weights,
        &out.decomposition,
        &out.classification.probabilities,
        &out.classification.removed(),
    )?;
    write_atomic(&paths.qc_text, out.qc.to_text().as_bytes())?;
    write_atomic(&paths.qc_json, out.qc.to_json()?.as_bytes())?;
    if paths.error_log.exists() {
        std::fs::remove_file(&paths.error_log)?;
    }
    Ok(())
}

/// Per-subject error log: stage, kind and message.
///
/// A QC JSON left by an earlier run is removed first, so a failed subject
/// never looks complete.
pub fn write_error_log(
    paths: &SubjectPaths,
    subject: &str,
    failure: &JobFailure,
) -> crate::error::Result<()> {
    if paths.qc_json.exists() {
        std::fs::remove_file(&paths.qc_json)?;
    }
    std::fs::create_dir_all(&paths.dir)?;
    let stage = failure.stage.map_or("unknown", |s| s.as_str());
    let text = format!(
        "subject: {subject}\nstage: {stage}\nkind: {}\ntime: {}\nmessage: {}\n",
        failure.kind,
        Utc::now().to_rfc3339(),
        failure.message
    );
    write_atomic(&paths.error_log, text.as_bytes())
}
