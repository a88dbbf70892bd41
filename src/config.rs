//! Pipeline and batch configuration.
//!
//! [`PipelineConfig`] holds every tunable parameter of the per-subject
//! cleaning pipeline; [`BatchConfig`] holds the resource budget and paths of
//! a batch run.  Both are built once per run and passed by reference into
//! every job.  All fields have defaults and every section deserialises with
//! `#[serde(default)]`, so a JSON config file only needs the fields it
//! changes:
//!
//! ```
//! use eegclean::PipelineConfig;
//!
//! let cfg: PipelineConfig = serde_json::from_str(
//!     r#"{ "filter": { "line_freq": 50.0 }, "decomposition": { "max_iter": 200 } }"#,
//! ).unwrap();
//! assert_eq!(cfg.filter.line_freq, Some(50.0));
//! assert_eq!(cfg.filter.target_sfreq, 250.0);
//! ```
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classify::Category;
use crate::error::{CleanError, Result};

/// Configuration for the whole per-subject pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub filter: FilterConfig,
    pub detector: DetectorConfig,
    pub decomposition: DecompositionConfig,
    pub classifier: ClassifierConfig,
    pub qc: QcThresholds,
}

impl PipelineConfig {
    /// Load a config from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Resampling, band-pass and notch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Canonical sampling rate in Hz.
    ///
    /// The resampler is skipped when the source rate already equals this
    /// value (within 1 mHz).
    ///
    /// Default: `250.0` Hz.
    pub target_sfreq: f32,

    /// Lower band-pass edge in Hz.  Default: `1.0`.
    pub l_freq: f32,

    /// Upper band-pass edge in Hz.  Must lie below the Nyquist frequency of
    /// `target_sfreq` with room for the transition band.  Default: `100.0`.
    pub h_freq: f32,

    /// Line-noise frequency to notch out, `None` to disable.  Default: `60.0`.
    pub line_freq: Option<f32>,

    /// Width of the notch stop band in Hz.  Default: `1.0`.
    pub notch_width: f32,

    /// Transition bandwidth on each side of a notch in Hz.  Default: `1.0`.
    pub notch_trans_bw: f32,

    /// Secondary notches applied only to the listed subjects.
    ///
    /// Default: `[]`.
    pub extra_notches: Vec<ExtraNotch>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            target_sfreq: 250.0,
            l_freq: 1.0,
            h_freq: 100.0,
            line_freq: Some(60.0),
            notch_width: 1.0,
            notch_trans_bw: 1.0,
            extra_notches: vec![],
        }
    }
}

/// A fixed-frequency hardware artifact present for a named subset of
/// subjects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraNotch {
    pub freq: f32,
    /// Subject identifiers; matched case-insensitively, spaces ignored.
    pub subjects: Vec<String>,
}

impl FilterConfig {
    /// Extra notch frequencies that apply to `subject`.
    pub fn extra_notches_for(&self, subject: &str) -> Vec<f32> {
        let norm = |s: &str| s.replace(' ', "").to_lowercase();
        let subject = norm(subject);
        self.extra_notches
            .iter()
            .filter(|n| n.subjects.iter().any(|s| norm(s) == subject))
            .map(|n| n.freq)
            .collect()
    }
}

/// Bad-channel detection criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum flat run, in seconds, for a channel to count as flatlined.
    /// Default: `5.0`.
    pub flatline_secs: f32,

    /// A sample step counts as "flat" when `|Δx|` is below this fraction of
    /// the median (over channels) of the per-channel median `|Δx|`.
    /// Default: `1e-3`.
    pub flatline_rel_jitter: f64,

    /// Minimum correlation with the spatial-neighbour mean.  Default: `0.8`.
    pub corr_threshold: f64,

    /// Window length for the correlation criterion.  Default: `5.0` s.
    pub corr_window_secs: f32,

    /// Fraction of windows allowed below `corr_threshold`.  Default: `0.4`.
    pub max_bad_window_fraction: f64,

    /// Number of nearest neighbours averaged for the correlation criterion.
    /// Default: `3`.
    pub n_neighbours: usize,

    /// Robust z-score above which residual line-noise power flags a channel.
    /// Default: `4.0`.
    pub line_noise_z: f64,

    /// Minimum line-to-total power ratio before the z-score criterion is
    /// considered at all.  Default: `0.01`.
    pub line_noise_floor: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            flatline_secs: 5.0,
            flatline_rel_jitter: 1e-3,
            corr_threshold: 0.8,
            corr_window_secs: 5.0,
            max_bad_window_fraction: 0.4,
            n_neighbours: 3,
            line_noise_z: 4.0,
            line_noise_floor: 0.01,
        }
    }
}

/// Decomposition engine parameters.
///
/// `threads` is the per-job budget handed down by the batch orchestrator; it
/// is overwritten for every dispatched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    /// Independent models fitted; the one with the highest final
    /// log-likelihood is kept.  Default: `1`.
    pub num_models: usize,

    /// Hard iteration cap per model.  Default: `512`.
    pub max_iter: usize,

    /// Threads of the engine's internal pool.  Default: `1`.
    pub threads: usize,

    /// Record the log-likelihood every this many iterations.  Default: `1`.
    pub trace_interval: usize,

    /// Initial natural-gradient step size.  Default: `0.1`.
    pub learning_rate: f64,

    /// Stop when the largest weight change falls below this.  Default: `1e-7`.
    pub tolerance: f64,

    /// Fit on every k-th sample.  Weights are applied to all samples.
    /// Default: `1`.
    pub decimate: usize,

    /// Seed for the initial weights of models after the first.  Default: `42`.
    pub seed: u64,
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            num_models: 1,
            max_iter: 512,
            threads: 1,
            trace_interval: 1,
            learning_rate: 0.1,
            tolerance: 1e-7,
            decimate: 1,
            seed: 42,
        }
    }
}

impl DecompositionConfig {
    /// Reject parameters that would make the fit meaningless, before any
    /// computation starts.
    pub fn validate(&self) -> Result<()> {
        if self.num_models == 0 {
            return Err(CleanError::Config("num_models must be >= 1".into()));
        }
        if self.max_iter == 0 {
            return Err(CleanError::Config("max_iter must be >= 1".into()));
        }
        if self.threads == 0 {
            return Err(CleanError::Config("thread budget must be >= 1".into()));
        }
        if self.trace_interval == 0 {
            return Err(CleanError::Config("trace_interval must be >= 1".into()));
        }
        if self.decimate == 0 {
            return Err(CleanError::Config("decimate must be >= 1".into()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(CleanError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Component removal policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Probability at or above which a component is removed.  Default: `0.8`.
    pub threshold: f64,

    /// Categories that trigger removal.  Default: muscle, eye, channel noise.
    pub remove: Vec<Category>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            remove: vec![Category::Muscle, Category::Eye, Category::ChannelNoise],
        }
    }
}

/// Thresholds that mark a subject for exclusion in the QC report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcThresholds {
    /// Default: `25.0` %.
    pub max_interpolated_percent: f64,
    /// Default: `75.0` %.
    pub min_samples_retained_percent: f64,
    /// Default: `40.0` %.
    pub max_components_removed_percent: f64,
}

impl Default for QcThresholds {
    fn default() -> Self {
        Self {
            max_interpolated_percent: 25.0,
            min_samples_retained_percent: 75.0,
            max_components_removed_percent: 40.0,
        }
    }
}

/// Resource budget and paths for a batch run.
///
/// The orchestrator runs `workers` jobs at once and hands each job
/// `threads_per_worker` threads for its decomposition, so at most
/// `workers × threads_per_worker` compute threads are busy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Concurrent jobs (W).  Default: `1`.
    pub workers: usize,

    /// Decomposition threads per job (T).  Default: `1`.
    pub threads_per_worker: usize,

    /// Optional hard cap B on `workers × threads_per_worker`.
    pub thread_budget: Option<usize>,

    /// Root of the per-subject output subtrees.  Default: `output/cleaned`.
    pub output_root: PathBuf,

    /// Skip subjects whose outputs already exist.  Default: `true`.
    pub skip_existing: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            threads_per_worker: 1,
            thread_budget: None,
            output_root: PathBuf::from("output/cleaned"),
            skip_existing: true,
        }
    }
}

impl BatchConfig {
    /// Partition a total thread budget `B` into `workers` jobs of
    /// `⌊B / workers⌋` threads each.
    pub fn from_budget(
        budget: usize,
        workers: usize,
        output_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        if workers == 0 || budget < workers {
            return Err(CleanError::Config(format!(
                "cannot split a budget of {budget} threads over {workers} workers"
            )));
        }
        Ok(Self {
            workers,
            threads_per_worker: budget / workers,
            thread_budget: Some(budget),
            output_root: output_root.into(),
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CleanError::Config("workers must be >= 1".into()));
        }
        if self.threads_per_worker == 0 {
            return Err(CleanError::Config("threads_per_worker must be >= 1".into()));
        }
        if let Some(budget) = self.thread_budget {
            let used = self.workers * self.threads_per_worker;
            if used > budget {
                return Err(CleanError::Config(format!(
                    "{} workers x {} threads = {used} exceeds the budget of {budget}",
                    self.workers, self.threads_per_worker
                )));
            }
        }
        Ok(())
    }
}
