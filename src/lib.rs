//! # eegclean: batch EEG artifact removal in Rust
//!
//! `eegclean` cleans long multichannel EEG recordings one subject at a time
//! and runs many subjects concurrently under a fixed thread budget.  The
//! DSP steps follow [MNE-Python](https://mne.tools) (FFT resampling,
//! `firwin` FIR design, overlap-add zero-phase filtering, spherical-spline
//! interpolation); the decomposition is extended Infomax ICA.
//!
//! ## Pipeline overview
//!
//! ```text
//! <subject>.safetensors
//!   │
//!   ├─ template            labels → 10-20 positions, canonical order
//!   ├─ filter              resample → band-pass → line notch → extra notches
//!   ├─ detect              flatline / neighbour correlation / line noise  → mask
//!   ├─ decompose           extended Infomax on all channels, T threads
//!   ├─ classify            7-way probabilities, threshold on muscle/eye/channel
//!   ├─ reconstruct         remove ICs → interpolate bad channels → average ref
//!   └─ qc                  retention, counts, convergence, exclusion reasons
//!        │
//!        └─→ <out>/<subject>/{_cleaned,_weights}.safetensors, _qc.json, _qc.txt
//! ```
//!
//! No time samples are ever dropped: bad channels are repaired by
//! interpolation, so the cleaned output keeps the exact sample count and
//! event alignment of the filtered signal.
//!
//! ## Quick start
//!
//! ```no_run
//! use eegclean::{io::read_recording, Pipeline, PipelineConfig};
//! use std::path::Path;
//!
//! let rec = read_recording(Path::new("data/P01.safetensors")).unwrap();
//! let pipeline = Pipeline::new(PipelineConfig::default());
//! let out = pipeline.clean("P01", rec, 4).unwrap();
//! println!("{}", out.qc.to_text());
//! ```
//!
//! ## Batches
//!
//! ```no_run
//! use eegclean::{BatchConfig, Orchestrator, Pipeline, PipelineConfig, SubjectSpec};
//! use std::path::Path;
//!
//! let ids: Vec<String> = vec!["P01".into(), "P02".into(), "P03".into()];
//! let subjects = SubjectSpec::from_dir(Path::new("data"), &ids);
//! let batch = BatchConfig::from_budget(8, 2, "output/cleaned").unwrap(); // 2 workers x 4 threads
//! let orch = Orchestrator::new(Pipeline::new(PipelineConfig::default()), batch).unwrap();
//! let summary = orch.run(&subjects).unwrap();
//! println!("{} ok, {} failed", summary.succeeded, summary.failed);
//! ```

pub mod batch;
pub mod classify;
pub mod config;
pub mod decompose;
pub mod detect;
pub mod error;
pub mod filter;
pub mod interpolate;
pub mod io;
pub mod job;
pub mod linalg;
pub mod qc;
pub mod reconstruct;
pub mod recording;
pub mod resample;
pub mod spectrum;
pub mod template;

// ── Crate-root re-exports ─────────────────────────────────────────────────

// config
pub use config::{
    BatchConfig, ClassifierConfig, DecompositionConfig, DetectorConfig, ExtraNotch, FilterConfig,
    PipelineConfig, QcThresholds,
};

// error
pub use error::{AtStage, CleanError, ErrorKind, Result, Stage, StageError};

// data model
pub use recording::{Channel, ChannelStatus, Event, Recording};
pub use template::ChannelTemplate;

// stages
pub use classify::{Category, Classification, ComponentFlag, ComponentScorer, HeuristicScorer};
pub use decompose::{ConvergenceTrace, Decomposer, Decomposition, Infomax};
pub use detect::{detect_bad_channels, BadReason, ChannelMask};
pub use filter::filter_recording;
pub use qc::{QcReport, SignalStats};
pub use reconstruct::{average_reference_inplace, reconstruct, Reconstruction};
pub use resample::{resample, resample_recording};

// orchestration
pub use batch::{BatchSummary, Orchestrator, SubjectSpec};
pub use job::{CleanOutput, JobOutcome, JobRecord, JobStatus, Pipeline};

/// Clean one recording with the built-in engines.
///
/// Shorthand for `Pipeline::new(cfg.clone()).clean(subject, recording, threads)`.
pub fn clean(
    subject: &str,
    recording: Recording,
    cfg: &PipelineConfig,
    threads: usize,
) -> std::result::Result<CleanOutput, StageError> {
    Pipeline::new(cfg.clone()).clean(subject, recording, threads)
}
