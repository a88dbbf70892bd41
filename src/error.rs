//! Error taxonomy for the cleaning pipeline.
//!
//! Every fallible library function returns [`Result`].  [`CleanError`]
//! variants map onto the operator-facing [`ErrorKind`] so that a failed job
//! can be triaged (bad input vs. bad configuration vs. numerical trouble vs.
//! a pipeline bug) without parsing messages.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CleanError {
    /// Missing or malformed recording / event data.
    #[error("input error: {0}")]
    Input(String),

    /// Invalid filter cutoffs, thread budget or other parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// The decomposition (or a downstream matrix operation) produced
    /// something that is not a well-formed finite matrix.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// A pipeline invariant was broken.  Always a bug, never bad input.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CleanError>;

/// Coarse failure class recorded in job records and error logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Input,
    Config,
    Numerical,
    Invariant,
    Io,
    /// The job panicked; caught at the job boundary.
    Panic,
}

impl CleanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CleanError::Input(_) => ErrorKind::Input,
            CleanError::Config(_) => ErrorKind::Config,
            CleanError::Numerical(_) => ErrorKind::Numerical,
            CleanError::Invariant(_) => ErrorKind::Invariant,
            CleanError::Io(_) | CleanError::Json(_) => ErrorKind::Io,
        }
    }
}

impl From<ndarray::ShapeError> for CleanError {
    fn from(e: ndarray::ShapeError) -> Self {
        CleanError::Input(format!("array shape mismatch: {e}"))
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Input => "input",
            ErrorKind::Config => "config",
            ErrorKind::Numerical => "numerical",
            ErrorKind::Invariant => "invariant",
            ErrorKind::Io => "io",
            ErrorKind::Panic => "panic",
        };
        f.write_str(s)
    }
}

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Filter,
    Detect,
    Decompose,
    Classify,
    Reconstruct,
    Qc,
    Write,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Filter => "filter",
            Stage::Detect => "detect",
            Stage::Decompose => "decompose",
            Stage::Classify => "classify",
            Stage::Reconstruct => "reconstruct",
            Stage::Qc => "qc",
            Stage::Write => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`CleanError`] tagged with the stage that raised it.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: CleanError,
}

impl StageError {
    pub fn new(stage: Stage, source: CleanError) -> Self {
        Self { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Attach a stage to a library result: `filter(..).at(Stage::Filter)?`.
pub trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|e| StageError::new(stage, e))
    }
}
