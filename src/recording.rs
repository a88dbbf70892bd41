//! In-memory recording: signal matrix, channel list and event markers.
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{CleanError, Result};

/// Runtime status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Position taken from the template, data untouched.
    TemplateAssigned,
    /// Flagged by the bad-channel detector.
    DataRejected,
    /// Flagged and then rebuilt from its neighbours.
    Interpolated,
}

impl ChannelStatus {
    pub fn code(self) -> u8 {
        match self {
            ChannelStatus::TemplateAssigned => 0,
            ChannelStatus::DataRejected => 1,
            ChannelStatus::Interpolated => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ChannelStatus::TemplateAssigned),
            1 => Some(ChannelStatus::DataRejected),
            2 => Some(ChannelStatus::Interpolated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub label: String,
    /// Unit-sphere position (x right, y anterior, z up), if known.
    pub position: Option<[f64; 3]>,
    pub status: ChannelStatus,
}

impl Channel {
    pub fn new(label: impl Into<String>, position: Option<[f64; 3]>) -> Self {
        Self { label: label.into(), position, status: ChannelStatus::TemplateAssigned }
    }
}

/// A labelled marker aligned to the sample axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub label: String,
    /// Sample index of the onset.
    pub onset: usize,
    /// Duration in samples, if the marker has one.
    pub duration: Option<usize>,
}

impl Event {
    pub fn new(label: impl Into<String>, onset: usize) -> Self {
        Self { label: label.into(), onset, duration: None }
    }
}

/// One subject's continuous multichannel recording.
///
/// `data` is `[C, T]`; row `c` belongs to `channels[c]`.
#[derive(Debug, Clone)]
pub struct Recording {
    pub data: Array2<f32>,
    pub sfreq: f32,
    pub channels: Vec<Channel>,
    pub events: Vec<Event>,
}

impl Recording {
    /// Build a recording, rejecting inconsistent layouts.
    pub fn new(
        data: Array2<f32>,
        sfreq: f32,
        channels: Vec<Channel>,
        events: Vec<Event>,
    ) -> Result<Self> {
        let rec = Self { data, sfreq, channels, events };
        rec.validate()?;
        Ok(rec)
    }

    /// Check shape, rate, finiteness and event bounds.
    pub fn validate(&self) -> Result<()> {
        if !(self.sfreq > 0.0 && self.sfreq.is_finite()) {
            return Err(CleanError::Input(format!("invalid sampling rate {}", self.sfreq)));
        }
        if self.data.nrows() != self.channels.len() {
            return Err(CleanError::Input(format!(
                "data has {} rows but {} channels are listed",
                self.data.nrows(),
                self.channels.len()
            )));
        }
        if self.data.nrows() == 0 || self.data.ncols() == 0 {
            return Err(CleanError::Input(format!("empty data matrix {:?}", self.data.dim())));
        }
        if let Some(pos) = self.data.iter().position(|v| !v.is_finite()) {
            let (c, t) = (pos / self.data.ncols(), pos % self.data.ncols());
            return Err(CleanError::Input(format!(
                "non-finite sample at channel {} ({}), sample {t}",
                c, self.channels[c].label
            )));
        }
        let n_t = self.n_samples();
        if let Some(ev) = self.events.iter().find(|e| e.onset >= n_t) {
            return Err(CleanError::Input(format!(
                "event '{}' at sample {} lies beyond the last sample ({})",
                ev.label,
                ev.onset,
                n_t - 1
            )));
        }
        Ok(())
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn duration_secs(&self) -> f64 {
        self.n_samples() as f64 / self.sfreq as f64
    }

    pub fn labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }

    /// Signal converted to `f64` for the matrix stages.
    pub fn data_f64(&self) -> Array2<f64> {
        self.data.mapv(|v| v as f64)
    }
}
