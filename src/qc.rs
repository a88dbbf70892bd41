//! QC Metrics Engine.
//!
//! Builds the per-subject [`QcReport`] from whatever the pipeline produced.
//! Every input is optional: a missing input turns the fields it feeds into
//! `null` (JSON) / `unavailable` (text) instead of aborting.  Counts that
//! are known to be zero are always written as explicit zeros.
//!
//! Sample retention is computed from a generic per-sample mask.  The
//! pipeline never rejects time windows, so in practice the mask is all
//! `true`, but per-event retention is computed honestly from it.
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::classify::ComponentFlag;
use crate::config::QcThresholds;
use crate::decompose::Decomposition;
use crate::detect::{BadReason, ChannelMask};
use crate::error::Result;
use crate::recording::Recording;

pub const QC_SCHEMA: &str = "eegclean.qc/1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadChannelEntry {
    pub label: String,
    pub reason: BadReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRetention {
    pub label: String,
    pub count: usize,
    pub retained: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSummary {
    pub iterations: usize,
    pub converged: bool,
    pub final_ll: Option<f64>,
    pub model: usize,
    pub restarts: usize,
    /// `(iteration, LL)` pairs.
    pub trace: Vec<(usize, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

impl SignalStats {
    /// Statistics over every sample of every channel.
    pub fn of(data: &Array2<f32>) -> Self {
        if data.is_empty() {
            return Self { min: 0.0, max: 0.0, mean: 0.0, std: 0.0 };
        }
        let n = data.len() as f64;
        let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
        for &v in data.iter() {
            let v = v as f64;
            min = min.min(v);
            max = max.max(v);
            sum += v;
        }
        let mean = sum / n;
        let var = data.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
        Self { min, max, mean, std: var.sqrt() }
    }
}

/// Per-subject QC record.  Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcReport {
    pub schema: String,
    pub subject: String,
    pub n_channels: usize,
    pub n_samples: usize,
    pub sfreq: f64,
    pub bad_channel_count: Option<usize>,
    pub bad_channels: Option<Vec<BadChannelEntry>>,
    pub interpolated_count: Option<usize>,
    pub interpolated_percent: Option<f64>,
    pub components_total: Option<usize>,
    pub components_removed: Option<usize>,
    pub components_removed_percent: Option<f64>,
    pub removed_components: Option<Vec<ComponentFlag>>,
    pub samples_total: usize,
    pub samples_retained: Option<usize>,
    pub samples_retained_percent: Option<f64>,
    pub event_retention: Option<Vec<EventRetention>>,
    pub convergence: Option<ConvergenceSummary>,
    /// Keyed by checkpoint, e.g. `after_filter`, `at_save`.
    pub signal_stats: BTreeMap<String, SignalStats>,
    pub exclusion_reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything QC may look at.  `None` marks an unavailable input.
pub struct QcInputs<'a> {
    pub subject: &'a str,
    /// The recording whose layout is reported (normally the cleaned one).
    pub recording: &'a Recording,
    pub mask: Option<&'a ChannelMask>,
    pub interpolated: Option<&'a [usize]>,
    pub decomposition: Option<&'a Decomposition>,
    pub removed: Option<&'a [ComponentFlag]>,
    /// One entry per sample; `true` = retained.
    pub retained: Option<&'a [bool]>,
    pub stats: Vec<(String, SignalStats)>,
}

fn percent(part: usize, whole: usize) -> Option<f64> {
    (whole > 0).then(|| 100.0 * part as f64 / whole as f64)
}

/// Per-label count of events and of events whose onset is retained, in
/// order of first appearance.
pub fn event_retention(rec: &Recording, retained: &[bool]) -> Vec<EventRetention> {
    let mut out: Vec<EventRetention> = Vec::new();
    for ev in &rec.events {
        let kept = retained.get(ev.onset).copied().unwrap_or(false);
        let entry = match out.iter_mut().position(|e| e.label == ev.label) {
            Some(i) => &mut out[i],
            None => {
                out.push(EventRetention {
                    label: ev.label.clone(),
                    count: 0,
                    retained: 0,
                    percent: 0.0,
                });
                let last = out.len() - 1;
                &mut out[last]
            }
        };
        entry.count += 1;
        entry.retained += kept as usize;
    }
    for e in &mut out {
        e.percent = percent(e.retained, e.count).unwrap_or(0.0);
    }
    out
}

/// Assemble the QC report.
pub fn compute_qc(inputs: &QcInputs<'_>, thresholds: &QcThresholds) -> QcReport {
    let rec = inputs.recording;
    let n_ch = rec.n_channels();
    let n_t = rec.n_samples();

    let bad_channels = inputs.mask.map(|m| {
        m.bad_indices()
            .into_iter()
            .filter_map(|i| {
                let label = rec.channels.get(i)?.label.clone();
                Some(BadChannelEntry { label, reason: m.reason(i)? })
            })
            .collect::<Vec<_>>()
    });
    let interpolated_count = inputs.interpolated.map(|v| v.len());
    let components_total = inputs.decomposition.map(|d| d.n_components());
    let components_removed = inputs.removed.map(|r| r.len());
    let samples_retained = inputs.retained.map(|r| r.iter().filter(|&&k| k).count());

    let mut report = QcReport {
        schema: QC_SCHEMA.to_string(),
        subject: inputs.subject.to_string(),
        n_channels: n_ch,
        n_samples: n_t,
        sfreq: rec.sfreq as f64,
        bad_channel_count: bad_channels.as_ref().map(|b| b.len()),
        bad_channels,
        interpolated_count,
        interpolated_percent: interpolated_count.and_then(|n| percent(n, n_ch)),
        components_total,
        components_removed,
        components_removed_percent: match (components_removed, components_total) {
            (Some(r), Some(t)) => percent(r, t),
            _ => None,
        },
        removed_components: inputs.removed.map(|r| r.to_vec()),
        samples_total: n_t,
        samples_retained,
        samples_retained_percent: samples_retained.and_then(|n| percent(n, n_t)),
        event_retention: inputs.retained.map(|r| event_retention(rec, r)),
        convergence: inputs.decomposition.map(|d| ConvergenceSummary {
            iterations: d.iterations,
            converged: d.converged,
            final_ll: d.final_ll(),
            model: d.model,
            restarts: d.restarts,
            trace: d.trace.points.clone(),
        }),
        signal_stats: inputs.stats.iter().cloned().collect(),
        exclusion_reasons: vec![],
        created_at: Utc::now(),
    };
    report.exclusion_reasons = exclusion_reasons(&report, thresholds);
    report
}

/// Threshold breaches that mark the subject for exclusion.
pub fn exclusion_reasons(report: &QcReport, t: &QcThresholds) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(p) = report.interpolated_percent.filter(|p| *p > t.max_interpolated_percent) {
        out.push(format!(
            "{p:.1}% of channels interpolated (limit {}%)",
            t.max_interpolated_percent
        ));
    }
    if let Some(p) =
        report.samples_retained_percent.filter(|p| *p < t.min_samples_retained_percent)
    {
        out.push(format!(
            "{p:.1}% of samples retained (minimum {}%)",
            t.min_samples_retained_percent
        ));
    }
    if let Some(p) =
        report.components_removed_percent.filter(|p| *p > t.max_components_removed_percent)
    {
        out.push(format!(
            "{p:.1}% of components removed (limit {}%)",
            t.max_components_removed_percent
        ));
    }
    out
}

fn or_unavailable<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map_or_else(|| "unavailable".to_string(), |v| v.to_string())
}

impl QcReport {
    pub fn is_excluded(&self) -> bool {
        !self.exclusion_reasons.is_empty()
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable form.
    pub fn to_text(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(s, "QC report: {} ({})", self.subject, self.schema);
        let _ = writeln!(s, "Created: {}", self.created_at.to_rfc3339());
        let _ = writeln!(
            s,
            "Channels: {}, samples: {} at {} Hz",
            self.n_channels, self.n_samples, self.sfreq
        );

        let _ = writeln!(s, "Bad channels: {}", or_unavailable(self.bad_channel_count));
        match &self.bad_channels {
            Some(b) if !b.is_empty() => {
                let list: Vec<String> =
                    b.iter().map(|e| format!("{} ({})", e.label, e.reason.as_str())).collect();
                let _ = writeln!(s, "Bad channels identified: {}", list.join(", "));
            }
            Some(_) => {
                let _ = writeln!(s, "Bad channels identified: none");
            }
            None => {}
        }
        match (self.interpolated_count, self.interpolated_percent) {
            (Some(n), Some(p)) => {
                let _ = writeln!(s, "Interpolated: {n} ({p:.1}%)");
            }
            _ => {
                let _ = writeln!(s, "Interpolated: unavailable");
            }
        }

        match (self.components_removed, self.components_total, self.components_removed_percent) {
            (Some(r), Some(t), Some(p)) => {
                let _ = writeln!(s, "ICs removed: {r} of {t} ({p:.1}%)");
            }
            (Some(r), _, _) => {
                let _ = writeln!(s, "ICs removed: {r}");
            }
            _ => {
                let _ = writeln!(s, "ICs removed: unavailable");
            }
        }
        for c in self.removed_components.iter().flatten() {
            let _ = writeln!(
                s,
                "  IC {}: {} (p = {:.3})",
                c.index,
                c.category.as_str(),
                c.probability
            );
        }

        match (self.samples_retained_percent, self.samples_retained) {
            (Some(p), Some(n)) => {
                let _ = writeln!(s, "Samples retained: {p:.1}% ({n} / {})", self.samples_total);
            }
            _ => {
                let _ = writeln!(s, "Samples retained: unavailable");
            }
        }
        match &self.event_retention {
            Some(ev) if !ev.is_empty() => {
                let _ = writeln!(s, "Event retention:");
                for e in ev {
                    let _ = writeln!(
                        s,
                        "  {}: {} / {} ({:.1}%)",
                        e.label, e.retained, e.count, e.percent
                    );
                }
            }
            Some(_) => {
                let _ = writeln!(s, "Event retention: no events");
            }
            None => {
                let _ = writeln!(s, "Event retention: unavailable");
            }
        }

        match &self.convergence {
            Some(c) => {
                let _ = writeln!(
                    s,
                    "Decomposition: {} iterations, converged: {}, final LL = {}, \
                     model {}, {} restart(s)",
                    c.iterations,
                    if c.converged { "yes" } else { "no" },
                    c.final_ll.map_or_else(|| "unavailable".into(), |v| format!("{v:.6}")),
                    c.model,
                    c.restarts
                );
            }
            None => {
                let _ = writeln!(s, "Decomposition: unavailable");
            }
        }
        for (name, st) in &self.signal_stats {
            let _ = writeln!(
                s,
                "Stats {}: min={:.4} max={:.4} mean={:.4} std={:.4}",
                name.replace('_', " "),
                st.min,
                st.max,
                st.mean,
                st.std
            );
        }
        if self.exclusion_reasons.is_empty() {
            let _ = writeln!(s, "Exclusion: none");
        } else {
            for r in &self.exclusion_reasons {
                let _ = writeln!(s, "Exclusion: {r}");
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Category;
    use crate::decompose::ConvergenceTrace;
    use crate::recording::{Channel, Event};

    fn rec() -> Recording {
        let chans: Vec<Channel> =
            ["Fp1", "Fp2", "C3", "C4"].iter().map(|l| Channel::new(*l, None)).collect();
        let events = vec![Event::new("stim", 10), Event::new("resp", 50), Event::new("stim", 90)];
        Recording::new(Array2::zeros((4, 100)), 100.0, chans, events).unwrap()
    }

    fn decomposition() -> Decomposition {
        let mut trace = ConvergenceTrace::default();
        trace.push(1, -2.0);
        trace.push(2, -1.9);
        Decomposition::from_weights(Array2::eye(4), Array2::eye(4), trace).unwrap()
    }

    #[test]
    fn zero_counts_are_explicit() {
        let r = rec();
        let mask = ChannelMask::none(4);
        let d = decomposition();
        let retained = vec![true; 100];
        let qc = compute_qc(
            &QcInputs {
                subject: "P01",
                recording: &r,
                mask: Some(&mask),
                interpolated: Some(&[]),
                decomposition: Some(&d),
                removed: Some(&[]),
                retained: Some(&retained),
                stats: vec![],
            },
            &QcThresholds::default(),
        );
        assert_eq!(qc.bad_channel_count, Some(0));
        assert_eq!(qc.components_removed, Some(0));
        assert_eq!(qc.components_removed_percent, Some(0.0));
        assert_eq!(qc.samples_retained_percent, Some(100.0));
        let json: serde_json::Value = serde_json::from_str(&qc.to_json().unwrap()).unwrap();
        assert_eq!(json["bad_channel_count"], 0);
        assert_eq!(json["components_removed"], 0);
        let text = qc.to_text();
        assert!(text.contains("Bad channels: 0"), "{text}");
        assert!(text.contains("ICs removed: 0 of 4 (0.0%)"), "{text}");
        assert!(text.contains("Samples retained: 100.0% (100 / 100)"), "{text}");
        assert!(!qc.is_excluded());
    }

    #[test]
    fn missing_inputs_are_unavailable() {
        let r = rec();
        let qc = compute_qc(
            &QcInputs {
                subject: "P02",
                recording: &r,
                mask: None,
                interpolated: None,
                decomposition: None,
                removed: None,
                retained: None,
                stats: vec![],
            },
            &QcThresholds::default(),
        );
        let json: serde_json::Value = serde_json::from_str(&qc.to_json().unwrap()).unwrap();
        assert!(json["bad_channel_count"].is_null());
        assert!(json["event_retention"].is_null());
        let text = qc.to_text();
        assert!(text.contains("Bad channels: unavailable"));
        assert!(text.contains("ICs removed: unavailable"));
        assert!(text.contains("Decomposition: unavailable"));
    }

    #[test]
    fn event_retention_follows_sample_mask() {
        let r = rec();
        let mut retained = vec![true; 100];
        retained[80..].iter_mut().for_each(|k| *k = false);
        let ev = event_retention(&r, &retained);
        assert_eq!(ev.len(), 2);
        assert_eq!((ev[0].label.as_str(), ev[0].count, ev[0].retained), ("stim", 2, 1));
        assert_eq!(ev[0].percent, 50.0);
        assert_eq!((ev[1].label.as_str(), ev[1].retained), ("resp", 1));
    }

    #[test]
    fn thresholds_produce_exclusion_reasons() {
        let r = rec();
        let mut reasons = vec![None; 4];
        reasons[0] = Some(BadReason::Flatline);
        reasons[1] = Some(BadReason::LineNoise);
        let mask = ChannelMask::from_reasons(reasons);
        let d = decomposition();
        let removed = vec![
            ComponentFlag { index: 0, category: Category::Eye, probability: 0.9 },
            ComponentFlag { index: 1, category: Category::Muscle, probability: 0.85 },
        ];
        let qc = compute_qc(
            &QcInputs {
                subject: "P03",
                recording: &r,
                mask: Some(&mask),
                interpolated: Some(&[0, 1]),
                decomposition: Some(&d),
                removed: Some(&removed),
                retained: Some(&vec![true; 100]),
                stats: vec![("at_save".into(), SignalStats::of(&r.data))],
            },
            &QcThresholds::default(),
        );
        assert_eq!(qc.interpolated_percent, Some(50.0));
        assert_eq!(qc.exclusion_reasons.len(), 2);
        assert!(qc.is_excluded());
        assert!(qc.to_text().contains("Bad channels identified: Fp1 (flatline), Fp2 (line_noise)"));
    }

    #[test]
    fn signal_stats() {
        let data = ndarray::array![[1.0_f32, -1.0], [3.0, 1.0]];
        let s = SignalStats::of(&data);
        assert_eq!((s.min, s.max, s.mean), (-1.0, 3.0, 1.0));
        approx::assert_abs_diff_eq!(s.std, 2.0_f64.sqrt(), epsilon = 1e-12);
    }
}
