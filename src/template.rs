//! Channel template: canonical channel order and spatial positions.
//!
//! The template is the position-complete channel list of a subject, kept
//! apart from the working recording so that reconstruction can restore the
//! exact channel count and order.  Positions missing from the input file are
//! filled from a built-in 10-20 table; every position is projected onto the
//! unit sphere (x right, y anterior, z up).
use crate::error::{CleanError, Result};
use crate::recording::{Channel, Recording};

/// Approximate 10-20 positions on the unit sphere.  Old temporal names
/// (T3/T4/T5/T6) alias their 10-10 equivalents.
const STANDARD_1020: &[(&str, [f64; 3])] = &[
    ("fp1", [-0.309, 0.951, 0.0]),
    ("fpz", [0.0, 1.0, 0.0]),
    ("fp2", [0.309, 0.951, 0.0]),
    ("f7", [-0.809, 0.588, 0.0]),
    ("f3", [-0.545, 0.673, 0.5]),
    ("fz", [0.0, 0.719, 0.695]),
    ("f4", [0.545, 0.673, 0.5]),
    ("f8", [0.809, 0.588, 0.0]),
    ("fc1", [-0.36, 0.36, 0.86]),
    ("fc2", [0.36, 0.36, 0.86]),
    ("t7", [-1.0, 0.0, 0.0]),
    ("t3", [-1.0, 0.0, 0.0]),
    ("c3", [-0.719, 0.0, 0.695]),
    ("cz", [0.0, 0.0, 1.0]),
    ("c4", [0.719, 0.0, 0.695]),
    ("t8", [1.0, 0.0, 0.0]),
    ("t4", [1.0, 0.0, 0.0]),
    ("cp1", [-0.36, -0.36, 0.86]),
    ("cp2", [0.36, -0.36, 0.86]),
    ("p7", [-0.809, -0.588, 0.0]),
    ("t5", [-0.809, -0.588, 0.0]),
    ("p3", [-0.545, -0.673, 0.5]),
    ("pz", [0.0, -0.719, 0.695]),
    ("p4", [0.545, -0.673, 0.5]),
    ("p8", [0.809, -0.588, 0.0]),
    ("t6", [0.809, -0.588, 0.0]),
    ("o1", [-0.309, -0.951, 0.0]),
    ("oz", [0.0, -1.0, 0.0]),
    ("o2", [0.309, -0.951, 0.0]),
];

/// Label normalisation: lowercase, spaces stripped (`"Fp 1"` ≡ `"fp1"`).
pub fn normalize_label(label: &str) -> String {
    label.replace(' ', "").to_lowercase()
}

/// Standard 10-20 position for `label`, if it is a known site.
pub fn standard_position(label: &str) -> Option<[f64; 3]> {
    let key = normalize_label(label);
    STANDARD_1020.iter().find(|(name, _)| *name == key).map(|(_, p)| unit(*p))
}

fn unit(p: [f64; 3]) -> [f64; 3] {
    let n = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
    if n > 0.0 { [p[0] / n, p[1] / n, p[2] / n] } else { p }
}

fn chord(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}

#[derive(Debug, Clone)]
pub struct ChannelTemplate {
    channels: Vec<Channel>,
}

impl ChannelTemplate {
    /// Build the template from the channel list of an input file.
    ///
    /// Duplicate labels are rejected; missing or degenerate positions are
    /// looked up in the standard table and otherwise stay `None`.
    pub fn from_channels(channels: &[Channel]) -> Result<Self> {
        let mut out: Vec<Channel> = Vec::with_capacity(channels.len());
        for ch in channels {
            let key = normalize_label(&ch.label);
            if key.is_empty() {
                return Err(CleanError::Input("empty channel label".into()));
            }
            if out.iter().any(|c| normalize_label(&c.label) == key) {
                return Err(CleanError::Input(format!("duplicate channel label '{}'", ch.label)));
            }
            let given = ch
                .position
                .filter(|p| p.iter().all(|v| v.is_finite()) && p.iter().any(|v| *v != 0.0))
                .map(unit);
            let position = given.or_else(|| standard_position(&ch.label));
            if position.is_none() {
                log::debug!("no position known for channel '{}'", ch.label);
            }
            out.push(Channel::new(ch.label.clone(), position));
        }
        Ok(Self { channels: out })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }

    pub fn position(&self, idx: usize) -> Option<[f64; 3]> {
        self.channels.get(idx).and_then(|c| c.position)
    }

    pub fn positions(&self) -> Vec<Option<[f64; 3]>> {
        self.channels.iter().map(|c| c.position).collect()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        let key = normalize_label(label);
        self.channels.iter().position(|c| normalize_label(&c.label) == key)
    }

    /// The `k` channels closest to `idx` by chord distance.
    ///
    /// Returns an empty list when `idx` has no position; channels without a
    /// position are never neighbours.
    pub fn neighbours(&self, idx: usize, k: usize) -> Vec<usize> {
        self.neighbours_where(idx, k, |_| true)
    }

    /// Like [`neighbours`](Self::neighbours), but only channels for which
    /// `keep` holds are candidates.
    pub fn neighbours_where(
        &self,
        idx: usize,
        k: usize,
        keep: impl Fn(usize) -> bool,
    ) -> Vec<usize> {
        let Some(p) = self.position(idx) else {
            return vec![];
        };
        let mut dists: Vec<(usize, f64)> = self
            .channels
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != idx && keep(*j))
            .filter_map(|(j, c)| c.position.map(|q| (j, chord(&p, &q))))
            .collect();
        dists.sort_by(|a, b| a.1.total_cmp(&b.1));
        dists.into_iter().take(k).map(|(j, _)| j).collect()
    }

    /// Copy the template positions onto a recording with the same channel
    /// order.
    pub fn apply(&self, rec: &mut Recording) -> Result<()> {
        self.verify(rec)?;
        for (ch, t) in rec.channels.iter_mut().zip(&self.channels) {
            ch.position = t.position;
        }
        Ok(())
    }

    /// Check that `rec` carries exactly the template's channels, in order.
    pub fn verify(&self, rec: &Recording) -> Result<()> {
        if rec.channels.len() != self.len() || rec.n_channels() != self.len() {
            return Err(CleanError::Invariant(format!(
                "channel count drift: template has {}, recording lists {} labels and {} data rows",
                self.len(),
                rec.channels.len(),
                rec.n_channels()
            )));
        }
        for (i, (a, b)) in rec.channels.iter().zip(&self.channels).enumerate() {
            if normalize_label(&a.label) != normalize_label(&b.label) {
                return Err(CleanError::Invariant(format!(
                    "channel order drift at index {i}: '{}' where template has '{}'",
                    a.label, b.label
                )));
            }
        }
        Ok(())
    }
}
