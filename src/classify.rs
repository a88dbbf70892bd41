//! Component Classifier.
//!
//! Every component gets a probability vector over seven [`Category`]
//! values from a [`ComponentScorer`].  The scorer is swappable; only its
//! contract matters: given a component's topography and time course, return
//! seven non-negative numbers.  The classifier validates and renormalises
//! them.
//!
//! Removal is decided by [`flag_components`], a pure function of the
//! probability matrix and the policy.  Nothing is removed here.
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;
use crate::decompose::Decomposition;
use crate::error::{CleanError, Result};
use crate::spectrum::{default_nperseg, kurtosis, welch};

pub const N_CATEGORIES: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Neural,
    Muscle,
    Eye,
    Cardiac,
    LineNoise,
    ChannelNoise,
    Other,
}

impl Category {
    /// All categories in probability-vector order.
    pub const ALL: [Category; N_CATEGORIES] = [
        Category::Neural,
        Category::Muscle,
        Category::Eye,
        Category::Cardiac,
        Category::LineNoise,
        Category::ChannelNoise,
        Category::Other,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Neural => "neural",
            Category::Muscle => "muscle",
            Category::Eye => "eye",
            Category::Cardiac => "cardiac",
            Category::LineNoise => "line_noise",
            Category::ChannelNoise => "channel_noise",
            Category::Other => "other",
        }
    }
}

/// What a scorer sees of one component.
pub struct ComponentView<'a> {
    pub index: usize,
    /// Mixing-matrix column: the component's weight on every channel.
    pub topography: ArrayView1<'a, f64>,
    /// Activation time course.
    pub activation: ArrayView1<'a, f64>,
    /// Unit-sphere channel positions, aligned with `topography`.
    pub positions: &'a [Option<[f64; 3]>],
    pub sfreq: f64,
    pub line_freq: Option<f64>,
}

/// Maps a component to seven non-negative category scores.
pub trait ComponentScorer: Send + Sync {
    fn score(&self, component: &ComponentView<'_>) -> Result<[f64; N_CATEGORIES]>;
}

/// A component flagged for removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentFlag {
    pub index: usize,
    /// The removal category with the highest probability.
    pub category: Category,
    pub probability: f64,
}

#[derive(Debug, Clone)]
pub struct Classification {
    /// `[K, 7]`, rows sum to 1.
    pub probabilities: Array2<f64>,
    pub flags: Vec<ComponentFlag>,
}

impl Classification {
    pub fn removed(&self) -> Vec<usize> {
        self.flags.iter().map(|f| f.index).collect()
    }
}

/// Validate a raw score vector and rescale it to sum to 1.
pub fn normalise(raw: [f64; N_CATEGORIES]) -> Result<[f64; N_CATEGORIES]> {
    if raw.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(CleanError::Numerical(format!("scorer returned invalid probabilities {raw:?}")));
    }
    let sum: f64 = raw.iter().sum();
    if sum <= 0.0 {
        return Err(CleanError::Numerical("scorer returned an all-zero probability vector".into()));
    }
    Ok(raw.map(|v| v / sum))
}

/// Score every component of `decomposition` over `data` (`[C, T]`).
pub fn score_components(
    scorer: &dyn ComponentScorer,
    decomposition: &Decomposition,
    data: ArrayView2<'_, f64>,
    positions: &[Option<[f64; 3]>],
    sfreq: f64,
    line_freq: Option<f64>,
) -> Result<Array2<f64>> {
    let sources = decomposition.sources(data);
    let k = decomposition.n_components();
    let mut probs = Array2::<f64>::zeros((k, N_CATEGORIES));
    for i in 0..k {
        let view = ComponentView {
            index: i,
            topography: decomposition.mixing.column(i),
            activation: sources.row(i),
            positions,
            sfreq,
            line_freq,
        };
        let p = normalise(scorer.score(&view)?)?;
        for (dst, v) in probs.row_mut(i).iter_mut().zip(p) {
            *dst = v;
        }
    }
    Ok(probs)
}

/// Decide which components to remove.
///
/// A component is flagged when its probability in any of `policy.remove`
/// is at least `policy.threshold`.  The flag records the dominant such
/// category; ties go to the earlier category.
pub fn flag_components(probs: &Array2<f64>, policy: &ClassifierConfig) -> Vec<ComponentFlag> {
    let mut flags = Vec::new();
    for (index, row) in probs.rows().into_iter().enumerate() {
        let hits: Vec<(Category, f64)> = policy
            .remove
            .iter()
            .map(|&c| (c, row[c.index()]))
            .filter(|(_, p)| *p >= policy.threshold)
            .collect();
        let Some(&(category, probability)) = hits
            .iter()
            .fold(None, |best: Option<&(Category, f64)>, h| match best {
                Some(b) if b.1 >= h.1 => Some(b),
                _ => Some(h),
            })
        else {
            continue;
        };
        if hits.len() > 1 {
            log::info!(
                "component {index} exceeds the threshold in {} categories; \
                 dominant: {} ({probability:.3})",
                hits.len(),
                category.as_str()
            );
        } else {
            log::debug!("component {index}: {} ({probability:.3})", category.as_str());
        }
        flags.push(ComponentFlag { index, category, probability });
    }
    flags
}

/// Score, then flag.
pub fn classify(
    scorer: &dyn ComponentScorer,
    decomposition: &Decomposition,
    data: ArrayView2<'_, f64>,
    positions: &[Option<[f64; 3]>],
    sfreq: f64,
    line_freq: Option<f64>,
    policy: &ClassifierConfig,
) -> Result<Classification> {
    let probabilities = score_components(scorer, decomposition, data, positions, sfreq, line_freq)?;
    let flags = flag_components(&probabilities, policy);
    log::info!(
        "{} of {} components flagged for removal",
        flags.len(),
        probabilities.nrows()
    );
    Ok(Classification { probabilities, flags })
}

/// Built-in scorer: a softmax over hand-set logits of spectral band
/// ratios, kurtosis and topography shape.
///
/// | category | evidence |
/// |---|---|
/// | neural | alpha (8-13 Hz) share |
/// | muscle | share above 20 Hz |
/// | eye | 0.5-4 Hz share, anterior topography, peaky time course |
/// | cardiac | peaky time course away from the front, little slow power |
/// | line noise | share within ±1 Hz of the line frequency |
/// | channel noise | topography concentrated on one channel |
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicScorer;

impl HeuristicScorer {
    fn features(c: &ComponentView<'_>) -> Features {
        let x: Vec<f64> = c.activation.to_vec();
        let psd = welch(&x, c.sfreq, default_nperseg(c.sfreq, x.len()));
        let nyq = c.sfreq / 2.0;

        let w2: Vec<f64> = c.topography.iter().map(|v| v * v).collect();
        let total: f64 = w2.iter().sum();
        let (frontal, focal) = if total > 0.0 {
            let anterior: f64 = w2
                .iter()
                .zip(c.positions)
                .filter_map(|(w, p)| p.map(|p| w * p[1].max(0.0)))
                .sum();
            let peak = w2.iter().cloned().fold(0.0_f64, f64::max);
            (anterior / total, peak / total)
        } else {
            (0.0, 0.0)
        };

        Features {
            alpha: psd.band_ratio(8.0, 13.0),
            high: psd.band_ratio(20.0, nyq),
            slow: psd.band_ratio(0.5, 4.0),
            line: c
                .line_freq
                .filter(|f| f + 1.0 < nyq)
                .map_or(0.0, |f| psd.band_ratio(f - 1.0, f + 1.0)),
            kurtosis: kurtosis(&x).min(15.0),
            frontal,
            focal,
        }
    }
}

struct Features {
    alpha: f64,
    high: f64,
    slow: f64,
    line: f64,
    kurtosis: f64,
    frontal: f64,
    focal: f64,
}

impl ComponentScorer for HeuristicScorer {
    fn score(&self, component: &ComponentView<'_>) -> Result<[f64; N_CATEGORIES]> {
        let f = Self::features(component);
        let logits = [
            1.5 + 3.0 * f.alpha,
            8.0 * f.high - 4.0,
            6.0 * f.slow + 5.0 * f.frontal + 0.4 * f.kurtosis - 6.0,
            0.35 * f.kurtosis + 2.0 * (1.0 - f.frontal) - 4.0 * f.slow - 2.0,
            25.0 * f.line - 3.0,
            10.0 * f.focal - 7.5,
            0.0,
        ];
        let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let e = logits.map(|l| (l - max).exp());
        let sum: f64 = e.iter().sum();
        Ok(e.map(|v| v / sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};
    use std::f64::consts::PI;

    fn policy() -> ClassifierConfig {
        ClassifierConfig::default()
    }

    #[test]
    fn flagging_is_a_pure_function() {
        let probs = array![
            [0.9, 0.02, 0.02, 0.02, 0.02, 0.01, 0.01],
            [0.05, 0.05, 0.85, 0.01, 0.01, 0.02, 0.01],
            [0.1, 0.8, 0.0, 0.0, 0.0, 0.1, 0.0],
            [0.1, 0.1, 0.0, 0.79, 0.0, 0.0, 0.01],
        ];
        let a = flag_components(&probs, &policy());
        let b = flag_components(&probs, &policy());
        assert_eq!(a, b);
        let idx: Vec<usize> = a.iter().map(|f| f.index).collect();
        assert_eq!(idx, vec![1, 2]);
        assert_eq!(a[0].category, Category::Eye);
        assert_eq!(a[1].category, Category::Muscle);
    }

    #[test]
    fn multiple_hits_record_dominant() {
        let probs = array![[0.0, 0.45, 0.55, 0.0, 0.0, 0.0, 0.0]];
        let cfg = ClassifierConfig { threshold: 0.4, ..policy() };
        let flags = flag_components(&probs, &cfg);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].category, Category::Eye);
    }

    #[test]
    fn threshold_above_one_flags_nothing() {
        let probs = array![[0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]];
        let cfg = ClassifierConfig { threshold: 1.01, ..policy() };
        assert!(flag_components(&probs, &cfg).is_empty());
    }

    #[test]
    fn normalise_rejects_invalid_vectors() {
        assert!(normalise([0.0; 7]).is_err());
        assert!(normalise([f64::NAN, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0]).is_err());
        assert!(normalise([-0.1, 1.1, 0.0, 0.0, 0.0, 0.0, 0.0]).is_err());
        let p = normalise([2.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        approx::assert_abs_diff_eq!(p[0], 0.5, epsilon = 1e-12);
    }

    fn positions() -> Vec<Option<[f64; 3]>> {
        ["Fp1", "Fp2", "C3", "C4", "O1", "O2"]
            .iter()
            .map(|l| crate::template::standard_position(l))
            .collect()
    }

    fn view<'a>(
        topo: &'a Array1<f64>,
        act: &'a Array1<f64>,
        pos: &'a [Option<[f64; 3]>],
    ) -> ComponentView<'a> {
        ComponentView {
            index: 0,
            topography: topo.view(),
            activation: act.view(),
            positions: pos,
            sfreq: 250.0,
            line_freq: Some(60.0),
        }
    }

    #[test]
    fn frontal_blinks_score_as_eye() {
        let pos = positions();
        let topo = array![1.0, 1.0, 0.15, 0.15, 0.05, 0.05];
        let act = Array1::from_shape_fn(250 * 60, |t| {
            let phase = t % 750;
            if phase < 100 { 0.5 * (1.0 - (2.0 * PI * phase as f64 / 100.0).cos()) } else { 0.0 }
        });
        let p = HeuristicScorer.score(&view(&topo, &act, &pos)).unwrap();
        assert!(p[Category::Eye.index()] > 0.8, "{p:?}");
    }

    #[test]
    fn posterior_alpha_scores_as_neural() {
        let pos = positions();
        let topo = array![0.1, 0.1, 0.5, 0.5, 1.0, 1.0];
        let act = Array1::from_shape_fn(250 * 60, |t| (2.0 * PI * 10.0 * t as f64 / 250.0).sin());
        let p = HeuristicScorer.score(&view(&topo, &act, &pos)).unwrap();
        let best = (0..7).max_by(|&a, &b| p[a].total_cmp(&p[b])).unwrap();
        assert_eq!(best, Category::Neural.index(), "{p:?}");
        assert!(p[Category::Eye.index()] < 0.8);
    }

    #[test]
    fn categories_serialise_snake_case() {
        assert_eq!(serde_json::to_string(&Category::ChannelNoise).unwrap(), "\"channel_noise\"");
        assert_eq!(Category::ALL[Category::LineNoise.index()], Category::LineNoise);
    }
}
