/// clean_steps: run every cleaning stage on one recording and write each
/// intermediate array to a safetensors file for inspection.
///
/// Output keys:
///   raw               [C, T_orig]  f32  input signal
///   filtered          [C, T]       f32  after resample + band-pass + notches
///   bad_mask          [C]          u8   1 = flagged by the detector
///   sources           [C, T]       f64  component activations W·S·X
///   ic_probabilities  [C, 7]       f64  classifier output
///   removed           [R]          i64  removed component indices
///   ic_removed        [C, T]       f64  after component removal
///   interpolated      [C, T]       f64  after bad-channel interpolation
///   cleaned           [C, T]       f32  after average reference
///   ll_trace          [K, 2]       f64  (iteration, LL)
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use eegclean::{
    classify::{classify, HeuristicScorer},
    config::{DecompositionConfig, PipelineConfig},
    decompose::{Decomposer, Infomax},
    detect::detect_bad_channels,
    filter::filter_recording,
    interpolate::interpolate_bad_channels,
    io::{read_recording, StWriter},
    reconstruct::{average_reference_inplace, remove_components},
    template::ChannelTemplate,
};

#[derive(Parser, Debug)]
#[command(name = "clean_steps")]
struct Args {
    /// Input recording (`eegclean.recording/1` safetensors).
    #[arg(long)]
    input: PathBuf,

    /// Output safetensors path.
    #[arg(long)]
    output: PathBuf,

    /// Subject identifier (selects subject-specific notches).
    #[arg(long, default_value = "subject")]
    subject: String,

    /// Pipeline configuration JSON.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Decomposition threads.
    #[arg(long, default_value_t = 1)]
    threads: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = match &args.config {
        Some(p) => PipelineConfig::from_json_file(p)?,
        None => PipelineConfig::default(),
    };

    // ── 1. Read ────────────────────────────────────────────────────────────
    let t_read = now();
    let mut rec = read_recording(&args.input)?;
    let raw = rec.data.clone();
    let template = ChannelTemplate::from_channels(&rec.channels)?;
    template.apply(&mut rec)?;
    let ms_read = t_read.elapsed().as_secs_f64() * 1000.0;

    // ── 2. Filter ──────────────────────────────────────────────────────────
    let t_f = now();
    let filtered = filter_recording(&rec, &args.subject, &cfg.filter)?;
    let ms_f = t_f.elapsed().as_secs_f64() * 1000.0;

    // ── 3. Detect ──────────────────────────────────────────────────────────
    let t_d = now();
    let mask = detect_bad_channels(&filtered, &template, cfg.filter.line_freq, &cfg.detector);
    let ms_d = t_d.elapsed().as_secs_f64() * 1000.0;

    // ── 4. Decompose ───────────────────────────────────────────────────────
    let t_ica = now();
    let x = filtered.data_f64();
    let params = DecompositionConfig { threads: args.threads, ..cfg.decomposition.clone() };
    let dec = Infomax.decompose(&args.subject, x.view(), &params)?;
    let ms_ica = t_ica.elapsed().as_secs_f64() * 1000.0;

    // ── 5. Classify ────────────────────────────────────────────────────────
    let t_c = now();
    let cls = classify(
        &HeuristicScorer,
        &dec,
        x.view(),
        &template.positions(),
        filtered.sfreq as f64,
        cfg.filter.line_freq.map(f64::from),
        &cfg.classifier,
    )?;
    let removed = cls.removed();
    let ms_c = t_c.elapsed().as_secs_f64() * 1000.0;

    // ── 6. Reconstruct ─────────────────────────────────────────────────────
    let t_r = now();
    let ic_removed = remove_components(&x, &dec, &removed)?;
    let mut interpolated = ic_removed.clone();
    interpolate_bad_channels(&mut interpolated, &template, &mask)?;
    let mut cleaned = interpolated.clone();
    average_reference_inplace(&mut cleaned);
    let ms_r = t_r.elapsed().as_secs_f64() * 1000.0;

    eprintln!(
        "TIMING read={ms_read:.4}ms filter={ms_f:.4}ms detect={ms_d:.4}ms \
         decompose={ms_ica:.4}ms classify={ms_c:.4}ms reconstruct={ms_r:.4}ms",
    );
    eprintln!(
        "  {} ch  {} samples  {} bad  {} removed  {} iterations",
        filtered.n_channels(),
        filtered.n_samples(),
        mask.count(),
        removed.len(),
        dec.iterations
    );

    // ── 7. Write output ────────────────────────────────────────────────────
    eprintln!("Writing → {}", args.output.display());
    let mut w = StWriter::new().with_schema("eegclean.steps/1");
    w.add_f32_arr2("raw", &raw);
    w.add_f32_arr2("filtered", &filtered.data);
    let bad: Vec<u8> = mask.as_bools().into_iter().map(u8::from).collect();
    w.add_u8("bad_mask", &bad);
    w.add_f64_arr2("sources", &dec.sources(x.view()));
    w.add_f64_arr2("ic_probabilities", &cls.probabilities);
    let removed_i64: Vec<i64> = removed.iter().map(|&i| i as i64).collect();
    w.add_i64("removed", &removed_i64);
    w.add_f64_arr2("ic_removed", &ic_removed);
    w.add_f64_arr2("interpolated", &interpolated);
    w.add_f32_arr2("cleaned", &cleaned.mapv(|v| v as f32));
    let trace: Vec<f64> = dec.trace.points.iter().flat_map(|&(i, ll)| [i as f64, ll]).collect();
    w.add_f64("ll_trace", &trace, &[dec.trace.len(), 2]);
    w.write(&args.output)?;

    eprintln!("Done.");
    Ok(())
}

#[inline(always)]
fn now() -> std::time::Instant {
    std::time::Instant::now()
}
