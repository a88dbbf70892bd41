//! eegclean: clean a list of subjects with a bounded worker pool.
//!
//! ```text
//! eegclean --input-dir data --subjects P01,P02,P03 --output-root out \
//!          --workers 2 --threads 4
//! ```
//!
//! Writes `<output-root>/<subject>/…` per subject and
//! `<output-root>/batch_summary.{json,txt}` once every job has finished.
//! Exits with status 2 when at least one subject failed.
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use eegclean::{BatchConfig, Orchestrator, Pipeline, PipelineConfig, SubjectSpec};

#[derive(Parser, Debug)]
#[command(name = "eegclean", about = "Batch EEG artifact removal")]
struct Args {
    /// Directory holding `<subject>.safetensors` recordings.
    #[arg(long)]
    input_dir: PathBuf,

    /// Comma-separated subject identifiers.
    #[arg(long, value_delimiter = ',')]
    subjects: Vec<String>,

    /// File with one subject identifier per line (`#` starts a comment).
    #[arg(long)]
    subjects_file: Option<PathBuf>,

    /// Root of the per-subject output directories.
    #[arg(long, default_value = "output/cleaned")]
    output_root: PathBuf,

    /// Concurrent jobs (W).
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Decomposition threads per job (T).  Ignored when `--budget` is set.
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Total thread budget B, split as T = B / W.
    #[arg(long)]
    budget: Option<usize>,

    /// Pipeline configuration JSON; absent fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Recompute subjects whose outputs already exist.
    #[arg(long)]
    no_skip: bool,
}

fn read_subject_list(args: &Args) -> Result<Vec<String>> {
    let mut ids: Vec<String> = args
        .subjects
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if let Some(path) = &args.subjects_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        ids.extend(
            text.lines()
                .map(|l| l.split('#').next().unwrap_or("").trim())
                .filter(|l| !l.is_empty())
                .map(String::from),
        );
    }
    if ids.is_empty() {
        bail!("no subjects given (use --subjects or --subjects-file)");
    }
    Ok(ids)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let ids = read_subject_list(&args)?;
    let pipeline_cfg = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let mut batch = match args.budget {
        Some(b) => BatchConfig::from_budget(b, args.workers, &args.output_root)?,
        None => BatchConfig {
            workers: args.workers,
            threads_per_worker: args.threads,
            output_root: args.output_root.clone(),
            ..BatchConfig::default()
        },
    };
    batch.skip_existing = !args.no_skip;

    let subjects = SubjectSpec::from_dir(&args.input_dir, &ids);
    let orch = Orchestrator::new(Pipeline::new(pipeline_cfg), batch)?;
    let summary = orch.run(&subjects)?;

    print!("{}", summary.to_text());
    eprintln!("Summary → {}", args.output_root.join("batch_summary.json").display());
    if summary.failed > 0 {
        std::process::exit(2);
    }
    Ok(())
}
