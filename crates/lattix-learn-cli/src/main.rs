//! lattix-learn CLI - train knowledge graph embeddings from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Train TransE on a tab-separated triple file, 8 worker threads
//! lattix-learn train triples.tsv --dim 100 --epochs 500 --threads 8 --out model/
//!
//! # Same, hyperparameters from JSON, checkpoint every 50 epochs
//! lattix-learn train triples.tsv --config params.json --store-every 50 --out model/
//!
//! # Show what a stored model contains
//! lattix-learn inspect model/
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lattix_learn::persistence::read_meta;
use lattix_learn::scoring::strategy_for;
use lattix_learn::{
    load_model, LearnParams, Learner, ModelKind, RankValidator, ShuffledBatcher, StopReason, Triple, TripleSet,
    Validator,
};
use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lattix-learn")]
#[command(about = "Knowledge graph embedding trainer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train embeddings from a `head<TAB>relation<TAB>tail` file
    Train(TrainArgs),

    /// Show the shape and layout of a stored model
    Inspect {
        /// Model directory
        dir: PathBuf,

        /// Also load every shard
        #[arg(long)]
        verify: bool,
    },
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Input triples (TSV, labels are arbitrary strings)
    input: PathBuf,

    /// JSON file with hyperparameters; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory for checkpoints and the final model
    #[arg(short, long)]
    out: Option<PathBuf>,

    #[arg(long)]
    model: Option<ModelKind>,

    #[arg(long)]
    dim: Option<usize>,

    #[arg(long)]
    epochs: Option<u32>,

    #[arg(long)]
    margin: Option<f32>,

    #[arg(long = "lr")]
    learning_rate: Option<f32>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Use AdaGrad instead of plain SGD
    #[arg(long)]
    adagrad: bool,

    /// Training worker threads
    #[arg(long)]
    threads: Option<usize>,

    /// Checkpoint writer threads
    #[arg(long)]
    store_threads: Option<usize>,

    /// Validate every N epochs
    #[arg(long)]
    eval_every: Option<u32>,

    /// Checkpoint every N epochs (needs --out)
    #[arg(long)]
    store_every: Option<u32>,

    /// Gzip checkpoint shards
    #[arg(long)]
    compress: bool,

    /// Write per-update gradient traces to this CSV file
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Fraction of triples held out for validation
    #[arg(long)]
    valid: Option<f32>,

    /// Fraction of triples held out for testing
    #[arg(long)]
    test: Option<f32>,

    /// Corrupted copies per positive triple
    #[arg(long)]
    numneg: Option<usize>,

    /// Stop once the violation rate improves by less than this per epoch
    #[arg(long)]
    feedback_threshold: Option<f64>,

    /// Epochs that always run before the early stop is consulted
    #[arg(long, default_value = "2")]
    feedback_min_epochs: u32,

    #[arg(long)]
    seed: Option<u64>,

    /// Continue from a stored model
    #[arg(long)]
    warm_start: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => cmd_train(args),
        Commands::Inspect { dir, verify } => cmd_inspect(&dir, verify),
    }
}

/// Label <-> dense id mapping, in first-seen order.
#[derive(Default)]
struct Vocab {
    ids: HashMap<String, u64>,
    labels: Vec<String>,
}

impl Vocab {
    fn id(&mut self, label: &str) -> u64 {
        if let Some(&id) = self.ids.get(label) {
            return id;
        }
        let id = self.labels.len() as u64;
        self.ids.insert(label.to_string(), id);
        self.labels.push(label.to_string());
        id
    }

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn write(&self, path: &Path) -> Result<()> {
        let mut out = fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        for (id, label) in self.labels.iter().enumerate() {
            writeln!(out, "{id}\t{label}")?;
        }
        Ok(())
    }
}

fn load_triples(path: &Path) -> Result<(TripleSet, Vocab, Vocab)> {
    let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut entities = Vocab::default();
    let mut relations = Vocab::default();
    let mut triples = Vec::new();

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 3 {
            bail!("{}:{}: expected 3 tab-separated fields, found {}", path.display(), n + 1, fields.len());
        }
        let head = entities.id(fields[0]);
        let relation = relations.id(fields[1]);
        let tail = entities.id(fields[2]);
        triples.push(Triple::new(head, relation, tail));
    }
    if triples.is_empty() {
        bail!("{} contains no triples", path.display());
    }

    let set = TripleSet::with_counts(triples, entities.len(), relations.len())?;
    Ok((set, entities, relations))
}

fn build_params(args: &TrainArgs, set: &TripleSet) -> Result<LearnParams> {
    let mut params = match &args.config {
        Some(path) => {
            LearnParams::from_json_file(path).with_context(|| format!("Failed to load config {}", path.display()))?
        }
        None => LearnParams::default(),
    };
    params.ne = set.num_entities();
    params.nr = set.num_relations();

    if let Some(v) = args.model {
        params.model = v;
    }
    if let Some(v) = args.dim {
        params.dim = v;
    }
    if let Some(v) = args.epochs {
        params.epochs = v;
    }
    if let Some(v) = args.margin {
        params.margin = v;
    }
    if let Some(v) = args.learning_rate {
        params.learning_rate = v;
    }
    if let Some(v) = args.batch_size {
        params.batch_size = v;
    }
    if args.adagrad {
        params.adagrad = true;
    }
    if let Some(v) = args.threads {
        params.nthreads = v;
    }
    if let Some(v) = args.store_threads {
        params.nstorethreads = v;
    }
    if let Some(v) = args.eval_every {
        params.evalits = v;
    }
    if let Some(v) = args.store_every {
        params.storeits = v;
    }
    if let Some(dir) = &args.out {
        params.storefolder = Some(dir.clone());
    }
    if args.compress {
        params.compress_storage = true;
    }
    if let Some(v) = &args.trace {
        params.filetrace = Some(v.clone());
    }
    if let Some(v) = args.valid {
        params.valid = v;
    }
    if let Some(v) = args.test {
        params.test = v;
    }
    if let Some(v) = args.numneg {
        params.numneg = v;
    }
    if let Some(threshold) = args.feedback_threshold {
        params = params.with_feedback(threshold, args.feedback_min_epochs);
    }
    if let Some(v) = args.seed {
        params.seed = v;
    }

    params.validate().context("Invalid training parameters")?;
    Ok(params)
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let start = Instant::now();
    let (set, entities, relations) = load_triples(&args.input)?;
    let params = build_params(&args, &set)?;
    info!(
        triples = set.len(),
        entities = entities.len(),
        relations = relations.len(),
        "loaded {}",
        args.input.display()
    );

    let split = set.split(params.valid, params.test, params.seed)?;
    let mut source = ShuffledBatcher::new(&split.train, params.numneg, params.seed);

    let pb = ProgressBar::new(u64::from(params.epochs));
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} epochs {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let progress = pb.clone();

    let mut learner = Learner::new(params.clone())?.on_epoch(move |stats| {
        progress.inc(1);
        progress.set_message(format!(
            "violations {:.4} conflicts {}",
            stats.violation_rate(),
            stats.conflicts
        ));
    });
    if !split.valid.is_empty() {
        learner = learner.with_validator(RankValidator::new(split.valid.triples().to_vec()));
    }
    if let Some(dir) = &args.warm_start {
        let model = load_model(dir).with_context(|| format!("Failed to load warm start {}", dir.display()))?;
        learner = learner.with_warm_start(model)?;
    }

    let (model, report) = learner.train(&mut source)?;
    pb.finish_and_clear();

    if let Some(dir) = &params.storefolder {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        entities.write(&dir.join("entities.tsv"))?;
        relations.write(&dir.join("relations.tsv"))?;
        fs::write(dir.join("params.json"), serde_json::to_string_pretty(&params)?)
            .with_context(|| format!("Failed to write params to {}", dir.display()))?;
    }

    println!("Training Summary");
    println!("================");
    println!("Entities:       {}", set.num_entities());
    println!("Relations:      {}", set.num_relations());
    println!("Triples:        {} train / {} valid / {} test", split.train.len(), split.valid.len(), split.test.len());
    println!("Epochs run:     {}", report.epochs_run());
    match report.stop {
        StopReason::Completed => println!("Stopped:        all epochs completed"),
        StopReason::EarlyStop { epoch, improvement } => {
            println!("Stopped:        early at epoch {epoch} (improvement {improvement:.5})")
        }
    }
    if let Some(last) = report.epochs.last() {
        println!("Violation rate: {:.4}", last.violation_rate());
    }
    println!("Conflicts:      {}", report.total_conflicts());
    if !report.checkpoints.is_empty() {
        println!(
            "Checkpoints:    {} written, {} failed",
            report.checkpoints.len() - report.failed_checkpoints(),
            report.failed_checkpoints()
        );
    }

    if !split.test.is_empty() {
        let strategy = strategy_for(params.model);
        let test = RankValidator::new(split.test.triples().to_vec());
        let result = test.validate(&model.entities, &model.relations, strategy.as_ref())?;
        println!("Test:           {}", result.metrics.summary());
    }
    println!("Elapsed:        {:.2?}", start.elapsed());
    Ok(())
}

fn cmd_inspect(dir: &Path, verify: bool) -> Result<()> {
    let meta = read_meta(dir).with_context(|| format!("Failed to read model metadata in {}", dir.display()))?;

    println!("Model");
    println!("=====");
    println!("Entities:       {}", meta.ne);
    println!("Relations:      {}", meta.nr);
    println!("Dimension:      {}", meta.dim);
    println!("Scoring:        {}", meta.model);
    println!("Epoch:          {}", meta.epoch);
    println!("Compressed:     {}", meta.compressed);
    println!("Shards:         {}", meta.shards.len());
    println!("AdaGrad state:  {}", if meta.has_optimizer_state() { "yes" } else { "no" });

    if verify {
        let start = Instant::now();
        let model = load_model(dir).with_context(|| format!("Failed to load model from {}", dir.display()))?;
        println!(
            "Verified:       {} x {} entity rows loaded in {:.2?}",
            model.num_entities(),
            model.dim(),
            start.elapsed()
        );
    }
    Ok(())
}
