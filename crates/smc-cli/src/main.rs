mod bigram;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use smc_core::{
    Constraint, LanguageModel, ParallelSampler, ParticleSampler, Potential, SampleOptions,
    Sampler, SamplerConfig, forbidden_content, length_bounds,
};

use crate::bigram::BigramModel;

#[derive(Parser)]
#[command(name = "smc", about = "Constraint-guided text generation with SMC particle filtering")]
struct Cli {
    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Continue a prompt using a bigram model trained on a corpus
    Generate(GenerateArgs),

    /// Print the default sampler configuration as TOML
    Config,
}

#[derive(Args)]
struct GenerateArgs {
    /// Text to continue
    prompt: String,

    /// Plain-text corpus the bigram model is built from
    #[arg(long)]
    corpus: PathBuf,

    /// Sampler configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Token budget
    #[arg(long, default_value_t = 20)]
    max_tokens: usize,

    /// Candidate-selection temperature (overrides config)
    #[arg(long)]
    temperature: Option<f64>,

    /// Regex the generated text must match
    #[arg(long)]
    regex: Option<String>,

    /// Fact the text should mention (repeatable)
    #[arg(long = "fact")]
    facts: Vec<String>,

    /// Word or phrase the text must avoid (repeatable)
    #[arg(long = "forbid")]
    forbidden: Vec<String>,

    /// Minimum length in words
    #[arg(long, requires = "max_len")]
    min_len: Option<usize>,

    /// Maximum length in words
    #[arg(long, requires = "min_len")]
    max_len: Option<usize>,

    /// Stop once any particle contains this string (repeatable)
    #[arg(long = "stop")]
    stop: Vec<String>,

    /// Use the batch-parallel sampler
    #[arg(long)]
    parallel: bool,

    /// Seed for reproducible output (overrides config)
    #[arg(long)]
    seed: Option<u64>,

    /// Soft wall-clock limit in seconds
    #[arg(long)]
    timeout: Option<f64>,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Generate(args) => cmd_generate(args, cli.verbose),
        Commands::Config => cmd_config(),
    }
}

fn load_config(args: &GenerateArgs) -> Result<SamplerConfig> {
    let mut config = match &args.config {
        Some(path) => SamplerConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SamplerConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = Some(seed);
    }
    Ok(config)
}

fn build_potentials(args: &GenerateArgs) -> Result<Vec<Potential>> {
    let mut potentials = Vec::new();

    if let Some(pattern) = &args.regex {
        potentials.push(Potential::regex("regex", pattern).context("bad --regex")?);
    }
    if !args.facts.is_empty() {
        potentials.push(Potential::factual("facts", args.facts.clone(), None));
    }

    let mut constraints: Vec<Constraint> = Vec::new();
    if !args.forbidden.is_empty() {
        constraints.push(forbidden_content(args.forbidden.clone()));
    }
    if let (Some(min), Some(max)) = (args.min_len, args.max_len) {
        constraints.push(length_bounds(min, max).context("bad --min-len/--max-len")?);
    }
    if !constraints.is_empty() {
        potentials.push(Potential::constraint("constraints", constraints));
    }

    Ok(potentials)
}

fn build_options(args: &GenerateArgs) -> Result<SampleOptions> {
    let mut options = SampleOptions::new(args.max_tokens).with_stop_strings(args.stop.clone());
    if let Some(temperature) = args.temperature {
        options = options.with_temperature(temperature);
    }
    if let Some(secs) = args.timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .with_context(|| {
                format!("--timeout must be a positive number of seconds, got {secs}")
            })?;
        options = options.with_timeout(timeout);
    }
    Ok(options)
}

fn cmd_generate(args: &GenerateArgs, verbose: bool) -> Result<()> {
    let config = load_config(args)?;
    let potentials = build_potentials(args)?;
    let options = build_options(args)?;

    let corpus = std::fs::read_to_string(&args.corpus)
        .with_context(|| format!("failed to read corpus {}", args.corpus.display()))?;
    let bigram = BigramModel::from_corpus(&corpus);
    if bigram.is_empty() {
        bail!("corpus {} contains no words", args.corpus.display());
    }
    tracing::info!(
        "bigram model: {} distinct words from {}",
        bigram.vocabulary_size(),
        args.corpus.display()
    );
    let model: Arc<dyn LanguageModel> = Arc::new(bigram);

    let mut sampler: Box<dyn ParticleSampler> = if args.parallel {
        Box::new(
            ParallelSampler::new(config, potentials)
                .context("invalid sampler configuration")?
                .with_model(model),
        )
    } else {
        Box::new(
            Sampler::new(config, potentials)
                .context("invalid sampler configuration")?
                .with_model(model),
        )
    };

    let outcome = sampler.sample_with_outcome(&args.prompt, &options, None);
    println!("{}", outcome.text);

    if verbose {
        eprintln!(
            "--- outcome: tokens={}, rounds={}, resamples={}, stop={:?} ---",
            outcome.tokens_generated, outcome.rounds, outcome.resamples, outcome.stop_reason
        );
    }
    Ok(())
}

fn cmd_config() -> Result<()> {
    let toml = SamplerConfig::default()
        .to_toml_string()
        .context("failed to render default config")?;
    print!("{toml}");
    Ok(())
}
