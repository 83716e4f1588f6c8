//! burn-disco CLI
//!
//! Runs CLIP-guided diffusion from a JSON config with flag overrides.
//!
//! ```text
//! burn-disco config > run.json
//! burn-disco generate --config run.json --clip ViT-B/32=clip_b32.safetensors \
//!     --vocab bpe_simple_vocab_16e6.txt --secondary secondary.safetensors
//! ```

use std::cell::Cell;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::module::Module;
use burn_disco::backends::{default_device, DefaultBackend};
use burn_disco::clip::{ClipConfig, ClipEmbedder, ClipTokenizer, ImageTextEmbedder};
use burn_disco::convert::{load_clip, load_secondary, SafeTensorFile};
use burn_disco::secondary::SecondaryConfig;
use burn_disco::{
    CancelToken, DiskArtifacts, GuidanceReport, RunConfig, RunController, RunEvent, RunModels, RunSummary, SamplingMethod,
};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burn-disco")]
#[command(about = "CLIP-guided diffusion in pure Rust")]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate images guided by text prompts
    Generate(GenerateArgs),

    /// Print the default run configuration as JSON
    Config,

    /// List tensors in a safetensors file
    Inspect {
        path: PathBuf,

        /// Only names containing this substring
        #[arg(short, long)]
        filter: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Sampler {
    Ddim,
    Ancestral,
}

impl From<Sampler> for SamplingMethod {
    fn from(sampler: Sampler) -> Self {
        match sampler {
            Sampler::Ddim => SamplingMethod::Ddim,
            Sampler::Ancestral => SamplingMethod::Ancestral,
        }
    }
}

#[derive(Args)]
struct GenerateArgs {
    /// Run configuration; defaults are used for missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prompt as `text` or `text:weight`; replaces the configured prompts
    #[arg(short, long = "prompt")]
    prompts: Vec<String>,

    /// CLIP model as `ARCH=FILE`, e.g. `ViT-B/32=clip.safetensors`
    #[arg(long = "clip", value_parser = parse_clip_arg, required = true)]
    clips: Vec<(String, PathBuf)>,

    /// CLIP BPE merges file
    #[arg(long)]
    vocab: PathBuf,

    /// Secondary model weights
    #[arg(long)]
    secondary: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "images_out")]
    output: PathBuf,

    #[arg(long)]
    batch_name: Option<String>,

    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    width: Option<usize>,

    #[arg(long)]
    height: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    n_batches: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    clip_guidance_scale: Option<f64>,

    #[arg(long)]
    cutn_batches: Option<usize>,

    #[arg(long)]
    skip_timesteps: Option<usize>,

    #[arg(long)]
    init_image: Option<PathBuf>,

    #[arg(long)]
    display_rate: Option<usize>,

    #[arg(long, value_enum)]
    sampler: Option<Sampler>,

    /// Write the first crop batch of each model as images
    #[arg(long)]
    cutout_debug: bool,
}

fn parse_clip_arg(s: &str) -> Result<(String, PathBuf), String> {
    let (arch, file) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ARCH=FILE, got {s:?}"))?;
    if ClipConfig::by_name(arch).is_none() {
        return Err(format!("unknown CLIP architecture {arch:?}"));
    }
    Ok((arch.to_string(), PathBuf::from(file)))
}

impl GenerateArgs {
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                RunConfig::from_json(&json).with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => RunConfig::default(),
        };

        if !self.prompts.is_empty() {
            config.text_prompts = self.prompts.clone();
        }
        if let Some(name) = &self.batch_name {
            config.batch_name = name.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.init_image.is_some() {
            config.init_image = self.init_image.clone();
        }
        if let Some(sampler) = self.sampler {
            config.sampling = sampler.into();
        }
        config.cutout_debug |= self.cutout_debug;

        let overrides = [
            (&mut config.steps, self.steps),
            (&mut config.width, self.width),
            (&mut config.height, self.height),
            (&mut config.n_batches, self.n_batches),
            (&mut config.batch_size, self.batch_size),
            (&mut config.cutn_batches, self.cutn_batches),
            (&mut config.skip_timesteps, self.skip_timesteps),
            (&mut config.display_rate, self.display_rate),
        ];
        for (field, value) in overrides {
            if let Some(value) = value {
                *field = value;
            }
        }
        if let Some(scale) = self.clip_guidance_scale {
            config.clip_guidance_scale = scale;
        }

        Ok(config)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Flips `cancel` on the first ctrl-c
fn watch_interrupt(cancel: CancelToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;
    std::thread::spawn(move || {
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            warn!("interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });
    Ok(())
}

fn run_generate(args: GenerateArgs) -> Result<()> {
    let config = args.run_config()?;
    config.validate().context("Invalid run configuration")?;
    let device = default_device();

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let mut embedders = Vec::new();
    for (arch, path) in &args.clips {
        pb.set_message(format!("Loading {arch}..."));
        let clip_config = ClipConfig::by_name(arch).with_context(|| format!("Unknown CLIP architecture {arch}"))?;
        let tokenizer = ClipTokenizer::from_file(&args.vocab).context("Failed to load vocabulary file")?;
        let model = load_clip::<DefaultBackend, _>(path, &clip_config, &device)
            .with_context(|| format!("Failed to load {arch} from {}", path.display()))?;
        embedders.push(ClipEmbedder::new(model, tokenizer, &clip_config));
    }

    pb.set_message("Loading secondary model...");
    let secondary = load_secondary::<DefaultBackend, _>(&args.secondary, &SecondaryConfig::imagenet2(), &device)
        .context("Failed to load secondary model")?
        .no_grad();

    let models = RunModels {
        denoiser: &secondary,
        secondary: Some(&secondary),
        embedders: embedders
            .iter()
            .map(|e| e as &dyn ImageTextEmbedder<DefaultBackend>)
            .collect(),
        perceptual: None,
    };
    let controller = RunController::new(&config, models, device).context("Invalid run configuration")?;
    watch_interrupt(controller.cancel_token())?;

    let mut sink = DiskArtifacts::new(&args.output);
    let batches = config.n_batches;
    let last_loss = Cell::new(f64::NAN);

    let summary = controller.run(
        &mut sink,
        |event| match *event {
            RunEvent::BatchStarted { batch_index, .. } => {
                pb.set_position(0);
                pb.set_message(format!("batch {}/{batches}", batch_index + 1));
            }
            RunEvent::Step {
                batch_index,
                step,
                steps,
                ..
            } => {
                pb.set_position(((step + 1) * 100 / steps.max(1)) as u64);
                pb.set_message(format!("batch {}/{batches} loss {:.4}", batch_index + 1, last_loss.get()));
            }
            RunEvent::BatchFinished { batch_index } => {
                pb.println(format!("finished batch {}/{batches}", batch_index + 1));
            }
        },
        |report: &GuidanceReport| {
            debug!(t = report.timestep, loss = report.clip_loss(), rms = report.grad_rms, "guidance");
            last_loss.set(report.clip_loss() + report.aux_loss);
        },
    );
    pb.finish_and_clear();

    let summary = summary.context("Run failed")?;
    info!(
        seed = summary.seed,
        run = summary.run_number,
        batches = summary.batches_completed,
        folder = %sink.batch_folder(&config.batch_name).display(),
        "done"
    );
    if summary.interrupted {
        warn!(seed = summary.seed, "run interrupted");
    }
    println!("{}", summary_line(&summary, batches));
    Ok(())
}

/// One-line outcome printed after a run, interrupted or not
fn summary_line(summary: &RunSummary, batches: usize) -> String {
    if summary.interrupted {
        format!(
            "interrupted after {} of {batches} batches, seed {}",
            summary.batches_completed, summary.seed
        )
    } else {
        format!("finished {batches} batches, seed {}", summary.seed)
    }
}

fn run_inspect(path: &Path, filter: Option<&str>) -> Result<()> {
    let file = SafeTensorFile::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut names: Vec<&str> = file.names().filter(|name| filter.is_none_or(|f| name.contains(f))).collect();
    names.sort_unstable();

    println!("File: {}", path.display());
    println!("Tensors: {}\n", names.len());
    for name in names {
        if let (Some(shape), Some(dtype)) = (file.shape(name), file.dtype(name)) {
            println!("{name}: {shape:?} ({dtype:?})");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Generate(args) => run_generate(args),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&RunConfig::default())?);
            Ok(())
        }
        Commands::Inspect { path, filter } => run_inspect(&path, filter.as_deref()),
    }
}
