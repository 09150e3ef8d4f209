// CLI entry point for the improv toolchain.
//
// Usage:
//   improv repair <response.txt> [-o out.mid] [--min-notes N] [--seed S] [--config cfg.json]
//   improv decode <file.mid> [--pretty]
//   improv features <file.mid>
//   improv prompt <input.mid> --corpus <dir> [-k K]
//
// `repair` renders a saved model completion to MIDI without calling any
// model. `prompt` builds the generation prompt from a local corpus so it can
// be pasted into any completion service. Logging goes to stderr and follows
// `RUST_LOG` (default `info`).

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use improv_music::read_midi;
use improv_prng::ImprovRng;
use improv_rag::{
    DEFAULT_RETRIEVAL_K, FeatureExtractor, FeatureIndex, PipelineConfig, PromptTemplate,
    RetrievalIndex, ScoreFeatureExtractor, render,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "improv")]
#[command(about = "Turn language-model music output into MIDI, and MIDI into prompts")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a saved model response to a MIDI file
    Repair {
        /// Text file holding the raw completion
        input: PathBuf,

        /// Output MIDI file
        #[arg(short, long, default_value = "improv.mid")]
        output: PathBuf,

        /// Minimum total note count (overrides the config)
        #[arg(long)]
        min_notes: Option<usize>,

        /// Augmenter seed (overrides the config)
        #[arg(long)]
        seed: Option<u64>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print a MIDI file as score JSON
    Decode {
        file: PathBuf,

        /// Pretty-print the JSON
        #[arg(long)]
        pretty: bool,
    },
    /// Print the feature query text for a MIDI file
    Features { file: PathBuf },
    /// Build the generation prompt for a MIDI file from a corpus directory
    Prompt {
        input: PathBuf,

        /// Directory of reference MIDI files
        #[arg(long)]
        corpus: PathBuf,

        /// Number of similar pieces to include
        #[arg(short, default_value_t = DEFAULT_RETRIEVAL_K)]
        k: usize,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Repair {
            input,
            output,
            min_notes,
            seed,
            config,
        } => {
            let mut config = load_config(config)?;
            if let Some(n) = min_notes {
                config.music.min_notes = n;
            }
            if seed.is_some() {
                config.seed = seed;
            }

            let text = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let mut rng = match config.seed {
                Some(seed) => ImprovRng::new(seed),
                None => ImprovRng::from_time(),
            };
            let rendered = match render(&text, &config.music, &mut rng) {
                Ok(rendered) => rendered,
                Err(e) => {
                    if let Some(raw) = e.raw_response() {
                        warn!(bytes = raw.len(), "model response could not be parsed");
                    }
                    return Err(e).context(format!("failed to render {}", input.display()));
                }
            };
            if let Some(warning) = &rendered.warning {
                warn!(%warning, "augmentation skipped");
            }
            rendered
                .write(&output)
                .with_context(|| format!("failed to write {}", output.display()))?;
            info!(
                output = %output.display(),
                notes = rendered.score.total_notes(),
                appended = rendered.appended,
                "wrote MIDI"
            );
        }
        Commands::Decode { file, pretty } => {
            let score =
                read_midi(&file).with_context(|| format!("failed to decode {}", file.display()))?;
            let json = if pretty {
                serde_json::to_string_pretty(&score)?
            } else {
                serde_json::to_string(&score)?
            };
            println!("{json}");
        }
        Commands::Features { file } => {
            let summary = ScoreFeatureExtractor
                .summary(&file)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("failed to read {}", file.display()))?;
            println!("{}", summary.to_query_text());
        }
        Commands::Prompt {
            input,
            corpus,
            k,
            config,
        } => {
            let config = load_config(config)?;
            let extractor = ScoreFeatureExtractor;
            let features = extractor
                .extract(&input)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("failed to read {}", input.display()))?;
            let query = extractor.query_text(&features);

            let index = FeatureIndex::from_dir(&corpus)
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("failed to index {}", corpus.display()))?;
            if index.is_empty() {
                bail!("no readable MIDI files in {}", corpus.display());
            }
            let similar = index.similar(&query, k).map_err(|e| anyhow::anyhow!(e))?;

            let template = PromptTemplate::for_augment(config.music.min_notes, &config.music.augment);
            println!("{}", template.render(&query, &similar));
        }
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(&path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}
