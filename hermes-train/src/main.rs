use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hermes_train::config::Config;
use hermes_train::model::GenerationConfig;
use hermes_train::model_wrapper::get_model_tflops;
use hermes_train::{ExportArgs, InferenceArgs, Mode, ModelWrapper, ProcessGroupManager, TrainingArgs};

#[derive(Parser)]
#[command(name = "hermes-train")]
#[command(about = "Pretrain LLMs with candle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pretrain a model from a JSON config
    Pretrain {
        /// Path to the training arguments JSON
        #[arg(short, long)]
        config: PathBuf,

        /// Global rank (defaults to $RANK)
        #[arg(long)]
        rank: Option<usize>,

        /// Number of processes (defaults to $WORLD_SIZE)
        #[arg(long)]
        world_size: Option<usize>,

        /// Rank on this node (defaults to $LOCAL_RANK)
        #[arg(long)]
        local_rank: Option<usize>,
    },

    /// Generate continuations for a JSONL file of prompts
    Generate {
        /// Path to the inference arguments JSON
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Save a model in reduced precision for serving
    Export {
        /// Path to the export arguments JSON
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show model info
    Info {
        /// Model configuration preset (nano, tiny, gpt2-small, gpt2-medium, llama-small)
        #[arg(short, long, default_value = "gpt2-small")]
        model: String,

        /// Sequence length for the TFLOPs estimate
        #[arg(long, default_value = "1024")]
        seq_len: usize,
    },
}

#[derive(Deserialize)]
struct Prompt {
    text: String,
}

#[derive(Serialize)]
struct Generation<'a> {
    text: &'a str,
    num_generated_tokens: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hermes_train=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Pretrain {
            config,
            rank,
            world_size,
            local_rank,
        } => {
            let args = TrainingArgs::from_json(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            let pg = ProcessGroupManager::init(&args.distributed_args, rank, world_size, local_rank)?;
            let is_main_process = pg.is_main_process();
            hermes_train::pretrain::run(&args, Mode::Training, pg)?;
            if is_main_process {
                info!("Training complete!");
            }
        }

        Commands::Generate { config } => {
            let content = std::fs::read_to_string(&config)?;
            let args: InferenceArgs = serde_json::from_str(&content)?;
            let model = ModelWrapper::new(&args, Mode::Inference, 0)?;

            let prompts: Vec<Prompt> = hermes_train::io::read_jsonl(&args.prompts_path)?;
            info!("Loaded {} prompts from {}", prompts.len(), args.prompts_path.display());

            let params = &args.generation_parameters;
            let generation_config = GenerationConfig {
                max_new_tokens: params.max_new_tokens,
                temperature: params.temperature,
                top_k: params.top_k,
            };
            let mut rng = StdRng::seed_from_u64(args.random_args.seed);

            if let Some(parent) = args.output_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut output = std::io::BufWriter::new(std::fs::File::create(&args.output_path)?);

            for chunk in prompts.chunks(params.batch_size.max(1)) {
                let inputs = chunk
                    .iter()
                    .map(|prompt| model.tokenizer().encode(&prompt.text, false))
                    .collect::<hermes_train::Result<Vec<_>>>()?;
                let (texts, num_generated_tokens) =
                    model.generate(&inputs, &generation_config, &mut rng)?;
                for (text, num_generated_tokens) in texts.iter().zip(num_generated_tokens) {
                    let record = Generation {
                        text,
                        num_generated_tokens,
                    };
                    writeln!(output, "{}", serde_json::to_string(&record)?)?;
                }
            }
            output.flush()?;
            info!("Wrote generations to {}", args.output_path.display());
        }

        Commands::Export { config } => {
            let content = std::fs::read_to_string(&config)?;
            let args: ExportArgs = serde_json::from_str(&content)?;
            let model = ModelWrapper::new(&args, Mode::Export, 0)?;
            model.save_pretrained(&args.export_path)?;
            info!("Exported model to {}", args.export_path.display());
        }

        Commands::Info { model, seq_len } => {
            let config = Config::preset(&model)
                .with_context(|| format!("unknown model config '{model}'"))?;
            println!("Model: {}", model);
            println!("  Type: {}", config.model_type);
            println!("  Vocab size: {}", config.vocab_size);
            println!("  Max sequence length: {}", config.max_seq_len);
            println!("  Hidden size: {}", config.hidden_size);
            println!("  Num layers: {}", config.num_layers);
            println!("  Num heads: {} ({} kv)", config.num_heads, config.num_kv_heads);
            println!("  Intermediate size: {}", config.intermediate_size);
            println!("  Head dimension: {}", config.head_dim());

            let total = config.num_parameters();
            println!(
                "  Estimated parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );
            println!(
                "  TFLOPs per sample (seq_len {}): {:.4}",
                seq_len,
                get_model_tflops(&config, 1, seq_len, None, 1)
            );
        }
    }

    Ok(())
}
