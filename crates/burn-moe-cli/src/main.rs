//! burn-moe CLI
//!
//! Command-line front end for the sparse MoE layer.
//!
//! Supports:
//! - Training on a synthetic clustered classification task
//! - Inspecting how a batch is routed across experts
//! - Writing a default configuration file

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use burn::backend::{Autodiff, NdArray};
use burn::nn::Initializer;
use burn::prelude::*;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use burn_moe_core::train::{adamw_trainer, TrainerConfig};
use burn_moe_core::SparseMoeConfig;

mod data;

use data::ClusterDataset;

type InferBackend = NdArray<f32>;
type TrainBackend = Autodiff<InferBackend>;

#[derive(Parser)]
#[command(name = "burn-moe")]
#[command(about = "Sparsely-gated Mixture of Experts in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train an MoE classifier on synthetic Gaussian clusters
    Train {
        /// Layer config (JSON); defaults to a small 8-expert layer
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of optimizer steps
        #[arg(long, default_value = "500")]
        steps: usize,

        /// Examples per step
        #[arg(short, long, default_value = "64")]
        batch_size: usize,

        /// AdamW learning rate
        #[arg(long, default_value = "1e-3")]
        lr: f64,

        /// Load-balancing loss coefficient (overrides the config)
        #[arg(long)]
        loss_coef: Option<f64>,

        /// Evaluate every N steps
        #[arg(long, default_value = "100")]
        eval_every: usize,

        /// Seed for the synthetic data
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Route one random batch and print per-expert statistics
    Route {
        /// Layer config (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Examples in the batch
        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        /// Route in training mode (adds gate noise)
        #[arg(long)]
        noisy: bool,

        /// Seed for the synthetic data
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Print or save the default layer config
    Config {
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn default_config() -> SparseMoeConfig {
    SparseMoeConfig::new(16, 4, 8, 32)
        .with_k(2)
        .with_gate_initializer(Initializer::Normal {
            mean: 0.0,
            std: 0.1,
        })
}

fn load_config(path: Option<PathBuf>) -> Result<SparseMoeConfig> {
    match path {
        Some(path) => SparseMoeConfig::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(default_config()),
    }
}

fn run_train(
    config: SparseMoeConfig,
    steps: usize,
    batch_size: usize,
    lr: f64,
    loss_coef: Option<f64>,
    eval_every: usize,
    seed: u64,
) -> Result<()> {
    ensure!(batch_size > 0, "--batch-size must be at least 1");
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(seed);
    let dataset = ClusterDataset::new(config.input_size, config.output_size, 2.0, 1.0, &mut rng)?;
    let (eval_x, eval_labels) = dataset.sample::<TrainBackend>(512, &mut rng, &device);

    let model = config
        .init::<TrainBackend>(&device)
        .context("Failed to initialize MoE layer")?;
    let mut trainer_config = TrainerConfig::default().with_learning_rate(lr);
    if let Some(coef) = loss_coef {
        trainer_config = trainer_config.with_loss_coef(coef);
    }
    let mut trainer = adamw_trainer(model, trainer_config);

    tracing::info!(
        experts = config.num_experts,
        k = config.k,
        input_size = config.input_size,
        classes = config.output_size,
        "training"
    );

    let pb = ProgressBar::new(steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    for step in 1..=steps {
        let (x, labels) = dataset.sample::<TrainBackend>(batch_size, &mut rng, &device);
        let stats = trainer.step(x, labels).context("Training step failed")?;
        pb.set_position(step as u64);
        pb.set_message(format!(
            "loss {:.4} aux {:.4}",
            stats.target_loss, stats.aux_loss
        ));

        if eval_every > 0 && step % eval_every == 0 {
            let eval = trainer.evaluate(eval_x.clone(), eval_labels.clone())?;
            pb.suspend(|| {
                tracing::info!(
                    step,
                    target_loss = stats.target_loss,
                    aux_loss = stats.aux_loss,
                    accuracy = eval.accuracy,
                    "eval"
                )
            });
        }
    }
    pb.finish_and_clear();

    let eval = trainer.evaluate(eval_x, eval_labels)?;
    println!(
        "Trained {} steps in {:.1?}: accuracy {:.1}% on {} held-out examples",
        trainer.steps(),
        start.elapsed(),
        eval.accuracy * 100.0,
        eval.num_examples
    );
    Ok(())
}

fn run_route(config: SparseMoeConfig, batch_size: usize, noisy: bool, seed: u64) -> Result<()> {
    ensure!(batch_size > 0, "--batch-size must be at least 1");
    let device = Default::default();
    let mut rng = StdRng::seed_from_u64(seed);
    let dataset = ClusterDataset::new(config.input_size, config.output_size, 2.0, 1.0, &mut rng)?;
    let (x, _) = dataset.sample::<InferBackend>(batch_size, &mut rng, &device);

    let model = config
        .init::<InferBackend>(&device)
        .context("Failed to initialize MoE layer")?;
    let routed = model.route(x, noisy, config.loss_coef)?;

    let load: Vec<f32> = routed.load.into_data().iter::<f32>().collect();
    let importance: Vec<f32> = routed
        .gates
        .sum_dim(0)
        .into_data()
        .iter::<f32>()
        .collect();
    let aux_loss: f32 = routed.loss.into_scalar().elem();

    println!("expert  examples  importance  load");
    for (expert, size) in routed.part_sizes.iter().enumerate() {
        println!(
            "{:>6}  {:>8}  {:>10.4}  {:>6.3}",
            expert, size, importance[expert], load[expert]
        );
    }
    println!("load-balancing loss: {aux_loss:.6}");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            config,
            steps,
            batch_size,
            lr,
            loss_coef,
            eval_every,
            seed,
        } => {
            let config = load_config(config)?;
            run_train(config, steps, batch_size, lr, loss_coef, eval_every, seed)
        }

        Commands::Route {
            config,
            batch_size,
            noisy,
            seed,
        } => {
            let config = load_config(config)?;
            run_route(config, batch_size, noisy, seed)
        }

        Commands::Config { output } => {
            let config = default_config();
            match output {
                Some(path) => {
                    config
                        .save(&path)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&config)?),
            }
            Ok(())
        }
    }
}
