use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crnn_ctc::{
    dataloader::Charset,
    logging::init_tracing,
    model::{build_seeded, summary::log_model_stats, Mode},
    train::{train, CleanupPolicy, TrainConfig},
    Result,
};

#[derive(Parser, Debug)]
#[command(name = "crnn-ctc", about = "CRNN text recognizer trained with CTC loss")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on a directory of labelled images.
    Train {
        /// JSON training configuration; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Dataset directory, overrides the config.
        #[arg(long)]
        src_dir: Option<PathBuf>,
        /// Where checkpoints and the final model go.
        #[arg(long)]
        save_dir: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Remove the augmentation cache without asking.
        #[arg(long, short = 'y')]
        yes: bool,
        /// What to do with the augmentation cache when --yes is not given.
        #[arg(long, value_enum)]
        cache_policy: Option<CleanupPolicy>,
    },
    /// Print the layer table for a given input size and charset.
    Summary {
        #[arg(long, default_value_t = 128)]
        width: usize,
        #[arg(long, default_value_t = 32)]
        height: usize,
        #[arg(long, default_value = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ")]
        charset: String,
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
}

fn set_threads(threads: usize) {
    if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
        warn!(error = %e, "could not size the rayon pool");
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Train {
            config,
            src_dir,
            save_dir,
            epochs,
            batch_size,
            seed,
            yes,
            cache_policy,
        } => {
            let mut config = match config {
                Some(path) => TrainConfig::load(&path)?,
                None => TrainConfig::default(),
            };
            if let Some(dir) = src_dir {
                config.dataset.src_dir = dir;
            }
            if let Some(dir) = save_dir {
                config.save_dir = dir;
            }
            if let Some(epochs) = epochs {
                config.epochs = epochs;
            }
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if seed.is_some() {
                config.seed = seed;
                config.dataset.shuffle_seed = seed;
            }
            if let Some(policy) = cache_policy {
                config.cache_policy = policy;
            }
            if yes {
                config.cache_policy = CleanupPolicy::Yes;
            }

            set_threads(config.threads());
            let report = train(config)?;
            let best = report.history.iter().map(|e| e.val_loss).fold(f32::INFINITY, f32::min);
            info!(
                epochs = report.history.len(),
                best_val_loss = best,
                model = %report.model_path.display(),
                cache_removed = report.cache_removed,
                "training finished"
            );
        }
        Command::Summary {
            width,
            height,
            charset,
            batch_size,
        } => {
            let charset = Charset::new(&charset)?;
            let graph = build_seeded((width, height), charset.num_classes(), 1, Mode::Inference, 0)?;
            log_model_stats(graph.predictor(), batch_size);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
