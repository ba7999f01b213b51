// Quantize a model's parameters and activations, then report its accuracy
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use post_training_quantization::config::RunConfig;
use post_training_quantization::driver::run;
use post_training_quantization::zoo::{SyntheticZoo, KNOWN_MODELS};

#[derive(Parser, Debug)]
#[command(name = "quantize", about = "Post-training quantization accuracy run")]
struct Args {
    /// Model type (mlp|mlp_bn|mlp_imagenet)
    #[arg(long = "type", default_value = "mlp_bn")]
    model_type: String,

    /// linear|minmax|log|tanh
    #[arg(long, default_value = "linear")]
    quant_method: String,

    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Number of devices to evaluate on
    #[arg(long, default_value_t = 1)]
    ngpu: usize,

    #[arg(long, default_value_t = 117)]
    seed: u64,

    /// Folder to save the quantized model
    #[arg(long, default_value = "~/.cache/ptq/models/")]
    model_root: PathBuf,

    #[arg(long, default_value = "~/data/public_dataset/")]
    data_root: PathBuf,

    /// Folder for the results log
    #[arg(long, default_value = "log/default")]
    logdir: PathBuf,

    #[arg(long, default_value_t = 224)]
    input_size: usize,

    /// Number of batches used to calibrate activation ranges
    #[arg(long, default_value_t = 20)]
    n_sample: usize,

    #[arg(long, default_value_t = 8)]
    param_bits: u32,

    /// Bit-width for batch-norm running statistics
    #[arg(long, default_value_t = 32)]
    bn_bits: u32,

    /// Bit-width for layer outputs
    #[arg(long, default_value_t = 8)]
    fwd_bits: u32,

    #[arg(long, default_value_t = 0.0)]
    overflow_rate: f64,

    /// Save the quantized model next to the others in --model-root
    #[arg(long)]
    save_quantized_model: bool,

    /// Chart quantization error by bit-width for the model's parameters
    #[arg(long)]
    plot: Option<PathBuf>,
}

impl From<Args> for RunConfig {
    fn from(args: Args) -> Self {
        RunConfig {
            model_type: args.model_type,
            quant_method: args.quant_method,
            batch_size: args.batch_size,
            ngpu: args.ngpu,
            seed: args.seed,
            model_root: args.model_root,
            data_root: args.data_root,
            logdir: args.logdir,
            input_size: args.input_size,
            n_sample: args.n_sample,
            param_bits: args.param_bits,
            bn_bits: args.bn_bits,
            fwd_bits: args.fwd_bits,
            overflow_rate: args.overflow_rate,
            save_quantized_model: args.save_quantized_model,
            plot: args.plot,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RunConfig::from(Args::parse());
    let resolved = config.validate().context("invalid configuration")?;
    let zoo = SyntheticZoo::new(resolved.input_size);

    let outcome = run(&config, &zoo)
        .with_context(|| format!("run failed for --type {} (known: {})", config.model_type, KNOWN_MODELS.join("|")))?;

    println!("{}", outcome.descriptor);
    if let Some(warning) = outcome.warning {
        eprintln!("warning: {warning}");
    }
    Ok(())
}
