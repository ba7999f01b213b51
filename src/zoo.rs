//! Model and dataset collaborators.
//!
//! [`SyntheticZoo`] stands in for a real checkpoint zoo: networks are drawn from
//! the context RNG and every sample is labelled by a full-precision replica of
//! the same network, so accuracy reads as agreement with the unquantized model.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::context::{Device, ExecutionContext};
use crate::error::{QuantError, Result};
use crate::eval::{argmax, imagenet_normalize};
use crate::nn::{as_matrix, BatchNorm1d, Linear, Model, Relu, Sequential};
use crate::tensor::Tensor;

pub const KNOWN_MODELS: [&str; 3] = ["mlp", "mlp_bn", "mlp_imagenet"];

const NUM_CLASSES: usize = 10;
const TRAIN_SAMPLES: usize = 2000;
const TEST_SAMPLES: usize = 1000;

#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub input: Tensor,
    pub labels: Vec<usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dataset {
    batches: Vec<Batch>,
}

impl Dataset {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Batch> {
        self.batches.iter()
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

pub trait DatasetFetcher {
    fn fetch(&self, batch_size: usize, data_root: &Path, train: bool, input_size: usize) -> Result<Dataset>;
}

pub struct Selection {
    pub model: Model,
    pub fetcher: Box<dyn DatasetFetcher>,
    pub is_imagenet: bool,
}

pub trait ModelProvider {
    fn select(&self, model_type: &str, model_root: &Path, ctx: &mut ExecutionContext) -> Result<Selection>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Architecture {
    Mlp,
    MlpBn,
    MlpImagenet,
}

impl Architecture {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "mlp" => Ok(Architecture::Mlp),
            "mlp_bn" => Ok(Architecture::MlpBn),
            "mlp_imagenet" => Ok(Architecture::MlpImagenet),
            other => Err(QuantError::UnknownModel(format!(
                "{other} (known: {})",
                KNOWN_MODELS.join("|")
            ))),
        }
    }

    fn is_imagenet(self) -> bool {
        self == Architecture::MlpImagenet
    }

    fn build(self, input_size: usize, seed: u64) -> Model {
        let mut rng = StdRng::seed_from_u64(seed);
        match self {
            Architecture::Mlp => Model::new(
                "mlp",
                Sequential::new()
                    .unit("fc1", Linear::random(input_size, 64, &mut rng))
                    .unit("relu1", Relu)
                    .unit("fc2", Linear::random(64, NUM_CLASSES, &mut rng)),
            ),
            Architecture::MlpBn | Architecture::MlpImagenet => {
                let name = if self.is_imagenet() { "mlp_imagenet" } else { "mlp_bn" };
                let features = Sequential::new()
                    .unit("0", Linear::random(input_size, 64, &mut rng))
                    .unit("1", BatchNorm1d::random(64, &mut rng))
                    .unit("2", Relu)
                    .unit("3", Linear::random(64, 32, &mut rng))
                    .unit("4", BatchNorm1d::random(32, &mut rng))
                    .unit("5", Relu);
                let classifier = Sequential::new().unit("0", Linear::random(32, NUM_CLASSES, &mut rng));
                Model::new(
                    name,
                    Sequential::new()
                        .nested("features", features)
                        .nested("classifier", classifier),
                )
            }
        }
    }
}

/// Built-in networks with random weights.
#[derive(Clone, Copy, Debug)]
pub struct SyntheticZoo {
    input_size: usize,
}

impl SyntheticZoo {
    pub fn new(input_size: usize) -> Self {
        Self { input_size }
    }
}

impl ModelProvider for SyntheticZoo {
    fn select(&self, model_type: &str, model_root: &Path, ctx: &mut ExecutionContext) -> Result<Selection> {
        let arch = Architecture::from_name(model_type)?;
        let weights_seed: u64 = ctx.rng().random();
        debug!(model_type, model_root = %model_root.display(), weights_seed, "building synthetic model");

        let model = arch.build(self.input_size, weights_seed).to(ctx.device());
        let fetcher = SyntheticFetcher {
            arch,
            input_size: self.input_size,
            weights_seed,
            device: ctx.device(),
        };
        Ok(Selection {
            model,
            fetcher: Box::new(fetcher),
            is_imagenet: arch.is_imagenet(),
        })
    }
}

struct SyntheticFetcher {
    arch: Architecture,
    input_size: usize,
    weights_seed: u64,
    device: Device,
}

impl DatasetFetcher for SyntheticFetcher {
    fn fetch(&self, batch_size: usize, data_root: &Path, train: bool, input_size: usize) -> Result<Dataset> {
        if batch_size == 0 {
            return Err(QuantError::Configuration("batch_size must be positive".into()));
        }
        if input_size != self.input_size {
            return Err(QuantError::Configuration(format!(
                "input size {input_size} does not match the model's {}",
                self.input_size
            )));
        }
        debug!(data_root = %data_root.display(), train, batch_size, "generating synthetic split");

        let ctx = ExecutionContext::host(0);
        let mut reference = self.arch.build(self.input_size, self.weights_seed);
        let split_salt: u64 = if train { 0x7472_6169_6e } else { 0x7465_7374 };
        let mut rng = StdRng::seed_from_u64(self.weights_seed ^ split_salt);
        let range = if self.arch.is_imagenet() { 0.0..255.0 } else { -1.0..1.0 };

        let total = if train { TRAIN_SAMPLES } else { TEST_SAMPLES };
        let mut batches = Vec::with_capacity(total.div_ceil(batch_size));
        let mut produced = 0;
        while produced < total {
            let rows = batch_size.min(total - produced);
            let input = Tensor::random(&[rows, self.input_size], range.clone(), &mut rng);
            let seen = if self.arch.is_imagenet() {
                imagenet_normalize(&input)
            } else {
                input.clone()
            };
            let logits = reference.forward(&seen, &ctx)?;
            let labels = as_matrix(&logits)?.rows().into_iter().map(argmax).collect();
            batches.push(Batch {
                input: input.to(self.device),
                labels,
            });
            produced += rows;
        }
        Ok(Dataset::new(batches))
    }
}
