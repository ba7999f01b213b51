//! End-to-end run: select, quantize parameters, calibrate activations,
//! evaluate, record.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::activation::wrap_for_activation_quantization;
use crate::config::{QuantMethod, RunConfig, BYPASS_BITS};
use crate::context::{Device, ExecutionContext};
use crate::error::{ConfigWarning, Result};
use crate::eval::{evaluate, Accuracy};
use crate::nn::Model;
use crate::params::{quantize_parameters, ParamClass, ParameterPassReport, StateDict};
use crate::persist::{append_result, save_snapshot, snapshot_path, QuantizedModelSnapshot, RunDescriptor};
use crate::report::{error_by_bits, plot_error_by_bits};
use crate::tensor::Tensor;
use crate::zoo::ModelProvider;

/// Batch size used while activation quantizers calibrate.
pub const CALIBRATION_BATCH_SIZE: usize = 10;

const PLOTTED_BITS: [u32; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

#[derive(Debug)]
pub struct RunOutcome {
    pub model: Model,
    pub accuracy: Accuracy,
    pub descriptor: RunDescriptor,
    pub parameter_report: Option<ParameterPassReport>,
    pub warning: Option<ConfigWarning>,
    pub snapshot: Option<PathBuf>,
    pub results_file: PathBuf,
}

pub fn run(config: &RunConfig, provider: &dyn ModelProvider) -> Result<RunOutcome> {
    let resolved = config.validate()?;
    info!(?config, input_size = resolved.input_size, "run configuration");

    let mut ctx = ExecutionContext::new(Device::Host, config.seed);
    let selection = provider.select(&config.model_type, &resolved.model_root, &mut ctx)?;
    let mut model = selection.model;
    let fetcher = selection.fetcher;
    let is_imagenet = selection.is_imagenet;
    let device_count = if is_imagenet { config.ngpu } else { 1 };

    let original_params = model.state_dict();
    let parameter_report = if config.param_bits < BYPASS_BITS {
        let (quantized, report) = quantize_parameters(&original_params, &resolved.params);
        model.load_state_dict(&quantized)?;
        Some(report)
    } else {
        None
    };

    let mut warning = None;
    if !resolved.activations.is_bypass() {
        let (wrapped, w) = wrap_for_activation_quantization(model, &resolved.activations, config.n_sample);
        model = wrapped;
        warning = w;
        info!("\n{model}");

        let calibration = fetcher.fetch(
            CALIBRATION_BATCH_SIZE,
            &resolved.data_root,
            false,
            resolved.input_size,
        )?;
        evaluate(&mut model, &calibration, &ctx, 1, Some(config.n_sample), is_imagenet)?;
    }

    let val = fetcher.fetch(config.batch_size, &resolved.data_root, false, resolved.input_size)?;
    let accuracy = evaluate(&mut model, &val, &ctx, device_count, None, is_imagenet)?;
    info!("\n{model}");

    let descriptor = RunDescriptor::new(
        config.model_type.clone(),
        resolved.method,
        config.param_bits,
        config.bn_bits,
        config.fwd_bits,
        config.overflow_rate,
        accuracy,
    );
    let res_str = descriptor.to_string();
    info!("{res_str}");

    let snapshot = if config.save_quantized_model {
        let path = snapshot_path(&resolved.model_root, &descriptor);
        save_snapshot(
            &path,
            &QuantizedModelSnapshot {
                model_state_dict: model.state_dict(),
                res_str,
                res_dict: descriptor.clone(),
            },
        )?;
        Some(path)
    } else {
        None
    };
    let results_file = append_result(&resolved.logdir, &descriptor, snapshot.as_deref())?;

    if let Some(path) = &config.plot {
        let values = regular_parameter_values(&original_params);
        if values.is_empty() {
            warn!("no parameters to chart");
        } else {
            let series = error_by_bits(&Tensor::from_slice(&values), &QuantMethod::ALL, &PLOTTED_BITS)?;
            plot_error_by_bits(&series, path)?;
            info!(path = %path.display(), "wrote quantization error chart");
        }
    }

    Ok(RunOutcome {
        model,
        accuracy,
        descriptor,
        parameter_report,
        warning,
        snapshot,
        results_file,
    })
}

fn regular_parameter_values(params: &StateDict) -> Vec<f32> {
    params
        .iter()
        .filter(|e| e.class == ParamClass::Regular)
        .flat_map(|e| e.tensor.iter().copied())
        .collect()
}
