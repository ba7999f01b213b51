//! Output quantization for every unit of a model.
//!
//! Each wrapped unit calibrates on its first `n_sample` calls, then freezes:
//!
//! ```text
//! Calibrating(n) -> Calibrating(n-1) -> ... -> Calibrating(1) -> Frozen
//! ```
//!
//! While calibrating, the range estimate is widened with the statistics of the
//! unit's actual output (running envelope) and the output handed downstream is
//! already quantized with the widened estimate, so later units calibrate
//! against degraded inputs just as they will see them at inference. Once
//! frozen the estimate never changes again.
//!
//! A model must not be driven by concurrent calibration streams: the counter
//! advances once per call, in call order.

use std::fmt;

use tracing::{debug, info, warn};

use crate::config::{QuantMethod, QuantizationConfig};
use crate::context::ExecutionContext;
use crate::error::{ConfigWarning, Result};
use crate::nn::{Model, Quantizable};
use crate::params::ParamClass;
use crate::quantization::log::log_magnitude_range;
use crate::quantization::{
    estimate_integer_bits, linear_quantize, log_min_max_quantize_in_range, min_max_quantize_in_range,
    scale_factor, tanh_quantize,
};
use crate::tensor::Tensor;

/// Log2-magnitude floor used when a log quantizer never saw data.
pub const DEFAULT_LOG_FLOOR: f32 = -16.0;

/// What a calibrated quantizer has learned about its unit's output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RangeEstimate {
    /// Largest integer-bit count observed (linear scheme).
    IntegerBits(i32),
    /// Envelope of observed values (min-max scheme).
    ValueRange { min: f32, max: f32 },
    /// Envelope of observed log2-magnitudes (log scheme).
    LogRange { min: f32, max: f32 },
    /// Fixed `[-1, 1]` domain after squashing; nothing to learn (tanh scheme).
    Bounded,
}

impl RangeEstimate {
    /// Estimate used when nothing was observed: integer bits 0, values in
    /// `[-1, 1]`, magnitudes in `[2^-16, 1]`.
    pub fn default_for(method: QuantMethod) -> Self {
        match method {
            QuantMethod::Linear => RangeEstimate::IntegerBits(0),
            QuantMethod::MinMax => RangeEstimate::ValueRange { min: -1.0, max: 1.0 },
            QuantMethod::LogMinMax => RangeEstimate::LogRange {
                min: DEFAULT_LOG_FLOOR,
                max: 0.0,
            },
            QuantMethod::Tanh => RangeEstimate::Bounded,
        }
    }

    /// Statistics of one output. `None` for an empty tensor.
    pub fn observe(method: QuantMethod, output: &Tensor, overflow_rate: f64) -> Option<Self> {
        if output.is_empty() {
            return None;
        }
        let estimate = match method {
            QuantMethod::Linear => RangeEstimate::IntegerBits(estimate_integer_bits(output, overflow_rate)),
            QuantMethod::MinMax => {
                let (min, max) = output.min_and_max()?;
                RangeEstimate::ValueRange { min, max }
            }
            QuantMethod::LogMinMax => {
                let (min, max) = log_magnitude_range(output)?;
                RangeEstimate::LogRange { min, max }
            }
            QuantMethod::Tanh => RangeEstimate::Bounded,
        };
        Some(estimate)
    }

    /// Running envelope of two estimates of the same kind.
    pub fn widen(self, other: Self) -> Self {
        use RangeEstimate::*;
        match (self, other) {
            (IntegerBits(a), IntegerBits(b)) => IntegerBits(a.max(b)),
            (ValueRange { min: a0, max: a1 }, ValueRange { min: b0, max: b1 }) => ValueRange {
                min: a0.min(b0),
                max: a1.max(b1),
            },
            (LogRange { min: a0, max: a1 }, LogRange { min: b0, max: b1 }) => LogRange {
                min: a0.min(b0),
                max: a1.max(b1),
            },
            (_, newer) => newer,
        }
    }

    pub fn apply(&self, tensor: &Tensor, bits: u32) -> Tensor {
        match *self {
            RangeEstimate::IntegerBits(integer_bits) => {
                linear_quantize(tensor, scale_factor(bits, integer_bits), bits)
            }
            RangeEstimate::ValueRange { min, max } => min_max_quantize_in_range(tensor, bits, min, max),
            RangeEstimate::LogRange { min, max } => log_min_max_quantize_in_range(tensor, bits, min, max),
            RangeEstimate::Bounded => tanh_quantize(tensor, bits),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationPhase {
    Calibrating { remaining: usize },
    Frozen,
}

/// Per-unit calibration progress. Lives exactly as long as its wrapper.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationState {
    counter: usize,
    estimate: Option<RangeEstimate>,
    frozen: bool,
}

impl CalibrationState {
    pub fn new(n_sample: usize) -> Self {
        Self {
            counter: n_sample,
            estimate: None,
            frozen: n_sample == 0,
        }
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn phase(&self) -> CalibrationPhase {
        if self.frozen {
            CalibrationPhase::Frozen
        } else {
            CalibrationPhase::Calibrating {
                remaining: self.counter,
            }
        }
    }

    /// Learned estimate, `None` until something non-empty was observed.
    pub fn estimate(&self) -> Option<RangeEstimate> {
        self.estimate
    }

    /// Estimate applied to outputs: the learned one, else the method default.
    pub fn effective_estimate(&self, method: QuantMethod) -> RangeEstimate {
        self.estimate.unwrap_or_else(|| RangeEstimate::default_for(method))
    }

    /// Folds one observation in and counts the call. No-op once frozen.
    fn record(&mut self, observed: Option<RangeEstimate>) {
        if self.frozen {
            return;
        }
        if let Some(observed) = observed {
            self.estimate = Some(match self.estimate {
                Some(current) => current.widen(observed),
                None => observed,
            });
        }
        self.counter -= 1;
        self.frozen = self.counter == 0;
    }
}

/// A unit whose output is quantized, calibrating first.
#[derive(Debug)]
pub struct ActivationQuantizer {
    path: String,
    inner: Box<dyn Quantizable>,
    config: QuantizationConfig,
    state: CalibrationState,
}

impl ActivationQuantizer {
    pub fn new(
        path: impl Into<String>,
        inner: Box<dyn Quantizable>,
        config: QuantizationConfig,
        n_sample: usize,
    ) -> Self {
        Self {
            path: path.into(),
            inner,
            config,
            state: CalibrationState::new(n_sample),
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }
}

struct EstimateDisplay<'a>(&'a ActivationQuantizer);

impl fmt::Display for EstimateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.0;
        let bits = q.config.bits();
        let counter = q.state.counter();
        match q.state.estimate() {
            Some(RangeEstimate::IntegerBits(integer_bits)) => write!(
                f,
                "LinearQuant(sf={}, bits={bits}, overflow_rate={:.3}, counter={counter})",
                scale_factor(bits, integer_bits),
                q.config.overflow_rate()
            ),
            Some(RangeEstimate::ValueRange { min, max }) => {
                write!(f, "MinMaxQuant(min={min:.4}, max={max:.4}, bits={bits}, counter={counter})")
            }
            Some(RangeEstimate::LogRange { min, max }) => write!(
                f,
                "LogQuant(log2_min={min:.4}, log2_max={max:.4}, bits={bits}, counter={counter})"
            ),
            Some(RangeEstimate::Bounded) => write!(f, "TanhQuant(bits={bits}, counter={counter})"),
            None => write!(
                f,
                "{}Quant(uncalibrated, bits={bits}, counter={counter})",
                q.config.method()
            ),
        }
    }
}

impl Quantizable for ActivationQuantizer {
    fn describe(&self) -> String {
        format!("{} -> {}", self.inner.describe(), EstimateDisplay(self))
    }

    fn forward_and_maybe_calibrate(&mut self, input: &Tensor, ctx: &ExecutionContext) -> Result<Tensor> {
        let output = self.inner.forward_and_maybe_calibrate(input, ctx)?;
        let method = self.config.method();

        if !self.state.is_frozen() {
            let observed = RangeEstimate::observe(method, &output, self.config.overflow_rate());
            self.state.record(observed);
            if self.state.is_frozen() {
                debug!(unit = %self.path, estimate = ?self.state.estimate(), "calibration frozen");
            }
        }

        Ok(self
            .state
            .effective_estimate(method)
            .apply(&output, self.config.bits()))
    }

    fn parameters(&self) -> Vec<(&'static str, ParamClass, &Tensor)> {
        self.inner.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        self.inner.parameters_mut()
    }

    fn calibration(&self) -> Option<&CalibrationState> {
        Some(&self.state)
    }
}

/// Wraps every unit of `model` so its output is quantized after `n_sample`
/// calibrating calls.
///
/// Containers are rebuilt around the wrapped units, never wrapped themselves:
/// names, order, shapes and parameters are unchanged. A bypass config returns
/// the model as is. `n_sample == 0` freezes every unit on its default estimate
/// immediately and is reported as a warning.
pub fn wrap_for_activation_quantization(
    model: Model,
    config: &QuantizationConfig,
    n_sample: usize,
) -> (Model, Option<ConfigWarning>) {
    if config.is_bypass() {
        info!(bits = config.bits(), "activation quantization bypassed");
        return (model, None);
    }

    let warning = (n_sample == 0).then_some(ConfigWarning::ZeroCalibrationSamples);
    if let Some(warning) = &warning {
        warn!("{warning}");
    }

    let config = *config;
    let mut wrapped = 0usize;
    let model = model.map_units(|path, unit| {
        wrapped += 1;
        let quantizer: Box<dyn Quantizable> =
            Box::new(ActivationQuantizer::new(path, unit, config, n_sample));
        quantizer
    });
    info!(
        units = wrapped,
        method = %config.method(),
        bits = config.bits(),
        n_sample,
        "activation quantizers installed"
    );
    (model, warning)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::nn::{Linear, Relu, Sequential};

    /// Ignores its input and emits a fixed tensor.
    #[derive(Debug)]
    struct Emit(Vec<Tensor>);

    impl Quantizable for Emit {
        fn describe(&self) -> String {
            "Emit".into()
        }

        fn forward_and_maybe_calibrate(&mut self, _input: &Tensor, _ctx: &ExecutionContext) -> Result<Tensor> {
            Ok(if self.0.len() > 1 {
                self.0.remove(0)
            } else {
                self.0[0].clone()
            })
        }
    }

    fn cfg(method: QuantMethod, bits: u32) -> QuantizationConfig {
        QuantizationConfig::new(method, bits, 0.0).unwrap()
    }

    fn wrap(outputs: Vec<Tensor>, config: QuantizationConfig, n_sample: usize) -> ActivationQuantizer {
        ActivationQuantizer::new("unit", Box::new(Emit(outputs)), config, n_sample)
    }

    fn call(q: &mut ActivationQuantizer) -> Tensor {
        q.forward_and_maybe_calibrate(&Tensor::zeros(&[1]), &ExecutionContext::host(0))
            .unwrap()
    }

    #[test]
    fn freezes_after_budget_and_stays_put() {
        let out = Tensor::from_slice(&[1.0, 2.0, -1.0]);
        let mut q = wrap(vec![out], cfg(QuantMethod::MinMax, 4), 3);

        assert_eq!(q.state().phase(), CalibrationPhase::Calibrating { remaining: 3 });
        call(&mut q);
        call(&mut q);
        assert_eq!(q.state().phase(), CalibrationPhase::Calibrating { remaining: 1 });
        let third = call(&mut q);
        assert_eq!(q.state().phase(), CalibrationPhase::Frozen);
        let frozen = q.state().estimate();
        assert_eq!(frozen, Some(RangeEstimate::ValueRange { min: -1.0, max: 2.0 }));

        let fourth = call(&mut q);
        let fifth = call(&mut q);
        assert_eq!(fourth, third);
        assert_eq!(fifth, fourth);
        assert_eq!(q.state().estimate(), frozen);
        assert_eq!(q.state().counter(), 0);
    }

    #[test]
    fn calibration_output_is_already_quantized() {
        let raw = Tensor::from_slice(&[0.3, 2.0, -1.0]);
        let mut q = wrap(vec![raw.clone()], cfg(QuantMethod::MinMax, 4), 5);
        let out = call(&mut q);
        assert_ne!(out, raw);
        assert_abs_diff_eq!(out.to_vec()[0], 0.4, epsilon = 1e-5);
    }

    #[test]
    fn min_max_envelope_widens_then_clamps() {
        let outputs = vec![
            Tensor::from_slice(&[0.0, 1.0]),
            Tensor::from_slice(&[-2.0, 0.5]),
            Tensor::from_slice(&[10.0, -10.0]),
        ];
        let mut q = wrap(outputs, cfg(QuantMethod::MinMax, 8), 2);
        call(&mut q);
        call(&mut q);
        assert_eq!(q.state().estimate(), Some(RangeEstimate::ValueRange { min: -2.0, max: 1.0 }));

        let clamped = call(&mut q);
        assert_abs_diff_eq!(clamped.to_vec()[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(clamped.to_vec()[1], -2.0, epsilon = 1e-5);
    }

    #[test]
    fn linear_keeps_the_widest_integer_part() {
        let outputs = vec![
            Tensor::from_slice(&[0.5, -0.25]),
            Tensor::from_slice(&[3.0, 0.1]),
            Tensor::from_slice(&[0.2]),
        ];
        let mut q = wrap(outputs, cfg(QuantMethod::Linear, 8), 3);
        call(&mut q);
        assert_eq!(q.state().estimate(), Some(RangeEstimate::IntegerBits(-1)));
        call(&mut q);
        call(&mut q);
        assert_eq!(q.state().estimate(), Some(RangeEstimate::IntegerBits(2)));
        assert!(q.describe().contains("LinearQuant(sf=5, bits=8, overflow_rate=0.000, counter=0)"));
    }

    #[test]
    fn zero_samples_freeze_on_defaults() {
        let mut q = wrap(vec![Tensor::from_slice(&[5.0, -0.3])], cfg(QuantMethod::MinMax, 2), 0);
        assert!(q.state().is_frozen());
        let out = call(&mut q);
        // [-1, 1] with 4 levels
        assert_abs_diff_eq!(out.to_vec()[0], 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(out.to_vec()[1], -1.0 / 3.0, epsilon = 1e-5);
        assert_eq!(q.state().estimate(), None);
        assert_eq!(
            q.state().effective_estimate(QuantMethod::MinMax),
            RangeEstimate::default_for(QuantMethod::MinMax)
        );
    }

    #[test]
    fn empty_outputs_count_but_teach_nothing() {
        let mut q = wrap(vec![Tensor::zeros(&[0])], cfg(QuantMethod::Linear, 8), 1);
        assert!(call(&mut q).is_empty());
        assert!(q.state().is_frozen());
        assert_eq!(q.state().estimate(), None);
    }

    #[test]
    fn wrapping_preserves_structure_and_parameters() {
        let mut rng = StdRng::seed_from_u64(9);
        let model = Model::new(
            "net",
            Sequential::new()
                .nested(
                    "features",
                    Sequential::new()
                        .unit("0", Linear::random(4, 6, &mut rng))
                        .unit("1", Relu),
                )
                .unit("head", Linear::random(6, 3, &mut rng)),
        );
        let paths = model.unit_paths();
        let dict = model.state_dict();

        let (mut wrapped, warning) = wrap_for_activation_quantization(model, &cfg(QuantMethod::Linear, 8), 2);
        assert_eq!(warning, None);
        assert_eq!(wrapped.unit_paths(), paths);
        assert_eq!(wrapped.state_dict(), dict);
        assert_eq!(wrapped.calibration_states().len(), 3);

        let ctx = ExecutionContext::host(0);
        let out = wrapped.forward(&Tensor::zeros(&[7, 4]), &ctx).unwrap();
        assert_eq!(out.shape(), &[7, 3]);
        assert!(wrapped
            .calibration_states()
            .iter()
            .all(|(_, s)| s.phase() == CalibrationPhase::Calibrating { remaining: 1 }));
    }

    #[test]
    fn zero_budget_is_flagged() {
        let model = Model::new("net", Sequential::new().unit("act", Relu));
        let (model, warning) = wrap_for_activation_quantization(model, &cfg(QuantMethod::Tanh, 4), 0);
        assert_eq!(warning, Some(ConfigWarning::ZeroCalibrationSamples));
        assert!(model.calibration_states().iter().all(|(_, s)| s.is_frozen()));
    }

    #[test]
    fn bypass_leaves_model_unwrapped() {
        let model = Model::new("net", Sequential::new().unit("act", Relu));
        let (model, warning) = wrap_for_activation_quantization(model, &cfg(QuantMethod::Linear, 32), 4);
        assert_eq!(warning, None);
        assert!(model.calibration_states().is_empty());
    }
}
