//! Post-training quantization of trained networks: fake-quantized parameters,
//! calibrated activation quantizers, and the accuracy run that ties them together.

pub mod activation;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod eval;
pub mod nn;
pub mod params;
pub mod persist;
pub mod quantization;
pub mod report;
pub mod tensor;
pub mod zoo;

pub use activation::{wrap_for_activation_quantization, ActivationQuantizer, CalibrationState, RangeEstimate};
pub use config::{ParameterPassConfig, QuantMethod, QuantizationConfig, RunConfig};
pub use context::{Device, ExecutionContext};
pub use error::{ConfigWarning, QuantError, Result};
pub use params::{quantize_parameters, ParamClass, ParameterEntry, StateDict};
pub use quantization::estimate_integer_bits;
pub use tensor::Tensor;
