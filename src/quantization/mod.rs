//! Simulated reduced precision: every scheme maps a tensor to the nearest
//! representable values and hands them back as f32.

pub mod linear;
pub mod log;
pub mod min_max;
pub mod range;
pub mod tanh;

pub use linear::{linear_quantize, linear_quantize_fitted, scale_factor, LinearQuantizer};
pub use log::{log_min_max_quantize, log_min_max_quantize_in_range, LogMinMaxQuantizer};
pub use min_max::{min_max_quantize, min_max_quantize_in_range, MinMaxQuantizer};
pub use range::estimate_integer_bits;
pub use tanh::{tanh_quantize, TanhQuantizer};

pub use crate::config::BYPASS_BITS;
use crate::config::{QuantMethod, QuantizationConfig};
use crate::tensor::Tensor;

pub trait Quantizer {
    fn quantize(&self, real_val: f32) -> i64;
    fn dequantize(&self, q_val: i64) -> f32;
}

/// quantize → dequantize for every element.
pub fn fake_quantize(tensor: &Tensor, quantizer: &impl Quantizer) -> Tensor {
    tensor.map(|x| quantizer.dequantize(quantizer.quantize(x)))
}

/// Applies the configured scheme with scale derived from `tensor` itself.
///
/// Bypass configs (`bits >= 32`) and empty tensors come back unchanged.
pub fn quantize(tensor: &Tensor, config: &QuantizationConfig) -> Tensor {
    quantize_with(tensor, config.method(), config.bits(), config.overflow_rate())
}

pub fn quantize_with(tensor: &Tensor, method: QuantMethod, bits: u32, overflow_rate: f64) -> Tensor {
    if bits >= BYPASS_BITS || tensor.is_empty() {
        return tensor.clone();
    }
    match method {
        QuantMethod::Linear => linear_quantize_fitted(tensor, bits, overflow_rate),
        QuantMethod::MinMax => min_max_quantize(tensor, bits),
        QuantMethod::LogMinMax => log_min_max_quantize(tensor, bits),
        QuantMethod::Tanh => tanh_quantize(tensor, bits),
    }
}
