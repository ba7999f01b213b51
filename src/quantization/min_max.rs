use super::{fake_quantize, Quantizer, BYPASS_BITS};
use crate::tensor::Tensor;

/// Uniform quantization scheme with `2^bits` levels spanning `[min_val, max_val]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MinMaxQuantizer {
    min_val: f64,
    max_val: f64,
    levels: f64,
}

impl MinMaxQuantizer {
    pub fn new(min_val: f32, max_val: f32, bits: u32) -> Self {
        MinMaxQuantizer {
            min_val: f64::from(min_val),
            max_val: f64::from(max_val),
            levels: 2f64.powi(bits as i32) - 1.0,
        }
    }

    fn span(&self) -> f64 {
        self.max_val - self.min_val
    }
}

impl Quantizer for MinMaxQuantizer {
    fn quantize(&self, real_val: f32) -> i64 {
        // a collapsed range has a single level
        if self.span() <= 0.0 {
            return 0;
        }
        let rescaled = (f64::from(real_val) - self.min_val) / self.span();
        (rescaled * self.levels + 0.5).floor().clamp(0.0, self.levels) as i64
    }

    fn dequantize(&self, q_val: i64) -> f32 {
        if self.span() <= 0.0 {
            return self.min_val as f32;
        }
        (q_val as f64 / self.levels * self.span() + self.min_val) as f32
    }
}

/// Quantizes over the tensor's own `[min, max]`. Output never leaves that range.
pub fn min_max_quantize(tensor: &Tensor, bits: u32) -> Tensor {
    match tensor.min_and_max() {
        Some((min_val, max_val)) => min_max_quantize_in_range(tensor, bits, min_val, max_val),
        None => tensor.clone(),
    }
}

/// Quantizes over a fixed range; values outside it are clamped to the ends.
pub fn min_max_quantize_in_range(tensor: &Tensor, bits: u32, min_val: f32, max_val: f32) -> Tensor {
    if bits >= BYPASS_BITS || tensor.is_empty() {
        return tensor.clone();
    }
    fake_quantize(tensor, &MinMaxQuantizer::new(min_val, max_val, bits))
}
