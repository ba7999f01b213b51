use super::min_max::MinMaxQuantizer;
use super::{fake_quantize, Quantizer, BYPASS_BITS};
use crate::tensor::Tensor;

/// Magnitudes below this are treated as this before `log2`.
pub const LOG_EPS: f64 = 1e-20;

/// Sign plus a uniformly quantized log2-magnitude.
///
/// One bit carries the sign, the remaining `bits - 1` index `2^(bits-1)`
/// magnitude levels between `2^log_min` and `2^log_max`. Zero is encoded as the
/// smallest positive magnitude so the code book stays at `2^bits` entries.
/// With a single bit only the sign survives.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogMinMaxQuantizer {
    magnitude: Option<MinMaxQuantizer>,
}

impl LogMinMaxQuantizer {
    pub fn new(log_min: f32, log_max: f32, bits: u32) -> Self {
        let magnitude = (bits > 1).then(|| MinMaxQuantizer::new(log_min, log_max, bits - 1));
        LogMinMaxQuantizer { magnitude }
    }
}

fn sign(real_val: f32) -> i64 {
    if real_val < 0.0 {
        -1
    } else {
        1
    }
}

pub fn log_magnitude(real_val: f32) -> f32 {
    f64::from(real_val.abs()).max(LOG_EPS).log2() as f32
}

/// `[min, max]` of the log2-magnitudes, `None` for an empty tensor.
pub fn log_magnitude_range(tensor: &Tensor) -> Option<(f32, f32)> {
    tensor.map(log_magnitude).min_and_max()
}

impl Quantizer for LogMinMaxQuantizer {
    /// Codes are `±(level + 1)`; never zero.
    fn quantize(&self, real_val: f32) -> i64 {
        let level = match &self.magnitude {
            Some(magnitude) => magnitude.quantize(log_magnitude(real_val)),
            None => 0,
        };
        sign(real_val) * (level + 1)
    }

    fn dequantize(&self, q_val: i64) -> f32 {
        let sign = q_val.signum() as f64;
        match &self.magnitude {
            Some(magnitude) => {
                let log_mag = magnitude.dequantize(q_val.abs() - 1);
                (sign * f64::from(log_mag).exp2()) as f32
            }
            None => sign as f32,
        }
    }
}

/// Range taken from the tensor's own log2-magnitudes.
pub fn log_min_max_quantize(tensor: &Tensor, bits: u32) -> Tensor {
    match log_magnitude_range(tensor) {
        Some((log_min, log_max)) => log_min_max_quantize_in_range(tensor, bits, log_min, log_max),
        None => tensor.clone(),
    }
}

pub fn log_min_max_quantize_in_range(
    tensor: &Tensor,
    bits: u32,
    log_min: f32,
    log_max: f32,
) -> Tensor {
    if bits >= BYPASS_BITS || tensor.is_empty() {
        return tensor.clone();
    }
    fake_quantize(tensor, &LogMinMaxQuantizer::new(log_min, log_max, bits))
}
