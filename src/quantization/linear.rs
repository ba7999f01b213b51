use super::range::estimate_integer_bits;
use super::{fake_quantize, Quantizer, BYPASS_BITS};
use crate::tensor::Tensor;

/// Symmetric power-of-two grid: codes in `[-2^(bits-1), 2^(bits-1) - 1]`,
/// step `2^-sf`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinearQuantizer {
    sf: i32,
    bits: u32,
}

impl LinearQuantizer {
    pub fn new(sf: i32, bits: u32) -> Self {
        LinearQuantizer { sf, bits }
    }

    /// Picks `sf = bits - 1 - integer_bits` for `tensor`.
    pub fn fit(tensor: &Tensor, bits: u32, overflow_rate: f64) -> Self {
        Self::new(scale_factor(bits, estimate_integer_bits(tensor, overflow_rate)), bits)
    }

    pub fn sf(&self) -> i32 {
        self.sf
    }

    fn bound(&self) -> f64 {
        2f64.powi(self.bits as i32 - 1)
    }
}

impl Quantizer for LinearQuantizer {
    fn quantize(&self, real_val: f32) -> i64 {
        let scaled = f64::from(real_val) * 2f64.powi(self.sf);
        let bound = self.bound();
        (scaled + 0.5).floor().clamp(-bound, bound - 1.0) as i64
    }

    fn dequantize(&self, q_val: i64) -> f32 {
        (q_val as f64 * 2f64.powi(-self.sf)) as f32
    }
}

/// Number of fractional bits left once `integer_bits` and the sign are taken.
pub fn scale_factor(bits: u32, integer_bits: i32) -> i32 {
    bits as i32 - 1 - integer_bits
}

/// Quantizes on the grid fixed by `sf`.
pub fn linear_quantize(tensor: &Tensor, sf: i32, bits: u32) -> Tensor {
    if bits >= BYPASS_BITS || tensor.is_empty() {
        return tensor.clone();
    }
    fake_quantize(tensor, &LinearQuantizer::new(sf, bits))
}

/// Derives `sf` from the tensor itself, then quantizes.
pub fn linear_quantize_fitted(tensor: &Tensor, bits: u32, overflow_rate: f64) -> Tensor {
    if bits >= BYPASS_BITS || tensor.is_empty() {
        return tensor.clone();
    }
    fake_quantize(tensor, &LinearQuantizer::fit(tensor, bits, overflow_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_onto_the_grid() {
        // 4 bits, sf 2: step 0.25, codes -8..=7
        let t = Tensor::from_slice(&[0.3, -0.6, 1.0, 0.125]);
        let q = linear_quantize(&t, 2, 4);
        assert_eq!(q.to_vec(), vec![0.25, -0.5, 1.0, 0.25]);
    }

    #[test]
    fn clamps_to_signed_range() {
        let t = Tensor::from_slice(&[5.0, -5.0]);
        let q = linear_quantize(&t, 2, 4);
        assert_eq!(q.to_vec(), vec![1.75, -2.0]);
    }

    #[test]
    fn fit_uses_estimated_integer_bits() {
        let t = Tensor::from_slice(&[3.0, -1.0, 0.5]);
        let quantizer = LinearQuantizer::fit(&t, 8, 0.0);
        assert_eq!(quantizer.sf(), 8 - 1 - 2);
    }

    #[test]
    fn zeros_are_exact() {
        let t = Tensor::zeros(&[4]);
        assert_eq!(linear_quantize_fitted(&t, 8, 0.0), t);
    }

    #[test]
    fn reapplying_with_same_sf_is_identity() {
        let t = Tensor::from_slice(&[0.11, -0.93, 0.47, 0.0, 0.999]);
        let once = linear_quantize(&t, 6, 4);
        assert_eq!(linear_quantize(&once, 6, 4), once);
    }
}
