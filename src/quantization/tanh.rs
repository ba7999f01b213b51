use super::{fake_quantize, Quantizer, BYPASS_BITS};
use crate::tensor::Tensor;

/// Keeps reconstructed levels strictly inside (-1, 1) so `atanh` stays finite.
const EDGE_EPS: f64 = 1e-6;

/// Squashes with `tanh`, quantizes uniformly on `[-1, 1]`, then inverts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TanhQuantizer {
    levels: f64,
}

impl TanhQuantizer {
    pub fn new(bits: u32) -> Self {
        TanhQuantizer {
            levels: 2f64.powi(bits as i32) - 1.0,
        }
    }
}

impl Quantizer for TanhQuantizer {
    fn quantize(&self, real_val: f32) -> i64 {
        let rescaled = (f64::from(real_val).tanh() + 1.0) / 2.0;
        (rescaled * self.levels + 0.5).floor().clamp(0.0, self.levels) as i64
    }

    fn dequantize(&self, q_val: i64) -> f32 {
        let squashed = 2.0 * (q_val as f64 / self.levels) - 1.0;
        squashed.clamp(-1.0 + EDGE_EPS, 1.0 - EDGE_EPS).atanh() as f32
    }
}

pub fn tanh_quantize(tensor: &Tensor, bits: u32) -> Tensor {
    if bits >= BYPASS_BITS || tensor.is_empty() {
        return tensor.clone();
    }
    fake_quantize(tensor, &TanhQuantizer::new(bits))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn zero_maps_near_zero() {
        // 2^3 - 1 = 7 levels: no level sits exactly at 0, nearest is ±1/7
        let q = tanh_quantize(&Tensor::from_slice(&[0.0]), 3);
        assert!(q.to_vec()[0].abs() < 0.2);
    }

    #[test]
    fn output_is_finite_at_the_edges() {
        let t = Tensor::from_slice(&[-100.0, 100.0, f32::MAX]);
        let q = tanh_quantize(&t, 4);
        assert!(q.iter().all(|x| x.is_finite()));
        assert!(q.to_vec()[0] < -5.0);
        assert!(q.to_vec()[1] > 5.0);
    }

    #[test]
    fn small_values_land_near_their_level() {
        let t = Tensor::from_slice(&[0.25, -0.5]);
        let q = tanh_quantize(&t, 8);
        assert_abs_diff_eq!(q.to_vec()[0], 0.25, epsilon = 0.01);
        assert_abs_diff_eq!(q.to_vec()[1], -0.5, epsilon = 0.01);
    }
}
