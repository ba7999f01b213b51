use crate::tensor::Tensor;

/// Floor applied to magnitudes before taking a logarithm.
pub const MAGNITUDE_EPS: f64 = 1e-12;

/// More than enough halvings for any bracket an f32 exponent range produces.
const MAX_BISECTION_STEPS: usize = 20;

/// Minimal `b` such that at most `overflow_rate` of the elements have `|x| > 2^b`.
///
/// `overflow_rate` must lie in `[0, 1]`; validated configs guarantee this.
/// Empty and all-zero tensors need no integer bits and return 0.
pub fn estimate_integer_bits(tensor: &Tensor, overflow_rate: f64) -> i32 {
    debug_assert!((0.0..=1.0).contains(&overflow_rate));

    let magnitudes: Vec<f64> = tensor.iter().map(|&x| f64::from(x.abs())).collect();
    let max = magnitudes.iter().copied().fold(0.0f64, f64::max);
    if max == 0.0 {
        return 0;
    }

    // 2^hi covers the largest element, so nothing overflows there.
    let mut hi = max.max(MAGNITUDE_EPS).log2().ceil() as i32;
    if overflow_rate == 0.0 {
        return hi;
    }

    let min_nonzero = magnitudes
        .iter()
        .copied()
        .filter(|&m| m > 0.0)
        .fold(f64::INFINITY, f64::min);
    // Every non-zero element exceeds 2^lo.
    let mut lo = (min_nonzero.max(MAGNITUDE_EPS).log2().floor() as i32 - 1).min(hi);

    let total = magnitudes.len() as f64;
    let overflow_fraction = |bits: i32| {
        let threshold = 2f64.powi(bits);
        magnitudes.iter().filter(|&&m| m > threshold).count() as f64 / total
    };

    for _ in 0..MAX_BISECTION_STEPS {
        if lo >= hi {
            break;
        }
        let mid = lo + (hi - lo).div_euclid(2);
        if overflow_fraction(mid) <= overflow_rate {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }

    hi
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn zero_rate_covers_the_max() {
        let t = Tensor::from_slice(&[0.1, -3.0, 2.5]);
        assert_eq!(estimate_integer_bits(&t, 0.0), 2);

        let t = Tensor::from_slice(&[0.3, -0.2]);
        assert_eq!(estimate_integer_bits(&t, 0.0), -1);
    }

    #[test]
    fn exact_power_of_two_is_not_rounded_up() {
        let t = Tensor::from_slice(&[2.0, 1.0]);
        assert_eq!(estimate_integer_bits(&t, 0.0), 1);
    }

    #[test]
    fn degenerate_tensors_need_no_bits() {
        assert_eq!(estimate_integer_bits(&Tensor::zeros(&[16]), 0.0), 0);
        assert_eq!(estimate_integer_bits(&Tensor::zeros(&[16]), 0.5), 0);
        assert_eq!(estimate_integer_bits(&Tensor::zeros(&[0]), 0.0), 0);
    }

    #[test]
    fn tolerated_outlier_is_ignored() {
        let mut values = vec![0.5f32; 99];
        values.push(100.0);
        let t = Tensor::from_slice(&values);
        assert_eq!(estimate_integer_bits(&t, 0.0), 7);
        assert_eq!(estimate_integer_bits(&t, 0.01), -1);
        assert_eq!(estimate_integer_bits(&t, 0.005), 7);
    }

    #[test]
    fn deterministic() {
        let t = Tensor::from_slice(&[0.7, -1.9, 0.01, 4.2, -0.3]);
        assert_eq!(estimate_integer_bits(&t, 0.2), estimate_integer_bits(&t, 0.2));
    }

    proptest! {
        #[test]
        fn stricter_tolerance_never_needs_fewer_bits(
            values in proptest::collection::vec(-1000.0f32..1000.0, 1..64),
            r1 in 0.0f64..=1.0,
            r2 in 0.0f64..=1.0,
        ) {
            let (strict, loose) = if r1 <= r2 { (r1, r2) } else { (r2, r1) };
            let t = Tensor::from_slice(&values);
            prop_assert!(estimate_integer_bits(&t, strict) >= estimate_integer_bits(&t, loose));
        }

        #[test]
        fn result_meets_the_tolerance(
            values in proptest::collection::vec(-50.0f32..50.0, 1..64),
            rate in 0.0f64..=1.0,
        ) {
            let t = Tensor::from_slice(&values);
            let bits = estimate_integer_bits(&t, rate);
            let threshold = 2f64.powi(bits);
            let over = values.iter().filter(|v| f64::from(v.abs()) > threshold).count();
            prop_assert!(over as f64 / values.len() as f64 <= rate);
        }
    }
}
