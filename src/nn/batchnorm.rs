use rand::Rng;

use super::{as_matrix, as_vector, Quantizable};
use crate::context::ExecutionContext;
use crate::error::{QuantError, Result};
use crate::params::ParamClass;
use crate::tensor::Tensor;

const BN_EPS: f32 = 1e-5;

/// Inference-mode batch norm over `[batch, features]`, driven by the running
/// statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchNorm1d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
}

impl BatchNorm1d {
    /// Identity transform: unit scale, zero shift, zero mean, unit variance.
    pub fn new(features: usize) -> Self {
        let ones = Tensor::from_slice(&vec![1.0; features]);
        Self {
            weight: ones.clone(),
            bias: Tensor::zeros(&[features]),
            running_mean: Tensor::zeros(&[features]),
            running_var: ones,
        }
    }

    /// Statistics as a briefly trained layer would have them.
    pub fn random(features: usize, rng: &mut impl Rng) -> Self {
        Self {
            weight: Tensor::random(&[features], 0.8..1.2, rng),
            bias: Tensor::random(&[features], -0.1..0.1, rng),
            running_mean: Tensor::random(&[features], -0.1..0.1, rng),
            running_var: Tensor::random(&[features], 0.5..1.5, rng),
        }
    }

    pub fn features(&self) -> usize {
        self.weight.len()
    }
}

impl Quantizable for BatchNorm1d {
    fn describe(&self) -> String {
        format!("BatchNorm1d({}, eps={BN_EPS:e})", self.features())
    }

    fn forward_and_maybe_calibrate(&mut self, input: &Tensor, _ctx: &ExecutionContext) -> Result<Tensor> {
        self.weight.device().check(input.device())?;
        let x = as_matrix(input)?;
        if x.ncols() != self.features() {
            return Err(QuantError::ShapeMismatch {
                expected: vec![x.nrows(), self.features()],
                got: input.shape().to_vec(),
            });
        }

        let gamma = as_vector(&self.weight)?;
        let beta = as_vector(&self.bias)?;
        let mean = as_vector(&self.running_mean)?;
        let var = as_vector(&self.running_var)?;

        let scale = &gamma / &var.mapv(|v| (v + BN_EPS).sqrt());
        let shift = &beta - &(&mean * &scale);
        let y = &x * &scale + &shift;
        Ok(input.with_data(y.into_dyn()))
    }

    fn parameters(&self) -> Vec<(&'static str, ParamClass, &Tensor)> {
        vec![
            ("weight", ParamClass::Regular, &self.weight),
            ("bias", ParamClass::Regular, &self.bias),
            ("running_mean", ParamClass::RunningStatistic, &self.running_mean),
            ("running_var", ParamClass::RunningStatistic, &self.running_var),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        vec![
            ("weight", &mut self.weight),
            ("bias", &mut self.bias),
            ("running_mean", &mut self.running_mean),
            ("running_var", &mut self.running_var),
        ]
    }
}
