use rand::Rng;

use super::{as_matrix, as_vector, Quantizable};
use crate::context::ExecutionContext;
use crate::error::{QuantError, Result};
use crate::params::ParamClass;
use crate::tensor::Tensor;

/// `y = x W^T + b` over `[batch, in_features]` inputs.
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    weight: Tensor,
    bias: Tensor,
}

impl Linear {
    /// `weight` is `[out_features, in_features]`, `bias` is `[out_features]`.
    pub fn new(weight: Tensor, bias: Tensor) -> Result<Self> {
        let rows = as_matrix(&weight)?.nrows();
        let len = as_vector(&bias)?.len();
        if rows != len {
            return Err(QuantError::ShapeMismatch {
                expected: vec![rows],
                got: bias.shape().to_vec(),
            });
        }
        Ok(Self { weight, bias })
    }

    /// Uniform init in `±1/sqrt(in_features)`.
    pub fn random(in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        Self {
            weight: Tensor::random(&[out_features, in_features], -bound..bound, rng),
            bias: Tensor::random(&[out_features], -bound..bound, rng),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Quantizable for Linear {
    fn describe(&self) -> String {
        format!(
            "Linear(in_features={}, out_features={})",
            self.in_features(),
            self.out_features()
        )
    }

    fn forward_and_maybe_calibrate(&mut self, input: &Tensor, _ctx: &ExecutionContext) -> Result<Tensor> {
        self.weight.device().check(input.device())?;
        let x = as_matrix(input)?;
        if x.ncols() != self.in_features() {
            return Err(QuantError::ShapeMismatch {
                expected: vec![x.nrows(), self.in_features()],
                got: input.shape().to_vec(),
            });
        }
        let w = as_matrix(&self.weight)?;
        let b = as_vector(&self.bias)?;
        let y = x.dot(&w.t()) + &b;
        Ok(input.with_data(y.into_dyn()))
    }

    fn parameters(&self) -> Vec<(&'static str, ParamClass, &Tensor)> {
        vec![
            ("weight", ParamClass::Regular, &self.weight),
            ("bias", ParamClass::Regular, &self.bias),
        ]
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        vec![("weight", &mut self.weight), ("bias", &mut self.bias)]
    }
}
