use super::Quantizable;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::tensor::Tensor;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Relu;

impl Quantizable for Relu {
    fn describe(&self) -> String {
        "ReLU()".to_string()
    }

    fn forward_and_maybe_calibrate(&mut self, input: &Tensor, _ctx: &ExecutionContext) -> Result<Tensor> {
        Ok(input.map(|x| x.max(0.0)))
    }
}
