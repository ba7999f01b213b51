use std::ops::Range;

use ndarray::{Array1, ArrayD, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::context::Device;
use crate::error::{QuantError, Result};

/// Dense f32 array with a placement tag.
///
/// Every quantization routine takes `&Tensor` and returns a new one; nothing
/// here mutates shared storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "TensorRecord", try_from = "TensorRecord")]
pub struct Tensor {
    data: ArrayD<f32>,
    device: Device,
}

/// On-disk form of a tensor. Placement is not persisted.
#[derive(Serialize, Deserialize)]
struct TensorRecord {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl From<Tensor> for TensorRecord {
    fn from(tensor: Tensor) -> Self {
        TensorRecord {
            shape: tensor.shape().to_vec(),
            data: tensor.data.iter().copied().collect(),
        }
    }
}

impl TryFrom<TensorRecord> for Tensor {
    type Error = QuantError;

    fn try_from(record: TensorRecord) -> Result<Self> {
        Tensor::from_vec(&record.shape, record.data)
    }
}

impl Tensor {
    pub fn new(data: ArrayD<f32>) -> Self {
        Self {
            data,
            device: Device::Host,
        }
    }

    pub fn from_vec(shape: &[usize], values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(QuantError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![values.len()],
            });
        }
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            QuantError::ShapeMismatch {
                expected: shape.to_vec(),
                got: vec![expected],
            }
        })?;
        Ok(Self::new(data))
    }

    /// One-dimensional tensor holding `values`.
    pub fn from_slice(values: &[f32]) -> Self {
        Self::new(Array1::from(values.to_vec()).into_dyn())
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn random(shape: &[usize], range: Range<f32>, rng: &mut impl Rng) -> Self {
        Self::new(ArrayD::from_shape_fn(IxDyn(shape), |_| {
            rng.random_range(range.clone())
        }))
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Retags the tensor for `device`.
    pub fn to(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Keeps placement, replaces storage. Shape must already match.
    pub fn with_data(&self, data: ArrayD<f32>) -> Self {
        Self {
            data,
            device: self.device,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &f32> {
        self.data.iter()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Element-wise transform into a new tensor on the same device.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        self.with_data(self.data.mapv(f))
    }

    /// `None` for an empty tensor.
    pub fn min_and_max(&self) -> Option<(f32, f32)> {
        let mut iter = self.data.iter().copied();
        let first = iter.next()?;
        Some(iter.fold((first, first), |(lo, hi), x| (lo.min(x), hi.max(x))))
    }

    /// Largest magnitude, 0 for an empty tensor.
    pub fn abs_max(&self) -> f32 {
        self.data.iter().fold(0.0f32, |acc, x| acc.max(x.abs()))
    }

    pub fn max(&self) -> Option<f32> {
        self.min_and_max().map(|(_, hi)| hi)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn from_vec_rejects_wrong_length() {
        let err = Tensor::from_vec(&[2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, QuantError::ShapeMismatch { .. }));
    }

    #[test]
    fn min_and_max_of_mixed_values() {
        let t = Tensor::from_slice(&[1.0, 2.0, -1.0]);
        assert_eq!(t.min_and_max(), Some((-1.0, 2.0)));
        assert_eq!(t.abs_max(), 2.0);
        assert_eq!(Tensor::zeros(&[0]).min_and_max(), None);
    }

    #[test]
    fn random_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(3);
        let t = Tensor::random(&[8, 8], -0.5..0.5, &mut rng);
        assert_eq!(t.shape(), &[8, 8]);
        assert!(t.iter().all(|&x| (-0.5..0.5).contains(&x)));
    }

    #[test]
    fn map_keeps_placement() {
        let t = Tensor::from_slice(&[1.0, -2.0]).to(Device::Accelerator(2));
        let doubled = t.map(|x| x * 2.0);
        assert_eq!(doubled.device(), Device::Accelerator(2));
        assert_eq!(doubled.to_vec(), vec![2.0, -4.0]);
    }

    #[test]
    fn serde_keeps_shape_and_values() {
        let t = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"shape":[2,2],"data":[1.0,2.0,3.0,4.0]}"#);
        let back: Tensor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
