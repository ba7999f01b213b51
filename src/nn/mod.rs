//! Computation units and the tree that composes them.

pub mod batchnorm;
pub mod linear;
pub mod relu;

use std::collections::BTreeSet;
use std::fmt;

use ndarray::{ArrayView1, ArrayView2, Ix1, Ix2};

pub use batchnorm::BatchNorm1d;
pub use linear::Linear;
pub use relu::Relu;

use crate::activation::CalibrationState;
use crate::context::{Device, ExecutionContext};
use crate::error::{QuantError, Result};
use crate::params::{ParamClass, ParameterEntry, StateDict};
use crate::tensor::Tensor;

/// A leaf computation unit.
///
/// Calls on one unit must be serialized: a unit may hold calibration state
/// that advances once per call, in call order.
pub trait Quantizable: fmt::Debug + Send {
    /// One line, e.g. `Linear(in_features=4, out_features=2)`.
    fn describe(&self) -> String;

    fn forward_and_maybe_calibrate(&mut self, input: &Tensor, ctx: &ExecutionContext) -> Result<Tensor>;

    /// Local names in a fixed order, tagged with their class.
    fn parameters(&self) -> Vec<(&'static str, ParamClass, &Tensor)> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<(&'static str, &mut Tensor)> {
        Vec::new()
    }

    fn calibration(&self) -> Option<&CalibrationState> {
        None
    }
}

#[derive(Debug)]
pub enum Node {
    Unit(Box<dyn Quantizable>),
    Sequential(Sequential),
}

/// Ordered, named children applied one after another.
#[derive(Debug, Default)]
pub struct Sequential {
    children: Vec<(String, Node)>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(mut self, name: impl Into<String>, unit: impl Quantizable + 'static) -> Self {
        self.children.push((name.into(), Node::Unit(Box::new(unit))));
        self
    }

    pub fn nested(mut self, name: impl Into<String>, child: Sequential) -> Self {
        self.children.push((name.into(), Node::Sequential(child)));
        self
    }

    fn forward(&mut self, input: &Tensor, ctx: &ExecutionContext) -> Result<Tensor> {
        let mut x = input.clone();
        for (_, child) in &mut self.children {
            x = match child {
                Node::Unit(unit) => unit.forward_and_maybe_calibrate(&x, ctx)?,
                Node::Sequential(seq) => seq.forward(&x, ctx)?,
            };
        }
        Ok(x)
    }

    fn visit_units<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a dyn Quantizable)) {
        for (name, child) in &self.children {
            let path = join(prefix, name);
            match child {
                Node::Unit(unit) => f(&path, unit.as_ref()),
                Node::Sequential(seq) => seq.visit_units(&path, f),
            }
        }
    }

    fn visit_units_mut(&mut self, prefix: &str, f: &mut dyn FnMut(&str, &mut dyn Quantizable)) {
        for (name, child) in &mut self.children {
            let path = join(prefix, name);
            match child {
                Node::Unit(unit) => f(&path, unit.as_mut()),
                Node::Sequential(seq) => seq.visit_units_mut(&path, f),
            }
        }
    }

    /// Rebuilds the tree with every unit replaced by `f(path, unit)`.
    /// Containers, names and order are kept.
    fn map_units(
        self,
        prefix: &str,
        f: &mut dyn FnMut(&str, Box<dyn Quantizable>) -> Box<dyn Quantizable>,
    ) -> Self {
        let children = self
            .children
            .into_iter()
            .map(|(name, child)| {
                let path = join(prefix, &name);
                let child = match child {
                    Node::Unit(unit) => Node::Unit(f(&path, unit)),
                    Node::Sequential(seq) => Node::Sequential(seq.map_units(&path, f)),
                };
                (name, child)
            })
            .collect();
        Sequential { children }
    }

    fn fmt_tree(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth + 1);
        for (name, child) in &self.children {
            match child {
                Node::Unit(unit) => writeln!(f, "{pad}({name}): {}", unit.describe())?,
                Node::Sequential(seq) => {
                    writeln!(f, "{pad}({name}): Sequential(")?;
                    seq.fmt_tree(f, depth + 1)?;
                    writeln!(f, "{pad})")?;
                }
            }
        }
        Ok(())
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// A named network around a root container.
#[derive(Debug)]
pub struct Model {
    name: String,
    body: Sequential,
}

impl Model {
    pub fn new(name: impl Into<String>, body: Sequential) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input must sit on the context's device.
    pub fn forward(&mut self, input: &Tensor, ctx: &ExecutionContext) -> Result<Tensor> {
        ctx.device().check(input.device())?;
        self.body.forward(input, ctx)
    }

    pub fn state_dict(&self) -> StateDict {
        let mut entries = Vec::new();
        self.body.visit_units("", &mut |path, unit| {
            for (local, class, tensor) in unit.parameters() {
                entries.push(ParameterEntry::new(join(path, local), class, tensor.clone()));
            }
        });
        entries.into_iter().collect()
    }

    /// Strict load: the key sets must match exactly and every shape must agree.
    /// Incoming tensors take the placement of the tensors they replace.
    pub fn load_state_dict(&mut self, dict: &StateDict) -> Result<()> {
        let current = self.state_dict();
        let expected: BTreeSet<&str> = current.names().collect();
        let given: BTreeSet<&str> = dict.names().collect();

        let missing: Vec<_> = expected.difference(&given).collect();
        let unexpected: Vec<_> = given.difference(&expected).collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(QuantError::StateDict(format!(
                "missing keys {missing:?}, unexpected keys {unexpected:?}"
            )));
        }
        for entry in current.iter() {
            let incoming = dict.get(&entry.name).map(|e| e.tensor.shape());
            if incoming != Some(entry.tensor.shape()) {
                return Err(QuantError::StateDict(format!(
                    "shape mismatch for '{}': expected {:?}, got {:?}",
                    entry.name,
                    entry.tensor.shape(),
                    incoming.unwrap_or_default()
                )));
            }
        }

        self.body.visit_units_mut("", &mut |path, unit| {
            for (local, slot) in unit.parameters_mut() {
                if let Some(entry) = dict.get(&join(path, local)) {
                    *slot = entry.tensor.clone().to(slot.device());
                }
            }
        });
        Ok(())
    }

    /// Moves every parameter to `device`.
    pub fn to(mut self, device: Device) -> Self {
        self.body.visit_units_mut("", &mut |_, unit| {
            for (_, slot) in unit.parameters_mut() {
                *slot = slot.clone().to(device);
            }
        });
        self
    }

    pub fn unit_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.body.visit_units("", &mut |path, _| paths.push(path.to_string()));
        paths
    }

    /// Calibration state of every wrapped unit, keyed by path.
    pub fn calibration_states(&self) -> Vec<(String, CalibrationState)> {
        let mut states = Vec::new();
        self.body.visit_units("", &mut |path, unit| {
            if let Some(state) = unit.calibration() {
                states.push((path.to_string(), state.clone()));
            }
        });
        states
    }

    pub fn map_units(
        self,
        mut f: impl FnMut(&str, Box<dyn Quantizable>) -> Box<dyn Quantizable>,
    ) -> Self {
        Model {
            name: self.name,
            body: self.body.map_units("", &mut f),
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}(", self.name)?;
        self.body.fmt_tree(f, 0)?;
        write!(f, ")")
    }
}

/// Views a `[rows, cols]` tensor as a matrix.
pub(crate) fn as_matrix(tensor: &Tensor) -> Result<ArrayView2<'_, f32>> {
    tensor
        .data()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| QuantError::ShapeMismatch {
            expected: vec![0, 0],
            got: tensor.shape().to_vec(),
        })
}

pub(crate) fn as_vector(tensor: &Tensor) -> Result<ArrayView1<'_, f32>> {
    tensor
        .data()
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| QuantError::ShapeMismatch {
            expected: vec![0],
            got: tensor.shape().to_vec(),
        })
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn model() -> Model {
        let mut rng = StdRng::seed_from_u64(1);
        Model::new(
            "tiny",
            Sequential::new()
                .nested(
                    "features",
                    Sequential::new()
                        .unit("0", Linear::random(3, 4, &mut rng))
                        .unit("1", BatchNorm1d::random(4, &mut rng))
                        .unit("2", Relu),
                )
                .unit("classifier", Linear::random(4, 2, &mut rng)),
        )
    }

    #[test]
    fn state_dict_uses_dotted_paths_in_order() {
        let names: Vec<String> = model().state_dict().names().map(String::from).collect();
        assert_eq!(
            names,
            vec![
                "features.0.weight",
                "features.0.bias",
                "features.1.weight",
                "features.1.bias",
                "features.1.running_mean",
                "features.1.running_var",
                "classifier.weight",
                "classifier.bias",
            ]
        );
    }

    #[test]
    fn batchnorm_statistics_are_tagged() {
        let dict = model().state_dict();
        assert_eq!(
            dict.get("features.1.running_var").map(|e| e.class),
            Some(ParamClass::RunningStatistic)
        );
        assert_eq!(dict.get("features.1.weight").map(|e| e.class), Some(ParamClass::Regular));
    }

    #[test]
    fn forward_shapes() {
        let ctx = ExecutionContext::host(0);
        let mut m = model();
        let out = m.forward(&Tensor::zeros(&[5, 3]), &ctx).unwrap();
        assert_eq!(out.shape(), &[5, 2]);
    }

    #[test]
    fn load_round_trips_and_is_strict() {
        let mut m = model();
        let mut dict = m.state_dict();
        m.load_state_dict(&dict).unwrap();
        assert_eq!(m.state_dict(), dict);

        dict.insert(ParameterEntry::untagged("extra.weight", Tensor::zeros(&[1])))
            .unwrap();
        assert!(matches!(m.load_state_dict(&dict), Err(QuantError::StateDict(_))));
    }

    #[test]
    fn load_rejects_wrong_shape() {
        let mut m = model();
        let dict: StateDict = m
            .state_dict()
            .iter()
            .map(|e| {
                if e.name == "classifier.bias" {
                    ParameterEntry::new(e.name.clone(), e.class, Tensor::zeros(&[3]))
                } else {
                    e.clone()
                }
            })
            .collect();
        assert!(matches!(m.load_state_dict(&dict), Err(QuantError::StateDict(_))));
    }

    #[test]
    fn misplaced_input_is_rejected() {
        let ctx = ExecutionContext::host(0);
        let mut m = model();
        let input = Tensor::zeros(&[1, 3]).to(Device::Accelerator(0));
        assert!(matches!(
            m.forward(&input, &ctx),
            Err(QuantError::DevicePlacementMismatch { .. })
        ));
    }

    #[test]
    fn display_renders_the_tree() {
        let text = model().to_string();
        assert!(text.starts_with("tiny(\n  (features): Sequential(\n    (0): Linear(in_features=3, out_features=4)"));
        assert!(text.contains("  (classifier): Linear(in_features=4, out_features=2)"));
        assert!(text.ends_with(')'));
    }
}
