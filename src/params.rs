//! Persisted parameters and the pass that quantizes them.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ParameterPassConfig, BYPASS_BITS};
use crate::error::{QuantError, Result};
use crate::quantization::quantize_with;
use crate::tensor::Tensor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamClass {
    Regular,
    /// Batch-norm moving mean / variance.
    RunningStatistic,
}

impl ParamClass {
    /// Fallback for entries that arrive without a tag: names containing
    /// `running` are running statistics.
    pub fn from_name(name: &str) -> Self {
        if name.contains("running") {
            ParamClass::RunningStatistic
        } else {
            ParamClass::Regular
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterEntry {
    pub name: String,
    pub class: ParamClass,
    pub tensor: Tensor,
}

impl ParameterEntry {
    pub fn new(name: impl Into<String>, class: ParamClass, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            class,
            tensor,
        }
    }

    /// Classifies by name.
    pub fn untagged(name: impl Into<String>, tensor: Tensor) -> Self {
        let name = name.into();
        let class = ParamClass::from_name(&name);
        Self { name, class, tensor }
    }
}

/// Ordered name → tensor map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDict {
    entries: Vec<ParameterEntry>,
}

impl StateDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry. Names must be unique.
    pub fn insert(&mut self, entry: ParameterEntry) -> Result<()> {
        if self.get(&entry.name).is_some() {
            return Err(QuantError::StateDict(format!("duplicate entry '{}'", entry.name)));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ParameterEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParameterEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<ParameterEntry> for StateDict {
    fn from_iter<I: IntoIterator<Item = ParameterEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// What happened to one entry.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryOutcome {
    pub name: String,
    pub class: ParamClass,
    /// `None` when the entry was copied unchanged.
    pub bits: Option<u32>,
    pub max_before: Option<f32>,
    pub max_after: Option<f32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterPassReport {
    pub entries: Vec<EntryOutcome>,
}

impl ParameterPassReport {
    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|e| e.bits.is_none())
            .map(|e| e.name.as_str())
    }

    pub fn quantized_count(&self) -> usize {
        self.entries.iter().filter(|e| e.bits.is_some()).count()
    }
}

/// Returns a quantized copy of `params`. The input is left untouched; names,
/// classes and order are preserved.
pub fn quantize_parameters(
    params: &StateDict,
    config: &ParameterPassConfig,
) -> (StateDict, ParameterPassReport) {
    let regular = config.regular();
    let mut report = ParameterPassReport::default();

    let quantized = params
        .iter()
        .map(|entry| {
            let bits = config.bits_for(entry.class);
            let max_before = entry.tensor.max();

            if bits >= BYPASS_BITS {
                warn!(entry = %entry.name, class = ?entry.class, "ignoring {}", entry.name);
                report.entries.push(EntryOutcome {
                    name: entry.name.clone(),
                    class: entry.class,
                    bits: None,
                    max_before,
                    max_after: max_before,
                });
                return entry.clone();
            }

            let tensor = quantize_with(&entry.tensor, regular.method(), bits, regular.overflow_rate());
            let max_after = tensor.max();
            debug!(
                entry = %entry.name,
                bits,
                max_before = ?max_before,
                max_after = ?max_after,
                "quantized parameter"
            );
            report.entries.push(EntryOutcome {
                name: entry.name.clone(),
                class: entry.class,
                bits: Some(bits),
                max_before,
                max_after,
            });
            ParameterEntry::new(entry.name.clone(), entry.class, tensor)
        })
        .collect();

    info!(
        method = %regular.method(),
        quantized = report.quantized_count(),
        skipped = report.entries.len() - report.quantized_count(),
        "parameter pass finished"
    );
    (quantized, report)
}
