//! Run results and quantized-model snapshots on disk.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::QuantMethod;
use crate::error::Result;
use crate::eval::Accuracy;
use crate::params::StateDict;

pub const RESULTS_FILE: &str = "acc1_acc5.txt";

const HASH_SUFFIX_LEN: usize = 12;

/// First 12 hex digits of the SHA-256 of `content`.
pub fn create_filename_hash_suffix(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = format!("{digest:x}");
    hex.truncate(HASH_SUFFIX_LEN);
    hex
}

/// What a run was asked to do and how well it did.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunDescriptor {
    #[serde(rename = "type")]
    pub model_type: String,
    pub quant_method: QuantMethod,
    pub param_bits: u32,
    pub bn_bits: u32,
    pub fwd_bits: u32,
    pub overflow_rate: f64,
    pub acc1: String,
    pub acc5: String,
}

impl RunDescriptor {
    pub fn new(
        model_type: impl Into<String>,
        quant_method: QuantMethod,
        param_bits: u32,
        bn_bits: u32,
        fwd_bits: u32,
        overflow_rate: f64,
        accuracy: Accuracy,
    ) -> Self {
        Self {
            model_type: model_type.into(),
            quant_method,
            param_bits,
            bn_bits,
            fwd_bits,
            overflow_rate,
            acc1: format!("{:.4}", accuracy.top1),
            acc5: format!("{:.4}", accuracy.top5),
        }
    }
}

/// Shortest round-trip float text with a signed, two-digit exponent.
fn float_repr(x: f64) -> String {
    let text = format!("{x:?}");
    match text.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => text,
    }
}

/// Dictionary-literal rendering; this exact text is what gets hashed.
impl fmt::Display for RunDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{'type': '{}', 'quant_method': '{}', 'param_bits': {}, 'bn_bits': {}, \
             'fwd_bits': {}, 'overflow_rate': {}, 'acc1': '{}', 'acc5': '{}'}}",
            self.model_type,
            self.quant_method,
            self.param_bits,
            self.bn_bits,
            self.fwd_bits,
            float_repr(self.overflow_rate),
            self.acc1,
            self.acc5
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantizedModelSnapshot {
    pub model_state_dict: StateDict,
    pub res_str: String,
    pub res_dict: RunDescriptor,
}

pub fn snapshot_file_name(descriptor: &RunDescriptor) -> String {
    format!(
        "{}-quantized-{}.json",
        descriptor.model_type,
        create_filename_hash_suffix(&descriptor.to_string())
    )
}

pub fn snapshot_path(model_root: &Path, descriptor: &RunDescriptor) -> PathBuf {
    model_root.join(snapshot_file_name(descriptor))
}

pub fn save_snapshot(path: &Path, snapshot: &QuantizedModelSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string(snapshot)?;
    fs::write(path, json)?;
    info!(path = %path.display(), "saved quantized model");
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<QuantizedModelSnapshot> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Appends `<descriptor>, <snapshot path | not saved>` to the results file in
/// `logdir`, creating both if needed.
pub fn append_result(logdir: &Path, descriptor: &RunDescriptor, saved_to: Option<&Path>) -> Result<PathBuf> {
    fs::create_dir_all(logdir)?;
    let path = logdir.join(RESULTS_FILE);
    let location = saved_to.map_or_else(|| "not saved".to_string(), |p| p.display().to_string());
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{descriptor}, {location}")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::params::{ParamClass, ParameterEntry};
    use crate::tensor::Tensor;

    fn descriptor() -> RunDescriptor {
        RunDescriptor::new(
            "mlp_bn",
            QuantMethod::Linear,
            8,
            32,
            8,
            0.0,
            Accuracy {
                top1: 92.13,
                top5: 99.8,
            },
        )
    }

    #[test]
    fn hash_suffix_is_sha256_prefix() {
        assert_eq!(create_filename_hash_suffix("abc"), "ba7816bf8f01");
        assert_eq!(create_filename_hash_suffix("").len(), 12);
    }

    #[test]
    fn descriptor_renders_as_dict_literal() {
        assert_eq!(
            descriptor().to_string(),
            "{'type': 'mlp_bn', 'quant_method': 'linear', 'param_bits': 8, 'bn_bits': 32, \
             'fwd_bits': 8, 'overflow_rate': 0.0, 'acc1': '92.1300', 'acc5': '99.8000'}"
        );
    }

    #[test]
    fn float_repr_matches_dict_literal_style() {
        assert_eq!(float_repr(0.0), "0.0");
        assert_eq!(float_repr(0.01), "0.01");
        assert_eq!(float_repr(1e-5), "1e-05");
        assert_eq!(float_repr(1.0), "1.0");
    }

    #[test]
    fn file_name_is_keyed_by_results() {
        let a = snapshot_file_name(&descriptor());
        assert!(a.starts_with("mlp_bn-quantized-"));
        assert!(a.ends_with(".json"));

        let mut other = descriptor();
        other.fwd_bits = 4;
        assert_ne!(a, snapshot_file_name(&other));
    }

    #[test]
    fn snapshot_survives_disk() {
        let dir = tempdir().unwrap();
        let mut dict = StateDict::new();
        dict.insert(ParameterEntry::new(
            "fc.weight",
            ParamClass::Regular,
            Tensor::from_vec(&[1, 2], vec![0.5, -0.25]).unwrap(),
        ))
        .unwrap();
        let snapshot = QuantizedModelSnapshot {
            model_state_dict: dict,
            res_str: descriptor().to_string(),
            res_dict: descriptor(),
        };
        let path = snapshot_path(dir.path(), &descriptor());
        save_snapshot(&path, &snapshot).unwrap();
        assert_eq!(load_snapshot(&path).unwrap(), snapshot);
    }

    #[test]
    fn results_are_appended() {
        let dir = tempdir().unwrap();
        let logdir = dir.path().join("log").join("default");
        append_result(&logdir, &descriptor(), None).unwrap();
        let path = append_result(&logdir, &descriptor(), Some(Path::new("/models/x.json"))).unwrap();

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("}, not saved"));
        assert!(lines[1].ends_with("}, /models/x.json"));
    }
}
