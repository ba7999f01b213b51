use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::params::ParamClass;

/// Bit-width at and above which quantization is skipped.
pub const BYPASS_BITS: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantMethod {
    Linear,
    MinMax,
    #[serde(rename = "log")]
    LogMinMax,
    Tanh,
}

impl QuantMethod {
    pub const ALL: [QuantMethod; 4] = [
        QuantMethod::Linear,
        QuantMethod::MinMax,
        QuantMethod::LogMinMax,
        QuantMethod::Tanh,
    ];

    /// Name accepted on the command line and written to run descriptors.
    pub fn as_str(self) -> &'static str {
        match self {
            QuantMethod::Linear => "linear",
            QuantMethod::MinMax => "minmax",
            QuantMethod::LogMinMax => "log",
            QuantMethod::Tanh => "tanh",
        }
    }
}

impl fmt::Display for QuantMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuantMethod {
    type Err = QuantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(QuantMethod::Linear),
            "minmax" => Ok(QuantMethod::MinMax),
            "log" | "log_minmax" => Ok(QuantMethod::LogMinMax),
            "tanh" => Ok(QuantMethod::Tanh),
            other => Err(QuantError::Configuration(format!(
                "unknown quantization method '{other}' (expected linear|minmax|log|tanh)"
            ))),
        }
    }
}

fn check_bits(what: &str, bits: u32) -> Result<()> {
    if bits == 0 || bits > BYPASS_BITS {
        return Err(QuantError::Configuration(format!(
            "{what} must be in 1..={BYPASS_BITS}, got {bits}"
        )));
    }
    Ok(())
}

/// Scheme, bit-width and overflow tolerance. Validated once, immutable afterwards.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantizationConfig {
    method: QuantMethod,
    bits: u32,
    overflow_rate: f64,
}

impl QuantizationConfig {
    pub fn new(method: QuantMethod, bits: u32, overflow_rate: f64) -> Result<Self> {
        check_bits("bits", bits)?;
        if !overflow_rate.is_finite() || !(0.0..=1.0).contains(&overflow_rate) {
            return Err(QuantError::Configuration(format!(
                "overflow rate must be in [0, 1], got {overflow_rate}"
            )));
        }
        Ok(Self {
            method,
            bits,
            overflow_rate,
        })
    }

    pub fn method(&self) -> QuantMethod {
        self.method
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn overflow_rate(&self) -> f64 {
        self.overflow_rate
    }

    pub fn is_bypass(&self) -> bool {
        self.bits >= BYPASS_BITS
    }

    /// Same scheme and tolerance at another bit-width.
    pub fn with_bits(&self, bits: u32) -> Result<Self> {
        Self::new(self.method, bits, self.overflow_rate)
    }
}

/// Bit-width selection for the parameter pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParameterPassConfig {
    regular: QuantizationConfig,
    bn_bits: u32,
}

impl ParameterPassConfig {
    pub fn new(regular: QuantizationConfig, bn_bits: u32) -> Result<Self> {
        check_bits("bn_bits", bn_bits)?;
        Ok(Self { regular, bn_bits })
    }

    pub fn regular(&self) -> &QuantizationConfig {
        &self.regular
    }

    pub fn bn_bits(&self) -> u32 {
        self.bn_bits
    }

    pub fn bits_for(&self, class: ParamClass) -> u32 {
        match class {
            ParamClass::Regular => self.regular.bits(),
            ParamClass::RunningStatistic => self.bn_bits,
        }
    }
}

/// Everything a full quantize-and-evaluate run needs.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    pub model_type: String,
    pub quant_method: String,
    pub batch_size: usize,
    pub ngpu: usize,
    pub seed: u64,
    pub model_root: PathBuf,
    pub data_root: PathBuf,
    pub logdir: PathBuf,
    pub input_size: usize,
    pub n_sample: usize,
    pub param_bits: u32,
    pub bn_bits: u32,
    pub fwd_bits: u32,
    pub overflow_rate: f64,
    pub save_quantized_model: bool,
    pub plot: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_type: "mlp_bn".to_string(),
            quant_method: "linear".to_string(),
            batch_size: 100,
            ngpu: 1,
            seed: 117,
            model_root: PathBuf::from("~/.cache/ptq/models/"),
            data_root: PathBuf::from("~/data/public_dataset/"),
            logdir: PathBuf::from("log/default"),
            input_size: 224,
            n_sample: 20,
            param_bits: 8,
            bn_bits: 32,
            fwd_bits: 8,
            overflow_rate: 0.0,
            save_quantized_model: false,
            plot: None,
        }
    }
}

/// Validated, derived view of a [`RunConfig`].
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedRun {
    pub method: QuantMethod,
    pub params: ParameterPassConfig,
    pub activations: QuantizationConfig,
    pub input_size: usize,
    pub model_root: PathBuf,
    pub data_root: PathBuf,
    pub logdir: PathBuf,
}

impl RunConfig {
    /// Checks every knob before any tensor work happens.
    pub fn validate(&self) -> Result<ResolvedRun> {
        let method: QuantMethod = self.quant_method.parse()?;
        if self.batch_size == 0 {
            return Err(QuantError::Configuration("batch_size must be positive".into()));
        }
        if self.ngpu == 0 {
            return Err(QuantError::Configuration("ngpu must be positive".into()));
        }
        let regular = QuantizationConfig::new(method, self.param_bits, self.overflow_rate)?;
        let params = ParameterPassConfig::new(regular, self.bn_bits)?;
        let activations = QuantizationConfig::new(method, self.fwd_bits, self.overflow_rate)?;

        let input_size = if self.model_type.contains("inception") {
            299
        } else {
            self.input_size
        };
        if input_size == 0 {
            return Err(QuantError::Configuration("input_size must be positive".into()));
        }

        Ok(ResolvedRun {
            method,
            params,
            activations,
            input_size,
            model_root: expand_user(&self.model_root),
            data_root: expand_user(&self.data_root),
            logdir: expand_user(&self.logdir),
        })
    }
}

/// Replaces a leading `~` with `$HOME`.
pub fn expand_user(path: &std::path::Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods() {
        assert_eq!("linear".parse::<QuantMethod>().unwrap(), QuantMethod::Linear);
        assert_eq!("minmax".parse::<QuantMethod>().unwrap(), QuantMethod::MinMax);
        assert_eq!("log".parse::<QuantMethod>().unwrap(), QuantMethod::LogMinMax);
        assert_eq!("tanh".parse::<QuantMethod>().unwrap(), QuantMethod::Tanh);
        for method in QuantMethod::ALL {
            assert_eq!(method.as_str().parse::<QuantMethod>().unwrap(), method);
        }
    }

    #[test]
    fn unknown_method_is_configuration_error() {
        let err = "kmeans".parse::<QuantMethod>().unwrap_err();
        assert!(matches!(err, QuantError::Configuration(_)));
    }

    #[test]
    fn rejects_bad_bits_and_rates() {
        assert!(QuantizationConfig::new(QuantMethod::Linear, 0, 0.0).is_err());
        assert!(QuantizationConfig::new(QuantMethod::Linear, 33, 0.0).is_err());
        assert!(QuantizationConfig::new(QuantMethod::Linear, 8, -0.1).is_err());
        assert!(QuantizationConfig::new(QuantMethod::Linear, 8, 1.5).is_err());
        assert!(QuantizationConfig::new(QuantMethod::Linear, 8, f64::NAN).is_err());
        let cfg = QuantizationConfig::new(QuantMethod::Tanh, 32, 1.0).unwrap();
        assert!(cfg.is_bypass());
    }

    #[test]
    fn bits_follow_parameter_class() {
        let regular = QuantizationConfig::new(QuantMethod::MinMax, 4, 0.0).unwrap();
        let cfg = ParameterPassConfig::new(regular, 16).unwrap();
        assert_eq!(cfg.bits_for(ParamClass::Regular), 4);
        assert_eq!(cfg.bits_for(ParamClass::RunningStatistic), 16);
        assert!(ParameterPassConfig::new(regular, 0).is_err());
    }

    #[test]
    fn inception_forces_input_size() {
        let cfg = RunConfig {
            model_type: "inception_v3".into(),
            ..RunConfig::default()
        };
        assert_eq!(cfg.validate().unwrap().input_size, 299);
        assert_eq!(RunConfig::default().validate().unwrap().input_size, 224);
    }

    #[test]
    fn validate_fails_fast_on_method() {
        let cfg = RunConfig {
            quant_method: "bogus".into(),
            ..RunConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(QuantError::Configuration(_))));
    }

    #[test]
    fn expand_user_only_touches_tilde() {
        assert_eq!(expand_user(std::path::Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_user(std::path::Path::new("~/models")),
                PathBuf::from(home).join("models")
            );
        }
    }
}
