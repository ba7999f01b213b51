use std::fmt;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{QuantError, Result};

/// Where a tensor's storage is placed.
///
/// All storage lives in host memory; the tag is the placement contract that
/// operations check before combining operands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    #[default]
    Host,
    Accelerator(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Accelerator(idx) => write!(f, "accelerator:{idx}"),
        }
    }
}

impl Device {
    /// Fails unless `found` is placed on `self`.
    pub fn check(self, found: Device) -> Result<()> {
        if self == found {
            Ok(())
        } else {
            Err(QuantError::DevicePlacementMismatch {
                expected: self,
                found,
            })
        }
    }
}

/// Explicit per-run state handed to every operation that needs a device or randomness.
///
/// A context must not be shared between concurrent calibration streams.
#[derive(Debug)]
pub struct ExecutionContext {
    device: Device,
    seed: u64,
    rng: StdRng,
}

impl ExecutionContext {
    pub fn new(device: Device, seed: u64) -> Self {
        Self {
            device,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn host(seed: u64) -> Self {
        Self::new(Device::Host, seed)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
