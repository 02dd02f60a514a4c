use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Knobs shared by both state machines.
///
/// The mask interval lower bound must stay strictly positive so the
/// multiplicative scalar is always invertible and bounded away from zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Seconds of silence before an outstanding request or masked exchange
    /// is resent.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Lower bound of the mask/scalar sampling interval (inclusive).
    #[serde(default = "default_rand_min")]
    pub rand_min: f64,
    /// Upper bound of the mask/scalar sampling interval (exclusive).
    #[serde(default = "default_rand_max")]
    pub rand_max: f64,
}

fn default_timeout_secs() -> f64 {
    1.0
}

fn default_rand_min() -> f64 {
    1.0
}

fn default_rand_max() -> f64 {
    42.0
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            rand_min: default_rand_min(),
            rand_max: default_rand_max(),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(self.timeout_secs > 0.0) {
            return Err(ProtocolError::InvalidTimeout(self.timeout_secs));
        }
        if !(self.rand_min > 0.0) || !(self.rand_max > self.rand_min) {
            return Err(ProtocolError::InvalidMaskInterval {
                min: self.rand_min,
                max: self.rand_max,
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}
