//! Coordinator tuning knobs

use crate::error::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for a [`Coordinator`](crate::Coordinator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Largest frame accepted from or written to a peer, in bytes
    pub max_frame_size: usize,
    /// How long a single frame write may take before the peer is dropped
    pub write_timeout_ms: u64,
    /// How long a new registration waits for the session it replaces to close
    pub supersede_timeout_ms: u64,
}

impl CoordinatorConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn supersede_timeout(&self) -> Duration {
        Duration::from_millis(self.supersede_timeout_ms)
    }

    /// Check the configuration for values the coordinator cannot run with
    pub fn validate(&self) -> Result<(), CoordinatorError> {
        if self.max_frame_size == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "max_frame_size must be greater than zero".to_string(),
            ));
        }
        if self.max_frame_size > meshcoord_proto::MAX_FRAME_SIZE {
            return Err(CoordinatorError::InvalidConfig(format!(
                "max_frame_size {} exceeds protocol limit {}",
                self.max_frame_size,
                meshcoord_proto::MAX_FRAME_SIZE
            )));
        }
        if self.write_timeout_ms == 0 {
            return Err(CoordinatorError::InvalidConfig(
                "write_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 4 * 1024 * 1024,
            write_timeout_ms: 10_000,
            supersede_timeout_ms: 5_000,
        }
    }
}
