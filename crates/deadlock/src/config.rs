//! Deadlock manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Period of the full sweep over every waiting transaction (default: 50ms)
    pub sweep_interval_ms: u64,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 50,
        }
    }
}

impl DeadlockConfig {
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        // a zero period would make tokio's interval panic
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
