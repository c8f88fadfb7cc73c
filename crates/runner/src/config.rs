//! Cluster configuration

use crate::error::{Result, RunnerError};
use infini_coordinator::CoordinatorConfig;
use infini_deadlock::DeadlockConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of partitions (default: 4)
    pub partitions: u32,
    pub deadlock: DeadlockConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            deadlock: DeadlockConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_deadlock(mut self, deadlock: DeadlockConfig) -> Self {
        self.deadlock = deadlock;
        self
    }

    pub fn with_coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RunnerError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(RunnerError::Config("at least one partition is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_json_overrides_defaults() {
        let config = ClusterConfig::from_json_str(
            r#"{"partitions": 8, "deadlock": {"sweep_interval_ms": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.partitions, 8);
        assert_eq!(config.deadlock.sweep_interval(), Duration::from_millis(10));
        assert_eq!(config.coordinator, CoordinatorConfig::default());

        assert_eq!(ClusterConfig::from_json_str("{}").unwrap(), ClusterConfig::default());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            ClusterConfig::from_json_str(r#"{"partitions": 0}"#),
            Err(RunnerError::Config(_))
        ));
        assert!(matches!(
            ClusterConfig::from_json_str("partitions = 2"),
            Err(RunnerError::Serialization(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = ClusterConfig::default()
            .with_partitions(2)
            .with_deadlock(DeadlockConfig::default().with_sweep_interval(Duration::from_millis(5)))
            .with_coordinator(CoordinatorConfig::default().with_request_timeout(Duration::from_secs(1)));
        assert_eq!(config.partitions, 2);
        assert_eq!(config.deadlock.sweep_interval_ms, 5);
        assert_eq!(config.coordinator.request_timeout(), Some(Duration::from_secs(1)));
    }
}
