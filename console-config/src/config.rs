use std::collections::HashSet;
use std::time::Duration;

use console_core::error::{ConsoleError, Result};
use console_logging::LogSettings;
use serde::{Deserialize, Serialize};

/// Root of the console configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Datacenter identifiers that `login --dc all` expands to.
    #[serde(default = "default_datacenters")]
    pub datacenters: Vec<String>,

    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub creation: CreationSettings,

    #[serde(default)]
    pub logging: LogSettings,
}

fn default_datacenters() -> Vec<String> {
    (1..=6).map(|n| n.to_string()).collect()
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            datacenters: default_datacenters(),
            dispatch: DispatchSettings::default(),
            creation: CreationSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

/// General operation queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Number of general workers. Defaults to one per known datacenter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_workers: Option<usize>,

    /// How long an idle worker waits on the queue before re-checking for shutdown.
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,

    /// Upper bound on a fan-out join. Unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_timeout_secs: Option<u64>,
}

fn default_queue_poll_interval_ms() -> u64 {
    250
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            operation_workers: None,
            queue_poll_interval_ms: default_queue_poll_interval_ms(),
            join_timeout_secs: None,
        }
    }
}

impl DispatchSettings {
    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        self.join_timeout_secs.map(Duration::from_secs)
    }
}

/// VM creation throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreationSettings {
    #[serde(default = "default_creation_workers")]
    pub workers: usize,

    /// Creations allowed in flight across all datacenters.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default)]
    pub job_poll: JobPollSettings,
}

fn default_creation_workers() -> usize {
    3
}

fn default_max_concurrent() -> usize {
    3
}

impl Default for CreationSettings {
    fn default() -> Self {
        Self {
            workers: default_creation_workers(),
            max_concurrent: default_max_concurrent(),
            job_poll: JobPollSettings::default(),
        }
    }
}

/// Backoff used while waiting for a remote job to finish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPollSettings {
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: u32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_initial_interval_ms() -> u64 {
    2_000
}

fn default_max_interval_ms() -> u64 {
    30_000
}

fn default_multiplier() -> u32 {
    2
}

// Remote creation can take up to 15 minutes.
fn default_timeout_secs() -> u64 {
    1_200
}

impl Default for JobPollSettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl JobPollSettings {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ConsoleConfig {
    /// Effective number of general workers.
    pub fn operation_workers(&self) -> usize {
        self.dispatch
            .operation_workers
            .unwrap_or(self.datacenters.len())
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.datacenters.is_empty() {
            return Err(ConsoleError::Config(
                "at least one datacenter must be listed".into(),
            ));
        }
        let mut seen = HashSet::new();
        for dc in &self.datacenters {
            if dc.trim().is_empty() {
                return Err(ConsoleError::Config("datacenter ids cannot be blank".into()));
            }
            if !seen.insert(dc.as_str()) {
                return Err(ConsoleError::Config(format!(
                    "datacenter '{}' is listed twice",
                    dc
                )));
            }
        }

        if self.dispatch.operation_workers == Some(0) {
            return Err(ConsoleError::Config(
                "dispatch.operation_workers must be at least 1".into(),
            ));
        }
        if self.dispatch.queue_poll_interval_ms == 0 {
            return Err(ConsoleError::Config(
                "dispatch.queue_poll_interval_ms must be positive".into(),
            ));
        }
        if self.creation.workers == 0 {
            return Err(ConsoleError::Config(
                "creation.workers must be at least 1".into(),
            ));
        }
        if self.creation.max_concurrent == 0 {
            return Err(ConsoleError::Config(
                "creation.max_concurrent must be at least 1".into(),
            ));
        }

        let poll = &self.creation.job_poll;
        if poll.initial_interval_ms == 0 || poll.max_interval_ms == 0 {
            return Err(ConsoleError::Config(
                "creation.job_poll intervals must be positive".into(),
            ));
        }
        if poll.initial_interval_ms > poll.max_interval_ms {
            return Err(ConsoleError::Config(
                "creation.job_poll.initial_interval_ms exceeds max_interval_ms".into(),
            ));
        }
        if poll.multiplier == 0 {
            return Err(ConsoleError::Config(
                "creation.job_poll.multiplier must be at least 1".into(),
            ));
        }
        if poll.timeout_secs == 0 {
            return Err(ConsoleError::Config(
                "creation.job_poll.timeout_secs must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_six_datacenter_deployment() {
        let config = ConsoleConfig::default();
        assert_eq!(config.datacenters.len(), 6);
        assert_eq!(config.operation_workers(), 6);
        assert_eq!(config.creation.workers, 3);
        assert_eq!(config.creation.max_concurrent, 3);
        assert!(config.dispatch.join_timeout().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn explicit_worker_count_wins() {
        let mut config = ConsoleConfig::default();
        config.dispatch.operation_workers = Some(2);
        assert_eq!(config.operation_workers(), 2);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = r#"
datacenters: ["it1", "de1"]
creation:
  max_concurrent: 5
"#;
        let config: ConsoleConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.datacenters, vec!["it1", "de1"]);
        assert_eq!(config.operation_workers(), 2);
        assert_eq!(config.creation.max_concurrent, 5);
        assert_eq!(config.creation.workers, 3);
        assert_eq!(config.creation.job_poll, JobPollSettings::default());
    }

    #[test]
    fn rejects_duplicate_datacenters() {
        let config = ConsoleConfig {
            datacenters: vec!["1".into(), "1".into()],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn rejects_zero_permits() {
        let mut config = ConsoleConfig::default();
        config.creation.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_poll_intervals() {
        let mut config = ConsoleConfig::default();
        config.creation.job_poll.initial_interval_ms = 60_000;
        assert!(config.validate().is_err());
    }
}
