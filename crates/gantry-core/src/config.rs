//! Worker configuration.
//!
//! One explicit struct handed to construction. Invalid values are fatal at
//! start, never papered over at runtime.

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity the heartbeat advertises to the store. Defaults to a
    /// process-unique name so two unconfigured workers never collide.
    pub machine_name: String,
    /// Maximum number of in-flight jobs.
    pub parallelism: usize,
    /// Sleep between polls when the store has no ready job.
    pub polling_frequency: std::time::Duration,
    /// Gap between worker heartbeats.
    pub heartbeat_frequency: std::time::Duration,
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn machine_name(mut self, machine_name: impl Into<String>) -> Self {
        self.machine_name = machine_name.into();
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn polling_frequency(mut self, polling_frequency: std::time::Duration) -> Self {
        self.polling_frequency = polling_frequency;
        self
    }

    pub fn heartbeat_frequency(mut self, heartbeat_frequency: std::time::Duration) -> Self {
        self.heartbeat_frequency = heartbeat_frequency;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::Parallelism);
        }
        if self.polling_frequency.is_zero() {
            return Err(ConfigError::PollingFrequency);
        }
        if self.heartbeat_frequency.is_zero() {
            return Err(ConfigError::HeartbeatFrequency);
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            machine_name: format!("worker-{}", uuid::Uuid::new_v4()),
            parallelism: 4,
            polling_frequency: std::time::Duration::from_secs(1),
            heartbeat_frequency: std::time::Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    Parallelism,
    PollingFrequency,
    HeartbeatFrequency,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parallelism => f.write_str("parallelism must be at least 1"),
            ConfigError::PollingFrequency => f.write_str("polling frequency must be greater than zero"),
            ConfigError::HeartbeatFrequency => {
                f.write_str("heartbeat frequency must be greater than zero")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
