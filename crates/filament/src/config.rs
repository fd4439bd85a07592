use {
    crate::ConfigError,
    filament_core::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE, TIME_RESOLUTION},
    std::{env, str::FromStr, thread, time::Duration},
    tracing::debug,
};

const ENV_MANAGERS: &str = "FILAMENT_MANAGERS";
const ENV_STACK_SIZE: &str = "FILAMENT_STACK_SIZE";
const ENV_TIME_RESOLUTION_MS: &str = "FILAMENT_TIME_RESOLUTION_MS";

/// Runtime settings.
///
/// ```
/// use {filament::Config, std::time::Duration};
///
/// let config = Config::default()
///     .managers(2)
///     .stack_size(64 * 1024)
///     .time_resolution(Duration::from_millis(1));
/// assert_eq!(config.manager_count(), 2);
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(default)
)]
pub struct Config {
    managers: usize,
    stack_size: usize,
    time_resolution: Duration,
    pool_capacity: usize,
    thread_name: String,
}

impl Config {
    /// Number of manager threads. `0` means one per available CPU.
    pub fn managers(mut self, managers: usize) -> Self {
        self.managers = managers;
        self
    }

    /// Stack size for fibers spawned without an explicit size. Values below
    /// [`MIN_STACK_SIZE`](filament_core::MIN_STACK_SIZE) are raised to it.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size.max(MIN_STACK_SIZE);
        self
    }

    /// Upper bound on how long an idle manager blocks waiting for events.
    pub fn time_resolution(mut self, time_resolution: Duration) -> Self {
        self.time_resolution = time_resolution;
        self
    }

    /// Number of finished fiber objects kept for reuse.
    pub fn pool_capacity(mut self, pool_capacity: usize) -> Self {
        self.pool_capacity = pool_capacity;
        self
    }

    /// Prefix for manager thread names.
    pub fn thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    pub fn manager_count(&self) -> usize {
        match self.managers {
            0 => thread::available_parallelism().map_or(1, |n| n.get()),
            n => n,
        }
    }

    pub fn default_stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn idle_timeout(&self) -> Duration {
        self.time_resolution
    }

    pub fn pool_size(&self) -> usize {
        self.pool_capacity
    }

    pub fn name_prefix(&self) -> &str {
        &self.thread_name
    }

    /// Defaults overridden by `FILAMENT_MANAGERS`, `FILAMENT_STACK_SIZE` and
    /// `FILAMENT_TIME_RESOLUTION_MS` when they are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(managers) = parse_var(ENV_MANAGERS)? {
            config = config.managers(managers);
        }
        if let Some(stack_size) = parse_var(ENV_STACK_SIZE)? {
            config = config.stack_size(stack_size);
        }
        if let Some(ms) = parse_var(ENV_TIME_RESOLUTION_MS)? {
            config = config.time_resolution(Duration::from_millis(ms));
        }
        debug!(?config, "Loaded configuration from the environment.");
        Ok(config)
    }

    #[cfg(feature = "serde_json")]
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            managers: 0,
            stack_size: DEFAULT_STACK_SIZE,
            time_resolution: TIME_RESOLUTION,
            pool_capacity: 256,
            thread_name: "filament-manager".into(),
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::default()
            .managers(3)
            .stack_size(10)
            .pool_capacity(0)
            .thread_name("worker");
        assert_eq!(config.manager_count(), 3);
        assert_eq!(config.default_stack_size(), MIN_STACK_SIZE);
        assert_eq!(config.pool_size(), 0);
        assert_eq!(config.name_prefix(), "worker");
        assert_eq!(config.idle_timeout(), TIME_RESOLUTION);
    }

    #[test]
    fn zero_managers_means_one_per_cpu() {
        assert!(Config::default().manager_count() >= 1);
    }

    #[test]
    fn env_values_are_validated() {
        // The only test touching this variable, so no other test observes it.
        env::set_var(ENV_TIME_RESOLUTION_MS, "not a number");
        let err = Config::from_env().unwrap_err();
        env::remove_var(ENV_TIME_RESOLUTION_MS);
        assert!(matches!(
            err,
            ConfigError::Invalid { var: ENV_TIME_RESOLUTION_MS, .. }
        ));
    }

    #[cfg(feature = "serde_json")]
    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = Config::from_json(r#"{"managers": 2}"#).unwrap();
        assert_eq!(config, Config::default().managers(2));
    }
}
