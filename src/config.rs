use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{RegistryError, RegistryResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default)]
    pub ticker: TickerConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_ticks_per_second")]
    pub ticks_per_second: u32,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            ticks_per_second: default_ticks_per_second(),
        }
    }
}

impl TickerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.ticks_per_second.max(1)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// An agent or client not pinged for longer than this is declared dead.
    #[serde(default = "default_alive_timeout", with = "duration_ms")]
    pub alive_timeout: Duration,

    /// How long a container may stay without clients before it is terminated.
    #[serde(default = "default_unused_container_timeout", with = "duration_ms")]
    pub unused_container_timeout: Duration,

    /// Recommended heartbeat cadence for agents and clients.
    #[serde(default = "default_ping_interval", with = "duration_ms")]
    pub ping_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            alive_timeout: default_alive_timeout(),
            unused_container_timeout: default_unused_container_timeout(),
            ping_interval: default_ping_interval(),
        }
    }
}

impl RegistryConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> RegistryResult<Self> {
        let config: Self = from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if self.ticker.ticks_per_second == 0 {
            return Err(RegistryError::Config(
                "ticks_per_second must be greater than 0".to_string(),
            ));
        }
        if self.timeouts.alive_timeout.is_zero() {
            return Err(RegistryError::Config(
                "alive_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> RegistryResult<T> {
    let file = File::open(path)
        .map_err(|e| RegistryError::Config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| RegistryError::Config(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> RegistryResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| RegistryError::Config(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

fn default_true() -> bool {
    true
}
fn default_ticks_per_second() -> u32 {
    10
}
fn default_alive_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_unused_container_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_ping_interval() -> Duration {
    Duration::from_secs(1)
}

// Duration is written as plain milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
