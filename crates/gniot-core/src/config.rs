use embassy_time::Duration;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

pub const DEFAULT_SAMPLES_PER_MEASURE: u16 = 3;
pub const DEFAULT_MEASURE_PERIOD_SECS: u16 = 60;
pub const DEFAULT_MEASURES_PER_SLEEP: u16 = 1;
pub const DEFAULT_SLEEP_LENGTH_MINUTES: u16 = 3;
pub const DEFAULT_READ_TIMEOUT_MS: u32 = 1000;
pub const DEFAULT_RETRY_DELAY_MS: u32 = 1500;

/// Read-only configuration snapshot handed to every operation that needs it.
///
/// The node never reads configuration from a global; the snapshot is built
/// once at boot and passed down explicitly.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeConfig {
    /// Identifier the server knows this node by
    pub node_id: u32,
    /// Good sensor readings reduced into one measurement
    pub samples_per_measure: u16,
    /// Pause between measurements within one wake period
    pub measure_period_secs: u16,
    /// Measurements taken before going to deep sleep (0 = never sleep)
    pub measures_per_sleep: u16,
    /// Deep-sleep length in minutes
    pub sleep_length_minutes: u16,
    /// Upper bound for a single DHT11 transaction
    pub read_timeout_ms: u32,
    /// Pause after every sensor read (the DHT11 needs >1 s between reads)
    pub retry_delay_ms: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            samples_per_measure: DEFAULT_SAMPLES_PER_MEASURE,
            measure_period_secs: DEFAULT_MEASURE_PERIOD_SECS,
            measures_per_sleep: DEFAULT_MEASURES_PER_SLEEP,
            sleep_length_minutes: DEFAULT_SLEEP_LENGTH_MINUTES,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl NodeConfig {
    pub const fn sleep_seconds(&self) -> u32 {
        self.sleep_length_minutes as u32 * 60
    }

    /// Reads allowed per measurement, failures included.
    pub const fn max_read_attempts(&self) -> u32 {
        self.samples_per_measure as u32 * 2
    }

    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms as u64)
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms as u64)
    }

    pub const fn measure_period(&self) -> Duration {
        Duration::from_secs(self.measure_period_secs as u64)
    }

    /// Whether the measurement loop stops after `taken` measurements.
    pub const fn sleep_due(&self, taken: u32) -> bool {
        self.measures_per_sleep != 0 && taken >= self.measures_per_sleep as u32
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown configuration key")]
    UnknownKey,
    #[error("invalid value for {key}")]
    InvalidValue { key: &'static str },
}

impl NodeConfig {
    /// Field names accepted by [`NodeConfig::set`].
    pub const KEYS: [&'static str; 7] = [
        "node_id",
        "samples_per_measure",
        "measure_period_secs",
        "measures_per_sleep",
        "sleep_length_minutes",
        "read_timeout_ms",
        "retry_delay_ms",
    ];

    /// Override one field from its textual form.
    ///
    /// `key` is a field name, compared ignoring ASCII case so `GNIOT_`-style
    /// variable names work once the prefix is stripped. The config is left
    /// untouched on error.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let key = Self::KEYS
            .into_iter()
            .find(|known| known.eq_ignore_ascii_case(key))
            .ok_or(ConfigError::UnknownKey)?;
        let value = value.trim();

        match key {
            "node_id" => self.node_id = parse(key, value)?,
            "samples_per_measure" => {
                let samples: u16 = parse(key, value)?;
                if samples == 0 {
                    return Err(ConfigError::InvalidValue { key });
                }
                self.samples_per_measure = samples;
            }
            "measure_period_secs" => self.measure_period_secs = parse(key, value)?,
            "measures_per_sleep" => self.measures_per_sleep = parse(key, value)?,
            "sleep_length_minutes" => self.sleep_length_minutes = parse(key, value)?,
            "read_timeout_ms" => self.read_timeout_ms = parse(key, value)?,
            _ => self.retry_delay_ms = parse(key, value)?,
        }

        debug!("config {} = {}", key, value);
        Ok(())
    }
}

fn parse<T: core::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployed_nodes() {
        let config = NodeConfig::default();
        assert_eq!(config.samples_per_measure, 3);
        assert_eq!(config.sleep_seconds(), 180);
        assert_eq!(config.max_read_attempts(), 6);
    }

    #[test]
    fn test_zero_measures_per_sleep_never_sleeps() {
        let config = NodeConfig {
            measures_per_sleep: 0,
            ..NodeConfig::default()
        };
        assert!(!config.sleep_due(10_000));

        let config = NodeConfig {
            measures_per_sleep: 2,
            ..NodeConfig::default()
        };
        assert!(!config.sleep_due(1));
        assert!(config.sleep_due(2));
    }

    #[test]
    fn test_set_parses_named_fields() {
        let mut config = NodeConfig::default();
        config.set("node_id", "17").unwrap();
        config.set("SLEEP_LENGTH_MINUTES", " 10 ").unwrap();

        assert_eq!(config.node_id, 17);
        assert_eq!(config.sleep_seconds(), 600);
    }

    #[test]
    fn test_set_rejects_bad_input() {
        let mut config = NodeConfig::default();

        assert_eq!(config.set("wifi_ssid", "x"), Err(ConfigError::UnknownKey));
        assert_eq!(
            config.set("measure_period_secs", "-5"),
            Err(ConfigError::InvalidValue {
                key: "measure_period_secs"
            })
        );
        assert_eq!(
            config.set("samples_per_measure", "0"),
            Err(ConfigError::InvalidValue {
                key: "samples_per_measure"
            })
        );
        assert_eq!(config, NodeConfig::default());
    }
}
