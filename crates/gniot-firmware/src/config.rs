//! Node configuration baked in at build time
//!
//! `build.rs` forwards `GNIOT_*` variables from the environment or a `.env`
//! file. Unset variables keep their defaults; unparsable ones are reported and
//! ignored.

use gniot_core::config::NodeConfig;
use log::{info, warn};

const BUILD_VARS: [(&str, Option<&str>); 7] = [
    ("node_id", option_env!("GNIOT_NODE_ID")),
    ("samples_per_measure", option_env!("GNIOT_SAMPLES_PER_MEASURE")),
    ("measure_period_secs", option_env!("GNIOT_MEASURE_PERIOD_SECS")),
    ("measures_per_sleep", option_env!("GNIOT_MEASURES_PER_SLEEP")),
    ("sleep_length_minutes", option_env!("GNIOT_SLEEP_LENGTH_MINUTES")),
    ("read_timeout_ms", option_env!("GNIOT_READ_TIMEOUT_MS")),
    ("retry_delay_ms", option_env!("GNIOT_RETRY_DELAY_MS")),
];

pub fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();

    for (key, value) in BUILD_VARS {
        let Some(value) = value else {
            continue;
        };
        if let Err(e) = config.set(key, value) {
            warn!("ignoring GNIOT_{} = {:?}: {}", key, value, e);
        }
    }

    info!(
        "node {}: {} samples/measure, {} measures every {} s, sleep {} min",
        config.node_id,
        config.samples_per_measure,
        config.measures_per_sleep,
        config.measure_period_secs,
        config.sleep_length_minutes
    );
    config
}
