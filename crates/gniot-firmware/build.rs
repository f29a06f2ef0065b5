//! Forwards node configuration from the environment (or a `.env` file) into
//! the firmware at build time.

const FORWARDED_VARS: [&str; 7] = [
    "GNIOT_NODE_ID",
    "GNIOT_SAMPLES_PER_MEASURE",
    "GNIOT_MEASURE_PERIOD_SECS",
    "GNIOT_MEASURES_PER_SLEEP",
    "GNIOT_SLEEP_LENGTH_MINUTES",
    "GNIOT_READ_TIMEOUT_MS",
    "GNIOT_RETRY_DELAY_MS",
];

fn main() {
    println!("cargo:rustc-link-arg=-Tlinkall.x");

    // A missing .env is fine, defaults apply
    match dotenvy::dotenv() {
        Ok(path) => println!("cargo:rerun-if-changed={}", path.display()),
        Err(_) => println!("cargo:rerun-if-changed=.env"),
    }

    for var in FORWARDED_VARS {
        println!("cargo:rerun-if-env-changed={var}");
        if let Ok(value) = std::env::var(var) {
            println!("cargo:rustc-env={var}={value}");
        }
    }
}
