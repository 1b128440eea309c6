//! Forwards `VALVE_*` settings from `.env` (or the build environment) to the
//! compiler so `option_env!` can pick them up.

const SETTINGS: [&str; 7] = [
    "VALVE_AP_SSID",
    "VALVE_AP_PASSPHRASE",
    "VALVE_AP_ACCESS_MODE",
    "VALVE_AP_CHANNEL",
    "VALVE_AP_ADDRESS",
    "VALVE_AP_NETMASK",
    "VALVE_HTTP_PORT",
];

fn main() {
    println!("cargo:rerun-if-changed=.env");

    // A missing .env is fine: every setting has a default
    let _ = dotenvy::dotenv();

    for name in SETTINGS {
        println!("cargo:rerun-if-env-changed={name}");
        if let Ok(value) = std::env::var(name) {
            println!("cargo:rustc-env={name}={value}");
        }
    }

    println!("cargo:rustc-link-arg=-Tlinkall.x");
}
