//! Configuration file handling for the profile daemon.

use crate::state_machine::ProfileConfig;
use crate::Profile;
use log::LevelFilter;
use serde_json::Value;
use std::time::Duration;

/// File storing the log level and per-profile connection tuning.
const PROFILE_CONF: &str = "/var/lib/bluetooth/btprofiled.json";

pub fn read_config() -> std::io::Result<String> {
    std::fs::read_to_string(PROFILE_CONF)
}

/// Log level from the config file; absent or malformed entries leave the
/// command line default in effect.
pub fn get_log_level() -> Option<LevelFilter> {
    get_log_level_internal(read_config().ok()?)
}

fn get_log_level_internal(config: String) -> Option<LevelFilter> {
    serde_json::from_str::<Value>(config.as_str())
        .ok()?
        .get("log_level")?
        .as_str()?
        .parse::<LevelFilter>()
        .ok()
}

/// Connection parameters for `profile`, falling back to the defaults for
/// anything missing.
pub fn get_profile_config(profile: Profile) -> ProfileConfig {
    match read_config() {
        Ok(config) => get_profile_config_internal(config, profile),
        Err(_) => ProfileConfig::default(),
    }
}

fn get_profile_config_internal(config: String, profile: Profile) -> ProfileConfig {
    let mut result = ProfileConfig::default();

    let parsed = match serde_json::from_str::<Value>(config.as_str()) {
        Ok(v) => v,
        Err(_) => return result,
    };
    let section = match parsed.get(profile.name()) {
        Some(s) => s,
        None => return result,
    };

    if let Some(ms) = section.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
        result.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = section.get("disconnect_timeout_ms").and_then(|v| v.as_u64()) {
        result.disconnect_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = section.get("max_connections").and_then(|v| v.as_u64()) {
        result.max_connections = n as usize;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level() {
        assert_eq!(
            get_log_level_internal("{\"log_level\": \"debug\"}".to_string()),
            Some(LevelFilter::Debug)
        );
        assert_eq!(
            get_log_level_internal("{\"log_level\": \"verbose\"}".to_string()),
            None
        );
        assert_eq!(get_log_level_internal("{}".to_string()), None);
        assert_eq!(get_log_level_internal("not json".to_string()), None);
    }

    #[test]
    fn parse_profile_section() {
        let config = "{
            \"pbap_client\": {
                \"connect_timeout_ms\": 4000,
                \"disconnect_timeout_ms\": 1500,
                \"max_connections\": 2
            }
        }";

        let parsed = get_profile_config_internal(config.to_string(), Profile::PbapClient);
        assert_eq!(parsed.connect_timeout, Duration::from_millis(4000));
        assert_eq!(parsed.disconnect_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.max_connections, 2);

        // Sections for other profiles do not apply.
        let other = get_profile_config_internal(config.to_string(), Profile::A2dpSink);
        let defaults = ProfileConfig::default();
        assert_eq!(other.connect_timeout, defaults.connect_timeout);
        assert_eq!(other.disconnect_timeout, defaults.disconnect_timeout);
        assert_eq!(other.max_connections, defaults.max_connections);
    }

    #[test]
    fn partial_profile_section_keeps_defaults() {
        let config = "{\"pbap_client\": {\"connect_timeout_ms\": 2500}}";

        let parsed = get_profile_config_internal(config.to_string(), Profile::PbapClient);
        assert_eq!(parsed.connect_timeout, Duration::from_millis(2500));
        assert_eq!(parsed.disconnect_timeout, ProfileConfig::default().disconnect_timeout);
        assert_eq!(parsed.max_connections, ProfileConfig::default().max_connections);
    }

    #[test]
    fn malformed_config_keeps_defaults() {
        let parsed = get_profile_config_internal("not json".to_string(), Profile::PbapClient);
        assert_eq!(parsed.connect_timeout, ProfileConfig::default().connect_timeout);
    }
}
