//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    #[serde(default)]
    pub service: RawServiceConfig,

    /// Monitored destinations. Empty means the built-in defaults.
    #[serde(default)]
    pub sites: Vec<RawSite>,

    #[serde(default)]
    pub quota: RawQuota,

    #[serde(default)]
    pub cooldowns: RawCooldowns,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    pub socket_path: Option<PathBuf>,

    /// Directory holding the state database
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawSite {
    /// Domain or URL; canonicalized the same way access targets are
    pub domain: String,
}

/// Daily unlimited-session quota
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawQuota {
    /// Unlimited sessions (or bypasses) per cycle, default 5
    pub daily_unlimited: Option<u32>,

    /// Cycle boundary as HH:MM local time, default 00:00
    pub reset_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawCooldowns {
    /// Cooldown after a duration session, default 30
    pub duration_minutes: Option<u32>,

    /// Cooldown after a count session reaches its target, default 30
    pub count_minutes: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_schema() {
        let toml_str = r#"
            config_version = 1

            [service]
            data_dir = "/tmp/gatehoused"

            [[sites]]
            domain = "youtube.com"

            [[sites]]
            domain = "https://www.reddit.com/"

            [quota]
            daily_unlimited = 3
            reset_time = "04:30"

            [cooldowns]
            duration_minutes = 45
        "#;

        let config: RawConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.sites.len(), 2);
        assert_eq!(config.sites[1].domain, "https://www.reddit.com/");
        assert_eq!(config.quota.daily_unlimited, Some(3));
        assert_eq!(config.quota.reset_time.as_deref(), Some("04:30"));
        assert_eq!(config.cooldowns.duration_minutes, Some(45));
        assert_eq!(config.cooldowns.count_minutes, None);
        assert!(config.service.socket_path.is_none());
    }

    #[test]
    fn sections_are_optional() {
        let config: RawConfig = toml::from_str("config_version = 1").unwrap();
        assert!(config.sites.is_empty());
        assert!(config.quota.daily_unlimited.is_none());
    }
}
