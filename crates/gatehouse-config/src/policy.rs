//! Validated policy structures

use crate::schema::RawConfig;
use crate::validation::parse_time;
use chrono::Duration;
use gatehouse_util::{canonicalize_target, MonitorKey, WallClock};
use std::path::PathBuf;

/// Sites monitored when the configuration lists none
pub const DEFAULT_SITES: &[&str] = &["instagram.com", "reddit.com", "youtube.com"];
pub const DEFAULT_DAILY_UNLIMITED: u32 = 5;
pub const DEFAULT_COOLDOWN_MINUTES: u32 = 30;

/// Validated policy ready for use by the core engine
#[derive(Debug, Clone)]
pub struct Policy {
    pub service: ServiceConfig,

    /// Canonical monitoring keys
    pub sites: Vec<MonitorKey>,

    pub quota: QuotaPolicy,

    pub cooldowns: CooldownPolicy,
}

impl Policy {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        let mut sites: Vec<MonitorKey> = raw
            .sites
            .iter()
            .filter_map(|site| canonicalize_target(&site.domain).ok())
            .collect();
        if sites.is_empty() {
            sites = default_sites();
        }

        let reset_time = raw
            .quota
            .reset_time
            .as_deref()
            .and_then(|s| parse_time(s).ok())
            .unwrap_or(WallClock::MIDNIGHT);

        Self {
            service: ServiceConfig {
                socket_path: raw.service.socket_path,
                data_dir: raw.service.data_dir,
            },
            sites,
            quota: QuotaPolicy {
                daily_unlimited: raw
                    .quota
                    .daily_unlimited
                    .unwrap_or(DEFAULT_DAILY_UNLIMITED),
                reset_time,
            },
            cooldowns: CooldownPolicy {
                after_duration: minutes(
                    raw.cooldowns
                        .duration_minutes
                        .unwrap_or(DEFAULT_COOLDOWN_MINUTES),
                ),
                after_count: minutes(
                    raw.cooldowns
                        .count_minutes
                        .unwrap_or(DEFAULT_COOLDOWN_MINUTES),
                ),
            },
        }
    }

    pub fn is_monitored(&self, key: &MonitorKey) -> bool {
        self.sites.contains(key)
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            sites: default_sites(),
            quota: QuotaPolicy {
                daily_unlimited: DEFAULT_DAILY_UNLIMITED,
                reset_time: WallClock::MIDNIGHT,
            },
            cooldowns: CooldownPolicy {
                after_duration: minutes(DEFAULT_COOLDOWN_MINUTES),
                after_count: minutes(DEFAULT_COOLDOWN_MINUTES),
            },
        }
    }
}

/// Where the service listens and keeps its state; `None` falls back to the
/// XDG defaults.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub socket_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub daily_unlimited: u32,
    pub reset_time: WallClock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub after_duration: Duration,
    pub after_count: Duration,
}

fn minutes(m: u32) -> Duration {
    Duration::minutes(i64::from(m))
}

fn default_sites() -> Vec<MonitorKey> {
    DEFAULT_SITES.iter().map(|s| MonitorKey::from(*s)).collect()
}
