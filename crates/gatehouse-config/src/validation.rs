//! Configuration validation

use crate::schema::RawConfig;
use gatehouse_util::{canonicalize_target, WallClock};
use std::collections::HashSet;
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Invalid site '{value}': {message}")]
    InvalidSite { value: String, message: String },

    #[error("Duplicate site: {0}")]
    DuplicateSite(String),

    #[error("Invalid time format '{value}': {message}")]
    InvalidTimeFormat { value: String, message: String },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for site in &config.sites {
        match canonicalize_target(&site.domain) {
            Ok(key) => {
                if !seen.insert(key.clone()) {
                    errors.push(ValidationError::DuplicateSite(key.to_string()));
                }
            }
            Err(e) => errors.push(ValidationError::InvalidSite {
                value: site.domain.clone(),
                message: e.to_string(),
            }),
        }
    }

    if let Some(reset) = &config.quota.reset_time {
        if let Err(message) = parse_time(reset) {
            errors.push(ValidationError::InvalidTimeFormat {
                value: reset.clone(),
                message,
            });
        }
    }

    if config.cooldowns.duration_minutes == Some(0) {
        errors.push(ValidationError::NotPositive {
            field: "cooldowns.duration_minutes",
        });
    }
    if config.cooldowns.count_minutes == Some(0) {
        errors.push(ValidationError::NotPositive {
            field: "cooldowns.count_minutes",
        });
    }

    errors
}

/// Parse HH:MM time format
pub fn parse_time(s: &str) -> Result<WallClock, String> {
    WallClock::parse(s).ok_or_else(|| "Expected HH:MM with hour 0-23 and minute 00-59".to_string())
}
