//! Config validation CLI tool
//!
//! Validates a gatehoused configuration file and reports any errors.

use gatehouse_config::{ConfigError, CURRENT_CONFIG_VERSION};
use gatehouse_util::{default_config_path, default_data_dir, default_socket_path};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a gatehoused configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match gatehouse_config::load_config(&config_path) {
        Ok(policy) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", CURRENT_CONFIG_VERSION);
            println!(
                "  Unlimited sessions per day: {} (resets at {})",
                policy.quota.daily_unlimited, policy.quota.reset_time
            );
            println!(
                "  Cooldowns: {} min after duration, {} min after count",
                policy.cooldowns.after_duration.num_minutes(),
                policy.cooldowns.after_count.num_minutes()
            );
            match &policy.service.socket_path {
                Some(path) => println!("  Socket: {}", path.display()),
                None => println!("  Socket: {} (default)", default_socket_path().display()),
            }
            match &policy.service.data_dir {
                Some(path) => println!("  Data directory: {}", path.display()),
                None => println!("  Data directory: {} (default)", default_data_dir().display()),
            }
            println!();
            println!("Monitored sites:");
            for site in &policy.sites {
                println!("  - {}", site);
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver, CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
