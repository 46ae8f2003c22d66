//! Default paths for gatehoused
//!
//! Everything lives under user-writable locations:
//! - Socket: `$XDG_RUNTIME_DIR/gatehoused/gatehoused.sock` or `/tmp/gatehoused-$USER/gatehoused.sock`
//! - Data: `$XDG_DATA_HOME/gatehoused` or `~/.local/share/gatehoused`
//! - Config: `$XDG_CONFIG_HOME/gatehouse/config.toml` or `~/.config/gatehouse/config.toml`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const GATEHOUSE_SOCKET_ENV: &str = "GATEHOUSE_SOCKET";

/// Environment variable for overriding the data directory
pub const GATEHOUSE_DATA_DIR_ENV: &str = "GATEHOUSE_DATA_DIR";

const SOCKET_FILENAME: &str = "gatehoused.sock";
const DATABASE_FILENAME: &str = "gatehoused.db";
const APP_DIR: &str = "gatehoused";
const CONFIG_APP_DIR: &str = "gatehouse";
const CONFIG_FILENAME: &str = "config.toml";

fn home_subdir(parts: &[&str]) -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(parts.iter().fold(PathBuf::from(home), |path, part| path.join(part)))
}

/// Get the default socket path.
///
/// `$GATEHOUSE_SOCKET` wins, then `$XDG_RUNTIME_DIR`, then a per-user
/// directory under `/tmp`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(GATEHOUSE_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Socket path ignoring `$GATEHOUSE_SOCKET`, for config defaults where clap
/// reads the variable itself.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default data directory (`$GATEHOUSE_DATA_DIR`, then XDG).
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(GATEHOUSE_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    home_subdir(&[".local", "share", APP_DIR])
        .unwrap_or_else(|| PathBuf::from("/tmp").join(APP_DIR).join("data"))
}

/// SQLite database file inside a data directory
pub fn database_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(DATABASE_FILENAME)
}

/// Get the default configuration file path.
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home)
            .join(CONFIG_APP_DIR)
            .join(CONFIG_FILENAME);
    }

    home_subdir(&[".config", CONFIG_APP_DIR, CONFIG_FILENAME])
        .unwrap_or_else(|| PathBuf::from("/etc").join(CONFIG_APP_DIR).join(CONFIG_FILENAME))
}
