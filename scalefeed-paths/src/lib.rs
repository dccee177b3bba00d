//! Cross-platform path utilities for Scalefeed.
//!
//! Single source of truth for where the daemon keeps its database,
//! configuration and Unix sockets.
//!
//! # Platform Behavior
//!
//! | Platform | Data Directory | Socket Directory |
//! |----------|----------------|------------------|
//! | Linux    | `~/.local/share/scalefeed` | `$XDG_RUNTIME_DIR` or data dir |
//! | macOS    | `~/Library/Application Support/scalefeed` | Same as data dir |

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

/// Errors specific to path operations.
#[derive(Error, Debug)]
pub enum PathError {
    #[error("Could not determine home directory")]
    NoHomeDirectory,

    #[error("Could not determine data directory")]
    NoDataDirectory,

    #[error("Could not determine config directory")]
    NoConfigDirectory,
}

const APP_NAME: &str = "scalefeed";

/// Control socket (status / latest / publish commands).
const IPC_SOCKET_NAME: &str = "scalefeed.sock";

/// Live feed socket (subscribers).
const LIVE_SOCKET_NAME: &str = "scalefeed_live.sock";

const DATABASE_NAME: &str = "records.db";

const CONFIG_NAME: &str = "config.toml";

/// Create `dir` (and parents) with owner-only permissions if it is missing.
fn ensure_private_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        fs::set_permissions(dir, perms)
            .with_context(|| format!("Failed to set permissions on {}", dir.display()))?;
    }

    Ok(())
}

/// Get the application data directory, creating it (0o700) if needed.
pub fn get_data_dir() -> Result<PathBuf> {
    let base_dir = dirs::data_dir().ok_or(PathError::NoDataDirectory)?;
    let data_dir = base_dir.join(APP_NAME);
    ensure_private_dir(&data_dir)?;
    Ok(data_dir)
}

/// Get the socket directory for the control and live sockets.
///
/// Linux prefers `$XDG_RUNTIME_DIR` and falls back to the data directory.
pub fn get_socket_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Some(runtime_dir) = dirs::runtime_dir() {
            if runtime_dir.exists() {
                return Ok(runtime_dir);
            }
        }
        get_data_dir()
    }

    #[cfg(not(target_os = "linux"))]
    {
        get_data_dir()
    }
}

/// Get the configuration directory.
///
/// Linux uses `~/.config/scalefeed`; other platforms keep config with data.
pub fn get_config_dir() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let config_base = dirs::config_dir().ok_or(PathError::NoConfigDirectory)?;
        let config_dir = config_base.join(APP_NAME);
        ensure_private_dir(&config_dir)?;
        Ok(config_dir)
    }

    #[cfg(not(target_os = "linux"))]
    {
        get_data_dir()
    }
}

/// Default configuration file location.
pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_NAME))
}

/// Path of the control socket.
pub fn get_ipc_socket_path() -> Result<PathBuf> {
    Ok(get_socket_dir()?.join(IPC_SOCKET_NAME))
}

/// Path of the live feed socket.
pub fn get_live_socket_path() -> Result<PathBuf> {
    Ok(get_socket_dir()?.join(LIVE_SOCKET_NAME))
}

/// Database directory: `<data_dir>/db`.
pub fn get_db_dir() -> Result<PathBuf> {
    let db_dir = get_data_dir()?.join("db");
    if !db_dir.exists() {
        fs::create_dir_all(&db_dir).with_context(|| {
            format!("Failed to create database directory: {}", db_dir.display())
        })?;
    }
    Ok(db_dir)
}

/// Default record database file.
pub fn get_database_path() -> Result<PathBuf> {
    Ok(get_db_dir()?.join(DATABASE_NAME))
}

/// Expand a leading `~` to the home directory.
pub fn expand_home<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir().ok_or(PathError::NoHomeDirectory)?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

/// Set secure Unix socket permissions (0o600).
#[cfg(unix)]
pub fn secure_socket_permissions(socket_path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if socket_path.exists() {
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(socket_path, perms).with_context(|| {
            format!("Failed to set socket permissions: {}", socket_path.display())
        })?;
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn secure_socket_permissions(_socket_path: &Path) -> Result<()> {
    Ok(())
}
