//! Path resolution for converge
//!
//! # Environment Variables
//!
//! - `CONVERGE_CONFIG_DIR` - Override config directory
//! - `CONVERGE_STATE_DIR` - Override state directory (lease files)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `CONVERGE_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/converge` (if set)
//! 3. `~/.config/converge`
//!
//! For state_dir():
//! 1. `CONVERGE_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/converge` (if set)
//! 3. `~/.local/state/converge`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "CONVERGE_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "CONVERGE_STATE_DIR";

const APP_DIR: &str = "converge";

/// Get the converge config directory path
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return Ok(path);
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join(APP_DIR);
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".config").join(APP_DIR);
    log::debug!("Using default config dir: {}", path.display());
    Ok(path)
}

/// Get the converge state directory path
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join(APP_DIR);
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return Ok(path);
    }

    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = home.join(".local").join("state").join(APP_DIR);
    log::debug!("Using default state dir: {}", path.display());
    Ok(path)
}

/// Path of the main config file
pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

/// Directory holding per-instance lease files
pub fn lease_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join("leases"))
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Run `f` with `key` set to `value`, restoring the previous value after.
    ///
    /// Each test touches its own variable, so parallel tests do not race.
    fn with_env_var<F, R>(key: &str, value: &str, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let original = env::var(key).ok();
        // SAFETY: no other test reads or writes this variable
        unsafe { env::set_var(key, value) };
        let result = f();
        match original {
            // SAFETY: as above
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
        result
    }

    #[test]
    fn test_config_dir_env_override() {
        with_env_var(ENV_CONFIG_DIR, "/custom/config/path", || {
            let result = config_dir().unwrap();
            assert_eq!(result, PathBuf::from("/custom/config/path"));
            assert_eq!(
                config_file().unwrap(),
                PathBuf::from("/custom/config/path/config.toml")
            );
        });
    }

    #[test]
    fn test_state_dir_env_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        with_env_var(ENV_STATE_DIR, "~/converge-state-test", || {
            assert_eq!(state_dir().unwrap(), home.join("converge-state-test"));
            assert_eq!(
                lease_dir().unwrap(),
                home.join("converge-state-test").join("leases")
            );
        });
    }

    #[test]
    fn test_expand_with_tilde() {
        let result = expand("~/keys/id_ed25519");
        let home = dirs::home_dir().unwrap();
        assert_eq!(result, home.join("keys").join("id_ed25519"));
    }

    #[test]
    fn test_expand_absolute() {
        assert_eq!(expand("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_with_env_var() {
        with_env_var("CONVERGE_TEST_VAR", "test_value", || {
            let result = expand("/path/$CONVERGE_TEST_VAR/file");
            assert_eq!(result, PathBuf::from("/path/test_value/file"));
        });
    }

    #[test]
    fn test_expand_unknown_env_var_unchanged() {
        let result = expand("/path/$NONEXISTENT_VAR_12345/file");
        assert_eq!(result, PathBuf::from("/path/$NONEXISTENT_VAR_12345/file"));
    }
}
