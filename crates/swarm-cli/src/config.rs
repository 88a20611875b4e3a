//! Config file location and load/save helpers: a swarm config lives at
//! `$XDG_CONFIG_HOME/swarm/config.toml` (or `~/.config/swarm/config.toml`),
//! resolved the same way the rest of this stack resolves dotfiles.

use std::path::PathBuf;

use anyhow::{Context, Result};
use swarm_core::SwarmConfig;

pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("swarm");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config").join("swarm")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load the config file if present, falling back to defaults otherwise.
pub fn load_or_default() -> Result<SwarmConfig> {
    let path = config_path();
    if !path.exists() {
        return Ok(SwarmConfig::default());
    }
    let raw = std::fs::read_to_string(&path).with_context(|| format!("failed to read config at {}", path.display()))?;
    SwarmConfig::from_toml(&raw).with_context(|| format!("failed to parse config at {}", path.display()))
}

/// Write the default config to disk, creating parent directories as
/// needed. Refuses to overwrite an existing file unless `force` is set.
pub fn write_default(force: bool) -> Result<PathBuf> {
    let path = config_path();
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}; use --force to overwrite", path.display());
    }
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let contents = toml::to_string_pretty(&SwarmConfig::default()).context("failed to serialize default config")?;
    std::fs::write(&path, contents).with_context(|| format!("failed to write config at {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn default_config_serializes_and_parses_back() {
        let toml = toml::to_string_pretty(&SwarmConfig::default()).unwrap();
        let parsed = SwarmConfig::from_toml(&toml).unwrap();
        assert_eq!(parsed.max_tokens, SwarmConfig::default().max_tokens);
    }

    #[test]
    fn write_then_load_round_trips() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        let path = write_default(false).unwrap();
        assert!(path.exists());
        let loaded = load_or_default().unwrap();
        assert_eq!(loaded.max_tokens, SwarmConfig::default().max_tokens);

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
    }

    #[test]
    fn write_default_refuses_overwrite_without_force() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };

        write_default(false).unwrap();
        let result = write_default(false);

        unsafe { std::env::remove_var("XDG_CONFIG_HOME") };
        assert!(result.is_err());
    }
}
