//! Initialize the configuration directory: create ~/.oncochat and a default config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;

/// Ensure the configuration directory has been initialized (config file exists).
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `oncochat init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Create the config directory and default config if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with every default spelled out if missing, so it is easy to edit.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        let default_config = serde_json::to_string_pretty(&config::Config::default())
            .context("serializing default config")?;
        std::fs::write(config_path, default_config)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    } else {
        log::debug!("config already exists at {}, skipping", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_loadable_default_config_once() {
        let dir = std::env::temp_dir().join(format!("oncochat-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        assert!(require_initialized(&path).is_err());

        let created = init_config_dir(&path).unwrap();
        assert_eq!(created, dir);
        require_initialized(&path).unwrap();
        let (config, _) = config::load_config(Some(path.clone())).unwrap();
        assert_eq!(config.session.timeout_minutes, 60);

        std::fs::write(&path, r#"{"gateway":{"port":9999}}"#).unwrap();
        init_config_dir(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("9999"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
