//! Configuration loading from `~/.mirror/config.toml` with defaults.

use crate::cli::Cli;
use mirror_types::config::{default_config_path, MirrorConfig};
use std::path::Path;
use tracing::{info, warn};

/// Load configuration from disk, falling back to defaults.
pub fn load_config(path: Option<&Path>) -> MirrorConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return MirrorConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match MirrorConfig::from_toml(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                MirrorConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            MirrorConfig::default()
        }
    }
}

/// Command-line flags win over the file.
pub fn apply_overrides(config: &mut MirrorConfig, cli: &Cli) {
    if let Some(addr) = cli.listen {
        config.listen_addr = addr;
    }
    if let Some(dir) = &cli.dir {
        config.root_dir = dir.clone();
    }
    if let Some(password) = &cli.password {
        config.password = password.clone();
    }
}
