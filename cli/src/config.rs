use serde::Deserialize;
use toml::de;
use std::{
    fs, io,
    path::{Path, PathBuf},
};

use relay_lsp::LspConfig;

#[derive(Debug, Default, Deserialize)]
pub struct RelayConfig {
    /// Workspace root used when no root marker is found. Defaults to the
    /// current directory.
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub lsp: LspConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: de::Error,
    },
}

impl RelayConfig {
    /// Load from `explicit`, or from the default location when `None`.
    ///
    /// A missing default file is `Ok(None)`; a missing explicit file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Option<Self>, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match config_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(None),
            },
        };

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(Some(config))
    }
}

/// `~/.relay/config.toml`
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".relay").join("config.toml"))
}
