use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::channels::ChannelRegistry;
use crate::decay::DecayParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub decay: DecayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_dims")]
    pub dims: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            dims: default_dims(),
        }
    }
}

fn default_alpha() -> f64 {
    0.15
}
fn default_dims() -> usize {
    384
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ChannelsConfig {
    /// Channels used when a call names none; all registered when unset.
    #[serde(default)]
    pub enabled: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DecayConfig {
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_half_life_days() -> f64 {
    45.0
}
fn default_interval_secs() -> u64 {
    3600
}

impl Config {
    pub fn decay_params(&self) -> DecayParams {
        DecayParams {
            alpha: self.graph.alpha,
            half_life_days: self.decay.half_life_days,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate graph
    if config.graph.alpha.is_nan() || config.graph.alpha <= 0.0 {
        anyhow::bail!("graph.alpha must be > 0");
    }
    if config.graph.dims == 0 {
        anyhow::bail!("graph.dims must be > 0");
    }

    // Validate decay
    if config.decay.half_life_days.is_nan() || config.decay.half_life_days <= 0.0 {
        anyhow::bail!("decay.half_life_days must be > 0");
    }
    if config.decay.interval_secs == 0 {
        anyhow::bail!("decay.interval_secs must be > 0");
    }

    // Validate channels
    if let Some(enabled) = &config.channels.enabled {
        let registry = ChannelRegistry::with_builtin(config.graph.dims);
        for name in enabled {
            if !registry.contains(name) {
                anyhow::bail!(
                    "Unknown channel in channels.enabled: '{}'. Registered: {}",
                    name,
                    registry.names().join(", ")
                );
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_apply() {
        let file = write("[db]\npath = \"./data/trj.sqlite\"\n");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.graph.alpha, 0.15);
        assert_eq!(config.graph.dims, 384);
        assert_eq!(config.decay.half_life_days, 45.0);
        assert_eq!(config.decay.interval_secs, 3600);
        assert!(config.channels.enabled.is_none());
    }

    #[test]
    fn test_rejects_zero_dims() {
        let file = write("[db]\npath = \"x.db\"\n\n[graph]\ndims = 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("graph.dims"));
    }

    #[test]
    fn test_rejects_non_positive_alpha() {
        let file = write("[db]\npath = \"x.db\"\n\n[graph]\nalpha = 0.0\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_rejects_unknown_channel() {
        let file = write("[db]\npath = \"x.db\"\n\n[channels]\nenabled = [\"rhetoric\", \"tone\"]\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("'tone'"));
    }

    #[test]
    fn test_decay_params_from_config() {
        let file = write("[db]\npath = \"x.db\"\n\n[decay]\nhalf_life_days = 10.0\n");
        let params = load_config(file.path()).unwrap().decay_params();
        assert_eq!(params.half_life_days, 10.0);
        assert_eq!(params.alpha, 0.15);
    }
}
