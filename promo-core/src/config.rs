use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromoConfig {
    pub engine: EngineSettings,
    pub canary: CanarySettings,
    pub store: StoreSection,
}

impl PromoConfig {
    /// Resolves the database path relative to `base_dir` unless it is absolute.
    pub fn database_path<P: AsRef<Path>>(&self, base_dir: P) -> PathBuf {
        let path = Path::new(&self.store.database_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base_dir.as_ref().join(path)
        }
    }
}

/// Knobs for the decision engine's posterior simulation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Number of posterior draws per decision.
    pub simulation_samples: usize,
    /// Global seed mixed into the per-experiment RNG seed.
    pub seed: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            simulation_samples: 400,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanarySettings {
    /// Ramp window used when the caller does not pass one.
    pub default_ramp_hours: f64,
    /// Floor for a canary schedule budget.
    pub min_budget: f64,
}

impl Default for CanarySettings {
    fn default() -> Self {
        Self {
            default_ramp_hours: 24.0,
            min_budget: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    pub database_path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            database_path: "data/experiments.sqlite".to_string(),
        }
    }
}

pub fn load_promo_config<P: AsRef<Path>>(path: P) -> Result<PromoConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
