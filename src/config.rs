//! Configuration for ordering and querying tracked particles.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (tracks.json)
//! ```json
//! {
//!   "chunk_size": 5000000,
//!   "timestep": 0.05,
//!   "conversion": { "x": 1.6e-7, "px": 0.511 }
//! }
//! ```

use crate::core::property::Property;
use crate::error::{Error, Result};
use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Default chunk size (records or slots per chunk)
pub const DEFAULT_CHUNK_SIZE: usize = 20_000_000;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    /// Records per reorder chunk and slots per selection chunk
    pub chunk_size: usize,
    /// Duration of one simulation step, in the units positions are stored in
    /// divided by the speed limit
    pub timestep: f64,
    /// Speed above which consecutive positions count as a broken trajectory
    pub speed_limit: f64,
    /// Unit conversion factor per property name
    pub conversion: BTreeMap<String, f64>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            timestep: 1.0,
            speed_limit: 1.0,
            conversion: BTreeMap::new(),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestep: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_limit: Option<f64>,
}

impl TrackConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// Environment variables use the `TRACKS_` prefix, e.g. `TRACKS_CHUNK_SIZE`.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(TrackConfig::default()));

        if let Some(path) = config_path {
            if !path.is_file() {
                return Err(Error::Configuration(format!(
                    "Config file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Json::file(path));
        }

        figment = figment.merge(Env::prefixed("TRACKS_"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: TrackConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engines cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Configuration("chunk_size must be positive".to_string()));
        }
        if !(self.timestep > 0.0) {
            return Err(Error::Configuration(format!(
                "timestep must be positive, got {}",
                self.timestep
            )));
        }
        if !(self.speed_limit > 0.0) {
            return Err(Error::Configuration(format!(
                "speed_limit must be positive, got {}",
                self.speed_limit
            )));
        }
        for (name, factor) in &self.conversion {
            let prop: Property = name.parse()?;
            if !prop.is_scalable() {
                return Err(Error::Configuration(format!(
                    "Property {} cannot take a conversion factor",
                    prop
                )));
            }
            if !factor.is_finite() {
                return Err(Error::Configuration(format!(
                    "Conversion factor for {} is not finite",
                    prop
                )));
            }
        }
        Ok(())
    }

    /// Scale factor applied to a property when fetched (1.0 if unset)
    pub fn factor(&self, prop: Property) -> f64 {
        if !prop.is_scalable() {
            return 1.0;
        }
        self.conversion.get(prop.name()).copied().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.factor(Property::X), 1.0);
    }

    #[test]
    fn test_file_and_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tracks.json");
        std::fs::write(
            &path,
            r#"{ "chunk_size": 1000, "timestep": 0.5, "conversion": { "x": 2.0 } }"#,
        )
        .unwrap();

        let config = TrackConfig::load(
            Some(&path),
            ConfigOverrides {
                chunk_size: Some(10),
                ..ConfigOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.timestep, 0.5);
        assert_eq!(config.speed_limit, 1.0);
        assert_eq!(config.factor(Property::X), 2.0);
        assert_eq!(config.factor(Property::Id), 1.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad = [
            TrackConfig {
                chunk_size: 0,
                ..TrackConfig::default()
            },
            TrackConfig {
                timestep: f64::NAN,
                ..TrackConfig::default()
            },
            TrackConfig {
                speed_limit: -1.0,
                ..TrackConfig::default()
            },
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        }

        let mut conversion = BTreeMap::new();
        conversion.insert("q".to_string(), 2.0);
        let config = TrackConfig {
            conversion,
            ..TrackConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let mut conversion = BTreeMap::new();
        conversion.insert("vx".to_string(), 2.0);
        let config = TrackConfig {
            conversion,
            ..TrackConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::UnknownProperty(_))));
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            TrackConfig::load(Some(&temp_dir.path().join("nope.json")), ConfigOverrides::default()),
            Err(Error::Configuration(_))
        ));
    }
}
