//! Configuration loader and validator for the relmap service.
use crate::mapper::MapperSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub mapper: MapperSettings,
}

/// Connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `relmap.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("relmap.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let url = cfg.database.url.trim();
    if url.is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }
    if !(url.starts_with("sqlite:") || url.starts_with("postgres:") || url.starts_with("postgresql:"))
    {
        return Err(ConfigError::Invalid(
            "database.url must start with sqlite:, postgres: or postgresql:",
        ));
    }
    if cfg.database.max_connections == 0 {
        return Err(ConfigError::Invalid("database.max_connections must be > 0"));
    }
    Ok(())
}

/// A complete sample configuration.
pub fn example() -> &'static str {
    r#"database:
  url: "sqlite://./data/relmap.db"
  max_connections: 5

mapper:
  naming: snake_case
  missing_column: fail
  cache_metadata: true
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{MissingColumnPolicy, NamingConvention};
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.mapper.naming, NamingConvention::SnakeCase);
        assert_eq!(cfg.mapper.missing_column, MissingColumnPolicy::FailOnNotFound);
    }

    #[test]
    fn mapper_section_is_optional() {
        let cfg: Config = serde_yaml::from_str("database:\n  url: \"sqlite::memory:\"\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.database.max_connections, 5);
        assert_eq!(cfg.mapper, MapperSettings::default());
    }

    #[test]
    fn invalid_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.database.url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("database.url")),
            _ => panic!("wrong error"),
        }

        cfg.database.url = "mysql://localhost/app".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_pool_size() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.database.max_connections = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("max_connections")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        let yaml = "database:\n  url: \"sqlite::memory:\"\nmapper:\n  missing_column: ignore\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("relmap.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.database.url, "sqlite://./data/relmap.db");
        assert!(cfg.mapper.cache_metadata);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let td = tempdir().unwrap();
        let err = load(Some(&td.path().join("absent.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
