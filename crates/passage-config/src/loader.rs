//! Configuration file loading.

use std::{fs, path::Path};

use crate::types::Config;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format")]
    UnsupportedFormat,
    #[error("validation: {0}")]
    Validation(String),
}

/// Load a config file, dispatching on the extension.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)?;
    let config: Config = match path.extension().and_then(|s| s.to_str()).unwrap_or("") {
        "json" | "jsonc" => {
            let stripped = json_comments::StripComments::new(data.as_bytes());
            serde_json::from_reader(stripped)?
        }
        "yaml" | "yml" => serde_yaml::from_str(&data)?,
        "toml" => toml::from_str(&data)?,
        _ => return Err(ConfigError::UnsupportedFormat),
    };
    validate(&config)?;
    Ok(config)
}

/// Structural checks the serde layer cannot express.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    for service in &config.services {
        if service.name.is_empty() {
            return Err(ConfigError::Validation("service without a name".into()));
        }
        if service.addr.is_empty() {
            return Err(ConfigError::Validation(format!(
                "service {:?} without an address",
                service.name
            )));
        }
        if let Some(chain) = &service.handler.chain {
            if !config.chains.iter().any(|c| &c.name == chain) {
                return Err(ConfigError::Validation(format!(
                    "service {:?} references unknown chain {chain:?}",
                    service.name
                )));
            }
        }
    }
    for chain in &config.chains {
        for hop in &chain.hops {
            if hop.nodes.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "chain {:?} hop {:?} has no nodes",
                    chain.name, hop.name
                )));
            }
        }
    }
    Ok(())
}
