//! Server configuration: built-in defaults, optionally overridden by `config/server.*`.

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::Semaphore;

use crate::model::ModelContract;

const DEFAULT_CONFIG_FILE: &str = "config/server";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub inference: InferenceConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
}

/// Where the model artifact lives and which nodes to bind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Artifact directory, or a direct path to an `.onnx` file
    pub path: String,
    /// Serving tags selecting the variant inside the artifact directory
    pub tags: Vec<String>,
    pub input_node: String,
    pub output_node: String,
    #[serde(default)]
    pub output_slot: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Upper bound on predictions executing at the same time
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl ModelConfig {
    pub fn contract(&self) -> ModelContract {
        ModelContract {
            input_node: self.input_node.clone(),
            output_node: self.output_node.clone(),
            output_slot: self.output_slot,
        }
    }
}

impl AppConfig {
    /// Defaults plus `config/server.{toml,yaml,json}` when present.
    pub fn load() -> Result<Self, ConfigError> {
        Self::build(File::with_name(DEFAULT_CONFIG_FILE).required(false))
    }

    fn build<S>(source: S) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config: AppConfig = Config::builder()
            .add_source(Config::try_from(&AppConfig::default())?)
            .add_source(source)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.inference.max_concurrent == 0 {
            return Err(ConfigError::Message(
                "inference.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.inference.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::Message(format!(
                "inference.max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.model.tags.is_empty() && !self.model.path.ends_with(".onnx") {
            return Err(ConfigError::Message(
                "model.tags must name at least one serving tag".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: 8000,
            },
            model: ModelConfig {
                path: "model/1557625293".to_string(),
                tags: vec!["serve".to_string()],
                input_node: "input_x".to_string(),
                output_node: "linear/linear_model/linear_model/linear_model/weighted_sum"
                    .to_string(),
                output_slot: 0,
            },
            inference: InferenceConfig { max_concurrent: 4 },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}
