use async_trait::async_trait;
use dashmap::DashMap;
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    flow::ContinuationMode,
    graph::{Graph, GraphError},
    logger::LogConfig,
};

pub const GRAPH: &str = "CHATFLOW_GRAPH";
pub const GRAPH_JSON: &str = "CHATFLOW_GRAPH_JSON";
pub const AGENT_ID: &str = "CHATFLOW_AGENT_ID";
pub const CONTINUATION: &str = "CHATFLOW_CONTINUATION";
pub const HTTP_TIMEOUT_SECS: &str = "CHATFLOW_HTTP_TIMEOUT_SECS";
pub const LOG_LEVEL: &str = "CHATFLOW_LOG_LEVEL";
pub const LOG_DIR: &str = "CHATFLOW_LOG_DIR";

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            debug!("no .env at {}", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("no graph configured, set CHATFLOW_GRAPH or CHATFLOW_GRAPH_JSON")]
    MissingGraph,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Settings of one interpreter process.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub graph_path: Option<PathBuf>,
    /// Inline graph, takes precedence over `graph_path`.
    pub graph_json: Option<String>,
    /// Operator id of this agent, needed by the `NewAssignment` trigger.
    pub agent_id: Option<i64>,
    pub continuation: ContinuationMode,
    pub http_timeout: Duration,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            graph_path: None,
            graph_json: None,
            agent_id: None,
            continuation: ContinuationMode::InProcess,
            http_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

fn parse<T>(key: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}

impl RuntimeConfig {
    pub async fn from_manager(config: &ConfigManager) -> Result<Self, ConfigError> {
        let mut runtime = Self::default();

        runtime.graph_path = config.get(GRAPH).await.map(PathBuf::from);
        runtime.graph_json = config.get(GRAPH_JSON).await.filter(|s| !s.trim().is_empty());
        if let Some(value) = config.get(AGENT_ID).await {
            runtime.agent_id = Some(parse(AGENT_ID, value)?);
        }
        if let Some(value) = config.get(CONTINUATION).await {
            runtime.continuation = match value.trim().to_ascii_lowercase().as_str() {
                "in_process" => ContinuationMode::InProcess,
                "round_trip" => ContinuationMode::RoundTrip,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: CONTINUATION,
                        value,
                        reason: "expected in_process or round_trip".into(),
                    });
                }
            };
        }
        if let Some(value) = config.get(HTTP_TIMEOUT_SECS).await {
            runtime.http_timeout = Duration::from_secs(parse(HTTP_TIMEOUT_SECS, value)?);
        }
        if let Some(value) = config.get(LOG_LEVEL).await {
            runtime.log_level = value;
        }
        runtime.log_dir = config.get(LOG_DIR).await.map(PathBuf::from);

        debug!(?runtime, "runtime config");
        Ok(runtime)
    }

    pub fn load_graph(&self) -> Result<Graph, ConfigError> {
        match (&self.graph_json, &self.graph_path) {
            (Some(json), _) => Ok(Graph::from_json(json)?),
            (None, Some(path)) => Ok(Graph::load(path)?),
            (None, None) => Err(ConfigError::MissingGraph),
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.log_level.clone(), self.log_dir.clone())
    }
}
