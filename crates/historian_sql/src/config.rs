use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use historian_core::{HistorianError, HistorianResult};

const DEFAULT_CONFIG_NAME: &str = "historian.json";
const DEFAULT_DB_NAME: &str = "historian.sqlite";

/// Connection descriptor: dialect identifier plus dialect-specific
/// connect parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Sqlite(SqliteParams),
    Postgres(NetworkParams),
    Mysql(NetworkParams),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqliteParams {
    pub database: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl ConnectionConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            ConnectionConfig::Sqlite(_) => "sqlite",
            ConnectionConfig::Postgres(_) => "postgres",
            ConnectionConfig::Mysql(_) => "mysql",
        }
    }

    /// Connection URL for the configured dialect. Relative sqlite paths are
    /// resolved against `base_dir`.
    pub fn connection_url(&self, base_dir: &Path) -> String {
        match self {
            ConnectionConfig::Sqlite(params) => {
                let path = PathBuf::from(&params.database);
                let path = if path.is_absolute() {
                    path
                } else {
                    base_dir.join(path)
                };
                format!("sqlite://{}?mode=rwc", path.display())
            }
            ConnectionConfig::Postgres(params) => network_url("postgres", params),
            ConnectionConfig::Mysql(params) => network_url("mysql", params),
        }
    }

    pub fn statement_timeout_ms(&self) -> Option<u64> {
        match self {
            ConnectionConfig::Sqlite(params) => params.timeout_ms,
            _ => None,
        }
    }
}

fn network_url(scheme: &str, params: &NetworkParams) -> String {
    let credentials = match &params.password {
        Some(password) => format!("{}:{}", params.user, password),
        None => params.user.clone(),
    };
    format!(
        "{}://{}@{}:{}/{}",
        scheme, credentials, params.host, params.port, params.database
    )
}

/// Table-naming descriptor. An optional prefix is applied to every table
/// name, followed by an underscore. When the topics and metadata base names
/// coincide the backend stores metadata in the topics table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TablesConfig {
    #[serde(default)]
    pub table_prefix: Option<String>,
    #[serde(default = "default_data_table")]
    pub data_table: String,
    #[serde(default = "default_topics_table")]
    pub topics_table: String,
    #[serde(default = "default_meta_table")]
    pub meta_table: String,
    #[serde(default = "default_agg_topics_table")]
    pub agg_topics_table: String,
    #[serde(default = "default_agg_meta_table")]
    pub agg_meta_table: String,
}

fn default_data_table() -> String {
    "data".to_string()
}

fn default_topics_table() -> String {
    "topics".to_string()
}

fn default_meta_table() -> String {
    "meta".to_string()
}

fn default_agg_topics_table() -> String {
    "aggregate_topics".to_string()
}

fn default_agg_meta_table() -> String {
    "aggregate_meta".to_string()
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            table_prefix: None,
            data_table: default_data_table(),
            topics_table: default_topics_table(),
            meta_table: default_meta_table(),
            agg_topics_table: default_agg_topics_table(),
            agg_meta_table: default_agg_meta_table(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistorianConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub tables_def: Option<TablesConfig>,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub readonly: Option<bool>,
}

impl HistorianConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::Sqlite(SqliteParams {
                database: path.into(),
                timeout_ms: None,
            }),
            tables_def: None,
            pool: None,
            readonly: None,
        }
    }

    /// Read `historian.json` from `base_dir`, writing a default sqlite
    /// configuration on first run.
    pub fn load_or_init(base_dir: &Path) -> HistorianResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| HistorianError::invalid(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| HistorianError::invalid(format!("read config: {err}")))?;
            let config: HistorianConfig =
                serde_json::from_str(&raw).map_err(|err| HistorianError::invalid(err.to_string()))?;
            return Ok(config);
        }
        let default = HistorianConfig::default_sqlite(DEFAULT_DB_NAME);
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| HistorianError::invalid(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| HistorianError::invalid(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn tables(&self) -> TablesConfig {
        self.tables_def.clone().unwrap_or_default()
    }

    pub fn readonly(&self) -> bool {
        self.readonly.unwrap_or(false)
    }
}
