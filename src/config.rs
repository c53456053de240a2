use envconfig::Envconfig;
use log::debug;
use std::time::Duration;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "MANIFEST_PATH", default = "mdl.json")]
    pub manifest_path: String,

    /// `postgres` or `sqlite`
    #[envconfig(from = "DATA_SOURCE", default = "postgres")]
    pub data_source: String,

    #[envconfig(from = "SQLITE_SOURCE_PATH", default = "source.db")]
    pub sqlite_source_path: String,

    #[envconfig(from = "SESSION_CATALOG")]
    pub session_catalog: Option<String>,

    #[envconfig(from = "SESSION_SCHEMA")]
    pub session_schema: Option<String>,
}

impl Config {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "Config loaded: manifest_path={}, data_source={}, sqlite_source_path={}, session_catalog={:?}, session_schema={:?}",
            config.manifest_path,
            config.data_source,
            config.sqlite_source_path,
            config.session_catalog,
            config.session_schema
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone)]
pub struct PostgresConfig {
    #[envconfig(from = "POSTGRES_USER", default = "postgres")]
    pub user: String,
    #[envconfig(from = "POSTGRES_PASSWORD", default = "postgres")]
    pub password: String,
    #[envconfig(from = "POSTGRES_HOST", default = "localhost:5432")]
    pub host: String,
    #[envconfig(from = "POSTGRES_DB", default = "main")]
    pub dbname: String,
}

impl PostgresConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!(
            "PostgresConfig loaded: user={}, host={}, dbname={}",
            config.user, config.host, config.dbname
        );
        Ok(config)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct CacheConfig {
    #[envconfig(from = "CACHE_LOCAL_STORE_PATH", default = "cache.db")]
    pub local_store_path: String,

    #[envconfig(from = "CACHE_MAX_CONCURRENT_TASKS", default = "10")]
    pub max_concurrent_tasks: usize,

    #[envconfig(from = "CACHE_MAX_CONCURRENT_METADATA_QUERIES", default = "10")]
    pub max_concurrent_metadata_queries: usize,

    #[envconfig(from = "CACHE_MEMORY_LIMIT_BYTES", default = "1073741824")]
    pub memory_limit_bytes: u64,

    /// Share of the memory limit one cached table may take.
    #[envconfig(from = "CACHE_MAX_TABLE_SIZE_RATIO", default = "0.5")]
    pub max_table_size_ratio: f64,

    #[envconfig(from = "CACHE_TASK_RETRY_DELAY_SECS", default = "60")]
    pub task_retry_delay_secs: u64,
}

impl CacheConfig {
    pub fn new() -> Result<Self, envconfig::Error> {
        let config = Self::init_from_env()?;
        debug!("CacheConfig loaded: {:?}", config);
        Ok(config)
    }

    pub fn table_size_limit(&self) -> usize {
        (self.memory_limit_bytes as f64 * self.max_table_size_ratio) as usize
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.task_retry_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.max_concurrent_tasks, 10);
        assert_eq!(config.max_concurrent_metadata_queries, 10);
        assert_eq!(config.table_size_limit(), 512 * 1024 * 1024);
        assert_eq!(config.retry_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_config_overrides() {
        let env = HashMap::from([
            ("DATA_SOURCE".to_string(), "sqlite".to_string()),
            ("SESSION_SCHEMA".to_string(), "tpch".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.data_source, "sqlite");
        assert_eq!(config.manifest_path, "mdl.json");
        assert_eq!(config.session_catalog, None);
        assert_eq!(config.session_schema.as_deref(), Some("tpch"));
    }
}
