use log::{error, info};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use mdl_sql::{
    cache::CacheManager,
    config::{CacheConfig, Config, PostgresConfig},
    data_store::{DataStoreClient, PostgresDataStore, SqliteDataStore},
    processor::QueryProcessor,
    semantic_model::{local_store::LocalSemanticModelStore, Mdl, SemanticModelStore},
    sql_parser::SessionContext,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::new().map_err(|e| {
        error!("Failed to initialize config: {}", e);
        e
    })?;

    let cache_config = CacheConfig::new().map_err(|e| {
        error!("Failed to initialize cache config: {}", e);
        e
    })?;

    match config.data_source.as_str() {
        "postgres" => {
            info!("Using PostgresDataStore");
            let postgres_config = PostgresConfig::new().map_err(|e| {
                error!("Failed to initialize Postgres config: {}", e);
                e
            })?;
            let data_store = PostgresDataStore::new(postgres_config).await.map_err(|e| {
                error!("Failed to create PostgresDataStore: {}", e);
                e
            })?;
            run(config, cache_config, data_store).await
        }
        "sqlite" => {
            info!("Using SqliteDataStore at {}", config.sqlite_source_path);
            let data_store = SqliteDataStore::open(
                &config.sqlite_source_path,
                cache_config.max_concurrent_tasks,
                cache_config.max_concurrent_metadata_queries,
            )
            .map_err(|e| {
                error!("Failed to open SqliteDataStore: {}", e);
                e
            })?;
            run(config, cache_config, data_store).await
        }
        other => {
            error!("Unknown data source: {}", other);
            process::exit(1);
        }
    }
}

/// Deploys the manifest, then answers one SQL statement per stdin line.
async fn run<C: DataStoreClient>(
    config: Config,
    cache_config: CacheConfig,
    data_store: C,
) -> Result<(), Box<dyn std::error::Error>> {
    let manifest = LocalSemanticModelStore::from_json_file(&config.manifest_path)
        .and_then(|store| store.get_manifest())
        .map_err(|e| {
            error!("Failed to load manifest {}: {}", config.manifest_path, e);
            e
        })?;
    let mdl = Arc::new(Mdl::from_manifest(manifest.clone())?);

    let local = SqliteDataStore::open(
        &cache_config.local_store_path,
        cache_config.max_concurrent_tasks,
        cache_config.max_concurrent_metadata_queries,
    )
    .map_err(|e| {
        error!("Failed to open local store {}: {}", cache_config.local_store_path, e);
        e
    })?;
    let source = Arc::new(data_store);
    let cache = CacheManager::new(
        tokio::runtime::Handle::current(),
        Arc::new(local),
        source.clone(),
        cache_config,
    );

    let session = match (config.session_catalog, config.session_schema) {
        (Some(catalog), Some(schema)) => Some(SessionContext::new(catalog, schema)),
        _ => None,
    };
    let processor = QueryProcessor::new(mdl, session, source, cache.clone());
    for task in processor.deploy(manifest).await? {
        info!("{} cache: {}", task.key, task.status);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sql = line.trim();
        if sql.is_empty() {
            continue;
        }
        match processor.query(sql).await {
            Ok(records) => {
                let header: Vec<&str> = records.columns().iter().map(|c| c.name.as_str()).collect();
                println!("{}", header.join("\t"));
                let columns = records.columns().len();
                let mut count = 0;
                for row in records {
                    let values: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                    println!("{}", values.join("\t"));
                    count += 1;
                }
                info!("{} rows, {} columns", count, columns);
            }
            Err(e) => error!("Query failed: {}", e),
        }
    }

    cache.stop();
    Ok(())
}
