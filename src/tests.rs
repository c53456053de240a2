use crate::cache::{CacheManager, TaskStatus};
use crate::config::CacheConfig;
use crate::data_store::{DataStoreClient, SqliteDataStore, SqliteMapping, Value};
use crate::processor::QueryProcessor;
use crate::semantic_model::local_store::LocalSemanticModelStore;
use crate::semantic_model::{Manifest, Mdl, SemanticModelStore};
use crate::sql_parser::{CacheLookup, SessionContext, SqlParser};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Handle;

const SOURCE_TABLES: &str = "
    CREATE TABLE raw_album (id INTEGER PRIMARY KEY, name TEXT, author TEXT, price INTEGER, bandId INTEGER);
    CREATE TABLE raw_band (id INTEGER PRIMARY KEY, name TEXT);
    CREATE TABLE raw_orders (orderkey INTEGER PRIMARY KEY, custkey INTEGER, orderstatus TEXT, totalprice REAL, orderdate TEXT);

    INSERT INTO raw_album VALUES
        (1, 'Kansaete Kuyashiiwa', 'ZUTOMAYO', 45, 1),
        (2, 'Nouriueno Cracker', 'ZUTOMAYO', 30, 1),
        (3, 'Plastic Love', 'Mariya Takeuchi', 25, 2);
    INSERT INTO raw_band VALUES (1, 'ZUTOMAYO'), (2, 'Mariya Takeuchi Band');
    INSERT INTO raw_orders VALUES
        (1, 10, 'F', 100.0, '2024-01-03'),
        (2, 10, 'O', 50.0, '2024-01-10'),
        (3, 20, 'F', 80.0, '2024-02-01'),
        (4, 20, 'O', 20.0, '2024-02-05');
";

/// The mock manifest reading from the `raw_*` tables of [`sqlite_source`].
///
/// SQLite resolves CTE names case-insensitively, so the models cannot read tables
/// sharing their names.
pub(crate) fn sqlite_manifest() -> Manifest {
    let mut manifest = LocalSemanticModelStore::mock().get_manifest().unwrap();
    for model in &mut manifest.models {
        model.ref_sql = Some(format!("select * from raw_{}", model.name.to_lowercase()));
    }
    manifest
}

pub(crate) async fn sqlite_source(dir: &TempDir) -> SqliteDataStore {
    let source = SqliteDataStore::open(dir.path().join("source.db"), 2, 2).unwrap();
    source.execute_ddl(SOURCE_TABLES).await.unwrap();
    source
}

fn cache_config(ratio: f64) -> CacheConfig {
    CacheConfig {
        local_store_path: "unused".to_string(),
        max_concurrent_tasks: 2,
        max_concurrent_metadata_queries: 2,
        memory_limit_bytes: 1024 * 1024,
        max_table_size_ratio: ratio,
        task_retry_delay_secs: 3600,
    }
}

async fn setup_processor(dir: &TempDir, manifest: Manifest, ratio: f64) -> QueryProcessor<SqliteDataStore> {
    let source = Arc::new(sqlite_source(dir).await);
    let local = SqliteDataStore::open(dir.path().join("cache.db"), 2, 2).unwrap();
    let cache = CacheManager::new(Handle::current(), Arc::new(local), source.clone(), cache_config(ratio));
    let mdl = Arc::new(Mdl::from_manifest(manifest.clone()).unwrap());
    let processor = QueryProcessor::new(mdl, None, source, cache);
    processor.deploy(manifest).await.unwrap();
    processor
}

async fn rows(processor: &QueryProcessor<SqliteDataStore>, sql: &str) -> Vec<Vec<Value>> {
    processor.query(sql).await.unwrap().collect()
}

fn sorted(mut rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    rows.sort_by_key(|row| format!("{:?}", row));
    rows
}

fn text(s: &str) -> Value {
    Value::String(s.to_string())
}

#[test_log::test(tokio::test)]
async fn test_metric_query() {
    let dir = tempfile::tempdir().unwrap();
    let processor = setup_processor(&dir, sqlite_manifest(), 0.5).await;
    let rows = rows(&processor, "SELECT author, price FROM Collection ORDER BY author").await;
    assert_eq!(
        rows,
        vec![
            vec![text("Mariya Takeuchi"), Value::Int(25)],
            vec![text("ZUTOMAYO"), Value::Int(75)],
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_relationship_dereference() {
    let dir = tempfile::tempdir().unwrap();
    let processor = setup_processor(&dir, sqlite_manifest(), 0.5).await;
    let rows = rows(&processor, "SELECT name, band.name FROM Album WHERE price > 26 ORDER BY price").await;
    assert_eq!(
        rows,
        vec![
            vec![text("Nouriueno Cracker"), text("ZUTOMAYO")],
            vec![text("Kansaete Kuyashiiwa"), text("ZUTOMAYO")],
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_group_by_dereference() {
    let dir = tempfile::tempdir().unwrap();
    let processor = setup_processor(&dir, sqlite_manifest(), 0.5).await;
    let rows = sorted(rows(&processor, "SELECT band.name, count(*) FROM Album GROUP BY band.name").await);
    assert_eq!(
        rows,
        vec![
            vec![text("Mariya Takeuchi Band"), Value::Int(1)],
            vec![text("ZUTOMAYO"), Value::Int(2)],
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_cumulative_metric() {
    let dir = tempfile::tempdir().unwrap();
    let processor = setup_processor(&dir, sqlite_manifest(), 0.5).await;
    let rows = rows(&processor, "SELECT week, total FROM WeeklyRevenue ORDER BY week").await;
    assert_eq!(
        rows,
        vec![
            vec![text("2024-01-01"), Value::Float(100.0)],
            vec![text("2024-01-08"), Value::Float(150.0)],
            vec![text("2024-01-29"), Value::Float(230.0)],
            vec![text("2024-02-05"), Value::Float(250.0)],
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_rollup() {
    let dir = tempfile::tempdir().unwrap();
    let processor = setup_processor(&dir, sqlite_manifest(), 0.5).await;
    let rows = sorted(rows(&processor, "SELECT * FROM roll_up(Revenue, orderdate, MONTH)").await);
    assert_eq!(
        rows,
        vec![
            vec![text("2024-01-01"), Value::Int(10), Value::Float(150.0)],
            vec![text("2024-02-01"), Value::Int(20), Value::Float(100.0)],
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_cached_rows_match_live() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = sqlite_manifest();
    manifest.metrics[0].pre_aggregated = true;
    manifest.models[1].pre_aggregated = true;
    let processor = setup_processor(&dir, manifest, 0.5).await;
    let mdl = processor.mdl().unwrap();
    let session = SessionContext::for_mdl(&mdl);
    let source = SqliteDataStore::open(dir.path().join("source.db"), 1, 1).unwrap();

    for sql in ["SELECT author, price FROM Collection", "SELECT id, name FROM Band"] {
        let cached_sql = SqlParser::new(SqliteMapping {})
            .parse_cached(sql, &session, &mdl, processor.cache())
            .unwrap()
            .unwrap_or_else(|| panic!("{} is not served from cache", sql));
        assert!(!cached_sql.contains("raw_"), "{} reads the source", cached_sql);

        let live_sql = processor.rewrite(sql).unwrap();
        let live: Vec<Vec<Value>> = source.execute_query(&live_sql, &[]).await.unwrap().collect();
        assert_eq!(sorted(rows(&processor, sql).await), sorted(live));
    }
}

#[test_log::test(tokio::test)]
async fn test_failed_cache_is_served_live() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = sqlite_manifest();
    manifest.metrics[0].pre_aggregated = true;
    let processor = setup_processor(&dir, manifest, 0.0).await;
    let mdl = processor.mdl().unwrap();
    let key = mdl.qualified("Collection");

    let info = processor.cache().get_task_info(&key).unwrap();
    assert_eq!(info.status, TaskStatus::Failed);
    assert!(processor.cache().retry_scheduled_future_exists(&key));

    let rows = sorted(rows(&processor, "SELECT author, price FROM Collection").await);
    assert_eq!(
        rows,
        vec![
            vec![text("Mariya Takeuchi"), Value::Int(25)],
            vec![text("ZUTOMAYO"), Value::Int(75)],
        ]
    );
    processor.cache().stop();
}

#[test_log::test(tokio::test)]
async fn test_redeploy_drops_cache() {
    let dir = tempfile::tempdir().unwrap();
    let mut manifest = sqlite_manifest();
    manifest.models[1].pre_aggregated = true;
    let processor = setup_processor(&dir, manifest, 0.5).await;
    let key = processor.mdl().unwrap().qualified("Band");
    assert!(processor.cache().lookup_cache_table(&key).is_some());

    let infos = processor.deploy(sqlite_manifest()).await.unwrap();
    assert!(infos.is_empty());
    assert!(processor.cache().lookup_cache_table(&key).is_none());
    assert_eq!(
        sorted(rows(&processor, "SELECT name FROM Band").await),
        vec![vec![text("Mariya Takeuchi Band")], vec![text("ZUTOMAYO")]]
    );
}

#[test_log::test(tokio::test)]
async fn test_writes_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let processor = setup_processor(&dir, sqlite_manifest(), 0.5).await;
    assert!(processor.query("DELETE FROM Album").await.is_err());
}
