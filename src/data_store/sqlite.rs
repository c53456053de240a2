//! Embedded SQLite store.
//!
//! Serves both as a data source and as the local store holding materialized tables.
//! Connections are pooled and every statement runs on tokio's blocking pool. Materialization
//! tasks and metadata queries draw from separate permit pools, so a long refresh never
//! starves table lookups.

use crate::data_store::{
    column_affinity, ColumnMetadata, DataStoreClient, DataStoreError, DataStoreMapping, RecordIterator, Value,
};
use crate::utils::encoding::decode_sqlite_value;
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use log::{debug, warn};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params_from_iter, Connection};
use sqlparser::dialect::SQLiteDialect;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteMapping;

impl DataStoreMapping for SqliteMapping {
    fn get_dialect(&self) -> &dyn sqlparser::dialect::Dialect {
        &SQLiteDialect {}
    }

    fn map_function(&self, pg_function: &str) -> Option<String> {
        let mapped = match pg_function {
            "char_length" | "character_length" => "length",
            "strpos" => "instr",
            "substring" => "substr",
            other => other,
        };
        Some(mapped.to_string())
    }
}

/// Which permit pool a statement draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Task,
    Metadata,
}

pub struct SqliteDataStore {
    path: PathBuf,
    connections: Arc<Mutex<Vec<Connection>>>,
    task_permits: Semaphore,
    metadata_permits: Semaphore,
}

impl SqliteDataStore {
    /// Opens the database at `path`, creating it when missing.
    ///
    /// At most `max_tasks + max_metadata` connections are ever open.
    pub fn open(path: impl AsRef<Path>, max_tasks: usize, max_metadata: usize) -> Result<Self, DataStoreError> {
        let path = path.as_ref().to_path_buf();
        let connection = open_connection(&path)?;
        debug!(
            "Opened sqlite store {} with {} task and {} metadata connections",
            path.display(),
            max_tasks,
            max_metadata
        );
        Ok(SqliteDataStore {
            path,
            connections: Arc::new(Mutex::new(vec![connection])),
            task_permits: Semaphore::new(max_tasks.max(1)),
            metadata_permits: Semaphore::new(max_metadata.max(1)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with a pooled connection on the blocking pool.
    async fn with_connection<T, F>(&self, workload: Workload, f: F) -> Result<T, DataStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DataStoreError> + Send + 'static,
    {
        let permits = match workload {
            Workload::Task => &self.task_permits,
            Workload::Metadata => &self.metadata_permits,
        };
        let _permit = permits
            .acquire()
            .await
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;

        let pooled = self
            .connections
            .lock()
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?
            .pop();
        let path = self.path.clone();
        let (connection, result) = tokio::task::spawn_blocking(move || {
            let mut connection = match pooled {
                Some(connection) => connection,
                None => match open_connection(&path) {
                    Ok(connection) => connection,
                    Err(e) => return (None, Err(e)),
                },
            };
            let result = f(&mut connection);
            (Some(connection), result)
        })
        .await?;

        if let Some(connection) = connection {
            self.connections
                .lock()
                .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?
                .push(connection);
        }
        result
    }

    pub async fn query(&self, workload: Workload, sql: &str, params: &[Value]) -> Result<RecordIterator, DataStoreError> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(workload, move |connection| {
            let mut stmt = connection.prepare(&sql)?;
            let columns = describe_statement(&stmt);
            let width = columns.len();
            let mut rows = stmt.query(params_from_iter(params.iter()))?;
            let mut values = vec![];
            while let Some(row) = rows.next()? {
                let mut record = Vec::with_capacity(width);
                for idx in 0..width {
                    record.push(decode_sqlite_value(row.get_ref(idx)?));
                }
                values.push(record);
            }
            Ok(RecordIterator::new(columns, values))
        })
        .await
    }

    pub async fn execute_batch(&self, workload: Workload, sql: &str) -> Result<(), DataStoreError> {
        let sql = sql.to_string();
        self.with_connection(workload, move |connection| Ok(connection.execute_batch(&sql)?))
            .await
    }

    /// Creates `table` and fills it with `rows` in one transaction.
    pub async fn create_table_as(
        &self,
        table: &str,
        columns: &[ColumnMetadata],
        rows: Vec<Vec<Value>>,
    ) -> Result<(), DataStoreError> {
        let definitions: Vec<String> = columns
            .iter()
            .map(|column| {
                format!("{} {}", quote(&column.name), column_affinity(&column.type_name))
                    .trim_end()
                    .to_string()
            })
            .collect();
        let create = format!("CREATE TABLE {} ({})", quote(table), definitions.join(", "));
        let placeholders: Vec<String> = (1..=columns.len()).map(|idx| format!("?{}", idx)).collect();
        let insert = format!("INSERT INTO {} VALUES ({})", quote(table), placeholders.join(", "));
        let count = rows.len();

        self.with_connection(Workload::Task, move |connection| {
            let tx = connection.transaction()?;
            tx.execute(&create, [])?;
            {
                let mut stmt = tx.prepare(&insert)?;
                for row in &rows {
                    stmt.execute(params_from_iter(row.iter()))?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!("Created table {} with {} rows", table, count);
        Ok(())
    }

    /// Drops `table` if present, logging instead of failing.
    pub async fn drop_table_quietly(&self, table: &str) {
        let sql = format!("DROP TABLE IF EXISTS {}", quote(table));
        if let Err(e) = self.execute_batch(Workload::Task, &sql).await {
            warn!("Failed to drop table {}: {}", table, e);
        }
    }

    pub async fn list_tables(&self) -> Result<Vec<String>, DataStoreError> {
        let tables = self
            .query(
                Workload::Metadata,
                "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                &[],
            )
            .await?;
        Ok(tables
            .filter_map(|row| match row.into_iter().next() {
                Some(Value::String(name)) => Some(name),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl DataStoreClient for SqliteDataStore {
    type Mapping = SqliteMapping;

    fn get_mapping(&self) -> Self::Mapping {
        SqliteMapping {}
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<RecordIterator, DataStoreError> {
        self.query(Workload::Task, sql, params).await
    }

    async fn describe(&self, sql: &str, _params: &[Value]) -> Result<Vec<ColumnMetadata>, DataStoreError> {
        let sql = sql.to_string();
        self.with_connection(Workload::Metadata, move |connection| {
            let stmt = connection.prepare(&sql)?;
            Ok(describe_statement(&stmt))
        })
        .await
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), DataStoreError> {
        self.execute_batch(Workload::Task, sql).await
    }
}

fn open_connection(path: &Path) -> Result<Connection, DataStoreError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    register_date_trunc(&connection)?;
    Ok(connection)
}

fn describe_statement(stmt: &rusqlite::Statement<'_>) -> Vec<ColumnMetadata> {
    stmt.columns()
        .iter()
        .map(|column| ColumnMetadata::new(column.name(), column.decl_type().unwrap_or_default()))
        .collect()
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `date_trunc(unit, value)` over ISO-8601 text, as rendered by time grains and windows.
fn register_date_trunc(connection: &Connection) -> rusqlite::Result<()> {
    connection.create_scalar_function(
        "date_trunc",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let unit: String = ctx.get(0)?;
            let value: Option<String> = ctx.get(1)?;
            Ok(value.and_then(|value| date_trunc(&unit, &value)))
        },
    )
}

fn date_trunc(unit: &str, value: &str) -> Option<String> {
    let (timestamp, date_only) = match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(date) => (date.and_time(NaiveTime::MIN), true),
        Err(_) => (
            NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S"))
                .ok()?,
            false,
        ),
    };
    let date = timestamp.date();
    let truncated = match unit.to_lowercase().as_str() {
        "year" => NaiveDate::from_ymd_opt(date.year(), 1, 1)?.and_time(NaiveTime::MIN),
        "quarter" => {
            let month = (date.month0() / 3) * 3 + 1;
            NaiveDate::from_ymd_opt(date.year(), month, 1)?.and_time(NaiveTime::MIN)
        }
        "month" => NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?.and_time(NaiveTime::MIN),
        "week" => {
            let monday = date - ChronoDuration::days(date.weekday().num_days_from_monday().into());
            monday.and_time(NaiveTime::MIN)
        }
        "day" => date.and_time(NaiveTime::MIN),
        "hour" => date.and_hms_opt(timestamp.hour(), 0, 0)?,
        "minute" => date.and_hms_opt(timestamp.hour(), timestamp.minute(), 0)?,
        "second" => timestamp.with_nanosecond(0)?,
        _ => return None,
    };
    Some(if date_only {
        truncated.format("%Y-%m-%d").to_string()
    } else {
        truncated.format("%Y-%m-%d %H:%M:%S").to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::year("year", "2024-05-17", "2024-01-01")]
    #[case::quarter("quarter", "2024-05-17", "2024-04-01")]
    #[case::month("month", "2024-05-17", "2024-05-01")]
    #[case::week("week", "2024-05-17", "2024-05-13")]
    #[case::day_of_timestamp("day", "2024-05-17 13:45:10", "2024-05-17 00:00:00")]
    #[case::hour("hour", "2024-05-17 13:45:10", "2024-05-17 13:00:00")]
    fn test_date_trunc(#[case] unit: &str, #[case] value: &str, #[case] expected: &str) {
        assert_eq!(date_trunc(unit, value).as_deref(), Some(expected));
    }

    #[rstest]
    fn test_date_trunc_rejects_garbage() {
        assert_eq!(date_trunc("month", "yesterday"), None);
        assert_eq!(date_trunc("fortnight", "2024-05-17"), None);
    }

    #[rstest]
    #[case::renamed("char_length", "length")]
    #[case::passthrough("sum", "sum")]
    fn test_sqlite_mapping(#[case] function: &str, #[case] expected: &str) {
        assert_eq!(SqliteMapping {}.map_function(function).as_deref(), Some(expected));
    }

    #[test_log::test(tokio::test)]
    async fn test_create_query_and_drop() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDataStore::open(dir.path().join("local.db"), 2, 2).unwrap();
        store
            .create_table_as(
                "Collection_01",
                &[ColumnMetadata::new("author", "varchar"), ColumnMetadata::new("price", "int8")],
                vec![
                    vec![Value::String("ZUTOMAYO".to_string()), Value::Int(45)],
                    vec![Value::String("Yorushika".to_string()), Value::Null],
                ],
            )
            .await
            .unwrap();
        assert_eq!(store.list_tables().await.unwrap(), vec!["Collection_01".to_string()]);

        let rows: Vec<Vec<Value>> = store
            .query(
                Workload::Metadata,
                "SELECT author, price FROM \"Collection_01\" WHERE price > ?1",
                &[Value::Int(10)],
            )
            .await
            .unwrap()
            .collect();
        assert_eq!(rows, vec![vec![Value::String("ZUTOMAYO".to_string()), Value::Int(45)]]);

        store.drop_table_quietly("Collection_01").await;
        store.drop_table_quietly("Collection_01").await;
        assert!(store.list_tables().await.unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_describe_and_date_trunc_in_sql() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDataStore::open(dir.path().join("source.db"), 1, 1).unwrap();
        store
            .execute_ddl("CREATE TABLE orders (orderkey INTEGER, orderdate TEXT)")
            .await
            .unwrap();
        let columns = store.describe("SELECT orderkey FROM orders", &[]).await.unwrap();
        assert_eq!(columns, vec![ColumnMetadata::new("orderkey", "INTEGER")]);

        let rows: Vec<Vec<Value>> = store
            .execute_query("SELECT DATE_TRUNC('month', '2024-05-17')", &[])
            .await
            .unwrap()
            .collect();
        assert_eq!(rows, vec![vec![Value::String("2024-05-01".to_string())]]);
    }
}
