pub mod postgres;
mod postgres_type;
pub mod sqlite;

pub use postgres::{PostgresDataStore, PostgresMapping};
pub use postgres_type::{column_affinity, PostgresType};
pub use sqlite::{SqliteDataStore, SqliteMapping, Workload};

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

/// How SQL for a data store differs from the PostgreSQL flavour clients write.
pub trait DataStoreMapping {
    /// Dialect supported by the data store
    fn get_dialect(&self) -> &dyn sqlparser::dialect::Dialect;
    /// Mapping inbuilt Postgres functions to data store specific functions
    ///
    /// For example, Postgres `char_length()` is `length()` in SQLite.
    fn map_function(&self, pg_function: &str) -> Option<String>;
}

/// A source the rewritten SQL runs against.
#[async_trait]
pub trait DataStoreClient: Send + Sync + 'static {
    type Mapping: DataStoreMapping + Send + Sync;

    fn get_mapping(&self) -> Self::Mapping;

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<RecordIterator, DataStoreError>;

    /// Output columns of `sql` without running it.
    async fn describe(&self, sql: &str, params: &[Value]) -> Result<Vec<ColumnMetadata>, DataStoreError>;

    async fn execute_ddl(&self, sql: &str) -> Result<(), DataStoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    /// Exact NUMERIC value.
    Decimal(Decimal),
    String(String),
}

impl Value {
    /// Rough in-memory footprint, used to bound materialized tables.
    pub fn estimated_size(&self) -> usize {
        match self {
            Value::Null | Value::Boolean(_) => 1,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Decimal(_) => 16,
            Value::String(s) => s.len(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_name: String,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        ColumnMetadata {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Rows of a finished query, in result order.
#[derive(Debug)]
pub struct RecordIterator {
    columns: Vec<ColumnMetadata>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl RecordIterator {
    pub fn new(columns: Vec<ColumnMetadata>, rows: Vec<Vec<Value>>) -> Self {
        RecordIterator {
            columns,
            rows: rows.into_iter(),
        }
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }
}

impl Iterator for RecordIterator {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Cannot read column {0} of type {1}")]
    UnsupportedType(String, String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
