use crate::config::PostgresConfig;
use crate::data_store::{ColumnMetadata, DataStoreClient, DataStoreError, DataStoreMapping, RecordIterator, Value};
use crate::utils::encoding::{decode_postgres_rows, postgres_params, row_desc_from_stmt};
use async_trait::async_trait;
use log::{debug, error};
use sqlparser::dialect::PostgreSqlDialect;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};

pub struct PostgresDataStore {
    client: Client,
}

pub struct PostgresMapping;

impl PostgresDataStore {
    pub async fn new(config: PostgresConfig) -> Result<Self, DataStoreError> {
        let connection_string = format!(
            "postgres://{}:{}@{}/{}",
            config.user, config.password, config.host, config.dbname
        );

        let (client, connection) = tokio_postgres::connect(&connection_string, NoTls)
            .await
            .map_err(|e| DataStoreError::ConnectionError(e.to_string()))?;

        // Spawn a task to manage the connection
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Postgres connection error: {}", e);
            }
        });

        debug!("Connected to postgres at {}/{}", config.host, config.dbname);
        Ok(PostgresDataStore { client })
    }
}

impl DataStoreMapping for PostgresMapping {
    fn get_dialect(&self) -> &dyn sqlparser::dialect::Dialect {
        &PostgreSqlDialect {}
    }

    // pass through since input functions are in postgres dialect
    fn map_function(&self, pg_function: &str) -> Option<String> {
        Some(pg_function.to_string())
    }
}

#[async_trait]
impl DataStoreClient for PostgresDataStore {
    type Mapping = PostgresMapping;

    fn get_mapping(&self) -> Self::Mapping {
        PostgresMapping {}
    }

    async fn execute_query(&self, sql: &str, params: &[Value]) -> Result<RecordIterator, DataStoreError> {
        let stmt = self.client.prepare(sql).await?;
        let columns = row_desc_from_stmt(&stmt);
        let boxed = postgres_params(params);
        let refs: Vec<&(dyn ToSql + Sync)> = boxed.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
        let rows = self.client.query(&stmt, &refs).await?;
        Ok(RecordIterator::new(columns, decode_postgres_rows(rows)?))
    }

    async fn describe(&self, sql: &str, _params: &[Value]) -> Result<Vec<ColumnMetadata>, DataStoreError> {
        let stmt = self.client.prepare(sql).await?;
        Ok(row_desc_from_stmt(&stmt))
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), DataStoreError> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }
}
