use crate::cache::{CacheError, CacheManager, TaskInfo};
use crate::data_store::{DataStoreClient, DataStoreError, RecordIterator, SqliteMapping};
use crate::semantic_model::{Manifest, Mdl, SemanticModelError};
use crate::sql_parser::{SessionContext, SqlParser, SqlParserError};
use log::{debug, info, warn};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error(transparent)]
    Parser(#[from] SqlParserError),

    #[error(transparent)]
    DataStore(#[from] DataStoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    SemanticModel(#[from] SemanticModelError),

    #[error("Manifest lock poisoned")]
    Poisoned,
}

/// Answers SQL over the deployed manifest, from cache tables when possible.
pub struct QueryProcessor<C> {
    mdl: RwLock<Arc<Mdl>>,
    session: Option<SessionContext>,
    source: Arc<C>,
    cache: CacheManager<C>,
}

impl<C: DataStoreClient> QueryProcessor<C> {
    /// `session` overrides the manifest's catalog and schema for unqualified names.
    pub fn new(mdl: Arc<Mdl>, session: Option<SessionContext>, source: Arc<C>, cache: CacheManager<C>) -> Self {
        QueryProcessor {
            mdl: RwLock::new(mdl),
            session,
            source,
            cache,
        }
    }

    pub fn mdl(&self) -> Result<Arc<Mdl>, ProcessorError> {
        self.mdl.read().map(|mdl| mdl.clone()).map_err(|_| ProcessorError::Poisoned)
    }

    pub fn cache(&self) -> &CacheManager<C> {
        &self.cache
    }

    fn session(&self, mdl: &Mdl) -> SessionContext {
        self.session.clone().unwrap_or_else(|| SessionContext::for_mdl(mdl))
    }

    /// Swaps in a new manifest and rebuilds its pre-aggregations.
    pub async fn deploy(&self, manifest: Manifest) -> Result<Vec<TaskInfo>, ProcessorError> {
        let mdl = Arc::new(Mdl::from_manifest(manifest)?);
        {
            let mut current = self.mdl.write().map_err(|_| ProcessorError::Poisoned)?;
            *current = mdl.clone();
        }
        info!("Deployed manifest {}.{}", mdl.catalog(), mdl.schema());
        Ok(self.cache.refresh(mdl).await?)
    }

    /// SQL the source would run for `sql`.
    pub fn rewrite(&self, sql: &str) -> Result<String, ProcessorError> {
        let mdl = self.mdl()?;
        let parser = SqlParser::new(self.source.get_mapping());
        Ok(parser.parse(sql, &self.session(&mdl), &mdl)?)
    }

    pub async fn query(&self, sql: &str) -> Result<RecordIterator, ProcessorError> {
        let mdl = self.mdl()?;
        let session = self.session(&mdl);

        match self.query_cached(sql, &session, &mdl).await {
            Ok(Some(records)) => return Ok(records),
            Ok(None) => {}
            Err(e) => warn!("Cached query failed, falling back to the source: {}", e),
        }

        let parser = SqlParser::new(self.source.get_mapping());
        let rewritten = parser.parse(sql, &session, &mdl)?;
        debug!("Querying source with {}", rewritten);
        Ok(self.source.execute_query(&rewritten, &[]).await?)
    }

    async fn query_cached(
        &self,
        sql: &str,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Option<RecordIterator>, ProcessorError> {
        let parser = SqlParser::new(SqliteMapping {});
        let Some(rewritten) = parser.parse_cached(sql, session, mdl, &self.cache)? else {
            return Ok(None);
        };
        debug!("Querying cache with {}", rewritten);
        Ok(Some(self.cache.query(&rewritten, &[]).await?))
    }
}
