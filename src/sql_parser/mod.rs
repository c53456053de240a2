pub mod analyzer;
pub mod transformations;

use crate::data_store::DataStoreMapping;
use crate::semantic_model::{CatalogSchemaTableName, Mdl};
use log::debug;
use sqlparser::ast::*;
use sqlparser::parser::Parser;
use thiserror::Error;
use transformations::{CacheRewrite, Rule};

#[derive(Error, Debug)]
pub enum SqlParserError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("SQL parsing error: {0}")]
    SqlParseError(String),

    #[error(transparent)]
    Transform(#[from] SqlTransformError),
}

/// Custom error type for SQL transformation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SqlTransformError {
    #[error("Unsupported SQL construct: {0}")]
    UnsupportedSqlConstruct(String),
    #[error("Ambiguous name: {0}")]
    AmbiguousName(String),
    #[error("Duplicate name: {0}")]
    DuplicateName(String),
    #[error("Invalid statement: {0}")]
    InvalidStatement(String),
    #[error("Invalid metric: {0}")]
    InvalidMetric(String),
    #[error("Semantic model error: {0}")]
    SemanticModelError(String),
    #[error("SQL parsing error: {0}")]
    SqlParsingError(String),
}

/// Default catalog and schema for unqualified table names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub catalog: String,
    pub schema: String,
}

impl SessionContext {
    pub fn new(catalog: impl Into<String>, schema: impl Into<String>) -> Self {
        SessionContext {
            catalog: catalog.into(),
            schema: schema.into(),
        }
    }

    /// A session defaulting to the manifest's own catalog and schema.
    pub fn for_mdl(mdl: &Mdl) -> Self {
        SessionContext::new(mdl.catalog(), mdl.schema())
    }
}

/// Finds the local table holding the pre-aggregated rows of a semantic object.
pub trait CacheLookup {
    fn lookup_cache_table(&self, name: &CatalogSchemaTableName) -> Option<String>;
}

pub struct SqlParser<M> {
    data_store_mapping: M,
}

impl<M> SqlParser<M>
where
    M: DataStoreMapping,
{
    pub fn new(data_store_mapping: M) -> Self {
        SqlParser { data_store_mapping }
    }

    /// Rewrites `query` into SQL the data source can run directly.
    pub fn parse(
        &self,
        query: &str,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<String, SqlParserError> {
        let rules = transformations::live_rules();
        let ast_list = self.parse_query(query)?;
        let transformed_ast_list = self.transform_ast(ast_list, &rules, session, mdl)?;

        let output_queries: Vec<String> = transformed_ast_list
            .into_iter()
            .map(|ast| self.ast_to_sql(ast))
            .collect();

        Ok(output_queries.join(";\n"))
    }

    /// Rewrites `query` to read only pre-aggregated tables.
    ///
    /// Returns `None` when some part of the query still needs the data source: a physical
    /// table in the input, or a semantic object without a cache table.
    pub fn parse_cached(
        &self,
        query: &str,
        session: &SessionContext,
        mdl: &Mdl,
        cache: &dyn CacheLookup,
    ) -> Result<Option<String>, SqlParserError> {
        let ast_list = self.parse_query(query)?;
        let mut output_queries = vec![];
        for statement in ast_list {
            let Statement::Query(query) = statement else {
                return Err(read_only_error());
            };
            let analysis = analyzer::analyze_query(&query, session, mdl)?;
            if !analysis.physical_tables().is_empty() {
                debug!(
                    "Query reads physical tables {:?}, skipping cache",
                    analysis.physical_tables()
                );
                return Ok(None);
            }

            let mut rewritten = *query;
            for rule in transformations::live_rules() {
                rewritten = rule.apply(rewritten, session, mdl)?;
            }
            let cache_rewrite = CacheRewrite::new(cache);
            let (rewritten, fully_cached) = cache_rewrite.rewrite(rewritten, session, mdl)?;
            if !fully_cached {
                return Ok(None);
            }
            let mut statement = Statement::Query(Box::new(rewritten));
            transformations::map_functions(&mut statement, &self.data_store_mapping);
            output_queries.push(self.ast_to_sql(statement));
        }
        Ok(Some(output_queries.join(";\n")))
    }

    fn parse_query(&self, query: &str) -> Result<Vec<Statement>, SqlParserError> {
        let data_store = self.data_store_mapping.get_dialect();
        let statements = Parser::parse_sql(data_store, query)
            .map_err(|e| SqlParserError::SqlParseError(e.to_string()))?;
        Ok(statements)
    }

    fn transform_ast(
        &self,
        ast: Vec<Statement>,
        rules: &[Box<dyn Rule>],
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Vec<Statement>, SqlParserError> {
        ast.into_iter()
            .map(|statement| match statement {
                Statement::Query(query) => {
                    let mut query = *query;
                    for rule in rules {
                        query = rule.apply(query, session, mdl)?;
                        debug!("After {}: {}", rule.name(), query);
                    }
                    let mut statement = Statement::Query(Box::new(query));
                    transformations::map_functions(&mut statement, &self.data_store_mapping);
                    Ok(statement)
                }
                _ => Err(read_only_error()),
            })
            .collect()
    }

    fn ast_to_sql(&self, ast: Statement) -> String {
        ast.to_string()
    }
}

fn read_only_error() -> SqlParserError {
    SqlParserError::PermissionDenied("Only read-only SQL statements are allowed".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::data_store::postgres::PostgresMapping;
    use crate::data_store::sqlite::SqliteMapping;
    use crate::semantic_model::local_store::LocalSemanticModelStore;
    use crate::semantic_model::SemanticModelStore;
    use rstest::*;
    use std::collections::HashMap;

    #[fixture]
    fn mdl() -> Mdl {
        Mdl::from_manifest(LocalSemanticModelStore::mock().get_manifest().unwrap()).unwrap()
    }

    #[fixture]
    fn sql_parser_fixture() -> SqlParser<PostgresMapping> {
        SqlParser::new(PostgresMapping {})
    }

    #[fixture]
    fn sqlite_parser_fixture() -> SqlParser<SqliteMapping> {
        SqlParser::new(SqliteMapping {})
    }

    struct StaticCache(HashMap<String, String>);

    impl CacheLookup for StaticCache {
        fn lookup_cache_table(&self, name: &CatalogSchemaTableName) -> Option<String> {
            self.0.get(&name.table).cloned()
        }
    }

    fn cache(entries: &[(&str, &str)]) -> StaticCache {
        StaticCache(
            entries
                .iter()
                .map(|(object, table)| (object.to_string(), table.to_string()))
                .collect(),
        )
    }

    #[rstest]
    #[case::metric(
        "SELECT author, price FROM Collection",
        "WITH Album AS (SELECT id, name, author, price, bandId, 'relationship<AlbumBand>' AS band FROM (SELECT * FROM album) AS Album), \
         Collection AS (SELECT author, sum(Album.price) AS price FROM Album GROUP BY 1) \
         SELECT author, price FROM Collection"
    )]
    #[case::model(
        "SELECT name FROM Band",
        "WITH Band AS (SELECT id, name, 'relationship<AlbumBand>' AS albums FROM (SELECT * FROM band) AS Band) \
         SELECT name FROM Band"
    )]
    #[case::qualified_model(
        "SELECT name FROM mdl.test.Band",
        "WITH Band AS (SELECT id, name, 'relationship<AlbumBand>' AS albums FROM (SELECT * FROM band) AS Band) \
         SELECT name FROM Band"
    )]
    #[case::physical_table("SELECT a FROM raw_events", "SELECT a FROM raw_events")]
    fn test_parse(
        sql_parser_fixture: SqlParser<PostgresMapping>,
        mdl: Mdl,
        #[case] sql: &str,
        #[case] expected: &str,
    ) {
        let session = SessionContext::for_mdl(&mdl);
        assert_eq!(sql_parser_fixture.parse(sql, &session, &mdl).unwrap(), expected);
    }

    #[rstest]
    fn test_parse_rejects_writes(sql_parser_fixture: SqlParser<PostgresMapping>, mdl: Mdl) {
        let session = SessionContext::for_mdl(&mdl);
        let result = sql_parser_fixture.parse("DELETE FROM Album", &session, &mdl);
        assert!(matches!(result, Err(SqlParserError::PermissionDenied(_))));
    }

    #[rstest]
    fn test_parse_reports_syntax_errors(sql_parser_fixture: SqlParser<PostgresMapping>, mdl: Mdl) {
        let session = SessionContext::for_mdl(&mdl);
        let result = sql_parser_fixture.parse("SELEC name FROM Album", &session, &mdl);
        assert!(matches!(result, Err(SqlParserError::SqlParseError(_))));
    }

    #[rstest]
    fn test_parse_maps_functions(sqlite_parser_fixture: SqlParser<SqliteMapping>, mdl: Mdl) {
        let session = SessionContext::for_mdl(&mdl);
        let sql = sqlite_parser_fixture
            .parse("SELECT char_length(name) FROM raw_albums", &session, &mdl)
            .unwrap();
        assert_eq!(sql, "SELECT length(name) FROM raw_albums");
    }

    #[rstest]
    fn test_parse_cached_substitutes_cache_tables(
        sqlite_parser_fixture: SqlParser<SqliteMapping>,
        mdl: Mdl,
    ) {
        let session = SessionContext::for_mdl(&mdl);
        let sql = sqlite_parser_fixture
            .parse_cached(
                "SELECT author, price FROM Collection",
                &session,
                &mdl,
                &cache(&[("Collection", "Collection_0a1b")]),
            )
            .unwrap();
        assert_eq!(
            sql.as_deref(),
            Some("WITH Collection AS (SELECT * FROM \"Collection_0a1b\") SELECT author, price FROM Collection")
        );
    }

    #[rstest]
    #[case::uncached_object("SELECT author FROM Collection", &[("Album", "Album_0a1b")][..])]
    #[case::nothing_cached("SELECT name FROM Band", &[][..])]
    #[case::physical_table("SELECT name FROM Album JOIN raw_band ON Album.bandId = raw_band.id", &[("Album", "Album_0a1b")][..])]
    fn test_parse_cached_falls_back(
        sqlite_parser_fixture: SqlParser<SqliteMapping>,
        mdl: Mdl,
        #[case] sql: &str,
        #[case] cached: &[(&str, &str)],
    ) {
        let session = SessionContext::for_mdl(&mdl);
        let result = sqlite_parser_fixture
            .parse_cached(sql, &session, &mdl, &cache(cached))
            .unwrap();
        assert_eq!(result, None);
    }
}
