use super::{has_cte, parse_query, prune_ctes, Rule};
use crate::semantic_model::mdl::ObjectKind;
use crate::semantic_model::{CatalogSchemaTableName, Mdl};
use crate::sql_parser::analyzer::analyze_query;
use crate::sql_parser::{CacheLookup, SessionContext, SqlTransformError};
use log::debug;
use sqlparser::ast::{Expr, Ident, Query, SelectItem, SetExpr};
use std::collections::BTreeSet;

/// Points generated CTEs at the local tables holding their pre-aggregated rows.
pub struct CacheRewrite<'a> {
    lookup: &'a dyn CacheLookup,
}

impl<'a> CacheRewrite<'a> {
    pub fn new(lookup: &'a dyn CacheLookup) -> Self {
        CacheRewrite { lookup }
    }

    /// Substitutes every cached CTE and reports whether the result reads cache tables only.
    pub fn rewrite(
        &self,
        mut query: Query,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<(Query, bool), SqlTransformError> {
        let mut cache_tables = BTreeSet::new();
        let mut uncached = vec![];
        if let Some(with) = query.with.as_mut() {
            for cte in &mut with.cte_tables {
                let name = cte.alias.name.value.clone();
                let kind = match mdl.object_kind(&name) {
                    Some(kind @ (ObjectKind::Model | ObjectKind::Metric | ObjectKind::CumulativeMetric)) => kind,
                    _ => continue,
                };
                let table = self
                    .lookup
                    .lookup_cache_table(&mdl.qualified(&name))
                    .filter(|_| kind != ObjectKind::Metric || covers_dimensions(&cte.query, mdl, &name));
                match table {
                    Some(table) => {
                        debug!("Reading {} from cache table {}", name, table);
                        *cte.query = parse_query(&format!("SELECT * FROM {}", Ident::with_quote('"', table.as_str())))?;
                        cache_tables.insert(CatalogSchemaTableName::new(
                            session.catalog.clone(),
                            session.schema.clone(),
                            table,
                        ));
                    }
                    None => uncached.push(name),
                }
            }
        }
        prune_ctes(&mut query, mdl);

        let remaining: Vec<&String> = uncached
            .iter()
            .filter(|name| has_cte(&query, name))
            .collect();
        if !remaining.is_empty() {
            debug!("No cache table for {:?}", remaining);
        }
        let analysis = analyze_query(&query, session, mdl)?;
        let fully_cached = !cache_tables.is_empty()
            && remaining.is_empty()
            && analysis.physical_tables().is_subset(&cache_tables);
        Ok((query, fully_cached))
    }
}

impl Rule for CacheRewrite<'_> {
    fn name(&self) -> &'static str {
        "CacheRewrite"
    }

    fn apply(
        &self,
        query: Query,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Query, SqlTransformError> {
        self.rewrite(query, session, mdl).map(|(query, _)| query)
    }
}

/// A cache table holds one row per dimension tuple, so a metric CTE pruned to fewer
/// dimensions cannot read it.
fn covers_dimensions(body: &Query, mdl: &Mdl, metric: &str) -> bool {
    let Some(metric) = mdl.get_metric(metric) else {
        return false;
    };
    let SetExpr::Select(select) = body.body.as_ref() else {
        return false;
    };
    let outputs: BTreeSet<&str> = select
        .projection
        .iter()
        .filter_map(|item| match item {
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.as_str()),
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => Some(ident.value.as_str()),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(idents)) => {
                idents.last().map(|ident| ident.value.as_str())
            }
            _ => None,
        })
        .collect();
    metric
        .dimension
        .iter()
        .all(|dimension| outputs.contains(dimension.name.as_str()))
}
