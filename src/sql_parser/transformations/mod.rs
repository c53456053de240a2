//! Rewrite rules turning a query over semantic objects into executable SQL.
//!
//! Rules run in a fixed order. Each one re-analyzes the query it receives, so a rule only
//! depends on the SQL text produced by the rules before it.

mod cache_rewrite;
mod group_by_key;
mod metric_rewrite;
mod model_rewrite;
mod relationship_rewrite;

pub use cache_rewrite::CacheRewrite;
pub use group_by_key::GroupByKeyRewrite;
pub use metric_rewrite::MetricRewrite;
pub use model_rewrite::ModelRewrite;
pub use relationship_rewrite::RelationshipRewrite;

use crate::data_store::DataStoreMapping;
use crate::semantic_model::Mdl;
use crate::sql_parser::{SessionContext, SqlTransformError};
use sqlparser::ast::{
    visit_relations, Cte, Expr, Ident, ObjectName, Query, Statement, TableAlias, Visit, VisitMut,
    VisitorMut, With,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::{
    ALL_KEYWORDS, ALL_KEYWORDS_INDEX, RESERVED_FOR_COLUMN_ALIAS, RESERVED_FOR_TABLE_ALIAS,
};
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

pub trait Rule {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        query: Query,
        session: &SessionContext,
        mdl: &Mdl,
    ) -> Result<Query, SqlTransformError>;
}

/// Rules producing SQL for the data source, in application order.
pub fn live_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(ModelRewrite),
        Box::new(RelationshipRewrite),
        Box::new(MetricRewrite),
        Box::new(GroupByKeyRewrite),
    ]
}

/// Renames functions the target data store spells differently.
pub fn map_functions<M: DataStoreMapping + ?Sized>(statement: &mut Statement, mapping: &M) {
    struct FunctionMapper<'a, M: ?Sized>(&'a M);

    impl<M: DataStoreMapping + ?Sized> VisitorMut for FunctionMapper<'_, M> {
        type Break = ();

        fn post_visit_expr(&mut self, expr: &mut Expr) -> ControlFlow<Self::Break> {
            if let Expr::Function(function) = expr {
                if let [name] = function.name.0.as_slice() {
                    if let Some(mapped) = self.0.map_function(&name.value.to_lowercase()) {
                        if !mapped.eq_ignore_ascii_case(&name.value) {
                            function.name = ObjectName(vec![Ident::new(mapped)]);
                        }
                    }
                }
            }
            ControlFlow::Continue(())
        }
    }

    let _ = VisitMut::visit(statement, &mut FunctionMapper(mapping));
}

/// An identifier, quoted only when it would not survive unquoted.
pub(crate) fn ident(name: &str) -> Ident {
    if needs_quotes(name) {
        Ident::with_quote('"', name)
    } else {
        Ident::new(name)
    }
}

/// The SQL text of [`ident`].
pub(crate) fn quote(name: &str) -> String {
    ident(name).to_string()
}

fn needs_quotes(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !starts_well || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return true;
    }
    let upper = name.to_ascii_uppercase();
    match ALL_KEYWORDS.binary_search(&upper.as_str()) {
        Ok(index) => {
            let keyword = ALL_KEYWORDS_INDEX[index];
            RESERVED_FOR_TABLE_ALIAS.contains(&keyword) || RESERVED_FOR_COLUMN_ALIAS.contains(&keyword)
        }
        Err(_) => false,
    }
}

pub(crate) fn parse_query(sql: &str) -> Result<Query, SqlTransformError> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| SqlTransformError::SqlParsingError(format!("{}: {}", sql, e)))?;
    match statements.into_iter().next() {
        Some(Statement::Query(query)) => Ok(*query),
        _ => Err(SqlTransformError::InvalidStatement(format!(
            "expected a query: {}",
            sql
        ))),
    }
}

pub(crate) fn cte_names(query: &Query) -> Vec<String> {
    query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .map(|cte| cte.alias.name.value.clone())
        .collect()
}

pub(crate) fn has_cte(query: &Query, name: &str) -> bool {
    query
        .with
        .iter()
        .flat_map(|with| with.cte_tables.iter())
        .any(|cte| cte.alias.name.value == name)
}

/// Adds a generated CTE ahead of the query's own WITH entries.
pub(crate) fn push_cte(query: &mut Query, mdl: &Mdl, name: &str, body: Query) {
    let cte = Cte {
        alias: TableAlias {
            name: ident(name),
            columns: vec![],
        },
        query: Box::new(body),
        from: None,
        materialized: None,
    };
    let with = query.with.get_or_insert_with(|| With {
        recursive: false,
        cte_tables: vec![],
    });
    let position = with
        .cte_tables
        .iter()
        .take_while(|cte| mdl.object_kind(&cte.alias.name.value).is_some())
        .count();
    with.cte_tables.insert(position, cte);
}

/// Single-part relation names referenced anywhere inside `node`.
pub(crate) fn referenced_relations<V: Visit>(node: &V) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let _ = visit_relations(node, |relation| {
        if let Some(last) = relation.0.last() {
            names.insert(last.value.clone());
        }
        ControlFlow::<()>::Continue(())
    });
    names
}

/// Orders CTEs so each one follows the CTEs it reads, keeping the existing order otherwise.
pub(crate) fn sort_ctes(query: &mut Query) {
    let Some(with) = query.with.as_mut() else {
        return;
    };
    if with.recursive {
        return;
    }
    let names: BTreeSet<String> = with
        .cte_tables
        .iter()
        .map(|cte| cte.alias.name.value.clone())
        .collect();
    let mut pending: Vec<(Cte, BTreeSet<String>)> = with
        .cte_tables
        .drain(..)
        .map(|cte| {
            let own = cte.alias.name.value.clone();
            let deps = referenced_relations(&cte.query)
                .into_iter()
                .filter(|name| names.contains(name) && *name != own)
                .collect();
            (cte, deps)
        })
        .collect();

    let mut emitted = BTreeSet::new();
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|(_, deps)| deps.iter().all(|dep| emitted.contains(dep)))
            .unwrap_or(0);
        let (cte, _) = pending.remove(ready);
        emitted.insert(cte.alias.name.value.clone());
        with.cte_tables.push(cte);
    }
}

/// Drops generated CTEs nothing reads any more.
pub(crate) fn prune_ctes(query: &mut Query, mdl: &Mdl) {
    loop {
        let Some(with) = query.with.as_ref() else {
            return;
        };
        let mut referenced = referenced_relations(query.body.as_ref());
        if let Some(order_by) = &query.order_by {
            referenced.extend(referenced_relations(order_by));
        }
        for cte in &with.cte_tables {
            let own = &cte.alias.name.value;
            referenced.extend(
                referenced_relations(&cte.query)
                    .into_iter()
                    .filter(|name| name != own),
            );
        }
        let before = with.cte_tables.len();
        let Some(with) = query.with.as_mut() else {
            return;
        };
        with.cte_tables.retain(|cte| {
            let name = &cte.alias.name.value;
            mdl.object_kind(name).is_none() || referenced.contains(name)
        });
        if with.cte_tables.is_empty() {
            query.with = None;
            return;
        }
        if with.cte_tables.len() == before {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic_model::local_store::LocalSemanticModelStore;
    use crate::semantic_model::SemanticModelStore;
    use rstest::*;

    #[fixture]
    fn mdl() -> Mdl {
        Mdl::from_manifest(LocalSemanticModelStore::mock().get_manifest().unwrap()).unwrap()
    }

    #[rstest]
    #[case::plain("price", "price")]
    #[case::mixed_case("bandId", "bandId")]
    #[case::reserved("order", "\"order\"")]
    #[case::non_reserved_keyword("name", "name")]
    #[case::space("total price", "\"total price\"")]
    #[case::leading_digit("1st", "\"1st\"")]
    fn test_quote(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(quote(name), expected);
    }

    #[rstest]
    fn test_sort_ctes_puts_dependencies_first() {
        let mut query =
            parse_query("WITH b AS (SELECT * FROM a), a AS (SELECT 1 AS x), c AS (SELECT 2) SELECT * FROM b, c")
                .unwrap();
        sort_ctes(&mut query);
        assert_eq!(cte_names(&query), vec!["a", "b", "c"]);
    }

    #[rstest]
    fn test_push_cte_goes_before_user_ctes(mdl: Mdl) {
        let mut query = parse_query("WITH recent AS (SELECT * FROM Album) SELECT * FROM recent").unwrap();
        push_cte(&mut query, &mdl, "Album", parse_query("SELECT 1 AS id").unwrap());
        assert_eq!(cte_names(&query), vec!["Album", "recent"]);
    }

    #[rstest]
    fn test_prune_ctes_keeps_user_ctes(mdl: Mdl) {
        let mut query = parse_query(
            "WITH Band AS (SELECT 1 AS id), Album AS (SELECT 1 AS id), unused AS (SELECT 1) SELECT * FROM Album",
        )
        .unwrap();
        prune_ctes(&mut query, &mdl);
        assert_eq!(cte_names(&query), vec!["Album", "unused"]);
    }
}
